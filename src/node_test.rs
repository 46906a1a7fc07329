use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;

#[test]
fn test_node_header() {
    let node = CsNode { cmt_no: 7 }.encode(101);
    assert_eq!(node.len(), CS_SZ);

    let hdr = decode_header(&node).unwrap();
    assert_eq!(hdr.sqnum, 101);
    assert_eq!(hdr.len, CS_SZ);
    assert_eq!(hdr.typ, NodeType::Cs);

    check_header(&node, NodeType::Cs, CS_SZ).unwrap();
    assert!(check_header(&node, NodeType::Ref, CS_SZ).is_err());
    assert!(check_header(&node, NodeType::Cs, CS_SZ + 8).is_err());

    // trailing garbage after the node is fine
    let mut padded = node.clone();
    padded.resize(align8(CS_SZ) + 16, 0xA5);
    decode_header(&padded).unwrap();

    // flipped byte in the payload breaks the crc
    let mut bad = node.clone();
    bad[CH_SZ] ^= 0xFF;
    assert!(decode_header(&bad).is_err());

    // bad magic
    let mut bad = node.clone();
    bad[0] ^= 0xFF;
    assert!(decode_header(&bad).is_err());

    // truncated
    assert!(decode_header(&node[..CH_SZ - 1]).is_err());
}

#[test]
fn test_try_header() {
    let node = RefNode {
        lnum: 10,
        offs: 2048,
        jhead: 1,
    }
    .encode(55);

    assert!(try_header(&node, NodeType::Ref, REF_SZ).is_some());
    assert!(try_header(&node, NodeType::Cs, REF_SZ).is_none());
    assert!(try_header(&node, NodeType::Ref, REF_SZ + 8).is_none());

    let mut bad = node.clone();
    bad[CH_SZ] ^= 0xFF;
    assert!(try_header(&bad, NodeType::Ref, REF_SZ).is_none());

    let mut bad = node;
    bad[0] ^= 0xFF;
    assert!(try_header(&bad, NodeType::Ref, REF_SZ).is_none());
}

#[test]
fn test_idx_node() {
    let branches: Vec<Branch> = (0..5)
        .map(|i| Branch {
            key: Key::data(9, i),
            lnum: 20 + i,
            offs: i * 64,
            len: DATA_SZ as u32,
        })
        .collect();
    let idx = IdxNode { level: 0, branches };

    let buf = idx.encode(9);
    assert_eq!(buf.len(), IDX_SZ + 5 * BRANCH_SZ);

    let out = IdxNode::decode(&buf, buf.len()).unwrap();
    assert_eq!(out.level, 0);
    assert_eq!(out.branches, idx.branches);

    assert!(IdxNode::decode(&buf, buf.len() - BRANCH_SZ).is_err());
}

#[test]
fn test_leaf_nodes() {
    let ino = InoNode {
        key: Key::inode(5),
        size: 40960,
        nlink: 2,
        mode: 0o100644,
    };
    let buf = ino.encode(1);
    assert_eq!(buf.len(), INO_SZ);
    assert_eq!(InoNode::decode(&buf).unwrap(), ino);
    assert_eq!(read_key(&buf).unwrap(), Key::inode(5));

    let dn = DataNode {
        key: Key::data(5, 3),
        size: 4096,
        data: vec![0xAB; 1024],
    };
    let buf = dn.encode(2);
    assert_eq!(buf.len(), DATA_SZ + 1024);
    assert_eq!(DataNode::decode(&buf).unwrap(), dn);

    let tn = TrunNode {
        ino: 5,
        old_size: 40960,
        new_size: 4096,
    };
    let buf = tn.encode(3);
    assert_eq!(buf.len(), TRUN_SZ);
    assert_eq!(TrunNode::decode(&buf).unwrap(), tn);
}

#[test]
fn test_dent_node() {
    let name = b"hello".to_vec();
    let dent = DentNode {
        key: Key::dent(2, crate::key::r5_hash(&name)),
        inum: 5,
        etype: 0,
        name: name.clone(),
    };
    let buf = dent.encode(4);
    assert_eq!(buf.len(), DENT_SZ + name.len() + 1);
    assert_eq!(decode_header(&buf).unwrap().typ, NodeType::Dent);
    assert_eq!(DentNode::decode(&buf).unwrap(), dent);
    assert!(!dent.is_deletion());

    // xattr entries pick the xent node type from their key
    let xent = DentNode {
        key: Key::xent(2, 77),
        inum: 6,
        etype: 0,
        name: b"user.attr".to_vec(),
    };
    let buf = xent.encode(5);
    assert_eq!(decode_header(&buf).unwrap().typ, NodeType::Xent);
    assert_eq!(DentNode::decode(&buf).unwrap(), xent);

    // deletion entry
    let del = DentNode {
        inum: 0,
        ..dent.clone()
    };
    assert!(del.is_deletion());
    assert_eq!(DentNode::decode(&del.encode(6)).unwrap(), del);

    // interior NUL in the name
    let mut bad = dent.clone();
    bad.name[2] = 0;
    assert!(DentNode::decode(&bad.encode(7)).is_err());

    // entry type out of range
    let bad = DentNode {
        etype: ITYPES_CNT,
        ..dent.clone()
    };
    assert!(DentNode::decode(&bad.encode(8)).is_err());

    // tampered nlen field, caught by crc before the shape check
    let mut buf = dent.encode(9);
    let p = CH_SZ + crate::key::KEY_SZ + 10;
    buf[p..p + 2].copy_from_slice(&3_u16.to_le_bytes());
    assert!(DentNode::decode(&buf).is_err());
}

#[test]
fn test_leaf_len_range() {
    let config = Config::new("test-leaf-len-range");

    assert_eq!(leaf_len_range(&config, KeyType::Inode), (INO_SZ, INO_SZ));
    let (min, max) = leaf_len_range(&config, KeyType::Data);
    assert_eq!((min, max), (DATA_SZ, DATA_SZ + config.block_size));
    let (min, max) = leaf_len_range(&config, KeyType::DirEntry);
    assert_eq!((min, max), (DENT_SZ + 1, DENT_SZ + config::MAX_NLEN + 1));
}

#[test]
fn test_node_fuzz() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_node_fuzz {}", seed);

    // random byte flips never panic, they either fail or decode
    for _i in 0..1_000 {
        let dent = DentNode {
            key: Key::dent(3, 1000),
            inum: 44,
            etype: 1,
            name: b"victim".to_vec(),
        };
        let mut buf = dent.encode(10);
        let n = rng.gen::<usize>() % buf.len();
        buf[n] ^= rng.gen::<u8>();
        let _ = DentNode::decode(&buf);
    }
}
