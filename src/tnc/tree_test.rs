use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::{collections::BTreeMap, sync::Arc};

use super::*;
use crate::{
    key::r5_hash,
    lprops::MemLprops,
    media::MemFlash,
    node::{DataNode, DentNode, IdxNode, InoNode},
};

fn small_config(name: &str) -> Config {
    let mut config = Config::new(name);
    config
        .set_geometry(64 * 1024, 64)
        .set_min_io_size(8)
        .set_log(2, 8);
    config
}

fn setup(name: &str) -> (Config, Arc<MemFlash>, Arc<MemLprops>, Tnc<MemFlash, MemLprops>) {
    let _ = env_logger::builder().is_test(true).try_init();

    let config = small_config(name);
    let flash = Arc::new(MemFlash::new(&config));
    let lprops = Arc::new(MemLprops::new(&config));
    let tnc = Tnc::create(config.clone(), Arc::clone(&flash), Arc::clone(&lprops));
    (config, flash, lprops, tnc)
}

// Append nodes into main-area LEBs, rolling to the next LEB when one
// fills up.
struct Appender {
    flash: Arc<MemFlash>,
    lnum: usize,
}

impl Appender {
    fn new(flash: &Arc<MemFlash>, lnum: usize) -> Appender {
        Appender {
            flash: Arc::clone(flash),
            lnum,
        }
    }

    fn put(&mut self, node: &[u8]) -> (usize, usize, usize) {
        loop {
            match self.flash.append(self.lnum, node) {
                Ok((offs, len)) => return (self.lnum, offs, len),
                Err(_) => self.lnum += 1,
            }
        }
    }

    fn put_ino(&mut self, ino: u32, sqnum: u64) -> (Key, Vec<u8>, (usize, usize, usize)) {
        let node = InoNode {
            key: Key::inode(ino),
            size: 0,
            nlink: 1,
            mode: 0o100644,
        };
        let raw = node.encode(sqnum);
        let loc = self.put(&raw);
        (node.key, raw, loc)
    }

    fn put_data(
        &mut self,
        ino: u32,
        block: u32,
        sqnum: u64,
    ) -> (Key, Vec<u8>, (usize, usize, usize)) {
        let node = DataNode {
            key: Key::data(ino, block),
            size: 4096,
            data: vec![block as u8; 16],
        };
        let raw = node.encode(sqnum);
        let loc = self.put(&raw);
        (node.key, raw, loc)
    }

    fn put_dent(
        &mut self,
        key: Key,
        inum: u64,
        name: &[u8],
        sqnum: u64,
    ) -> (Vec<u8>, (usize, usize, usize)) {
        let node = DentNode {
            key,
            inum,
            etype: 0,
            name: name.to_vec(),
        };
        let raw = node.encode(sqnum);
        let loc = self.put(&raw);
        (raw, loc)
    }
}

// Compose an index image for `leaves` the way the commit writer lays
// out the on-flash tree, and return the root location.
fn build_index(
    appender: &mut Appender,
    leaves: &[(Key, usize, usize, usize)],
) -> (usize, usize, usize) {
    use crate::node::Branch;

    let mut level = 0_u16;
    let mut branches: Vec<Branch> = leaves
        .iter()
        .map(|(key, lnum, offs, len)| Branch {
            key: *key,
            lnum: *lnum as u32,
            offs: *offs as u32,
            len: *len as u32,
        })
        .collect();

    loop {
        let mut next: Vec<Branch> = vec![];
        for chunk in branches.chunks(8) {
            let idx = IdxNode {
                level,
                branches: chunk.to_vec(),
            };
            let (lnum, offs, len) = appender.put(&idx.encode(1));
            next.push(Branch {
                key: chunk[0].key,
                lnum: lnum as u32,
                offs: offs as u32,
                len: len as u32,
            });
        }
        if next.len() == 1 {
            let root = next[0];
            return (root.lnum as usize, root.offs as usize, root.len as usize);
        }
        branches = next;
        level += 1;
    }
}

#[test]
fn test_tnc_empty() {
    let (_config, _flash, _lprops, tnc) = setup("test_tnc_empty");

    let key = Key::inode(1);
    assert!(matches!(tnc.lookup(&key), Err(Error::KeyNotFound(_, _))));
    // removing an absent key is not an error
    tnc.remove(&key).unwrap();

    let stats = tnc.validate().unwrap();
    assert_eq!(stats.height, 1);
    assert_eq!(stats.n_znodes, 1);
    assert_eq!(stats.n_dirty, 1);

    tnc.close().unwrap();
}

#[test]
fn test_sequential_append() {
    // a pure data-block append builds packed leaves: splitting never
    // scatters branches because new keys only ever land at the right
    // edge
    let (_config, flash, _lprops, tnc) = setup("test_sequential_append");
    let mut appender = Appender::new(&flash, 10);

    for block in 0..32 {
        let (key, _raw, (lnum, offs, len)) = appender.put_data(10, block, block as u64 + 1);
        tnc.add(key, lnum, offs, len).unwrap();
    }

    let mut shape: Vec<(usize, usize)> = vec![];
    let mut keys: Vec<Key> = vec![];
    tnc.walk_index(
        &mut |level, child_cnt| {
            shape.push((level, child_cnt));
            Ok(())
        },
        &mut |key, _lnum, _offs, _len| {
            keys.push(*key);
            Ok(())
        },
    )
    .unwrap();

    assert_eq!(shape, vec![(1, 4), (0, 8), (0, 8), (0, 8), (0, 8)]);
    let expect: Vec<Key> = (0..32).map(|b| Key::data(10, b)).collect();
    assert_eq!(keys, expect);

    let stats = tnc.validate().unwrap();
    assert_eq!(stats.height, 2);

    for block in 0..32 {
        tnc.lookup(&Key::data(10, block)).unwrap();
    }
}

#[test]
fn test_random_ops() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_random_ops {}", seed);

    let (_config, flash, _lprops, tnc) = setup("test_random_ops");
    let mut appender = Appender::new(&flash, 10);
    let mut model: BTreeMap<Key, Vec<u8>> = BTreeMap::new();
    let mut sqnum = 1;

    for _i in 0..3_000 {
        sqnum += 1;
        match rng.gen::<u8>() % 4 {
            // add or overwrite an inode key
            0 => {
                let ino = (rng.gen::<u32>() % 40) + 1;
                let (key, raw, (lnum, offs, len)) = appender.put_ino(ino, sqnum);
                tnc.add(key, lnum, offs, len).unwrap();
                model.insert(key, raw);
            }
            // add or overwrite a data key
            1 => {
                let ino = (rng.gen::<u32>() % 8) + 1;
                let block = rng.gen::<u32>() % 50;
                let (key, raw, (lnum, offs, len)) = appender.put_data(ino, block, sqnum);
                tnc.add(key, lnum, offs, len).unwrap();
                model.insert(key, raw);
            }
            // remove a data key
            2 => {
                let ino = (rng.gen::<u32>() % 8) + 1;
                let block = rng.gen::<u32>() % 50;
                let key = Key::data(ino, block);
                tnc.remove(&key).unwrap();
                model.remove(&key);
            }
            // remove an inode key
            _ => {
                let ino = (rng.gen::<u32>() % 40) + 1;
                let key = Key::inode(ino);
                tnc.remove(&key).unwrap();
                model.remove(&key);
            }
        }
    }

    // a lookup returns the value of the latest mutation for the key
    for ino in 1..=40 {
        let key = Key::inode(ino);
        match model.get(&key) {
            Some(raw) => assert_eq!(tnc.lookup(&key).unwrap(), *raw, "{}", key),
            None => assert!(matches!(tnc.lookup(&key), Err(Error::KeyNotFound(_, _)))),
        }
    }
    for ino in 1..=8 {
        for block in 0..50 {
            let key = Key::data(ino, block);
            match model.get(&key) {
                Some(raw) => assert_eq!(tnc.lookup(&key).unwrap(), *raw, "{}", key),
                None => {
                    assert!(matches!(tnc.lookup(&key), Err(Error::KeyNotFound(_, _))))
                }
            }
        }
    }

    tnc.validate().unwrap();
    tnc.close().unwrap();
}

#[test]
fn test_replace() {
    let (_config, flash, lprops, tnc) = setup("test_replace");
    let mut appender = Appender::new(&flash, 10);

    let (key, _raw, (lnum, offs, len)) = appender.put_ino(7, 1);
    tnc.add(key, lnum, offs, len).unwrap();

    // garbage collection moved the node
    let (_, raw2, (lnum2, offs2, len2)) = appender.put_ino(7, 2);
    tnc.replace(key, lnum, offs, lnum2, offs2, len2).unwrap();
    assert_eq!(tnc.lookup(&key).unwrap(), raw2);

    // a replace against a stale location must not clobber the entry,
    // the moved copy is garbage instead
    let (_, _raw3, (lnum3, offs3, len3)) = appender.put_ino(7, 3);
    tnc.replace(key, lnum, offs, lnum3, offs3, len3).unwrap();
    assert_eq!(tnc.lookup(&key).unwrap(), raw2);
    assert!(lprops.get(lnum3).dirty >= len3);

    tnc.validate().unwrap();
}

#[test]
fn test_remove_range() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_remove_range {}", seed);

    for _round in 0..10 {
        let (_config, flash, _lprops, tnc) = setup("test_remove_range");
        let mut appender = Appender::new(&flash, 10);

        let blocks: Vec<u32> = (0..100).filter(|_| rng.gen::<bool>()).collect();
        for (i, block) in blocks.iter().enumerate() {
            let (key, _raw, (lnum, offs, len)) = appender.put_data(3, *block, i as u64 + 1);
            tnc.add(key, lnum, offs, len).unwrap();
        }

        let lo = rng.gen::<u32>() % 100;
        let hi = lo + (rng.gen::<u32>() % (100 - lo + 1));
        tnc.remove_range(&Key::data(3, lo), &Key::data(3, hi)).unwrap();

        for block in blocks.iter() {
            let key = Key::data(3, *block);
            let gone = *block >= lo && *block <= hi;
            match tnc.lookup(&key) {
                Ok(_) => assert!(!gone, "block {} in [{}, {}]", block, lo, hi),
                Err(Error::KeyNotFound(_, _)) => {
                    assert!(gone, "block {} outside [{}, {}]", block, lo, hi)
                }
                Err(err) => panic!("{}", err),
            }
        }

        tnc.validate().unwrap();
    }
}

#[test]
fn test_hash_collision() {
    let (_config, flash, _lprops, tnc) = setup("test_hash_collision");
    let mut appender = Appender::new(&flash, 10);

    // two entries under the same directory whose names collide on the
    // same hash value
    let key = Key::dent(5, 1000);
    let (_raw_a, (lnum, offs, len)) = appender.put_dent(key, 20, b"a", 1);
    tnc.add_nm(key, lnum, offs, len, b"a").unwrap();
    let (raw_b, (lnum, offs, len)) = appender.put_dent(key, 21, b"b", 2);
    tnc.add_nm(key, lnum, offs, len, b"b").unwrap();

    assert_eq!(tnc.lookup_nm(&key, b"b").unwrap(), raw_b);
    let got = DentNode::decode(&tnc.lookup_nm(&key, b"a").unwrap()).unwrap();
    assert_eq!(got.inum, 20);

    tnc.remove_nm(&key, b"a").unwrap();
    assert_eq!(tnc.lookup_nm(&key, b"b").unwrap(), raw_b);
    assert!(matches!(
        tnc.lookup_nm(&key, b"a"),
        Err(Error::KeyNotFound(_, _))
    ));

    tnc.validate().unwrap();
}

#[test]
fn test_collision_run_across_splits() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_collision_run_across_splits {}", seed);

    let (_config, flash, _lprops, tnc) = setup("test_collision_run_across_splits");
    let mut appender = Appender::new(&flash, 10);

    // a run of equal keys long enough to cross several znodes; the
    // left-edge probe in the keyed search is what keeps the leftmost
    // members reachable after splits
    let key = Key::dent(5, 4000);
    let names: Vec<Vec<u8>> = (0..40_u32)
        .map(|i| format!("name-{:02}", i).into_bytes())
        .collect();
    let mut order: Vec<usize> = (0..names.len()).collect();
    for i in (1..order.len()).rev() {
        order.swap(i, rng.gen::<usize>() % (i + 1));
    }

    for (sq, i) in order.iter().enumerate() {
        let (_raw, (lnum, offs, len)) =
            appender.put_dent(key, 100 + *i as u64, &names[*i], sq as u64 + 1);
        tnc.add_nm(key, lnum, offs, len, &names[*i]).unwrap();
    }
    tnc.validate().unwrap();

    for (i, name) in names.iter().enumerate() {
        let got = DentNode::decode(&tnc.lookup_nm(&key, name).unwrap()).unwrap();
        assert_eq!(got.inum, 100 + i as u64, "{:?}", name);
    }

    // next_ent enumerates the colliding run in name order
    let mut listed: Vec<Vec<u8>> = vec![];
    let mut cursor = Key::lowest_dent(5);
    let mut last: Option<Vec<u8>> = None;
    loop {
        match tnc.next_ent(&cursor, last.as_deref()) {
            Ok(dent) => {
                cursor = dent.key;
                last = Some(dent.name.clone());
                listed.push(dent.name);
            }
            Err(Error::KeyNotFound(_, _)) => break,
            Err(err) => panic!("{}", err),
        }
    }
    let mut expect = names.clone();
    expect.sort();
    assert_eq!(listed, expect);

    // remove half of them, in random order
    for i in order.iter().copied().filter(|i| i % 2 == 0) {
        tnc.remove_nm(&key, &names[i]).unwrap();
    }
    for (i, name) in names.iter().enumerate() {
        match tnc.lookup_nm(&key, name) {
            Ok(raw) => {
                assert!(i % 2 == 1, "{:?}", name);
                let got = DentNode::decode(&raw).unwrap();
                assert_eq!(got.inum, 100 + i as u64);
            }
            Err(Error::KeyNotFound(_, _)) => assert!(i % 2 == 0, "{:?}", name),
            Err(err) => panic!("{}", err),
        }
    }

    tnc.validate().unwrap();
}

#[test]
fn test_remove_ino() {
    let (_config, flash, _lprops, tnc) = setup("test_remove_ino");
    let mut appender = Appender::new(&flash, 10);
    let mut sqnum = 0;
    let mut put_ino = |appender: &mut Appender, tnc: &Tnc<MemFlash, MemLprops>, ino: u32| {
        sqnum += 1;
        let (key, _raw, (lnum, offs, len)) = appender.put_ino(ino, sqnum);
        tnc.add(key, lnum, offs, len).unwrap();
    };

    // directory inode 5: its inode, entries under it, data, two
    // xattrs with their xattr inodes
    put_ino(&mut appender, &tnc, 5);
    for (i, name) in [b"f1".to_vec(), b"f2".to_vec()].iter().enumerate() {
        let key = Key::dent(5, r5_hash(name));
        let (_raw, (lnum, offs, len)) = appender.put_dent(key, 50 + i as u64, name, 10 + i as u64);
        tnc.add_nm(key, lnum, offs, len, name).unwrap();
    }
    for block in 0..3 {
        let (key, _raw, (lnum, offs, len)) = appender.put_data(5, block, 20 + block as u64);
        tnc.add(key, lnum, offs, len).unwrap();
    }
    let xattrs: Vec<(Vec<u8>, u32)> = vec![(b"user.one".to_vec(), 100), (b"user.two".to_vec(), 101)];
    for (name, xino) in xattrs.iter() {
        let key = Key::xent(5, r5_hash(name));
        let (_raw, (lnum, offs, len)) = appender.put_dent(key, *xino as u64, name, 30);
        tnc.add_nm(key, lnum, offs, len, name).unwrap();
        put_ino(&mut appender, &tnc, *xino);
        let (dkey, _raw, (lnum, offs, len)) = appender.put_data(*xino, 0, 31);
        tnc.add(dkey, lnum, offs, len).unwrap();
    }

    // an unrelated inode survives untouched
    put_ino(&mut appender, &tnc, 6);
    let (okey, oraw, (lnum, offs, len)) = appender.put_data(6, 0, 40);
    tnc.add(okey, lnum, offs, len).unwrap();

    tnc.remove_ino(5).unwrap();

    assert!(matches!(
        tnc.lookup(&Key::inode(5)),
        Err(Error::KeyNotFound(_, _))
    ));
    for block in 0..3 {
        assert!(matches!(
            tnc.lookup(&Key::data(5, block)),
            Err(Error::KeyNotFound(_, _))
        ));
    }
    for name in [b"f1".to_vec(), b"f2".to_vec()].iter() {
        assert!(matches!(
            tnc.lookup_nm(&Key::dent(5, r5_hash(name)), name),
            Err(Error::KeyNotFound(_, _))
        ));
    }
    for (name, xino) in xattrs.iter() {
        assert!(matches!(
            tnc.lookup_nm(&Key::xent(5, r5_hash(name)), name),
            Err(Error::KeyNotFound(_, _))
        ));
        assert!(matches!(
            tnc.lookup(&Key::inode(*xino)),
            Err(Error::KeyNotFound(_, _))
        ));
        assert!(matches!(
            tnc.lookup(&Key::data(*xino, 0)),
            Err(Error::KeyNotFound(_, _))
        ));
    }

    assert_eq!(tnc.lookup(&Key::inode(6)).unwrap().len(), node::INO_SZ);
    assert_eq!(tnc.lookup(&okey).unwrap(), oraw);

    tnc.validate().unwrap();
}

#[test]
fn test_open_index() {
    let config = small_config("test_open_index");
    let flash = Arc::new(MemFlash::new(&config));
    let lprops = Arc::new(MemLprops::new(&config));
    let mut appender = Appender::new(&flash, 10);

    // compose leaves and an index image for them, like a commit would
    let mut leaves: Vec<(Key, usize, usize, usize)> = vec![];
    let mut raws: BTreeMap<Key, Vec<u8>> = BTreeMap::new();
    for ino in 1..=100_u32 {
        let node = InoNode {
            key: Key::inode(ino),
            size: 0,
            nlink: 1,
            mode: 0o100644,
        };
        let raw = node.encode(ino as u64);
        let (lnum, offs, len) = appender.put(&raw);
        leaves.push((node.key, lnum, offs, len));
        raws.insert(node.key, raw);
    }
    let mut idx_appender = Appender::new(&flash, 30);
    let root = build_index(&mut idx_appender, &leaves);

    let tnc = Tnc::open(config, Arc::clone(&flash), Arc::clone(&lprops), root);
    for (key, raw) in raws.iter() {
        assert_eq!(tnc.lookup(key).unwrap(), *raw);
    }
    assert!(matches!(
        tnc.lookup(&Key::inode(101)),
        Err(Error::KeyNotFound(_, _))
    ));

    let stats = tnc.validate().unwrap();
    assert_eq!(stats.n_dirty, 0);
    assert!(stats.n_clean > 0);
    assert_eq!(stats.height, 3); // 100 leaves, fanout 8
}

#[test]
fn test_open_index_corrupt() {
    let config = small_config("test_open_index_corrupt");
    let flash = Arc::new(MemFlash::new(&config));
    let lprops = Arc::new(MemLprops::new(&config));
    let mut appender = Appender::new(&flash, 10);

    let mut leaves: Vec<(Key, usize, usize, usize)> = vec![];
    for ino in 1..=20_u32 {
        let (key, _raw, loc) = appender.put_ino(ino, ino as u64);
        leaves.push((key, loc.0, loc.1, loc.2));
    }
    let mut idx_appender = Appender::new(&flash, 30);
    let (rlnum, roffs, rlen) = build_index(&mut idx_appender, &leaves);

    // flip one byte inside the root index node image
    let raw = flash.leb_read(rlnum, roffs, rlen).unwrap();
    let mut bad = raw;
    bad[node::CH_SZ] ^= 0xFF;
    flash.write_at(rlnum, roffs, &bad).unwrap();

    let tnc = Tnc::open(config, flash, lprops, (rlnum, roffs, rlen));
    assert!(matches!(
        tnc.lookup(&Key::inode(1)),
        Err(Error::Corrupted(_, _))
    ));
}

#[test]
fn test_has_node() {
    let config = small_config("test_has_node");
    let flash = Arc::new(MemFlash::new(&config));
    let lprops = Arc::new(MemLprops::new(&config));
    let mut appender = Appender::new(&flash, 10);

    let mut leaves: Vec<(Key, usize, usize, usize)> = vec![];
    for ino in 1..=30_u32 {
        let (key, _raw, loc) = appender.put_ino(ino, ino as u64);
        leaves.push((key, loc.0, loc.1, loc.2));
    }
    let mut idx_appender = Appender::new(&flash, 30);
    let root = build_index(&mut idx_appender, &leaves);

    let tnc = Tnc::open(config, Arc::clone(&flash), lprops, root);

    // leaf nodes are present where the index says they are
    let (key, lnum, offs, _len) = leaves[4];
    assert!(tnc.has_node(&key, 0, lnum, offs, false).unwrap());
    assert!(!tnc.has_node(&key, 0, lnum, offs + 8, false).unwrap());

    // the root index node is present and clean
    assert!(tnc.has_node(&leaves[0].0, 1, root.0, root.1, true).unwrap());
    assert!(!tnc.has_node(&leaves[0].0, 1, root.0, root.1 + 8, true).unwrap());

    // dirtying the index node makes has_node disown it
    tnc.dirty_idx_node(&leaves[0].0, 1, root.0, root.1).unwrap();
    assert!(!tnc.has_node(&leaves[0].0, 1, root.0, root.1, true).unwrap());

    tnc.validate().unwrap();
}

#[test]
fn test_cow_commit() {
    let config = small_config("test_cow_commit");
    let flash = Arc::new(MemFlash::new(&config));
    let lprops = Arc::new(MemLprops::new(&config));
    let mut appender = Appender::new(&flash, 10);

    let mut leaves: Vec<(Key, usize, usize, usize)> = vec![];
    for ino in (2..=60_u32).step_by(2) {
        let (key, _raw, loc) = appender.put_ino(ino, ino as u64);
        leaves.push((key, loc.0, loc.1, loc.2));
    }
    let mut idx_appender = Appender::new(&flash, 30);
    let root = build_index(&mut idx_appender, &leaves);
    let tnc = Tnc::open(config, Arc::clone(&flash), lprops, root);

    // dirty one path in place, its on-flash images stay referenced
    let (k1, _raw1, (lnum, offs, len)) = appender.put_ino(31, 1000);
    tnc.add(k1, lnum, offs, len).unwrap();
    let before = tnc.validate().unwrap();
    assert!(before.n_dirty > 0);
    assert_eq!(before.n_old_idx, 0);

    let pinned = tnc.start_commit().unwrap();
    assert_eq!(pinned, before.n_dirty);

    // mutating the pinned path forces copies; the originals become
    // frozen snapshots and their images join the old-index tree
    let (k2, raw2, (lnum, offs, len)) = appender.put_ino(33, 1001);
    tnc.add(k2, lnum, offs, len).unwrap();

    assert_eq!(tnc.lookup(&k2).unwrap(), raw2);
    tnc.lookup(&k1).unwrap();
    let during = tnc.validate().unwrap();
    assert!(during.n_old_idx > 0, "{:?}", during);
    assert!(during.n_znodes > before.n_znodes);
    assert_eq!(tnc.to_old_idx().len(), during.n_old_idx);

    tnc.end_commit().unwrap();
    let after = tnc.validate().unwrap();
    assert_eq!(after.n_old_idx, 0);
    // the copies made after the pin are still dirty, the pinned ones
    // went clean and the obsoleted ones are gone
    assert!(after.n_znodes < during.n_znodes);
    assert_eq!(tnc.lookup(&k2).unwrap(), raw2);

    // a second commit with nothing obsoleted
    let pinned = tnc.start_commit().unwrap();
    assert!(pinned > 0);
    tnc.end_commit().unwrap();
    let done = tnc.validate().unwrap();
    assert_eq!(done.n_dirty, 0);
}

#[test]
fn test_abort_commit() {
    let config = small_config("test_abort_commit");
    let flash = Arc::new(MemFlash::new(&config));
    let lprops = Arc::new(MemLprops::new(&config));
    let mut appender = Appender::new(&flash, 10);

    let mut leaves: Vec<(Key, usize, usize, usize)> = vec![];
    for ino in (2..=40_u32).step_by(2) {
        let (key, _raw, loc) = appender.put_ino(ino, ino as u64);
        leaves.push((key, loc.0, loc.1, loc.2));
    }
    let mut idx_appender = Appender::new(&flash, 30);
    let root = build_index(&mut idx_appender, &leaves);
    let tnc = Tnc::open(config, Arc::clone(&flash), lprops, root);

    let (k1, _raw, (lnum, offs, len)) = appender.put_ino(21, 500);
    tnc.add(k1, lnum, offs, len).unwrap();
    let before = tnc.validate().unwrap();

    tnc.start_commit().unwrap();
    let (k2, raw2, (lnum, offs, len)) = appender.put_ino(23, 501);
    tnc.add(k2, lnum, offs, len).unwrap();

    tnc.abort_commit().unwrap();
    let after = tnc.validate().unwrap();
    // survivors stay dirty for the next commit attempt
    assert!(after.n_dirty >= before.n_dirty);
    assert_eq!(tnc.lookup(&k2).unwrap(), raw2);
    tnc.lookup(&k1).unwrap();
}

#[test]
fn test_lnc() {
    let (_config, flash, _lprops, tnc) = setup("test_lnc");
    let mut appender = Appender::new(&flash, 10);

    let key = Key::dent(5, 1000);
    let (_raw, (lnum, offs, len)) = appender.put_dent(key, 20, b"cached", 1);
    tnc.add_nm(key, lnum, offs, len, b"cached").unwrap();

    assert_eq!(tnc.to_stats().lnc_bytes, 0);
    tnc.lookup_nm(&key, b"cached").unwrap();
    let cached = tnc.to_stats().lnc_bytes;
    assert!(cached > 0);

    // eviction happens before the branch is dropped
    tnc.remove_nm(&key, b"cached").unwrap();
    assert_eq!(tnc.to_stats().lnc_bytes, 0);

    // with a zero budget the cache silently skips
    let mut config = small_config("test_lnc_zero");
    config.set_lnc_limit(0);
    let flash = Arc::new(MemFlash::new(&config));
    let lprops = Arc::new(MemLprops::new(&config));
    let tnc = Tnc::create(config, Arc::clone(&flash), lprops);
    let mut appender = Appender::new(&flash, 10);
    let (raw, (lnum, offs, len)) = appender.put_dent(key, 21, b"uncached", 1);
    tnc.add_nm(key, lnum, offs, len, b"uncached").unwrap();
    assert_eq!(tnc.lookup_nm(&key, b"uncached").unwrap(), raw);
    assert_eq!(tnc.to_stats().lnc_bytes, 0);
}

#[test]
fn test_tree_height() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_tree_height {}", seed);

    let (_config, flash, _lprops, tnc) = setup("test_tree_height");
    let mut appender = Appender::new(&flash, 10);

    let mut blocks: Vec<u32> = (0..500).collect();
    for i in (1..blocks.len()).rev() {
        blocks.swap(i, rng.gen::<usize>() % (i + 1));
    }
    for (sq, block) in blocks.iter().enumerate() {
        let (key, _raw, (lnum, offs, len)) = appender.put_data(1, *block, sq as u64 + 1);
        tnc.add(key, lnum, offs, len).unwrap();
    }

    let stats = tnc.validate().unwrap();
    // ceil(log8(500)) + 1
    let bound = ((500_f64).log(8.0).ceil() as usize) + 1;
    assert!(stats.height <= bound, "height {} bound {}", stats.height, bound);
}
