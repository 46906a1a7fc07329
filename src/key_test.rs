use arbitrary::Unstructured;
use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;

#[test]
fn test_key_order() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_key_order {}", seed);

    // lexicographic on (ino, type, disc)
    assert!(Key::inode(1) < Key::data(1, 0));
    assert!(Key::data(1, MAX_BLOCK) < Key::dent(1, 0));
    assert!(Key::dent(1, MAX_HASH) < Key::xent(1, 0));
    assert!(Key::xent(1, MAX_HASH) < Key::highest(1));
    assert!(Key::highest(1) < Key::inode(2));

    for _i in 0..1_000 {
        let bytes = rng.gen::<[u8; 32]>();
        let mut uns = Unstructured::new(&bytes);
        let (a, b) = (
            uns.arbitrary::<Key>().unwrap(),
            uns.arbitrary::<Key>().unwrap(),
        );
        let t = (a.to_ino(), a.to_type(), a.to_hash());
        let u = (b.to_ino(), b.to_type(), b.to_hash());
        assert_eq!(a.cmp(&b), t.cmp(&u), "{} {}", a, b);
    }
}

#[test]
fn test_key_codec() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_key_codec {}", seed);

    for _i in 0..1_000 {
        let bytes = rng.gen::<[u8; 16]>();
        let mut uns = Unstructured::new(&bytes);
        let key: Key = uns.arbitrary().unwrap();
        assert_eq!(key, Key::decode(&key.encode()).unwrap());
    }

    // encoding preserves order
    for _i in 0..1_000 {
        let bytes = rng.gen::<[u8; 32]>();
        let mut uns = Unstructured::new(&bytes);
        let (a, b) = (
            uns.arbitrary::<Key>().unwrap(),
            uns.arbitrary::<Key>().unwrap(),
        );
        let (ea, eb) = (
            u64::from_le_bytes(a.encode()),
            u64::from_le_bytes(b.encode()),
        );
        // low word is ino, compare as (hi, lo)
        let ea = (ea >> 32, ea & 0xFFFF_FFFF);
        let eb = (eb >> 32, eb & 0xFFFF_FFFF);
        let ea = (ea.1, ea.0);
        let eb = (eb.1, eb.0);
        assert_eq!(a.cmp(&b), ea.cmp(&eb), "{} {}", a, b);
    }

    // bad type code
    let val: u64 = 0b101 << 61; // type code 5
    assert!(Key::decode(&val.to_le_bytes()).is_err());
}

#[test]
fn test_key_hashed() {
    assert!(!Key::inode(10).is_hashed());
    assert!(!Key::data(10, 3).is_hashed());
    assert!(Key::dent(10, 3).is_hashed());
    assert!(Key::xent(10, 3).is_hashed());
    assert!(!Key::trun(10).is_hashed());
}

#[test]
fn test_r5_hash() {
    // stable across runs and never below 3
    assert_eq!(r5_hash(b"a"), r5_hash(b"a"));
    assert!(r5_hash(b"") >= 3);
    assert!(r5_hash(b"x") >= 3);
    assert!(r5_hash(b"some-much-longer-entry-name") <= MAX_HASH);

    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_r5_hash {}", seed);

    for _i in 0..1_000 {
        let n = (rng.gen::<usize>() % 64) + 1;
        let name: Vec<u8> = (0..n).map(|_| rng.gen::<u8>()).collect();
        let h = r5_hash(&name);
        assert!(h >= 3 && h <= MAX_HASH, "{}", h);
    }
}
