use crate::{node::Node, *};
use rand::prelude::*;
use std::collections::BTreeMap;

fn get_rng() -> SmallRng {
    let seed: u64 = std::env::var("SEED").map_or_else(
        |_| rand::rng().random(),
        |seed_str| seed_str.parse().unwrap(),
    );
    println!("SEED {}", seed);
    SmallRng::seed_from_u64(seed)
}

fn rand_bytes(rng: &mut impl Rng, a: usize, b: usize) -> Vec<u8> {
    let len = rng.random_range(a..=b);
    let mut buffer = vec![0; len];
    rng.fill_bytes(&mut buffer);
    buffer
}

/// Walks the whole tree checking the structural invariants: committed nodes
/// fit their page, keys are strictly ascending, leaf entries carry no child
/// pointers, inner entries mirror their child's first key, the leftmost
/// chain starts with the empty-key sentinel, all leaves sit at the same
/// depth and the host holds exactly the reachable pages.
fn check_tree(tree: &Tree<MemStore>) {
    fn check_node(
        tree: &Tree<MemStore>,
        node: &Node,
        depth: usize,
        leftmost: bool,
        pages: &mut usize,
        leaf_depths: &mut Vec<usize>,
    ) {
        *pages += 1;
        let view = node.view();
        assert!(view.nbytes() <= PAGE_SIZE);
        assert!(view.nkeys() >= 1);
        for i in 1..view.nkeys() {
            assert!(
                view.key(i - 1) < view.key(i),
                "keys out of order in page {}",
                node.id()
            );
            assert!(!view.key(i).is_empty());
        }
        for i in 0..view.nkeys() {
            assert!(view.key(i).len() <= MAX_KEY_SIZE);
            assert!(view.val(i).len() <= MAX_VALUE_SIZE);
        }
        if leftmost {
            assert!(view.key(0).is_empty(), "sentinel missing in page {}", node.id());
            if view.is_leaf() {
                assert!(view.val(0).is_empty());
            }
        }
        if view.is_leaf() {
            for i in 0..view.nkeys() {
                assert_eq!(view.ptr(i), 0);
            }
            leaf_depths.push(depth);
        } else {
            for i in 0..view.nkeys() {
                assert!(view.val(i).is_empty());
                let child = tree.fetch_node(view.ptr(i)).unwrap();
                assert_eq!(child.view().key(0), view.key(i));
                check_node(tree, &child, depth + 1, leftmost && i == 0, pages, leaf_depths);
            }
        }
    }

    let mut pages = 0;
    if tree.root() != 0 {
        let root = tree.fetch_node(tree.root()).unwrap();
        let mut leaf_depths = Vec::new();
        check_node(tree, &root, 0, true, &mut pages, &mut leaf_depths);
        assert!(
            leaf_depths.windows(2).all(|d| d[0] == d[1]),
            "leaves at unequal depths: {leaf_depths:?}"
        );
    }
    assert_eq!(
        pages,
        tree.store().num_pages(),
        "host page count doesn't match the reachable set"
    );
}

fn contents(tree: &Tree<MemStore>) -> Vec<(Vec<u8>, Vec<u8>)> {
    tree.iter()
        .unwrap()
        .map(|kv| {
            let (k, v) = kv.unwrap();
            (k.to_vec(), v.to_vec())
        })
        .collect()
}

#[test]
fn test_empty_tree() {
    let mut tree = Tree::new(MemStore::new());
    assert_eq!(tree.root(), 0);
    assert_eq!(tree.len(), 0);
    assert!(tree.is_empty());
    assert!(tree.get(b"missing").unwrap().is_none());
    assert!(!tree.delete(b"missing").unwrap());
    assert_eq!(tree.iter().unwrap().count(), 0);
    assert_eq!(tree.store().num_pages(), 0);
}

#[test]
fn test_first_insert() {
    let _ = env_logger::try_init();
    let mut tree = Tree::new(MemStore::new());
    tree.insert(b"apple", b"red").unwrap();
    assert_eq!(tree.get(b"apple").unwrap().unwrap(), b"red");
    assert!(tree.get(b"zzz").unwrap().is_none());
    assert_eq!(tree.len(), 1);
    assert_eq!(tree.store().num_pages(), 1);
    let root = tree.fetch_node(tree.root()).unwrap();
    let view = root.view();
    assert!(view.is_leaf());
    assert_eq!(view.nkeys(), 2);
    assert_eq!((view.key(0), view.val(0)), (&b""[..], &b""[..]));
    assert_eq!((view.key(1), view.val(1)), (&b"apple"[..], &b"red"[..]));
    check_tree(&tree);
}

#[test]
fn test_small_growth_stays_in_one_leaf() {
    let _ = env_logger::try_init();
    let mut tree = Tree::new(MemStore::new());
    tree.insert(b"b", b"1").unwrap();
    tree.insert(b"a", b"2").unwrap();
    tree.insert(b"c", b"3").unwrap();
    assert_eq!(tree.len(), 3);
    assert_eq!(tree.store().num_pages(), 1);
    let root = tree.fetch_node(tree.root()).unwrap();
    let view = root.view();
    assert!(view.is_leaf());
    assert_eq!(view.nkeys(), 4);
    assert_eq!(view.key(0), b"");
    assert_eq!((view.key(1), view.val(1)), (&b"a"[..], &b"2"[..]));
    assert_eq!((view.key(2), view.val(2)), (&b"b"[..], &b"1"[..]));
    assert_eq!((view.key(3), view.val(3)), (&b"c"[..], &b"3"[..]));
    check_tree(&tree);
}

fn big_entry(i: usize) -> (Vec<u8>, Vec<u8>) {
    let mut key = vec![b'k'; MAX_KEY_SIZE];
    key[..4].copy_from_slice(format!("{i:04}").as_bytes());
    (key, vec![i as u8; MAX_VALUE_SIZE])
}

#[test]
fn test_forced_split() {
    let _ = env_logger::try_init();
    let mut tree = Tree::new(MemStore::new());
    for i in 0..10 {
        let (key, val) = big_entry(i);
        tree.insert(&key, &val).unwrap();
        check_tree(&tree);
    }
    assert_eq!(tree.len(), 10);
    let root = tree.fetch_node(tree.root()).unwrap();
    assert!(root.view().is_inner());
    check_tree(&tree);
    for i in 0..10 {
        let (key, val) = big_entry(i);
        assert_eq!(tree.get(&key).unwrap().unwrap(), val);
    }
}

#[test]
fn test_overwrite_does_not_split() {
    let _ = env_logger::try_init();
    let mut tree = Tree::new(MemStore::new());
    tree.insert(b"k", b"v1").unwrap();
    let nkeys_before = tree.fetch_node(tree.root()).unwrap().view().nkeys();
    tree.insert(b"k", b"v2").unwrap();
    assert_eq!(tree.get(b"k").unwrap().unwrap(), b"v2");
    assert_eq!(tree.len(), 1);
    let root = tree.fetch_node(tree.root()).unwrap();
    assert!(root.view().is_leaf());
    assert_eq!(root.view().nkeys(), nkeys_before);
    assert_eq!(tree.store().num_pages(), 1);
    check_tree(&tree);
}

#[test]
fn test_oversize_rejected() {
    let mut tree = Tree::new(MemStore::new());
    tree.insert(b"k", b"v").unwrap();
    let root_before = tree.root();
    let page_before = tree.store().fetch(root_before).unwrap();
    let pages_before = tree.store().num_pages();

    let long_key = vec![0u8; MAX_KEY_SIZE + 1];
    assert!(matches!(
        tree.insert(&long_key, b"x"),
        Err(Error::OversizeKey(_))
    ));
    let long_val = vec![0u8; MAX_VALUE_SIZE + 1];
    assert!(matches!(
        tree.insert(b"k2", &long_val),
        Err(Error::OversizeValue(_))
    ));
    assert!(matches!(tree.delete(&long_key), Err(Error::OversizeKey(_))));

    // the tree is untouched, down to the exact root bytes
    assert_eq!(tree.root(), root_before);
    assert_eq!(tree.store().num_pages(), pages_before);
    assert_eq!(tree.store().fetch(root_before).unwrap()[..], page_before[..]);
    assert_eq!(tree.len(), 1);

    // boundary lengths are accepted
    tree.insert(&vec![1u8; MAX_KEY_SIZE], &vec![2u8; MAX_VALUE_SIZE])
        .unwrap();
    check_tree(&tree);
}

#[test]
fn test_empty_key_rejected() {
    let mut tree = Tree::new(MemStore::new());
    assert!(matches!(tree.insert(b"", b"v"), Err(Error::EmptyKey)));
    assert!(matches!(tree.delete(b""), Err(Error::EmptyKey)));
    tree.insert(b"a", b"1").unwrap();
    assert!(tree.get(b"").unwrap().is_none());
    check_tree(&tree);
}

#[test]
fn test_delete_with_merge() {
    let _ = env_logger::try_init();
    let mut tree = Tree::new(MemStore::new());
    // entries sized so a leaf holds at most 4 and merges kick in quickly
    let mut keys = Vec::new();
    for i in 0..12u32 {
        let key = format!("key-{i:02}").into_bytes();
        tree.insert(&key, &[i as u8; 1000]).unwrap();
        keys.push(key);
        check_tree(&tree);
    }
    let root = tree.fetch_node(tree.root()).unwrap();
    assert!(root.view().is_inner());
    let children_before = root.view().nkeys();
    assert!(children_before >= 3);

    // empty out the keys routed to a middle child; its survivors must be
    // absorbed by a sibling rather than left under-filled
    let middle = tree.fetch_node(root.view().ptr(1)).unwrap();
    let middle_keys: Vec<Vec<u8>> = (0..middle.view().nkeys())
        .map(|i| middle.view().key(i).to_vec())
        .collect();
    for key in &middle_keys {
        assert!(tree.delete(key).unwrap());
        check_tree(&tree);
    }
    let root = tree.fetch_node(tree.root()).unwrap();
    assert!(root.view().nkeys() < children_before);

    // deleting everything but one key shrinks the root back to a leaf
    for key in keys.iter().filter(|k| !middle_keys.contains(*k)).skip(1) {
        assert!(tree.delete(key).unwrap());
        check_tree(&tree);
    }
    assert_eq!(tree.len(), 1);
    let root = tree.fetch_node(tree.root()).unwrap();
    assert!(root.view().is_leaf());
    assert_eq!(tree.store().num_pages(), 1);

    // deleting the last key leaves a sentinel-only root leaf
    let last = keys.iter().find(|k| !middle_keys.contains(*k)).unwrap();
    assert!(tree.delete(last).unwrap());
    assert!(tree.is_empty());
    let root = tree.fetch_node(tree.root()).unwrap();
    assert_eq!(root.view().nkeys(), 1);
    assert_eq!(tree.iter().unwrap().count(), 0);
    check_tree(&tree);
}

#[test]
fn test_delete_inverse() {
    let mut tree = Tree::new(MemStore::new());
    tree.insert(b"a", b"1").unwrap();
    let root_before = tree.root();
    let page_before = tree.store().fetch(root_before).unwrap();

    tree.insert(b"b", b"2").unwrap();
    assert!(tree.delete(b"b").unwrap());
    // observably back to the previous state (the page number moved, pages
    // are copy-on-write, but the contents round-trip)
    assert_eq!(tree.len(), 1);
    assert_eq!(
        tree.store().fetch(tree.root()).unwrap()[..],
        page_before[..]
    );
    check_tree(&tree);
}

#[test]
fn test_sequential_inserts() {
    let _ = env_logger::try_init();
    let mut tree = Tree::new(MemStore::new());
    let mut model = BTreeMap::new();
    for i in 0..1000u32 {
        let key = format!("key-{i:06}").into_bytes();
        let val = i.to_le_bytes().to_vec();
        tree.insert(&key, &val).unwrap();
        model.insert(key, val);
    }
    check_tree(&tree);
    assert_eq!(tree.len(), 1000);
    let model_contents: Vec<_> = model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    assert_eq!(contents(&tree), model_contents);
    for i in (0..1000u32).rev() {
        let key = format!("key-{i:06}").into_bytes();
        assert!(tree.delete(&key).unwrap());
    }
    assert!(tree.is_empty());
    check_tree(&tree);
}

#[test]
fn test_range_iteration() {
    let mut tree = Tree::new(MemStore::new());
    let mut model = BTreeMap::new();
    for i in 0..100u32 {
        let key = format!("{i:03}").into_bytes();
        let val = format!("v{i}").into_bytes();
        tree.insert(&key, &val).unwrap();
        model.insert(key, val);
    }

    let collect = |iter: RangeIter<'_, MemStore>| -> Vec<Vec<u8>> {
        iter.map(|kv| kv.unwrap().0.to_vec()).collect()
    };
    let model_range = |range: std::ops::Range<usize>| -> Vec<Vec<u8>> {
        range.map(|i| format!("{i:03}").into_bytes()).collect()
    };

    assert_eq!(collect(tree.iter().unwrap()), model_range(0..100));
    assert_eq!(
        collect(tree.range(&b"010"[..]..&b"020"[..]).unwrap()),
        model_range(10..20)
    );
    assert_eq!(
        collect(tree.range(&b"010"[..]..=&b"020"[..]).unwrap()),
        model_range(10..21)
    );
    assert_eq!(
        collect(
            tree.range::<&[u8]>((
                std::ops::Bound::Excluded(&b"010"[..]),
                std::ops::Bound::Unbounded
            ))
            .unwrap()
        ),
        model_range(11..100)
    );
    assert_eq!(collect(tree.range(&b"0995"[..]..).unwrap()), Vec::<Vec<u8>>::new());
    assert_eq!(
        collect(tree.range(&b"05"[..]..&b"06"[..]).unwrap()),
        model_range(50..60)
    );
    assert_eq!(collect(tree.range(&b"020"[..]..&b"010"[..]).unwrap()).len(), 0);
}

#[test]
fn test_open_from_persisted_root() {
    let mut tree = Tree::new(MemStore::new());
    for i in 0..50u32 {
        tree.insert(format!("key{i}").as_bytes(), &i.to_le_bytes())
            .unwrap();
    }
    let (root, len) = (tree.root(), tree.len());
    let store = tree.into_store();

    let mut tree = Tree::open(store, root, len);
    assert_eq!(tree.len(), 50);
    for i in 0..50u32 {
        assert_eq!(
            tree.get(format!("key{i}").as_bytes()).unwrap().unwrap(),
            i.to_le_bytes()
        );
    }
    tree.insert(b"after-reopen", b"x").unwrap();
    assert_eq!(tree.len(), 51);
    check_tree(&tree);
}

#[test]
fn test_random_model() {
    let _ = env_logger::try_init();
    let mut rng = get_rng();
    let mut tree = Tree::new(MemStore::new());
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

    for op in 0..4000 {
        match rng.random_range(0..10) {
            // weighted towards inserts so the tree actually grows
            0..=5 => {
                let key = rand_bytes(&mut rng, 1, 60);
                let val = if rng.random_range(0..20) == 0 {
                    rand_bytes(&mut rng, 0, MAX_VALUE_SIZE)
                } else {
                    rand_bytes(&mut rng, 0, 200)
                };
                tree.insert(&key, &val).unwrap();
                model.insert(key, val);
            }
            6..=7 => {
                // overwrite an existing key
                if let Some(key) = model.keys().nth(rng.random_range(0..model.len().max(1))).cloned()
                {
                    let val = rand_bytes(&mut rng, 0, 300);
                    tree.insert(&key, &val).unwrap();
                    model.insert(key, val);
                }
            }
            _ => {
                let key = if model.is_empty() || rng.random_range(0..4) == 0 {
                    rand_bytes(&mut rng, 1, 60)
                } else {
                    let nth = rng.random_range(0..model.len());
                    model.keys().nth(nth).cloned().unwrap()
                };
                assert_eq!(tree.delete(&key).unwrap(), model.remove(&key).is_some());
            }
        }
        assert_eq!(tree.len(), model.len() as u64);
        if op % 500 == 499 {
            check_tree(&tree);
            let model_contents: Vec<_> =
                model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            assert_eq!(contents(&tree), model_contents);
        }
    }

    check_tree(&tree);
    for (key, val) in &model {
        assert_eq!(tree.get(key).unwrap().unwrap(), *val);
    }
    assert!(tree.get(&rand_bytes(&mut rng, 61, 70)).unwrap().is_none());
}
