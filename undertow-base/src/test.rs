use crate::{Ix, NodeBitmap, Pool, SegList, SegPool, SEG_WORDS};
use test_log::test;

#[test]
fn test_bitmap_members() {
    let mut bm = NodeBitmap::new();
    bm.insert(1);
    bm.insert(63);
    bm.insert(64);
    bm.insert(200);
    assert_eq!(bm.count(), 4);
    assert!(bm.contains(64));
    assert!(!bm.contains(2));
    assert_eq!(bm.iter().collect::<Vec<_>>(), vec![1, 63, 64, 200]);
    bm.remove(64);
    assert!(!bm.contains(64));
    assert_eq!(bm.count(), 3);
}

#[test]
fn test_pool_seize_release() {
    #[derive(Default)]
    struct Rec {
        val: u32,
    }
    let mut pool: Pool<Rec> = Pool::new(2);
    let a = pool.seize().unwrap();
    let b = pool.seize().unwrap();
    assert!(pool.seize().is_none());
    pool.get_mut(a).unwrap().val = 7;
    pool.release(a);
    assert!(pool.get(a).is_none());
    // Reused slot must not show the previous tenant's data.
    let c = pool.seize().unwrap();
    assert_eq!(c, a);
    assert_eq!(pool.get(c).unwrap().val, 0);
    assert_eq!(pool.in_use(), 2);
    let live: Vec<Ix<Rec>> = pool.iter_live().map(|(ix, _)| ix).collect();
    assert_eq!(live, vec![c, b]);
}

#[test]
#[should_panic]
fn test_pool_double_release() {
    let mut pool: Pool<u32> = Pool::new(1);
    let a = pool.seize().unwrap();
    pool.release(a);
    pool.release(a);
}

#[test]
fn test_segbuf_append_iter() {
    let mut pool = SegPool::new(4 * SEG_WORDS);
    let mut list = SegList::new();
    let words: Vec<u32> = (0..30).collect();
    pool.append(&mut list, &words[..5]).unwrap();
    pool.append(&mut list, &words[5..30]).unwrap();
    assert_eq!(list.len(), 30);
    assert_eq!(pool.to_vec(&list), words);
    pool.release(&mut list);
    assert!(list.is_empty());
    assert_eq!(pool.free_words(), 4 * SEG_WORDS);
}

#[test]
fn test_segbuf_exhaustion_is_atomic() {
    let mut pool = SegPool::new(SEG_WORDS);
    let mut list = SegList::new();
    pool.append(&mut list, &[1, 2, 3]).unwrap();
    // Needs a second segment but the pool only has one.
    assert!(pool.append(&mut list, &vec![0; SEG_WORDS]).is_err());
    assert_eq!(list.len(), 3);
    assert_eq!(pool.to_vec(&list), vec![1, 2, 3]);
}
