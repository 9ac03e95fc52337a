//! Parallel workers cooperating on one retrieve list: claims must be
//! exclusive even across separate mappings of the same file.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use filerelay::retrieve_list::RetrieveList;

#[test]
fn two_attachments_never_claim_the_same_entry() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut rl = RetrieveList::attach(dir.path(), "shared").unwrap();
        for i in 0..3 {
            rl.push(&format!("f{}", i), 10, 0, 0).unwrap();
        }
        rl.detach(true).unwrap();
    }

    // Two "workers", each with its own mapping of the same list.
    let won = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for slot in 0..2usize {
        let path = dir.path().to_path_buf();
        let won = won.clone();
        handles.push(std::thread::spawn(move || {
            let rl = RetrieveList::attach(&path, "shared").unwrap();
            let mut mine = Vec::new();
            for i in 0..rl.len() {
                if rl.claim(i, slot).is_ok() {
                    won.fetch_add(1, Ordering::SeqCst);
                    mine.push(i);
                }
            }
            (slot, mine)
        }));
    }
    let mut owner_of = [None::<usize>; 3];
    for h in handles {
        let (slot, mine) = h.join().unwrap();
        for i in mine {
            assert!(owner_of[i].is_none(), "entry {} claimed twice", i);
            owner_of[i] = Some(slot);
        }
    }
    // Every file has exactly one owner.
    assert_eq!(won.load(Ordering::SeqCst), 3);
    assert!(owner_of.iter().all(|o| o.is_some()));

    // A retrieved entry is never left assigned.
    let mut rl = RetrieveList::attach(dir.path(), "shared").unwrap();
    rl.mark_retrieved(0).unwrap();
    let e = rl.entry(0).unwrap();
    assert!(!(e.retrieved == 1 && e.assigned != 0));
}

#[test]
fn killed_worker_cleanup_releases_every_claim() {
    let dir = tempfile::tempdir().unwrap();
    let mut rl = RetrieveList::attach(dir.path(), "cleanup").unwrap();
    for i in 0..5 {
        rl.push(&format!("f{}", i), 1, 0, 0).unwrap();
    }
    rl.claim(0, 2).unwrap();
    rl.claim(2, 2).unwrap();
    rl.claim(3, 1).unwrap();
    rl.detach(true).unwrap();

    // The exit handler of slot 2 runs against a fresh mapping.
    let rl = RetrieveList::attach(dir.path(), "cleanup").unwrap();
    rl.release_all_for_slot(2);
    for i in [0usize, 2] {
        assert_eq!(rl.entry(i).unwrap().assigned, 0);
    }
    // Another worker's claim is untouched.
    assert_eq!(rl.entry(3).unwrap().assigned, 2);
}
