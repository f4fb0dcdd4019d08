//! Packed reader-count / free-bit atomic primitives.
//!
//! Every ring slot carries a single `u32` that encodes
//! `(readers << 1) | free_bit`. Readers modify the count only by atomic
//! add/sub of 2; the writer toggles the free bit only by atomic add/sub
//! of 1. Both sides update optimistically: if the observed prior value
//! shows the other side got there first, the change is undone and the
//! operation reports failure. The asymmetry is what lets the two kinds
//! of update race without corrupting each other, so it must be preserved
//! exactly.
//!
//! Ordering contract:
//!
//! - A successful reader pin (`fetch_add(2, Acquire)`) synchronizes with
//!   the writer's release when it cleared the free bit, so the reader
//!   observes the slot's final `{version, file_size, top_ref}`.
//! - A reader unpin (`fetch_sub(2, Release)`) synchronizes with the
//!   writer's acquire when it later sets the free bit, so all the
//!   reader's loads happen before the slot is recycled.

use std::sync::atomic::{AtomicU32, Ordering};

/// Pin a slot: add a reader iff the free bit is clear.
///
/// Returns `false` (after undoing the increment) if the slot was free.
#[inline]
pub fn double_inc_if_even(counter: &AtomicU32) -> bool {
    let prior = counter.fetch_add(2, Ordering::Acquire);
    if prior & 1 == 1 {
        // Slot was free; back off.
        counter.fetch_sub(2, Ordering::Relaxed);
        return false;
    }
    true
}

/// Unpin a slot.
#[inline]
pub fn double_dec(counter: &AtomicU32) {
    counter.fetch_sub(2, Ordering::Release);
}

/// Mark a slot free iff it has no readers.
///
/// Returns `false` (after undoing the increment) if a reader was
/// present.
#[inline]
pub fn one_if_zero(counter: &AtomicU32) -> bool {
    let prior = counter.fetch_add(1, Ordering::Acquire);
    if prior != 0 {
        // Somebody is reading; back off.
        counter.fetch_sub(1, Ordering::Relaxed);
        return false;
    }
    true
}

/// Clear the free bit when publishing a newly initialized slot.
#[inline]
pub fn dec_release(counter: &AtomicU32) {
    counter.fetch_sub(1, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn pin_fails_on_free_slot() {
        let count = AtomicU32::new(1); // free
        assert!(!double_inc_if_even(&count));
        assert_eq!(count.load(Ordering::Relaxed), 1, "failed pin must undo");
    }

    #[test]
    fn pin_unpin_roundtrip() {
        let count = AtomicU32::new(0); // live, no readers
        assert!(double_inc_if_even(&count));
        assert_eq!(count.load(Ordering::Relaxed), 2);
        assert!(double_inc_if_even(&count));
        assert_eq!(count.load(Ordering::Relaxed), 4);
        double_dec(&count);
        double_dec(&count);
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn free_fails_with_reader() {
        let count = AtomicU32::new(2); // one reader
        assert!(!one_if_zero(&count));
        assert_eq!(count.load(Ordering::Relaxed), 2, "failed free must undo");
    }

    #[test]
    fn free_then_publish() {
        let count = AtomicU32::new(0);
        assert!(one_if_zero(&count));
        assert_eq!(count.load(Ordering::Relaxed), 1);
        dec_release(&count);
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn reader_and_recycler_race_is_exclusive() {
        // Many rounds of one pinner vs one recycler on the same slot:
        // exactly one of them may win any given round, and a loser's undo
        // must leave the counter where it started.
        for _ in 0..200 {
            let count = Arc::new(AtomicU32::new(0));
            let c1 = Arc::clone(&count);
            let c2 = Arc::clone(&count);

            let pinner = thread::spawn(move || double_inc_if_even(&c1));
            let recycler = thread::spawn(move || one_if_zero(&c2));
            let pinned = pinner.join().unwrap();
            let freed = recycler.join().unwrap();

            assert!(
                !(pinned && freed),
                "a slot may not be pinned and freed at once"
            );
            let value = count.load(Ordering::Relaxed);
            match (pinned, freed) {
                (true, false) => assert_eq!(value, 2),
                (false, true) => assert_eq!(value, 1),
                (false, false) => unreachable!("one side must win"),
                (true, true) => unreachable!(),
            }
        }
    }

    #[test]
    fn many_readers_balance_to_zero() {
        let count = Arc::new(AtomicU32::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let count = Arc::clone(&count);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        assert!(double_inc_if_even(&count));
                        double_dec(&count);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }
}
