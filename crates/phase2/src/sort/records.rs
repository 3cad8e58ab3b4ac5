//! In-place sorting of fixed-width records stored back to back in a byte
//! slice.
//!
//! Table entries are not Rust values with a type to sort by, only runs of
//! `entry_size` bytes, so the standard slice sorts don't apply.  This is a
//! heapsort that works on the records through a comparator and swaps them
//! in place, so sorting a bucket needs no memory beyond the bucket itself.
//! Short inputs are insertion sorted instead.
//!
//! The sort is not stable.  Callers that need reproducible output must pass
//! a comparator under which only byte-identical records compare equal.

use std::cmp::Ordering;

/// Inputs with at most this many records are insertion sorted.
const INSERTION_RECORDS: usize = 16;

/// Sorts the `entry_size`-byte records of `data` by `cmp`.
pub fn sort_records<F>(data: &mut [u8], entry_size: usize, cmp: F)
where
    F: Fn(&[u8], &[u8]) -> Ordering,
{
    assert!(entry_size > 0);
    assert_eq!(data.len() % entry_size, 0);
    let n = data.len() / entry_size;
    if n <= INSERTION_RECORDS {
        insertion_sort(data, entry_size, &cmp);
        return;
    }

    for root in (0..n / 2).rev() {
        sift_down(data, entry_size, root, n, &cmp);
    }
    for end in (1..n).rev() {
        swap_records(data, entry_size, 0, end);
        sift_down(data, entry_size, 0, end, &cmp);
    }
}

fn record(data: &[u8], entry_size: usize, index: usize) -> &[u8] {
    &data[index * entry_size..(index + 1) * entry_size]
}

/// Swaps records `i` and `j`, where `i < j`.
fn swap_records(data: &mut [u8], entry_size: usize, i: usize, j: usize) {
    debug_assert!(i < j);
    let (left, right) = data.split_at_mut(j * entry_size);
    left[i * entry_size..(i + 1) * entry_size].swap_with_slice(&mut right[..entry_size]);
}

/// Restores the max-heap property below `root` for the first `end` records.
fn sift_down<F>(data: &mut [u8], entry_size: usize, mut root: usize, end: usize, cmp: &F)
where
    F: Fn(&[u8], &[u8]) -> Ordering,
{
    loop {
        let mut child = 2 * root + 1;
        if child >= end {
            break;
        }
        if child + 1 < end
            && cmp(
                record(data, entry_size, child),
                record(data, entry_size, child + 1),
            ) == Ordering::Less
        {
            child += 1;
        }
        if cmp(record(data, entry_size, root), record(data, entry_size, child)) != Ordering::Less {
            break;
        }
        swap_records(data, entry_size, root, child);
        root = child;
    }
}

fn insertion_sort<F>(data: &mut [u8], entry_size: usize, cmp: &F)
where
    F: Fn(&[u8], &[u8]) -> Ordering,
{
    let n = data.len() / entry_size;
    for i in 1..n {
        let mut j = i;
        while j > 0
            && cmp(record(data, entry_size, j - 1), record(data, entry_size, j))
                == Ordering::Greater
        {
            swap_records(data, entry_size, j - 1, j);
            j -= 1;
        }
    }
}
