//! Balanced partitioning primitives shared by the CPU and GPU matchers and
//! the distributor. Ported directly from the original `distrib` /
//! `fill_in_buckets` / `fill_in_buckets_bitmap` C routines: every behavior
//! here, including which bucket gets the remainder, must match bit for bit
//! so the matchers that build on it produce identical mappings.

use crate::bitmap::Bitset;

/// Splits `work` units across `buckets` buckets as evenly as possible: the
/// first `work % buckets` buckets get `work / buckets + 1`, the rest get
/// `work / buckets`. `buckets` must be nonzero.
pub fn distrib(work: usize, buckets: usize) -> Vec<usize> {
    assert!(buckets > 0, "distrib: buckets must be nonzero");
    let avg = work / buckets;
    let rem = work % buckets;
    (0..buckets)
        .map(|i| if i < rem { avg + 1 } else { avg })
        .collect()
}

/// Distributes `nbuckets` buckets across a slice of `elems` items, in the
/// same consecutive-run style as the original. Two shapes:
///
/// - if `elems.len() >= nbuckets`: each bucket gets a consecutive run of
///   elements (`distrib(elems.len(), nbuckets)` sized), concatenated into
///   the bucket's output.
/// - if `elems.len() < nbuckets`: each element is instead spread across a
///   consecutive run of buckets (`distrib(nbuckets, elems.len())` sized),
///   so every bucket gets (a copy of) exactly one element.
pub fn fill_in_buckets<T: Clone>(elems: &[T], nbuckets: usize) -> Vec<Vec<T>> {
    assert!(nbuckets > 0, "fill_in_buckets: nbuckets must be nonzero");
    let mut out: Vec<Vec<T>> = vec![Vec::new(); nbuckets];
    if elems.is_empty() {
        return out;
    }
    if elems.len() >= nbuckets {
        let sizes = distrib(elems.len(), nbuckets);
        let mut cursor = 0;
        for (bucket, size) in out.iter_mut().zip(sizes) {
            bucket.extend_from_slice(&elems[cursor..cursor + size]);
            cursor += size;
        }
    } else {
        let sizes = distrib(nbuckets, elems.len());
        let mut bucket_idx = 0;
        for (elem, size) in elems.iter().zip(sizes) {
            for _ in 0..size {
                out[bucket_idx].push(elem.clone());
                bucket_idx += 1;
            }
        }
    }
    out
}

/// Bitmap-input variant of [`fill_in_buckets`]: the elements are the set
/// bits of `elems`, and each output bucket is a `Bitset` of the elements it
/// was assigned.
pub fn fill_in_buckets_bitmap(elems: &Bitset, nbuckets: usize) -> Vec<Bitset> {
    let items = elems.to_vec();
    fill_in_buckets(&items, nbuckets)
        .into_iter()
        .map(Bitset::from_iter)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distrib_even() {
        assert_eq!(distrib(8, 4), vec![2, 2, 2, 2]);
    }

    #[test]
    fn distrib_remainder_goes_to_front() {
        assert_eq!(distrib(10, 4), vec![3, 3, 2, 2]);
        assert_eq!(distrib(1, 4), vec![1, 0, 0, 0]);
    }

    #[test]
    fn fill_in_buckets_more_elems_than_buckets() {
        let elems: Vec<usize> = (0..10).collect();
        let buckets = fill_in_buckets(&elems, 4);
        assert_eq!(buckets, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6, 7], vec![8, 9]]);
    }

    #[test]
    fn fill_in_buckets_fewer_elems_than_buckets() {
        let elems: Vec<usize> = vec![10, 20];
        let buckets = fill_in_buckets(&elems, 5);
        assert_eq!(buckets, vec![vec![10], vec![10], vec![10], vec![20], vec![20]]);
    }

    #[test]
    fn fill_in_buckets_bitmap_matches_vec_form() {
        let elems = Bitset::from_iter([0, 1, 2, 3, 4, 5, 6, 7]);
        let buckets = fill_in_buckets_bitmap(&elems, 3);
        let sizes: Vec<usize> = buckets.iter().map(|b| b.weight()).collect();
        assert_eq!(sizes, vec![3, 3, 2]);
    }
}
