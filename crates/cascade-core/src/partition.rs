//! One-shot partitioning geometry: how many sections, how large, and how much
//! overlap each one carries as its dictionary.

/// Number of sections for a blocking compression of `src_size` bytes.
///
/// Small inputs get at most one section per worker; large inputs get a whole
/// multiple of the worker count so every pass keeps the pool saturated.
pub(crate) fn nb_chunks(src_size: usize, window_log: u32, nb_workers: usize) -> usize {
    debug_assert!(nb_workers > 0);
    let chunk_target = 1usize << (window_log + 2);
    let chunk_max = chunk_target << 2;
    let pass_max = chunk_max * nb_workers;
    let multiplier = src_size / pass_max + 1;
    if multiplier > 1 {
        multiplier * nb_workers
    } else {
        (src_size / chunk_target + 1).min(nb_workers)
    }
}

/// Rounds the proposed section size up when the remainder would leave a
/// pathologically small trailing section.
pub(crate) fn average_chunk_size(src_size: usize, nb_chunks: usize) -> usize {
    let proposed = (src_size + nb_chunks - 1) / nb_chunks;
    if ((proposed - 1) & 0x1FFFF) < 0x7FFF {
        proposed + 0xFFFF
    } else {
        proposed
    }
}

/// Bytes of the previous section reused as a raw-content dictionary.
///
/// `overlap_log` 0 disables the overlap entirely; 9 reuses a full window.
pub(crate) fn overlap_size(window_log: u32, overlap_log: u32) -> usize {
    let rlog = if overlap_log > 9 { 0 } else { 9 - overlap_log };
    if rlog >= 9 {
        0
    } else {
        1usize << (window_log - rlog)
    }
}

/// Job-table capacity: the power of two strictly greater than `nb`.
pub(crate) fn ring_size_for(nb: usize) -> usize {
    let nb = nb.max(1);
    1usize << (usize::BITS - nb.leading_zeros())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_inputs_cap_at_worker_count() {
        // window_log 17 => 512 KiB target sections
        assert_eq!(nb_chunks(100, 17, 4), 1);
        assert_eq!(nb_chunks(600 << 10, 17, 4), 2);
        assert_eq!(nb_chunks(4 << 20, 17, 4), 4);
    }

    #[test]
    fn large_inputs_scale_by_whole_passes() {
        // pass_max = 2 MiB * 4 workers = 8 MiB at window_log 17
        assert_eq!(nb_chunks(9 << 20, 17, 4), 8);
        assert_eq!(nb_chunks(17 << 20, 17, 4), 12);
    }

    #[test]
    fn average_avoids_small_tail() {
        // proposed just above a 128 KiB boundary gets rounded up
        let bumped = average_chunk_size(513 << 10, 2);
        assert_eq!(bumped, (513 << 10) / 2 + 0xFFFF);
        // proposed comfortably inside the window stays as proposed
        let kept = average_chunk_size(600 << 10, 2);
        assert_eq!(kept, 300 << 10);
    }

    #[test]
    fn average_is_large_enough_for_in_order_drain() {
        for src in [(600 << 10) + 7, 3 << 20, (50 << 20) + 12345] {
            for workers in [2, 4, 8] {
                let nb = nb_chunks(src, 17, workers);
                if nb > 1 {
                    assert!(average_chunk_size(src, nb) >= 256 << 10);
                }
            }
        }
    }

    #[test]
    fn overlap_table() {
        assert_eq!(overlap_size(20, 0), 0);
        assert_eq!(overlap_size(20, 9), 1 << 20);
        assert_eq!(overlap_size(20, 15), 1 << 20); // clamps to 9
        assert_eq!(overlap_size(17, 6), 1 << 14);
    }

    #[test]
    fn ring_is_strictly_larger_power_of_two() {
        assert_eq!(ring_size_for(1), 2);
        assert_eq!(ring_size_for(3), 4);
        assert_eq!(ring_size_for(4), 8);
        assert_eq!(ring_size_for(6), 8);
        assert_eq!(ring_size_for(8), 16);
    }
}
