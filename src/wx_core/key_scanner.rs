//! Master-key recovery by signature scan.
//!
//! The v4 client keeps the 32-byte master key behind a heap pointer that
//! is immediately followed by a fixed length/capacity marker. Workers
//! search every shipped memory region for that marker from the end of the
//! buffer toward the start, chase each preceding pointer with a fresh
//! process read, and hand the 32 bytes to the database validator. The
//! first validated key wins the scan.

/// 24-byte marker trailing the key pointer: an 8-byte zero field, the
/// length 0x20, and the capacity 0x2f, all little-endian u64.
pub const V4_KEY_PATTERN: [u8; 24] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x2F, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

const PTR_SIZE: usize = 8;
const PTR_MIN: u64 = 0x10000;
const PTR_MAX: u64 = 0x7FFF_FFFF_FFFF;

/// Enumerates candidate key pointers in one region buffer, walking
/// matches from the end toward the start. The window end shrinks by one
/// byte past each hit so overlapping matches are enumerated too.
pub fn pointer_candidates(buffer: &[u8]) -> Vec<u64> {
    let mut candidates = Vec::new();
    let mut end = buffer.len();

    while end >= V4_KEY_PATTERN.len() {
        let hit = buffer[..end]
            .windows(V4_KEY_PATTERN.len())
            .rposition(|w| w == V4_KEY_PATTERN);
        let index = match hit {
            Some(index) => index,
            None => break,
        };

        if index >= PTR_SIZE {
            let ptr = u64::from_le_bytes(
                buffer[index - PTR_SIZE..index]
                    .try_into()
                    .expect("eight bytes before the match"),
            );
            if ptr > PTR_MIN && ptr < PTR_MAX {
                candidates.push(ptr);
            }
        }

        end = index + V4_KEY_PATTERN.len() - 1;
    }

    candidates
}

#[cfg(windows)]
pub use windows_impl::scan_master_key;

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use crate::wx_core::decryption::KEY_SIZE;
    use crate::wx_core::memory::{
        produce_regions, worker_count, MemoryRegion, KEY_SCAN_MIN_REGION, MAX_KEY_WORKERS,
        REGION_CHANNEL_CAPACITY,
    };
    use crate::wx_core::utils::{CancelToken, WxCoreError, WxCoreResult};
    use crate::wx_core::validator::Validator;
    use crate::wx_core::win_api::ProcessHandle;
    use crossbeam_channel::{bounded, Receiver, Sender};
    use log::{debug, info};

    /// Runs the producer/worker pipeline against a live process. Returns
    /// the first candidate the validator accepts, or None when the
    /// address space is exhausted without a hit.
    pub fn scan_master_key(
        pid: u32,
        validator: &Validator,
        token: &CancelToken,
    ) -> WxCoreResult<Option<[u8; KEY_SIZE]>> {
        let handle = ProcessHandle::open(pid)?;
        let scan = CancelToken::new();

        let (region_tx, region_rx) = bounded::<MemoryRegion>(REGION_CHANNEL_CAPACITY);
        let (result_tx, result_rx) = bounded::<[u8; KEY_SIZE]>(1);

        let workers = worker_count(MAX_KEY_WORKERS);
        debug!("starting {} workers for the master key search", workers);

        std::thread::scope(|s| {
            for _ in 0..workers {
                let region_rx = region_rx.clone();
                let result_tx = result_tx.clone();
                let handle = &handle;
                let scan = &scan;
                s.spawn(move || {
                    key_worker(handle, validator, region_rx, result_tx, token, scan)
                });
            }
            drop(region_rx);
            drop(result_tx);

            s.spawn(|| {
                producer(&handle, &region_tx, token, &scan);
                drop(region_tx);
            });
        });

        if let Ok(key) = result_rx.try_recv() {
            info!("master key recovered for pid {}", pid);
            return Ok(Some(key));
        }
        token.check()?;
        info!("master key scan finished without a valid candidate");
        Ok(None)
    }

    fn producer(
        handle: &ProcessHandle,
        region_tx: &Sender<MemoryRegion>,
        token: &CancelToken,
        scan: &CancelToken,
    ) {
        if token.is_cancelled() {
            scan.cancel();
            return;
        }
        produce_regions(handle, KEY_SCAN_MIN_REGION, region_tx, scan);
    }

    fn key_worker(
        handle: &ProcessHandle,
        validator: &Validator,
        region_rx: Receiver<MemoryRegion>,
        result_tx: Sender<[u8; KEY_SIZE]>,
        token: &CancelToken,
        scan: &CancelToken,
    ) {
        for region in region_rx.iter() {
            if token.is_cancelled() || scan.is_cancelled() {
                return;
            }

            for ptr in pointer_candidates(&region.bytes) {
                if token.is_cancelled() || scan.is_cancelled() {
                    return;
                }

                // The pointed-to bytes live outside this buffer; fetch
                // them fresh from the target. Unreadable pointers are
                // just dropped.
                let key: [u8; KEY_SIZE] = match handle.read_exact(ptr) {
                    Ok(key) => key,
                    Err(_) => continue,
                };

                if validator.validate(&key) {
                    // Capacity-1 channel: exactly one winner is kept.
                    let _ = result_tx.try_send(key);
                    scan.cancel();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with_match(at: usize, ptr: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0xccu8; len];
        buf[at - PTR_SIZE..at].copy_from_slice(&ptr.to_le_bytes());
        buf[at..at + V4_KEY_PATTERN.len()].copy_from_slice(&V4_KEY_PATTERN);
        buf
    }

    #[test]
    fn finds_a_single_candidate() {
        let buf = buffer_with_match(100, 0x1234_5678, 4096);
        assert_eq!(pointer_candidates(&buf), vec![0x1234_5678]);
    }

    #[test]
    fn walks_matches_from_high_addresses_to_low() {
        let mut buf = vec![0xccu8; 4096];
        for (at, ptr) in [(100usize, 0x11_0000u64), (900, 0x22_0000), (2000, 0x33_0000)] {
            buf[at - PTR_SIZE..at].copy_from_slice(&ptr.to_le_bytes());
            buf[at..at + V4_KEY_PATTERN.len()].copy_from_slice(&V4_KEY_PATTERN);
        }
        assert_eq!(
            pointer_candidates(&buf),
            vec![0x33_0000, 0x22_0000, 0x11_0000]
        );
    }

    #[test]
    fn adjacent_matches_are_both_enumerated() {
        // Second marker begins right where the first ends; shrinking the
        // window end one byte past each hit must still surface both.
        let mut buf = vec![0xccu8; 512];
        let first = 64;
        let second = first + V4_KEY_PATTERN.len();
        buf[first - PTR_SIZE..first].copy_from_slice(&0x44_0000u64.to_le_bytes());
        buf[first..first + V4_KEY_PATTERN.len()].copy_from_slice(&V4_KEY_PATTERN);
        buf[second..second + V4_KEY_PATTERN.len()].copy_from_slice(&V4_KEY_PATTERN);
        // The "pointer" before the second match is the tail of the first
        // pattern (all zeros), which the range filter rejects.
        assert_eq!(pointer_candidates(&buf), vec![0x44_0000]);
    }

    #[test]
    fn pointer_range_filter_applies() {
        for (ptr, expected) in [
            (0x10000u64, 0usize),      // lower bound is exclusive
            (0x10001, 1),
            (0x7FFF_FFFF_FFFF, 0),     // upper bound is exclusive
            (0x7FFF_FFFF_FFFE, 1),
            (0, 0),
        ] {
            let buf = buffer_with_match(200, ptr, 1024);
            assert_eq!(pointer_candidates(&buf).len(), expected, "ptr {:#x}", ptr);
        }
    }

    #[test]
    fn match_too_close_to_buffer_start_has_no_pointer() {
        let mut buf = vec![0u8; 256];
        buf[4..4 + V4_KEY_PATTERN.len()].copy_from_slice(&V4_KEY_PATTERN);
        assert!(pointer_candidates(&buf).is_empty());
    }

    #[test]
    fn empty_and_short_buffers_yield_nothing() {
        assert!(pointer_candidates(&[]).is_empty());
        assert!(pointer_candidates(&[0u8; 16]).is_empty());
    }
}
