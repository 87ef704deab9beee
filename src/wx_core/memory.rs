use crate::wx_core::utils::CancelToken;
use crossbeam_channel::{Sender, TrySendError};
use std::time::Duration;

/// Bound on in-flight region buffers between the producer and the
/// workers.
pub const REGION_CHANNEL_CAPACITY: usize = 100;

/// Process address space usually starts here.
pub const MIN_ADDRESS: u64 = 0x10000;

/// Regions below these sizes are not worth shipping to the workers.
pub const KEY_SCAN_MIN_REGION: u64 = 1024 * 1024;
pub const IMAGE_SCAN_MIN_REGION: u64 = 16 * 1024;

pub const MAX_KEY_WORKERS: usize = 8;
pub const MAX_IMAGE_WORKERS: usize = 4;

/// One committed read-write private region, read out of the target in a
/// single pass and owned by whichever worker receives it.
#[derive(Debug)]
pub struct MemoryRegion {
    pub base: u64,
    pub bytes: Vec<u8>,
}

/// Worker count for a scan: the CPU count clamped into [2, max].
pub fn worker_count(max: usize) -> usize {
    num_cpus::get().clamp(2, max)
}

/// Blocking send that keeps observing the cancellation token, so a full
/// channel cannot wedge the producer past a cancel.
pub fn send_region(
    sender: &Sender<MemoryRegion>,
    mut region: MemoryRegion,
    token: &CancelToken,
) -> bool {
    loop {
        if token.is_cancelled() {
            return false;
        }
        match sender.try_send(region) {
            Ok(()) => return true,
            Err(TrySendError::Full(r)) => {
                region = r;
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(TrySendError::Disconnected(_)) => return false,
        }
    }
}

#[cfg(windows)]
pub use windows_impl::produce_regions;

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use crate::wx_core::win_api::ProcessHandle;
    use log::{debug, trace};

    /// Walks the target's virtual address space from [`MIN_ADDRESS`] to
    /// the architecture limit and ships every committed read-write
    /// private region of at least `min_region_size` bytes down the
    /// channel. Unreadable regions are skipped; the walk ends when the
    /// memory-info query fails or the limit is reached.
    pub fn produce_regions(
        handle: &ProcessHandle,
        min_region_size: u64,
        regions: &Sender<MemoryRegion>,
        token: &CancelToken,
    ) {
        let max_addr: u64 = match handle.pointer_size() {
            Ok(4) => 0x7FFF_FFFF,
            _ => 0x7FFF_FFFF_FFFF,
        };
        debug!(
            "scanning memory regions from {:#x} to {:#x}",
            MIN_ADDRESS, max_addr
        );

        let mut current = MIN_ADDRESS;
        while current < max_addr {
            if token.is_cancelled() {
                return;
            }

            let info = match handle.virtual_query(current) {
                Some(info) => info,
                None => break,
            };

            if info.size < min_region_size {
                current = current.saturating_add(info.size.max(1));
                continue;
            }

            if info.committed && info.read_write && info.private {
                let mut size = info.size;
                if current + size > max_addr {
                    size = max_addr - current;
                }
                match handle.read_memory(current, size as usize) {
                    Ok(bytes) => {
                        trace!(
                            "memory region for analysis: {:#x} + {} bytes",
                            current,
                            bytes.len()
                        );
                        if !send_region(
                            regions,
                            MemoryRegion {
                                base: current,
                                bytes,
                            },
                            token,
                        ) {
                            return;
                        }
                    }
                    // Unreadable regions are not fatal for the scan.
                    Err(_) => {}
                }
            }

            current = info.base.saturating_add(info.size.max(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn worker_count_stays_clamped() {
        let n = worker_count(MAX_KEY_WORKERS);
        assert!((2..=MAX_KEY_WORKERS).contains(&n));
        let n = worker_count(MAX_IMAGE_WORKERS);
        assert!((2..=MAX_IMAGE_WORKERS).contains(&n));
    }

    #[test]
    fn send_region_stops_on_cancel() {
        let (tx, _rx) = bounded(1);
        let token = CancelToken::new();

        assert!(send_region(
            &tx,
            MemoryRegion {
                base: 0x10000,
                bytes: vec![0u8; 8]
            },
            &token,
        ));

        // Channel now full; a cancelled token must break the retry loop.
        token.cancel();
        assert!(!send_region(
            &tx,
            MemoryRegion {
                base: 0x20000,
                bytes: vec![0u8; 8]
            },
            &token,
        ));
    }

    #[test]
    fn send_region_reports_disconnect() {
        let (tx, rx) = bounded(1);
        drop(rx);
        assert!(!send_region(
            &tx,
            MemoryRegion {
                base: 0,
                bytes: Vec::new()
            },
            &CancelToken::new(),
        ));
    }
}
