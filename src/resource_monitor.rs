//! Background disk/memory watchdog (spec §5): a plain thread polling on an
//! interval and flipping a shared `AtomicBool` when a configured output
//! directory crosses a free-space threshold, mirroring the teacher's
//! thread-plus-shared-flag cancellation shape used for its own timers.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::warn;

/// Polls free disk space under `watch_dir` every `interval` and sets
/// `low_space` once free bytes drop below `min_free_bytes`. The fuzzer's
/// main loop checks `low_space` between iterations and stops cleanly
/// instead of running a solver against an unwritable output directory.
pub struct ResourceMonitor {
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    pub low_space: Arc<AtomicBool>,
}

impl ResourceMonitor {
    pub fn start(watch_dir: PathBuf, min_free_bytes: u64, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let low_space = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop);
        let low_space_clone = Arc::clone(&low_space);
        let handle = thread::spawn(move || {
            while !stop_clone.load(Ordering::Relaxed) {
                match free_bytes(&watch_dir) {
                    Ok(free) if free < min_free_bytes => {
                        low_space_clone.store(true, Ordering::Relaxed);
                    }
                    Ok(_) => {}
                    Err(e) => warn!("resource monitor: statvfs({watch_dir:?}) failed: {e}"),
                }
                thread::sleep(interval);
            }
        });
        ResourceMonitor { handle: Some(handle), stop, low_space }
    }

    pub fn is_low_on_space(&self) -> bool {
        self.low_space.load(Ordering::Relaxed)
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn free_bytes(path: &std::path::Path) -> nix::Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path)?;
    Ok(stat.blocks_available() * stat.fragment_size())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_detects_plenty_of_space_on_tmp() {
        let tmp = tempfile::tempdir().unwrap();
        let monitor = ResourceMonitor::start(tmp.path().to_path_buf(), 1, Duration::from_millis(10));
        thread::sleep(Duration::from_millis(50));
        assert!(!monitor.is_low_on_space());
        monitor.stop();
    }

    #[test]
    fn monitor_flags_impossible_threshold() {
        let tmp = tempfile::tempdir().unwrap();
        let monitor =
            ResourceMonitor::start(tmp.path().to_path_buf(), u64::MAX, Duration::from_millis(10));
        thread::sleep(Duration::from_millis(50));
        assert!(monitor.is_low_on_space());
        monitor.stop();
    }
}
