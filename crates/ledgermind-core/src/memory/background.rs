//! Background maintenance loop.
//!
//! Runs decay, reflection, and an integrity resync on a dedicated thread.
//! The loop polls a cooperative cancel flag every second and never
//! interleaves with request handlers beyond the store locks themselves.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::memory::Memory;

/// Poll interval for the cancel flag
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Handle to a running maintenance loop
pub struct MaintenanceLoop {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceLoop {
    /// Spawn the loop, running maintenance every `interval`.
    pub fn start(memory: Arc<Memory>, interval: Duration) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let handle = std::thread::Builder::new()
            .name("ledgermind-maintenance".into())
            .spawn(move || {
                let mut last_run: Option<Instant> = None;
                while flag.load(Ordering::Relaxed) {
                    let due = last_run.map_or(true, |t| t.elapsed() >= interval);
                    if due {
                        tracing::debug!("running background maintenance");
                        if let Err(e) = memory.run_decay(false) {
                            tracing::error!("background decay failed: {e}");
                        }
                        if let Err(e) = memory.run_reflection() {
                            tracing::error!("background reflection failed: {e}");
                        }
                        if let Err(e) = memory.semantic().sync_meta_index(false) {
                            tracing::error!("background meta resync failed: {e}");
                        }
                        last_run = Some(Instant::now());
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            })
            .expect("failed to spawn maintenance thread");

        Self {
            running,
            handle: Some(handle),
        }
    }

    /// Whether the loop is still running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Signal the loop to stop and wait for it to exit
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MaintenanceLoop {
    fn drop(&mut self) {
        self.stop();
    }
}
