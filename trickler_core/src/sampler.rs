//! Threaded weight sampler.
//!
//! A reader thread owns the scale capability and feeds a bounded(1)
//! channel; the newest reading always wins. The `Sampler` handle itself
//! implements `Scale`, so the charge controller does not care whether it
//! is wired to a live instrument or to this thread.

use crossbeam_channel as xch;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use trickler_traits::{Clock, Scale};

/// Per-read timeout used by the reader thread; short enough that tare and
/// shutdown requests are picked up promptly.
const READ_TIMEOUT_MS: u64 = 200;

pub struct Sampler {
    rx: xch::Receiver<f32>,
    latest_bits: Arc<AtomicU32>,
    last_ok_ms: Arc<AtomicU64>,
    tare: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl Sampler {
    pub fn spawn<S>(mut scale: S, clock: Arc<dyn Clock + Send + Sync>) -> Self
    where
        S: Scale + Send + 'static,
    {
        let (tx, rx) = xch::bounded::<f32>(1);
        let drain = rx.clone();
        let latest_bits = Arc::new(AtomicU32::new(f32::NAN.to_bits()));
        let last_ok_ms = Arc::new(AtomicU64::new(0));
        let tare = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_latest = latest_bits.clone();
        let thread_last_ok = last_ok_ms.clone();
        let thread_tare = tare.clone();
        let thread_stop = stop.clone();
        let thread_clock = clock.clone();

        std::thread::spawn(move || {
            while !thread_stop.load(Ordering::Relaxed) {
                if thread_tare.swap(false, Ordering::Relaxed) {
                    scale.force_zero();
                }
                match scale.wait_next(READ_TIMEOUT_MS) {
                    Some(v) => {
                        thread_latest.store(v.to_bits(), Ordering::Relaxed);
                        thread_last_ok.store(thread_clock.now_ms(), Ordering::Relaxed);
                        // Newest reading wins; a full queue sheds the one
                        // nobody consumed.
                        if tx.try_send(v).is_err() {
                            let _ = drain.try_recv();
                            let _ = tx.try_send(v);
                        }
                    }
                    None => {
                        // Timeout is not an error; the consumer has its own
                        // stall watchdog.
                    }
                }
            }
        });

        Self {
            rx,
            latest_bits,
            last_ok_ms,
            tare,
            stop,
            clock,
        }
    }

    /// Milliseconds since the last good reading.
    pub fn stalled_for(&self) -> u64 {
        self.clock
            .now_ms()
            .saturating_sub(self.last_ok_ms.load(Ordering::Relaxed))
    }
}

impl Scale for Sampler {
    fn current(&self) -> f32 {
        f32::from_bits(self.latest_bits.load(Ordering::Relaxed))
    }

    fn wait_next(&mut self, timeout_ms: u64) -> Option<f32> {
        self.rx
            .recv_timeout(Duration::from_millis(timeout_ms))
            .ok()
    }

    fn force_zero(&mut self) {
        self.tare.store(true, Ordering::Relaxed);
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
