//! Background range sampler.
//!
//! Reads the raw positions of the calibrated servos once per period and
//! folds them into the session. Stopping unparks the thread, so a stop
//! is observed within one period.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::Session;
use crate::controller::SharedController;

const THREAD_NAME: &str = "armlink-range-sampler";

/// Running sampler thread.
pub(crate) struct RangeSampler {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RangeSampler {
    /// Spawn the sampler for `ids`.
    pub(crate) fn spawn(
        controller: Arc<SharedController>,
        session: Arc<Mutex<Session>>,
        ids: Vec<u8>,
        period: Duration,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || run(&controller, &session, &ids, period, &flag))?;
        info!(period_ms = period.as_millis() as u64, "Range sampler started");
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Signal the thread and wait for it to exit.
    pub(crate) fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                warn!("Range sampler thread panicked");
            }
            info!("Range sampler stopped");
        }
    }
}

impl Drop for RangeSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    controller: &SharedController,
    session: &Mutex<Session>,
    ids: &[u8],
    period: Duration,
    stop: &AtomicBool,
) {
    let started = Instant::now();
    let mut read_errors: u64 = 0;
    loop {
        thread::park_timeout(period);
        if stop.load(Ordering::Acquire) {
            break;
        }
        let positions = match controller.read_raw_positions(ids) {
            Ok(positions) => positions,
            Err(e) => {
                read_errors += 1;
                debug!("Range sample skipped: {}", e);
                continue;
            }
        };
        if !session.lock().record(&positions, started.elapsed()) {
            break;
        }
    }
    if read_errors > 0 {
        warn!(read_errors, "Range sampler missed samples");
    }
}
