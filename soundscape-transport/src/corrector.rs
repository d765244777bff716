//! Periodic drift corrector.
//!
//! Runs as a tokio task that sleeps a jittered interval, then asks the
//! transport core for one drift check.  Jitter keeps peers that joined at
//! the same moment from correcting in lockstep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use soundscape_core::lock_unpoisoned;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::sync::TransportCore;

/// Handle to a running corrector task.  Dropping it cancels the task.
pub(crate) struct CorrectorHandle {
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl CorrectorHandle {
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.task.abort();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.task.is_finished()
    }
}

impl Drop for CorrectorHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Base interval scaled by a random factor in `[1 - ratio, 1 + ratio]`.
pub fn jittered_delay<R: Rng + ?Sized>(base: Duration, ratio: f64, rng: &mut R) -> Duration {
    if ratio <= 0.0 {
        return base;
    }
    let factor = 1.0 + rng.gen_range(-ratio..=ratio);
    base.mul_f64(factor.max(0.0))
}

pub(crate) fn spawn_corrector(
    core: Arc<Mutex<TransportCore>>,
    interval: Duration,
    jitter_ratio: f64,
) -> Option<CorrectorHandle> {
    let runtime = match Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => {
            warn!("No tokio runtime available; drift corrector not started");
            return None;
        }
    };

    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancelled);
    let task = runtime.spawn(async move {
        let mut rng = StdRng::from_entropy();
        loop {
            tokio::time::sleep(jittered_delay(interval, jitter_ratio, &mut rng)).await;
            if flag.load(Ordering::SeqCst) {
                break;
            }
            let correction = lock_unpoisoned(&core).correct_drift();
            if let Some(correction) = correction {
                debug!(
                    "Corrector tick: drift {:+.3}s (restarted: {})",
                    correction.drift_secs, correction.restarted
                );
            }
        }
        debug!("Drift corrector stopped");
    });

    Some(CorrectorHandle { cancelled, task })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_stays_in_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let base = Duration::from_millis(375);
        for _ in 0..1_000 {
            let delay = jittered_delay(base, 0.3, &mut rng);
            assert!(delay >= Duration::from_micros(262_499));
            assert!(delay <= Duration::from_micros(487_501));
        }
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let mut rng = StdRng::seed_from_u64(1);
        let base = Duration::from_millis(10);
        assert_eq!(jittered_delay(base, 0.0, &mut rng), base);
    }

    #[test]
    fn test_jitter_spreads_delays() {
        let mut rng = StdRng::seed_from_u64(42);
        let base = Duration::from_millis(375);
        let first = jittered_delay(base, 0.3, &mut rng);
        let differs = (0..20).any(|_| jittered_delay(base, 0.3, &mut rng) != first);
        assert!(differs);
    }
}
