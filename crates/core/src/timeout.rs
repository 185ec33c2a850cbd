//! Learned circuit-build timeouts.
//!
//! The estimator keeps a rolling window of observed build times and derives
//! the timeout from a high quantile, so a few slow builds move the cutoff
//! rather than a hard-coded constant. The window survives restart as an
//! opaque serialized blob.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Samples kept in the rolling window.
const WINDOW_CAPACITY: usize = 1000;

/// Builds needed before the learned value replaces the configured seed.
const MIN_SAMPLES: usize = 20;

/// Quantile of the sample distribution used as the timeout.
const TIMEOUT_QUANTILE: f64 = 0.80;

/// Rolling estimator of how long circuit builds take.
pub struct BuildTimeEstimator {
    samples: VecDeque<u32>,
    initial: Duration,
}

/// Serialized form of the window.
#[derive(Serialize, Deserialize)]
struct SavedState {
    samples: Vec<u32>,
}

impl BuildTimeEstimator {
    pub fn new(initial: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            initial,
        }
    }

    /// Restore from a previously persisted blob. A corrupt blob is
    /// discarded with a warning, never fatal.
    pub fn from_blob(initial: Duration, blob: &[u8]) -> Self {
        match bincode::deserialize::<SavedState>(blob) {
            Ok(state) => {
                let mut samples: VecDeque<u32> = state.samples.into();
                while samples.len() > WINDOW_CAPACITY {
                    samples.pop_front();
                }
                Self { samples, initial }
            }
            Err(e) => {
                warn!(error = %e, "discarding corrupt build-time state");
                Self::new(initial)
            }
        }
    }

    /// Persist the window as an opaque blob.
    pub fn to_blob(&self) -> Vec<u8> {
        let state = SavedState {
            samples: self.samples.iter().copied().collect(),
        };
        bincode::serialize(&state).unwrap_or_default()
    }

    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    /// Record one observed build time.
    pub fn note_build_time(&mut self, took: Duration) {
        let ms = took.as_millis().min(u128::from(u32::MAX)) as u32;
        if self.samples.len() == WINDOW_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(ms);
    }

    /// The timeout to apply to circuits building now.
    pub fn current_timeout(&self) -> Duration {
        if self.samples.len() < MIN_SAMPLES {
            return self.initial;
        }
        let mut sorted: Vec<u32> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let rank = ((sorted.len() as f64 * TIMEOUT_QUANTILE).ceil() as usize)
            .clamp(1, sorted.len())
            - 1;
        Duration::from_millis(u64::from(sorted[rank]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_value_until_enough_samples() {
        let initial = Duration::from_secs(60);
        let mut est = BuildTimeEstimator::new(initial);
        assert_eq!(est.current_timeout(), initial);
        for _ in 0..MIN_SAMPLES - 1 {
            est.note_build_time(Duration::from_millis(300));
        }
        assert_eq!(est.current_timeout(), initial);
        est.note_build_time(Duration::from_millis(300));
        assert_eq!(est.current_timeout(), Duration::from_millis(300));
    }

    #[test]
    fn test_uniform_samples_hit_the_quantile() {
        let mut est = BuildTimeEstimator::new(Duration::from_secs(60));
        // 1000 samples spread uniformly over [200, 1800] ms
        for i in 0..1000u32 {
            let ms = 200 + (u64::from(i) * 1600 / 999) as u32;
            est.note_build_time(Duration::from_millis(u64::from(ms)));
        }
        let timeout = est.current_timeout().as_millis() as f64;
        let p80 = 200.0 + 0.8 * 1600.0;
        assert!(
            (timeout - p80).abs() / p80 < 0.05,
            "timeout {} not within 5% of {}",
            timeout,
            p80
        );
    }

    #[test]
    fn test_window_is_bounded() {
        let mut est = BuildTimeEstimator::new(Duration::from_secs(60));
        for _ in 0..WINDOW_CAPACITY + 100 {
            est.note_build_time(Duration::from_millis(100));
        }
        assert_eq!(est.n_samples(), WINDOW_CAPACITY);
    }

    #[test]
    fn test_blob_roundtrip() {
        let mut est = BuildTimeEstimator::new(Duration::from_secs(60));
        for i in 0..100u64 {
            est.note_build_time(Duration::from_millis(200 + i));
        }
        let blob = est.to_blob();
        let restored = BuildTimeEstimator::from_blob(Duration::from_secs(60), &blob);
        assert_eq!(restored.n_samples(), 100);
        assert_eq!(restored.current_timeout(), est.current_timeout());
    }

    #[test]
    fn test_corrupt_blob_falls_back_to_seed() {
        let initial = Duration::from_secs(45);
        let est = BuildTimeEstimator::from_blob(initial, &[0xFF, 0x01, 0x02]);
        assert_eq!(est.n_samples(), 0);
        assert_eq!(est.current_timeout(), initial);
    }
}
