use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::types::{TransferProgress, TransferState};

/// Publishes progress for one client-side transfer.
///
/// Confirmed indices are de-duplicated, so a chunk acknowledged twice (after a
/// retry, or on a second connection) is only counted once and reported progress
/// never moves backwards.
pub struct ProgressTracker {
    tx: watch::Sender<TransferProgress>,
    confirmed: Mutex<HashSet<u32>>,
    speed: SpeedCalculator,
}

impl ProgressTracker {
    pub fn new(transfer_id: &str, total_bytes: u64, total_chunks: u32) -> Self {
        let (tx, _) = watch::channel(TransferProgress {
            transfer_id: transfer_id.to_string(),
            state: TransferState::Initialized,
            completed_bytes: 0,
            total_bytes,
            completed_chunks: 0,
            total_chunks,
            bytes_per_second: 0.0,
        });
        Self {
            tx,
            confirmed: Mutex::new(HashSet::new()),
            speed: SpeedCalculator::new(None, None),
        }
    }

    /// Returns a receiver that observes every update.
    pub fn subscribe(&self) -> watch::Receiver<TransferProgress> {
        self.tx.subscribe()
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> TransferProgress {
        self.tx.borrow().clone()
    }

    /// Counts chunks the receiver already holds (resume). No speed sample is taken.
    pub fn restore(&self, chunks: impl IntoIterator<Item = (u32, u64)>) {
        let mut confirmed = self.confirmed.lock().unwrap();
        let mut added_bytes = 0u64;
        let mut added_chunks = 0u32;
        for (index, bytes) in chunks {
            if confirmed.insert(index) {
                added_bytes += bytes;
                added_chunks += 1;
            }
        }
        self.tx.send_modify(|p| {
            p.completed_bytes += added_bytes;
            p.completed_chunks += added_chunks;
        });
    }

    /// Records a receiver acknowledgement for `index`. Returns `false` if the
    /// index was already counted.
    pub fn confirm(&self, index: u32, bytes: u64) -> bool {
        if !self.confirmed.lock().unwrap().insert(index) {
            return false;
        }
        self.speed.add_sample(bytes);
        let rate = self.speed.bytes_per_second();
        self.tx.send_modify(|p| {
            p.completed_bytes += bytes;
            p.completed_chunks += 1;
            p.bytes_per_second = rate;
        });
        true
    }

    /// Whether `index` has been confirmed.
    pub fn is_confirmed(&self, index: u32) -> bool {
        self.confirmed.lock().unwrap().contains(&index)
    }

    /// Moves to `state`. Terminal states are final.
    pub fn set_state(&self, state: TransferState) {
        self.tx.send_if_modified(|p| {
            if p.state.is_terminal() || p.state == state {
                return false;
            }
            p.state = state;
            if state.is_terminal() {
                p.bytes_per_second = 0.0;
            }
            true
        });
    }

    pub fn state(&self) -> TransferState {
        self.tx.borrow().state
    }
}

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed using a sliding window of samples.
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

struct SpeedInner {
    samples: Vec<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: Vec::new(),
                max_samples: max_samples.unwrap_or(100),
                window_size: window_size.unwrap_or(Duration::from_secs(5)),
            }),
        }
    }

    /// Records a sample of `bytes` transferred at the current instant.
    pub fn add_sample(&self, bytes: u64) {
        let mut s = self.inner.lock().unwrap();
        let now = Instant::now();
        s.samples.push(SpeedSample {
            bytes,
            timestamp: now,
        });

        if let Some(cutoff) = now.checked_sub(s.window_size) {
            s.samples.retain(|sample| sample.timestamp >= cutoff);
        }

        if s.samples.len() > s.max_samples {
            let excess = s.samples.len() - s.max_samples;
            s.samples.drain(..excess);
        }
    }

    /// Returns the average speed in bytes/second within the window.
    ///
    /// Returns 0.0 if fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let s = self.inner.lock().unwrap();
        if s.samples.len() < 2 {
            return 0.0;
        }

        let first = &s.samples[0];
        let last = &s.samples[s.samples.len() - 1];
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }

        let total_bytes: u64 = s.samples.iter().map(|sample| sample.bytes).sum();
        total_bytes as f64 / elapsed.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn confirm_counts_each_index_once() {
        let tracker = ProgressTracker::new("t1", 10, 3);
        assert!(tracker.confirm(0, 4));
        assert!(!tracker.confirm(0, 4));
        assert!(tracker.confirm(2, 2));

        let p = tracker.snapshot();
        assert_eq!(p.completed_chunks, 2);
        assert_eq!(p.completed_bytes, 6);
        assert!(tracker.is_confirmed(2));
        assert!(!tracker.is_confirmed(1));
    }

    #[test]
    fn restore_seeds_resumed_chunks() {
        let tracker = ProgressTracker::new("t1", 10, 3);
        tracker.restore([(0, 4), (1, 4)]);
        assert!(!tracker.confirm(1, 4));

        let p = tracker.snapshot();
        assert_eq!(p.completed_chunks, 2);
        assert_eq!(p.completed_bytes, 8);
        assert_eq!(p.bytes_per_second, 0.0);
    }

    #[test]
    fn fraction_reaches_one_only_when_completed() {
        let tracker = ProgressTracker::new("t1", 8, 2);
        tracker.set_state(TransferState::Sending);
        tracker.confirm(0, 4);
        tracker.confirm(1, 4);
        tracker.set_state(TransferState::AwaitingFinalization);
        assert!(tracker.snapshot().fraction() < 1.0);

        tracker.set_state(TransferState::Completed);
        assert_eq!(tracker.snapshot().fraction(), 1.0);
    }

    #[test]
    fn terminal_state_is_final() {
        let tracker = ProgressTracker::new("t1", 8, 2);
        tracker.set_state(TransferState::Interrupted);
        tracker.set_state(TransferState::Sending);
        assert_eq!(tracker.state(), TransferState::Interrupted);
    }

    #[tokio::test]
    async fn subscribers_see_updates() {
        let tracker = ProgressTracker::new("t1", 8, 2);
        let mut rx = tracker.subscribe();

        tracker.confirm(1, 4);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().completed_chunks, 1);

        tracker.set_state(TransferState::Failed);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().state, TransferState::Failed);
    }

    #[test]
    fn concurrent_confirms_never_double_count() {
        use std::thread;

        let tracker = Arc::new(ProgressTracker::new("t1", 400, 100));
        let mut handles = vec![];
        for _ in 0..4 {
            let t = Arc::clone(&tracker);
            handles.push(thread::spawn(move || {
                for i in 0..100 {
                    t.confirm(i, 4);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let p = tracker.snapshot();
        assert_eq!(p.completed_chunks, 100);
        assert_eq!(p.completed_bytes, 400);
    }

    #[test]
    fn speed_calculator_no_samples() {
        let calc = SpeedCalculator::new(None, None);
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[test]
    fn speed_calculator_single_sample() {
        let calc = SpeedCalculator::new(None, None);
        calc.add_sample(100);
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[test]
    fn speed_calculator_multiple_samples() {
        let calc = SpeedCalculator::new(Some(Duration::from_secs(10)), None);
        calc.add_sample(500);
        std::thread::sleep(Duration::from_millis(50));
        calc.add_sample(500);

        assert!(calc.bytes_per_second() > 0.0);
    }

    #[test]
    fn speed_calculator_max_samples() {
        let calc = SpeedCalculator::new(Some(Duration::from_secs(60)), Some(5));
        for i in 0..20 {
            calc.add_sample(i * 10);
        }
        let s = calc.inner.lock().unwrap();
        assert!(s.samples.len() <= 5);
    }
}
