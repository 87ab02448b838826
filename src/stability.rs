use std::fs;
use std::path::Path;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_THRESHOLD: u32 = 10;

/// Counts consecutive samples with the same length.
#[derive(Debug, Clone)]
pub struct StabilityCounter {
    threshold: u32,
    last_length: u64,
    unchanged: u32,
}

impl StabilityCounter {
    pub fn new(initial_length: u64, threshold: u32) -> Self {
        Self {
            threshold,
            last_length: initial_length,
            unchanged: 0,
        }
    }

    /// Feeds one sample and reports whether the length has now held steady for
    /// `threshold` consecutive samples.
    pub fn observe(&mut self, length: u64) -> bool {
        if length == self.last_length {
            self.unchanged += 1;
        } else {
            self.last_length = length;
            self.unchanged = 0;
        }
        self.is_stable()
    }

    pub fn is_stable(&self) -> bool {
        self.unchanged >= self.threshold
    }

    pub fn unchanged(&self) -> u32 {
        self.unchanged
    }
}

/// Waits for a file written in several passes by another process to stop growing
/// or shrinking. There is deliberately no overall timeout.
#[derive(Debug, Clone)]
pub struct StabilityDetector {
    interval: Duration,
    threshold: u32,
}

impl Default for StabilityDetector {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_INTERVAL, DEFAULT_THRESHOLD)
    }
}

impl StabilityDetector {
    pub fn new(interval: Duration, threshold: u32) -> Self {
        Self { interval, threshold }
    }

    pub async fn wait_until_stable(&self, path: &Path) -> u64 {
        let mut counter = StabilityCounter::new(file_length(path), self.threshold);
        let mut samples = 0u64;
        loop {
            sleep(self.interval).await;
            samples += 1;
            if counter.observe(file_length(path)) {
                break;
            }
        }
        debug!("{} stable after {} samples", path.display(), samples);
        counter.last_length
    }
}

// A file that vanished mid-write samples as empty.
fn file_length(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    /// Index of the sample at which the counter first reports stable.
    fn stabilizes_at(initial: u64, samples: &[u64], threshold: u32) -> Option<usize> {
        let mut counter = StabilityCounter::new(initial, threshold);
        samples.iter().position(|len| counter.observe(*len))
    }

    #[test]
    fn test_resets_on_length_change() {
        // 10,10,10 then a change to 20 and a run of 20s.
        let mut samples = vec![10, 10, 10];
        samples.extend(std::iter::repeat(20).take(12));
        let at = stabilizes_at(10, &samples, 10).unwrap();
        // The run of unchanged 20s starts after the sample at index 3.
        assert_eq!(at, 3 + 10);
    }

    #[test]
    fn test_not_stable_before_threshold() {
        let mut counter = StabilityCounter::new(5, 3);
        assert!(!counter.observe(5));
        assert!(!counter.observe(5));
        assert!(!counter.observe(6));
        assert_eq!(counter.unchanged(), 0);
        assert!(!counter.observe(6));
        assert!(!counter.observe(6));
        assert!(counter.observe(6));
    }

    proptest! {
        #[test]
        fn prop_never_stable_without_full_run(
            samples in prop::collection::vec(0u64..3, 0..60),
            threshold in 1u32..8,
        ) {
            if let Some(at) = stabilizes_at(0, &samples, threshold) {
                let previous = if at >= threshold as usize { samples[at - threshold as usize] } else { 0 };
                let window_start = at + 1 - threshold as usize;
                prop_assert!(samples[window_start..=at].iter().all(|len| *len == previous));
            } else {
                let mut run = 0;
                let mut last = 0;
                for len in &samples {
                    if *len == last { run += 1 } else { run = 0; last = *len; }
                    prop_assert!(run < threshold);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_waits_for_writer_to_finish() {
        let tmp_dir = TempDir::new().unwrap();
        let path = tmp_dir.path().join("live.sl2");
        fs::write(&path, b"a").unwrap();

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            for i in 0..5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                fs::write(&writer_path, vec![0u8; 10 * (i + 2)]).unwrap();
            }
        });

        let detector = StabilityDetector::new(Duration::from_millis(5), 20);
        let length = detector.wait_until_stable(&path).await;
        writer.await.unwrap();
        assert_eq!(length, 60);
    }

    #[tokio::test]
    async fn test_missing_file_counts_as_empty() {
        let tmp_dir = TempDir::new().unwrap();
        let detector = StabilityDetector::new(Duration::from_millis(1), 3);
        let length = detector.wait_until_stable(&tmp_dir.path().join("missing")).await;
        assert_eq!(length, 0);
    }
}
