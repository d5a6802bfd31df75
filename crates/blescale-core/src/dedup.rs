//! Suppression of repeated broadcasts of one physical measurement.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Default suppression window.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(30);

/// Remembers recently accepted `(address, weight)` pairs.
///
/// Weights are keyed at 0.1 resolution, so a scale re-broadcasting the same
/// settled value is accepted once per window while any change in weight
/// passes straight through.
#[derive(Debug)]
pub struct DedupWindow {
    window: Duration,
    seen: HashMap<(String, i64), Instant>,
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(DEDUP_WINDOW)
    }
}

impl DedupWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    fn key(address: &str, weight: f64) -> (String, i64) {
        (address.to_ascii_uppercase(), (weight * 10.0).round() as i64)
    }

    /// Whether a reading should be accepted. Accepting starts its window.
    pub fn accept(&mut self, address: &str, weight: f64) -> bool {
        let now = Instant::now();
        let window = self.window;
        self.seen.retain(|_, at| now.duration_since(*at) < window);

        let key = Self::key(address, weight);
        if self.seen.contains_key(&key) {
            return false;
        }
        self.seen.insert(key, now);
        true
    }

    /// Number of pairs currently suppressed.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
