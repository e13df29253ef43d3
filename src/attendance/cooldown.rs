use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Per-code suppression window. A repeat of the same code less than `window`
/// after the last admitted detection is dropped; exactly `window` later passes.
#[derive(Debug)]
pub struct Cooldown {
    window: chrono::Duration,
    last: HashMap<String, DateTime<Utc>>,
}

impl Cooldown {
    pub fn new(window: Duration) -> Self {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        Self { window, last: HashMap::new() }
    }

    pub fn admit(&mut self, code: &str, at: DateTime<Utc>) -> bool {
        if let Some(prev) = self.last.get(code) {
            let elapsed = at.signed_duration_since(*prev);
            // Negative elapsed means the source delivered out of order; treat as a repeat.
            if elapsed < self.window { return false; }
        }
        self.last.insert(code.to_string(), at);
        self.prune(at);
        true
    }

    /// Forget codes whose window has long passed.
    fn prune(&mut self, now: DateTime<Utc>) {
        if self.last.len() < 256 { return; }
        let window = self.window;
        self.last.retain(|_, t| now.signed_duration_since(*t) < window);
    }

    pub fn reset(&mut self) { self.last.clear(); }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> { Utc.timestamp_millis_opt(ms).unwrap() }

    #[test]
    fn repeats_inside_window_are_dropped() {
        let mut c = Cooldown::new(Duration::from_millis(2000));
        assert!(c.admit("STU1", at(0)));
        assert!(!c.admit("STU1", at(500)));
        assert!(!c.admit("STU1", at(1999)));
        assert!(c.admit("STU1", at(2100)));
        assert!(!c.admit("STU1", at(3000)));
    }

    #[test]
    fn window_boundary_passes_and_codes_are_independent() {
        let mut c = Cooldown::new(Duration::from_millis(2000));
        assert!(c.admit("A", at(0)));
        assert!(c.admit("B", at(1)));
        assert!(c.admit("A", at(2000)));
        assert!(!c.admit("B", at(-5)));
    }

    #[test]
    fn reset_forgets_everything() {
        let mut c = Cooldown::new(Duration::from_secs(2));
        c.admit("A", at(0));
        c.reset();
        assert!(c.admit("A", at(1)));
    }
}
