//! Stuck-loop detector (§4.8): flags a worker that is repeating the same
//! tool call or burning rounds on read-only actions without making
//! progress.

use std::collections::VecDeque;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone)]
pub struct StuckLoopDetector {
    ring: VecDeque<u64>,
    ring_capacity: usize,
    doom_loop_window: usize,
    read_only_streak: u32,
    read_only_threshold: u32,
}

impl StuckLoopDetector {
    pub fn new(doom_loop_window: usize, read_only_threshold: u32) -> Self {
        StuckLoopDetector {
            ring: VecDeque::with_capacity(doom_loop_window),
            ring_capacity: doom_loop_window,
            doom_loop_window,
            read_only_streak: 0,
            read_only_threshold,
        }
    }

    /// Records one tool call and returns whether the detector now considers
    /// the worker stuck.
    pub fn record(&mut self, tool_name: &str, args_summary: &str, is_read_only: bool) -> bool {
        let mut hasher = DefaultHasher::new();
        tool_name.hash(&mut hasher);
        args_summary.hash(&mut hasher);
        let signature = hasher.finish();

        self.ring.push_back(signature);
        if self.ring.len() > self.ring_capacity {
            self.ring.pop_front();
        }

        if is_read_only {
            self.read_only_streak += 1;
        } else {
            self.read_only_streak = 0;
        }

        self.is_stuck()
    }

    pub fn is_stuck(&self) -> bool {
        let doom_loop = self.ring.len() >= self.doom_loop_window
            && self.ring.iter().all(|s| *s == self.ring[0]);
        let read_only_stuck = self.read_only_streak >= self.read_only_threshold;
        doom_loop || read_only_stuck
    }

    pub fn reset(&mut self) {
        self.ring.clear();
        self.read_only_streak = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_repeated_calls_trigger_doom_loop() {
        let mut detector = StuckLoopDetector::new(3, 100);
        assert!(!detector.record("read_file", "a.rs", true));
        assert!(!detector.record("read_file", "a.rs", true));
        assert!(detector.record("read_file", "a.rs", true));
    }

    #[test]
    fn varied_calls_do_not_trigger_doom_loop() {
        let mut detector = StuckLoopDetector::new(3, 100);
        detector.record("read_file", "a.rs", true);
        detector.record("read_file", "b.rs", true);
        assert!(!detector.record("read_file", "c.rs", true));
    }

    #[test]
    fn read_only_streak_exceeding_threshold_is_stuck() {
        let mut detector = StuckLoopDetector::new(100, 3);
        detector.record("list_dir", "x", true);
        detector.record("grep", "y", true);
        assert!(detector.record("read_file", "z", true));
    }

    #[test]
    fn write_call_resets_read_only_streak() {
        let mut detector = StuckLoopDetector::new(100, 3);
        detector.record("list_dir", "x", true);
        detector.record("grep", "y", true);
        detector.record("write_file", "z", false);
        assert!(!detector.record("read_file", "w", true));
    }

    #[test]
    fn reset_clears_both_counters() {
        let mut detector = StuckLoopDetector::new(2, 2);
        detector.record("a", "1", true);
        detector.record("a", "1", true);
        assert!(detector.is_stuck());
        detector.reset();
        assert!(!detector.is_stuck());
    }
}
