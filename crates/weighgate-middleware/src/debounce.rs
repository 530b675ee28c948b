//! Debounce counters for raw scale samples.
//!
//! Two run-length counters, `stable_run` and `unstable_run`, are mutually
//! exclusive: a reading of one kind zeroes the other.  When a run reaches
//! its threshold the debouncer yields one [`Qualified`] reading and then
//! latches, so a plateau that keeps holding never qualifies a second time.
//! A stable reading whose value differs from the current plateau starts a
//! new stable plateau.

use weighgate_types::WeightSample;

/// Values closer than this are the same plateau.
const WEIGHT_EPSILON: f64 = 1e-9;

/// Output of [`Debouncer::observe`] when a run reaches its threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Qualified {
    Weight(f64),
    Unstable,
}

#[derive(Debug, Clone)]
pub struct Debouncer {
    stable_threshold: u32,
    unstable_threshold: u32,
    stable_run: u32,
    unstable_run: u32,
    stable_fired: bool,
    unstable_fired: bool,
    plateau: Option<f64>,
    last_sample: Option<WeightSample>,
}

impl Debouncer {
    /// Thresholds of zero are treated as one.
    pub fn new(stable_threshold: u32, unstable_threshold: u32) -> Self {
        Self {
            stable_threshold: stable_threshold.max(1),
            unstable_threshold: unstable_threshold.max(1),
            stable_run: 0,
            unstable_run: 0,
            stable_fired: false,
            unstable_fired: false,
            plateau: None,
            last_sample: None,
        }
    }

    /// Feed one timestamped reading; it is kept as [`Debouncer::last_sample`].
    pub fn observe_sample(&mut self, sample: WeightSample) -> Option<Qualified> {
        self.last_sample = Some(sample);
        self.observe(sample.value, sample.stable)
    }

    /// Feed one poll result.
    pub fn observe(&mut self, value: f64, stable: bool) -> Option<Qualified> {
        if stable {
            self.unstable_run = 0;
            self.unstable_fired = false;

            let same_plateau = self
                .plateau
                .is_some_and(|p| (p - value).abs() <= WEIGHT_EPSILON);
            if !same_plateau {
                self.stable_run = 0;
                self.stable_fired = false;
                self.plateau = Some(value);
            }

            self.stable_run = self.stable_run.saturating_add(1);
            if !self.stable_fired && self.stable_run >= self.stable_threshold {
                self.stable_fired = true;
                return Some(Qualified::Weight(value));
            }
        } else {
            self.stable_run = 0;
            self.stable_fired = false;
            self.plateau = None;

            self.unstable_run = self.unstable_run.saturating_add(1);
            if !self.unstable_fired && self.unstable_run >= self.unstable_threshold {
                self.unstable_fired = true;
                return Some(Qualified::Unstable);
            }
        }
        None
    }

    /// Forget all history, e.g. after the link dropped.
    pub fn reset(&mut self) {
        self.stable_run = 0;
        self.unstable_run = 0;
        self.stable_fired = false;
        self.unstable_fired = false;
        self.plateau = None;
        self.last_sample = None;
    }

    /// Most recent reading fed through [`Debouncer::observe_sample`].
    pub fn last_sample(&self) -> Option<WeightSample> {
        self.last_sample
    }

    pub fn stable_run(&self) -> u32 {
        self.stable_run
    }

    pub fn unstable_run(&self) -> u32 {
        self.unstable_run
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_exactly_at_threshold_and_only_once() {
        let mut d = Debouncer::new(3, 3);
        assert_eq!(d.observe(123.4, true), None);
        assert_eq!(d.observe(123.4, true), None);
        assert_eq!(d.observe(123.4, true), Some(Qualified::Weight(123.4)));
        for _ in 0..20 {
            assert_eq!(d.observe(123.4, true), None);
        }
    }

    #[test]
    fn unstable_fires_once_per_plateau() {
        let mut d = Debouncer::new(3, 2);
        let fired: Vec<_> = (0..10).filter_map(|_| d.observe(7.0, false)).collect();
        assert_eq!(fired, vec![Qualified::Unstable]);

        // A stable interruption starts a new unstable plateau afterwards.
        d.observe(7.0, true);
        assert_eq!(d.observe(8.0, false), None);
        assert_eq!(d.observe(9.0, false), Some(Qualified::Unstable));
    }

    #[test]
    fn counters_are_mutually_exclusive() {
        let mut d = Debouncer::new(5, 5);
        d.observe(1.0, true);
        d.observe(1.0, true);
        assert_eq!((d.stable_run(), d.unstable_run()), (2, 0));
        d.observe(1.5, false);
        assert_eq!((d.stable_run(), d.unstable_run()), (0, 1));
        d.observe(1.0, true);
        assert_eq!((d.stable_run(), d.unstable_run()), (1, 0));
    }

    #[test]
    fn new_stable_value_starts_a_new_plateau() {
        let mut d = Debouncer::new(2, 2);
        d.observe(10.0, true);
        assert_eq!(d.observe(10.0, true), Some(Qualified::Weight(10.0)));
        assert_eq!(d.observe(12.0, true), None);
        assert_eq!(d.observe(12.0, true), Some(Qualified::Weight(12.0)));
    }

    #[test]
    fn interruption_rearms_the_same_weight() {
        let mut d = Debouncer::new(2, 3);
        d.observe(5.0, true);
        assert!(d.observe(5.0, true).is_some());
        d.observe(5.0, false);
        d.observe(5.0, true);
        assert_eq!(d.observe(5.0, true), Some(Qualified::Weight(5.0)));
    }

    #[test]
    fn samples_feed_the_same_counters() {
        let mut d = Debouncer::new(2, 2);
        let first = WeightSample::now(42.0, true);
        assert_eq!(d.observe_sample(first), None);
        assert_eq!(d.last_sample(), Some(first));

        let second = WeightSample::now(42.0, true);
        assert_eq!(d.observe_sample(second), Some(Qualified::Weight(42.0)));
        assert_eq!(d.last_sample().map(|s| s.timestamp), Some(second.timestamp));
        assert!(second.timestamp >= first.timestamp);

        assert_eq!(d.observe_sample(WeightSample::now(40.0, false)), None);
        assert_eq!((d.stable_run(), d.unstable_run()), (0, 1));
        d.reset();
        assert_eq!(d.last_sample(), None);
    }

    #[test]
    fn reset_clears_history() {
        let mut d = Debouncer::new(2, 2);
        d.observe(3.0, true);
        d.reset();
        assert_eq!(d.observe(3.0, true), None);
        assert_eq!(d.observe(3.0, true), Some(Qualified::Weight(3.0)));
    }
}
