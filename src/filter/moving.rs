//! Moving filters: a sliding window of the last N raw samples.
//!
//! The first value after a clear fills the whole window; every later value
//! draws one new sample and drops the oldest.

use std::collections::VecDeque;
use std::marker::PhantomData;

use super::{AMode, FilterCore, FilterState, Mean, Median, ReadFilter, Reducer, Setup, Source};
use crate::error::InstrumentResult;

/// Running mean over the last N samples.
pub type MeanMovingFilter = MovingFilter<Mean>;
/// Running median over the last N samples.
pub type MedianMovingFilter = MovingFilter<Median>;

/// Sliding window: one fresh sample per value once the window is full.
pub struct MovingFilter<R: Reducer> {
    core: FilterCore,
    window: VecDeque<f64>,
    _reducer: PhantomData<R>,
}

impl<R: Reducer> MovingFilter<R> {
    /// Filter over `source`, configured through `setup`.
    pub fn new(source: Source, setup: Setup) -> Self {
        Self {
            core: FilterCore::new(source, setup),
            window: VecDeque::new(),
            _reducer: PhantomData,
        }
    }

    /// Samples currently in the window, oldest first.
    pub fn window(&self) -> Vec<f64> {
        self.window.iter().copied().collect()
    }
}

impl<R: Reducer> ReadFilter for MovingFilter<R> {
    fn get_value(&mut self) -> InstrumentResult<f64> {
        self.core.ensure_set_up()?;
        if self.window.is_empty() {
            self.window.extend(self.core.samples(self.core.count)?);
        } else {
            let sample = self.core.sample()?;
            self.window.push_back(sample);
            while self.window.len() > self.core.count {
                self.window.pop_front();
            }
        }
        self.core.state = FilterState::HasSamples;
        Ok(R::reduce(self.window.make_contiguous()))
    }

    fn set_count(&mut self, count: usize) -> InstrumentResult<()> {
        self.core.set_count(count)?;
        self.window.clear();
        Ok(())
    }

    fn count(&self) -> usize {
        self.core.count
    }

    fn set_up(&mut self) -> InstrumentResult<()> {
        self.core.set_up()
    }

    fn clear(&mut self) {
        self.window.clear();
        self.core.cleared();
    }

    fn state(&self) -> FilterState {
        self.core.state
    }

    fn mode(&self) -> AMode {
        R::MOVING_MODE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::test_support::{recording_setup, sequence};

    #[test]
    fn test_median_moving_suppresses_outlier() {
        let (source, calls) = sequence(&[1.0, 2.0, 3.0, 100.0, 4.0, 5.0, 6.0]);
        let (setup, _) = recording_setup();
        let mut filter = MedianMovingFilter::new(source, setup);
        filter.set_count(5).unwrap();

        assert_eq!(filter.get_value().unwrap(), 3.0);
        assert_eq!(*calls.lock(), 5);
        assert_eq!(filter.get_value().unwrap(), 4.0);
        assert_eq!(filter.get_value().unwrap(), 5.0);
        assert_eq!(*calls.lock(), 7);
        assert_eq!(filter.window(), vec![3.0, 100.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_mean_moving_one_sample_per_call() {
        let (source, calls) = sequence(&[2.0, 4.0, 6.0, 8.0]);
        let (setup, _) = recording_setup();
        let mut filter = MeanMovingFilter::new(source, setup);
        filter.set_count(2).unwrap();

        assert_eq!(filter.get_value().unwrap(), 3.0);
        assert_eq!(filter.get_value().unwrap(), 5.0);
        assert_eq!(filter.get_value().unwrap(), 7.0);
        assert_eq!(*calls.lock(), 4);
    }

    #[test]
    fn test_clear_refills_window() {
        let (source, calls) = sequence(&[1.0, 1.0, 9.0, 9.0]);
        let (setup, seen) = recording_setup();
        let mut filter = MeanMovingFilter::new(source, setup);
        filter.set_count(2).unwrap();
        assert_eq!(filter.get_value().unwrap(), 1.0);

        filter.clear();
        assert_eq!(filter.get_value().unwrap(), 9.0);
        assert_eq!(*calls.lock(), 4);
        // clear() never reconfigures the hardware
        assert_eq!(*seen.lock(), vec![2]);
    }
}
