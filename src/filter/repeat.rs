//! Repeat filters: N fresh raw samples per value, reduced to one.

use std::marker::PhantomData;

use super::{AMode, FilterCore, FilterState, Mean, Median, ReadFilter, Reducer, Setup, Source};
use crate::error::InstrumentResult;

/// Mean of N fresh samples.
pub type MeanRepeatFilter = RepeatFilter<Mean>;
/// Median of N fresh samples.
pub type MedianRepeatFilter = RepeatFilter<Median>;

/// Takes N fresh samples for every value.
pub struct RepeatFilter<R: Reducer> {
    core: FilterCore,
    last: Vec<f64>,
    _reducer: PhantomData<R>,
}

impl<R: Reducer> RepeatFilter<R> {
    /// Filter over `source`, configured through `setup`.
    pub fn new(source: Source, setup: Setup) -> Self {
        Self {
            core: FilterCore::new(source, setup),
            last: Vec::new(),
            _reducer: PhantomData,
        }
    }

    /// Raw samples behind the most recent value.
    pub fn samples(&self) -> &[f64] {
        &self.last
    }
}

impl<R: Reducer> ReadFilter for RepeatFilter<R> {
    fn get_value(&mut self) -> InstrumentResult<f64> {
        self.core.ensure_set_up()?;
        self.last.clear();
        self.last = self.core.samples(self.core.count)?;
        self.core.state = FilterState::HasSamples;
        Ok(R::reduce(&self.last))
    }

    fn set_count(&mut self, count: usize) -> InstrumentResult<()> {
        self.core.set_count(count)?;
        self.last.clear();
        Ok(())
    }

    fn count(&self) -> usize {
        self.core.count
    }

    fn set_up(&mut self) -> InstrumentResult<()> {
        self.core.set_up()
    }

    fn clear(&mut self) {
        self.last.clear();
        self.core.cleared();
    }

    fn state(&self) -> FilterState {
        self.core.state
    }

    fn mode(&self) -> AMode {
        R::REPEAT_MODE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::test_support::{recording_setup, sequence};

    #[test]
    fn test_mean_repeat_consumes_exactly_n() {
        let (source, calls) = sequence(&[1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0, 99.0]);
        let (setup, _) = recording_setup();
        let mut filter = MeanRepeatFilter::new(source, setup);
        filter.set_count(4).unwrap();

        assert_eq!(filter.get_value().unwrap(), 2.5);
        assert_eq!(*calls.lock(), 4);
        assert_eq!(filter.get_value().unwrap(), 25.0);
        assert_eq!(*calls.lock(), 8);
        assert_eq!(filter.samples(), &[10.0, 20.0, 30.0, 40.0]);
    }

    #[test]
    fn test_median_repeat_rejects_outlier() {
        let (source, _) = sequence(&[1.0, 1000.0, 2.0, 3.0, 2.5]);
        let (setup, _) = recording_setup();
        let mut filter = MedianRepeatFilter::new(source, setup);
        filter.set_count(5).unwrap();
        assert_eq!(filter.get_value().unwrap(), 2.5);
    }

    #[test]
    fn test_lifecycle() {
        let (source, _) = sequence(&[1.0; 6]);
        let (setup, seen) = recording_setup();
        let mut filter = MeanRepeatFilter::new(source, setup);
        assert_eq!(filter.state(), FilterState::Unconfigured);

        filter.set_count(2).unwrap();
        filter.set_up().unwrap();
        assert_eq!(filter.state(), FilterState::Ready);

        filter.get_value().unwrap();
        assert_eq!(filter.state(), FilterState::HasSamples);

        filter.clear();
        assert_eq!(filter.state(), FilterState::Ready);
        assert!(filter.samples().is_empty());

        filter.set_count(3).unwrap();
        assert_eq!(filter.state(), FilterState::Unconfigured);
        filter.get_value().unwrap();
        // set_up ran explicitly once and implicitly after set_count
        assert_eq!(*seen.lock(), vec![2, 3]);
    }

    #[test]
    fn test_source_error_propagates() {
        let (source, _) = sequence(&[1.0]);
        let (setup, _) = recording_setup();
        let mut filter = MeanRepeatFilter::new(source, setup);
        filter.set_count(2).unwrap();
        assert!(filter.get_value().is_err());
        assert_ne!(filter.state(), FilterState::HasSamples);
    }
}
