//! Read filters
//!
//! A read filter wraps a raw single-shot measurement (the *source*) and turns
//! it into a stabilized value. Each filter also carries a *setup* callback,
//! invoked with the window count whenever the filter is (re)configured, so a
//! driver can program or disable hardware-side averaging to match.
//!
//! | Mode | Filter | Raw samples per `get_value` |
//! |---|---|---|
//! | `None` | [`BypassFilter`] | 1 |
//! | `MeanRepeat` | [`MeanRepeatFilter`] | N |
//! | `MeanMoving` | [`MeanMovingFilter`] | N after a clear, then 1 |
//! | `MedianRepeat` | [`MedianRepeatFilter`] | N |
//! | `MedianMoving` | [`MedianMovingFilter`] | N after a clear, then 1 |
//!
//! Lifecycle: `Unconfigured` until [`ReadFilter::set_up`] runs, then `Ready`,
//! then `HasSamples` once a value has been produced. `set_count` returns the
//! filter to `Unconfigured`; `clear` drops samples but keeps the hardware
//! configuration. Calling `get_value` while unconfigured runs `set_up` first.

pub mod bypass;
pub mod channel;
pub mod moving;
pub mod repeat;

pub use bypass::BypassFilter;
pub use channel::FilterChannel;
pub use moving::{MeanMovingFilter, MedianMovingFilter, MovingFilter};
pub use repeat::{MeanRepeatFilter, MedianRepeatFilter, RepeatFilter};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{InstrumentError, InstrumentResult};

/// Raw single-shot measurement.
pub type Source = Arc<dyn Fn() -> InstrumentResult<f64> + Send + Sync>;

/// Hardware configuration hook, called with the window count.
pub type Setup = Arc<dyn Fn(usize) -> InstrumentResult<()> + Send + Sync>;

/// Averaging mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AMode {
    /// One raw sample per value; the count is passed to the setup hook
    #[default]
    None,
    /// Mean of N fresh samples
    MeanRepeat,
    /// Mean of a sliding window of N
    MeanMoving,
    /// Median of N fresh samples
    MedianRepeat,
    /// Median of a sliding window of N
    MedianMoving,
}

/// Where a filter is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterState {
    /// Setup has not run since creation or the last count change
    Unconfigured,
    /// Set up, no samples held
    Ready,
    /// Holding samples from earlier reads
    HasSamples,
}

/// Streaming statistic over a raw measurement.
pub trait ReadFilter: Send {
    /// Produce a stabilized value, drawing as many raw samples as the
    /// strategy requires.
    fn get_value(&mut self) -> InstrumentResult<f64>;

    /// Change the window size. Accumulated samples are discarded and the
    /// filter must be set up again.
    fn set_count(&mut self, count: usize) -> InstrumentResult<()>;

    /// Window size.
    fn count(&self) -> usize;

    /// Run the setup callback with the current count.
    fn set_up(&mut self) -> InstrumentResult<()>;

    /// Discard accumulated samples without touching the hardware.
    fn clear(&mut self);

    /// Lifecycle state.
    fn state(&self) -> FilterState;

    /// Mode this filter implements.
    fn mode(&self) -> AMode;
}

/// Build the filter for `mode` with a window of `count`.
pub fn build_filter(
    mode: AMode,
    count: usize,
    source: Source,
    setup: Setup,
) -> InstrumentResult<Box<dyn ReadFilter>> {
    let mut filter: Box<dyn ReadFilter> = match mode {
        AMode::None => Box::new(BypassFilter::new(source, setup)),
        AMode::MeanRepeat => Box::new(MeanRepeatFilter::new(source, setup)),
        AMode::MeanMoving => Box::new(MeanMovingFilter::new(source, setup)),
        AMode::MedianRepeat => Box::new(MedianRepeatFilter::new(source, setup)),
        AMode::MedianMoving => Box::new(MedianMovingFilter::new(source, setup)),
    };
    filter.set_count(count)?;
    Ok(filter)
}

/// Combines a window of samples into one value.
pub trait Reducer: Send + Sync + 'static {
    const REPEAT_MODE: AMode;
    const MOVING_MODE: AMode;

    /// `samples` is never empty.
    fn reduce(samples: &[f64]) -> f64;
}

/// Arithmetic mean.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mean;

impl Reducer for Mean {
    const REPEAT_MODE: AMode = AMode::MeanRepeat;
    const MOVING_MODE: AMode = AMode::MeanMoving;

    fn reduce(samples: &[f64]) -> f64 {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

/// Median; an even count averages the two middle values.
#[derive(Debug, Clone, Copy, Default)]
pub struct Median;

impl Reducer for Median {
    const REPEAT_MODE: AMode = AMode::MedianRepeat;
    const MOVING_MODE: AMode = AMode::MedianMoving;

    fn reduce(samples: &[f64]) -> f64 {
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        }
    }
}

/// State shared by every filter: source, setup hook, count and lifecycle.
struct FilterCore {
    source: Source,
    setup: Setup,
    count: usize,
    state: FilterState,
}

impl FilterCore {
    fn new(source: Source, setup: Setup) -> Self {
        Self {
            source,
            setup,
            count: 1,
            state: FilterState::Unconfigured,
        }
    }

    fn set_count(&mut self, count: usize) -> InstrumentResult<()> {
        if count == 0 {
            return Err(InstrumentError::InvalidFilterCount(count));
        }
        self.count = count;
        self.state = FilterState::Unconfigured;
        Ok(())
    }

    fn set_up(&mut self) -> InstrumentResult<()> {
        (self.setup)(self.count)?;
        self.state = FilterState::Ready;
        Ok(())
    }

    fn ensure_set_up(&mut self) -> InstrumentResult<()> {
        if self.state == FilterState::Unconfigured {
            self.set_up()?;
        }
        Ok(())
    }

    fn cleared(&mut self) {
        if self.state == FilterState::HasSamples {
            self.state = FilterState::Ready;
        }
    }

    fn sample(&self) -> InstrumentResult<f64> {
        (self.source)()
    }

    fn samples(&self, n: usize) -> InstrumentResult<Vec<f64>> {
        (0..n).map(|_| self.sample()).collect()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_and_median() {
        assert_eq!(Mean::reduce(&[1.0, 2.0, 6.0]), 3.0);
        assert_eq!(Median::reduce(&[5.0, 1.0, 100.0]), 5.0);
        assert_eq!(Median::reduce(&[4.0, 1.0, 3.0, 2.0]), 2.5);
        assert_eq!(Median::reduce(&[7.0]), 7.0);
    }

    #[test]
    fn test_build_filter_modes() {
        for mode in [
            AMode::None,
            AMode::MeanRepeat,
            AMode::MeanMoving,
            AMode::MedianRepeat,
            AMode::MedianMoving,
        ] {
            let (source, _) = test_support::sequence(&[1.0; 8]);
            let (setup, _) = test_support::recording_setup();
            let filter = build_filter(mode, 3, source, setup).unwrap();
            assert_eq!(filter.mode(), mode);
            assert_eq!(filter.count(), 3);
            assert_eq!(filter.state(), FilterState::Unconfigured);
        }
    }

    #[test]
    fn test_zero_count_rejected() {
        let (source, _) = test_support::sequence(&[]);
        let (setup, _) = test_support::recording_setup();
        assert!(matches!(
            build_filter(AMode::MeanRepeat, 0, source, setup),
            Err(InstrumentError::InvalidFilterCount(0))
        ));
    }

    #[test]
    fn test_amode_serde_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: AMode,
        }
        use figment::providers::{Format, Toml};
        let parsed: Wrapper = figment::Figment::from(Toml::string("mode = \"median_moving\""))
            .extract()
            .unwrap();
        assert_eq!(parsed.mode, AMode::MedianMoving);
    }
}
