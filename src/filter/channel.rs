//! Thread-safe filtered measurement channel.
//!
//! [`FilterChannel`] owns the filter for one measured quantity and rebuilds it
//! whenever the mode or count changes. Reconfiguration always runs in the same
//! order: rebuild, `set_count`, `set_up`, `clear`. The filter sits behind a
//! single mutex so a concurrent `get_value` sees either the old configuration
//! or the new one, never a mix.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use super::{build_filter, AMode, FilterState, ReadFilter, Setup, Source};
use crate::error::InstrumentResult;

struct ChannelState {
    mode: AMode,
    count: usize,
    filter: Box<dyn ReadFilter>,
}

/// A numeric channel whose reads go through a swappable [`ReadFilter`].
pub struct FilterChannel {
    source: Source,
    setup: Setup,
    state: Mutex<ChannelState>,
}

impl FilterChannel {
    /// Channel in [`AMode::None`] with a count of 1. Hardware setup is
    /// deferred until the first value is requested.
    pub fn new<F, S>(source: F, setup: S) -> InstrumentResult<Self>
    where
        F: Fn() -> InstrumentResult<f64> + Send + Sync + 'static,
        S: Fn(usize) -> InstrumentResult<()> + Send + Sync + 'static,
    {
        Self::with_mode(AMode::None, 1, source, setup)
    }

    /// Channel starting in `mode` with window `count`.
    ///
    /// # Errors
    ///
    /// [`InstrumentError::InvalidFilterCount`](crate::error::InstrumentError::InvalidFilterCount)
    /// when `count` is zero.
    pub fn with_mode<F, S>(mode: AMode, count: usize, source: F, setup: S) -> InstrumentResult<Self>
    where
        F: Fn() -> InstrumentResult<f64> + Send + Sync + 'static,
        S: Fn(usize) -> InstrumentResult<()> + Send + Sync + 'static,
    {
        let source: Source = Arc::new(source);
        let setup: Setup = Arc::new(setup);
        let filter = build_filter(mode, count, Arc::clone(&source), Arc::clone(&setup))?;
        Ok(Self {
            source,
            setup,
            state: Mutex::new(ChannelState {
                mode,
                count,
                filter,
            }),
        })
    }

    /// Next filtered value.
    pub fn get_value(&self) -> InstrumentResult<f64> {
        self.state.lock().filter.get_value()
    }

    /// Current averaging mode.
    pub fn mode(&self) -> AMode {
        self.state.lock().mode
    }

    /// Current window count.
    pub fn count(&self) -> usize {
        self.state.lock().count
    }

    /// Lifecycle state of the active filter.
    pub fn filter_state(&self) -> FilterState {
        self.state.lock().filter.state()
    }

    /// Switch averaging mode, keeping the current count.
    pub fn set_mode(&self, mode: AMode) -> InstrumentResult<()> {
        let mut state = self.state.lock();
        let count = state.count;
        self.reconfigure(&mut state, mode, count)
    }

    /// Change the window size, keeping the current mode.
    pub fn set_count(&self, count: usize) -> InstrumentResult<()> {
        let mut state = self.state.lock();
        let mode = state.mode;
        self.reconfigure(&mut state, mode, count)
    }

    /// Change mode and count in one step.
    pub fn configure(&self, mode: AMode, count: usize) -> InstrumentResult<()> {
        let mut state = self.state.lock();
        self.reconfigure(&mut state, mode, count)
    }

    /// Drop accumulated samples.
    pub fn clear(&self) {
        self.state.lock().filter.clear();
    }

    /// Rebuild with the current mode and count, re-running hardware setup.
    pub fn reset(&self) -> InstrumentResult<()> {
        let mut state = self.state.lock();
        let (mode, count) = (state.mode, state.count);
        self.reconfigure(&mut state, mode, count)
    }

    fn reconfigure(
        &self,
        state: &mut ChannelState,
        mode: AMode,
        count: usize,
    ) -> InstrumentResult<()> {
        // build_filter applies set_count; an invalid count leaves the old
        // filter untouched.
        let mut filter = build_filter(
            mode,
            count,
            Arc::clone(&self.source),
            Arc::clone(&self.setup),
        )?;
        filter.set_up()?;
        filter.clear();
        debug!(?mode, count, "filter reconfigured");
        *state = ChannelState {
            mode,
            count,
            filter,
        };
        Ok(())
    }
}

impl std::fmt::Debug for FilterChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FilterChannel")
            .field("mode", &state.mode)
            .field("count", &state.count)
            .field("state", &state.filter.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InstrumentError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_source() -> (
        impl Fn() -> InstrumentResult<f64> + Send + Sync + 'static,
        Arc<AtomicUsize>,
    ) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let source = move || -> InstrumentResult<f64> {
            Ok(counter.fetch_add(1, Ordering::SeqCst) as f64)
        };
        (source, calls)
    }

    #[test]
    fn test_default_bypass() {
        let (source, calls) = counting_source();
        let channel = FilterChannel::new(source, |_| Ok(())).unwrap();
        assert_eq!(channel.mode(), AMode::None);
        assert_eq!(channel.get_value().unwrap(), 0.0);
        assert_eq!(channel.get_value().unwrap(), 1.0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_set_mode_reruns_setup_and_discards_samples() {
        let (source, calls) = counting_source();
        let setups = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log = Arc::clone(&setups);
        let channel = FilterChannel::with_mode(AMode::MeanMoving, 3, source, move |n| {
            log.lock().push(n);
            Ok(())
        })
        .unwrap();

        // 0,1,2 -> 1.0
        assert_eq!(channel.get_value().unwrap(), 1.0);
        channel.set_mode(AMode::MeanRepeat).unwrap();
        assert_eq!(channel.filter_state(), FilterState::Ready);
        // fresh 3,4,5 only; nothing carried over from the moving window
        assert_eq!(channel.get_value().unwrap(), 4.0);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(*setups.lock(), vec![3, 3]);
    }

    #[test]
    fn test_invalid_count_keeps_old_filter() {
        let (source, _) = counting_source();
        let channel = FilterChannel::with_mode(AMode::MedianRepeat, 4, source, |_| Ok(())).unwrap();
        assert!(matches!(
            channel.set_count(0),
            Err(InstrumentError::InvalidFilterCount(0))
        ));
        assert_eq!(channel.count(), 4);
        assert_eq!(channel.mode(), AMode::MedianRepeat);
    }

    #[test]
    fn test_setup_failure_propagates() {
        let (source, _) = counting_source();
        let channel = FilterChannel::new(source, |_| {
            Err(InstrumentError::Connection("offline".to_string()))
        })
        .unwrap();
        assert!(channel.configure(AMode::MeanRepeat, 2).is_err());
        assert_eq!(channel.mode(), AMode::None);
        assert!(channel.get_value().is_err());
    }

    #[test]
    fn test_concurrent_reconfigure_is_atomic() {
        let (source, _) = counting_source();
        let channel = Arc::new(
            FilterChannel::with_mode(AMode::MeanRepeat, 2, source, |_| Ok(())).unwrap(),
        );
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let channel = Arc::clone(&channel);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        if i % 2 == 0 {
                            channel.get_value().unwrap();
                        } else {
                            channel.set_count(1 + i).unwrap();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(matches!(channel.count(), 2 | 4));
    }
}
