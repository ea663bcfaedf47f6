//! Pass-through filter: one raw sample per value.
//!
//! Used when the instrument averages internally; the setup callback receives
//! the count so the driver can program that hardware averaging.

use super::{AMode, FilterCore, FilterState, ReadFilter, Setup, Source};
use crate::error::InstrumentResult;

/// Reports each raw sample unchanged.
pub struct BypassFilter {
    core: FilterCore,
}

impl BypassFilter {
    /// Filter over `source`, configured through `setup`.
    pub fn new(source: Source, setup: Setup) -> Self {
        Self {
            core: FilterCore::new(source, setup),
        }
    }
}

impl ReadFilter for BypassFilter {
    fn get_value(&mut self) -> InstrumentResult<f64> {
        self.core.ensure_set_up()?;
        let value = self.core.sample()?;
        self.core.state = FilterState::HasSamples;
        Ok(value)
    }

    fn set_count(&mut self, count: usize) -> InstrumentResult<()> {
        self.core.set_count(count)
    }

    fn count(&self) -> usize {
        self.core.count
    }

    fn set_up(&mut self) -> InstrumentResult<()> {
        self.core.set_up()
    }

    fn clear(&mut self) {
        self.core.cleared();
    }

    fn state(&self) -> FilterState {
        self.core.state
    }

    fn mode(&self) -> AMode {
        AMode::None
    }
}
