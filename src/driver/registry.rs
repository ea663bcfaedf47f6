//! Ordered collection of drivers used to open addresses and discover devices.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{Driver, Handle, SerialDriver, TcpIpDriver};
use crate::address::Address;
use crate::error::{InstrumentError, InstrumentResult};

/// Drivers tried in registration order.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: Vec<Arc<dyn Driver>>,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.drivers.iter().map(|d| d.name().to_string()))
            .finish()
    }
}

impl DriverRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// VISA (when built with `instrument_visa` and a VISA library is present),
    /// then native serial, then raw TCP.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        #[cfg(feature = "instrument_visa")]
        match super::VisaDriver::new() {
            Ok(visa) => registry.register(visa),
            Err(e) => debug!(error = %e, "VISA driver unavailable"),
        }

        registry.register(SerialDriver::new());
        registry.register(TcpIpDriver::new());
        registry
    }

    /// Append `driver`; earlier drivers are tried first.
    pub fn register<D: Driver + 'static>(&mut self, driver: D) {
        self.drivers.push(Arc::new(driver));
    }

    /// Registered drivers in trial order.
    pub fn drivers(&self) -> impl Iterator<Item = &dyn Driver> {
        self.drivers.iter().map(|d| d.as_ref())
    }

    /// Open `address` with the first driver that succeeds.
    ///
    /// `preferred` names a driver to try before all others. Every failure is
    /// collected; if nothing opens the address the result is
    /// [`InstrumentError::NoDriver`] listing each driver's reason.
    pub fn open(
        &self,
        address: &Address,
        preferred: Option<&str>,
    ) -> InstrumentResult<(Box<dyn Handle>, String)> {
        let mut ordered: Vec<&Arc<dyn Driver>> = Vec::with_capacity(self.drivers.len());
        if let Some(name) = preferred {
            ordered.extend(self.drivers.iter().filter(|d| d.name() == name));
        }
        ordered.extend(
            self.drivers
                .iter()
                .filter(|d| preferred.map_or(true, |name| d.name() != name)),
        );

        let mut errors = String::new();
        for driver in ordered {
            if !driver.works_with(address) {
                continue;
            }
            match driver.open(address) {
                Ok(handle) => {
                    debug!(address = %address, driver = driver.name(), "Driver opened address");
                    return Ok((handle, driver.name().to_string()));
                }
                Err(e) => {
                    warn!(address = %address, driver = driver.name(), error = %e, "Driver failed to open address");
                    let _ = writeln!(errors, "* {}: {}", driver.name(), e);
                }
            }
        }

        if errors.is_empty() {
            errors.push_str("* no registered driver accepts this address kind");
        }
        Err(InstrumentError::NoDriver {
            address: address.to_string(),
            errors: errors.trim_end().to_string(),
        })
    }

    /// Addresses reported by every driver, de-duplicated and ordered by kind.
    ///
    /// A driver whose search fails is logged and skipped.
    pub fn search(&self) -> Vec<Address> {
        let mut found = BTreeMap::new();
        for driver in &self.drivers {
            match driver.search() {
                Ok(addresses) => {
                    found.extend(addresses.into_iter().map(|a| ((a.kind(), a.to_string()), a)));
                }
                Err(e) => warn!(driver = driver.name(), error = %e, "Device search failed"),
            }
        }
        found.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressKind;
    use crate::driver::mock::{MockDevice, MockDriver};

    fn serial() -> Address {
        Address::parse("ASRL::/dev/ttyS0::INSTR").unwrap()
    }

    #[test]
    fn test_open_falls_through_to_working_driver() {
        let device = MockDevice::new();
        let mut registry = DriverRegistry::new();
        registry.register(MockDriver::failing("first"));
        registry.register(MockDriver::new(device.clone()).named("second"));

        let (_, used) = registry.open(&serial(), None).unwrap();
        assert_eq!(used, "second");
        assert_eq!(device.open_calls(), 1);
    }

    #[test]
    fn test_preferred_driver_tried_first() {
        let a = MockDevice::new();
        let b = MockDevice::new();
        let mut registry = DriverRegistry::new();
        registry.register(MockDriver::new(a.clone()).named("a"));
        registry.register(MockDriver::new(b.clone()).named("b"));

        let (_, used) = registry.open(&serial(), Some("b")).unwrap();
        assert_eq!(used, "b");
        assert_eq!(a.open_calls(), 0);
        assert_eq!(b.open_calls(), 1);
    }

    #[test]
    fn test_errors_are_aggregated() {
        let mut registry = DriverRegistry::new();
        registry.register(MockDriver::failing("left"));
        registry.register(MockDriver::failing("right"));
        registry.register(
            MockDriver::new(MockDevice::new())
                .named("gpib-only")
                .serving(&[AddressKind::Gpib]),
        );

        match registry.open(&serial(), None) {
            Err(InstrumentError::NoDriver { errors, .. }) => {
                assert!(errors.contains("left"));
                assert!(errors.contains("right"));
                assert!(!errors.contains("gpib-only"));
            }
            other => panic!("unexpected result: {:?}", other.map(|(_, name)| name)),
        }
    }

    #[test]
    fn test_search_deduplicates_and_orders() {
        let tcp = Address::parse("TCPIP0::10.0.0.2::5025::SOCKET").unwrap();
        let gpib = Address::parse("GPIB0::7::INSTR").unwrap();
        let mut registry = DriverRegistry::new();
        registry.register(MockDriver::failing("x").discovering(vec![tcp.clone(), gpib.clone()]));
        registry.register(MockDriver::failing("y").discovering(vec![gpib.clone()]));

        assert_eq!(registry.search(), vec![gpib, tcp]);
    }
}
