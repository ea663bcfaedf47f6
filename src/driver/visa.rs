//! VISA driver for GPIB and LXI instruments
//!
//! Uses the `visa-rs` crate to talk to whatever vendor VISA library is
//! installed. The library delimits messages itself (EOI / termination
//! character), so handles report `native_framing() == true`.
//!
//! Feature-gated with `instrument_visa`; without it the driver still exists so
//! a [`DriverRegistry`](super::DriverRegistry) can report a clear error.

use super::{Driver, Handle};
use crate::address::Address;
use crate::error::{InstrumentError, InstrumentResult};

#[cfg(feature = "instrument_visa")]
use std::ffi::CString;
#[cfg(feature = "instrument_visa")]
use std::time::Duration;
#[cfg(feature = "instrument_visa")]
use tracing::debug;
#[cfg(feature = "instrument_visa")]
use visa_rs::prelude::*;

/// Opens `GPIB<n>::<addr>::INSTR` and `TCPIP<n>::<host>::INSTR` through VISA.
#[derive(Debug, Clone, Default)]
pub struct VisaDriver {
    _private: (),
}

impl VisaDriver {
    /// Probe the VISA library; fails if no resource manager can be created.
    pub fn new() -> InstrumentResult<Self> {
        #[cfg(feature = "instrument_visa")]
        {
            DefaultRM::new().map_err(|e| {
                InstrumentError::Connection(format!(
                    "Failed to create VISA resource manager: {e}"
                ))
            })?;
            Ok(Self { _private: () })
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            Err(InstrumentError::FeatureNotEnabled(
                "instrument_visa".to_string(),
            ))
        }
    }
}

impl Driver for VisaDriver {
    fn name(&self) -> &str {
        "visa"
    }

    fn works_with(&self, address: &Address) -> bool {
        address.to_gpib().is_some() || address.to_lxi().is_some()
    }

    fn open(&self, address: &Address) -> InstrumentResult<Box<dyn Handle>> {
        if !self.works_with(address) {
            return Err(InstrumentError::IncompatibleAddress {
                driver: self.name().to_string(),
                address: address.to_string(),
            });
        }

        #[cfg(feature = "instrument_visa")]
        {
            let resource = address.to_string();
            let rm = DefaultRM::new().map_err(visa_err)?;
            let c_string = CString::new(resource.clone())
                .map_err(|e| InstrumentError::AddressFormat(e.to_string()))?;
            let visa_string = VisaString::from(c_string);
            let instrument = rm
                .open(&visa_string, AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
                .map_err(|e| {
                    InstrumentError::Connection(format!(
                        "Failed to open VISA resource {resource}: {e}"
                    ))
                })?;
            debug!(resource = %resource, "VISA resource opened");

            let mut handle = VisaHandle {
                resource,
                _rm: rm,
                instrument: Some(instrument),
                timeout: Duration::from_millis(2000),
            };
            handle.set_timeout(Duration::from_millis(2000))?;
            Ok(Box::new(handle))
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            Err(InstrumentError::FeatureNotEnabled(
                "instrument_visa".to_string(),
            ))
        }
    }

    fn search(&self) -> InstrumentResult<Vec<Address>> {
        #[cfg(feature = "instrument_visa")]
        {
            let rm = DefaultRM::new().map_err(visa_err)?;
            let expr = CString::new("?*::INSTR")
                .map_err(|e| InstrumentError::Connection(e.to_string()))?;
            let mut list = match rm.find_res_list(&VisaString::from(expr)) {
                Ok(list) => list,
                // VI_ERROR_RSRC_NFOUND: nothing attached
                Err(_) => return Ok(Vec::new()),
            };
            let mut found = Vec::new();
            while let Some(resource) = list.find_next().map_err(visa_err)? {
                // Skip kinds this crate has no address grammar for (USB, VXI, ...)
                if let Ok(address) = Address::parse(&resource.to_string_lossy()) {
                    found.push(address);
                }
            }
            Ok(found)
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            Ok(Vec::new())
        }
    }
}

#[cfg(feature = "instrument_visa")]
fn visa_err(e: visa_rs::Error) -> InstrumentError {
    InstrumentError::Connection(format!("VISA error: {e}"))
}

/// Open VISA session.
#[cfg(feature = "instrument_visa")]
pub struct VisaHandle {
    resource: String,
    _rm: DefaultRM,
    instrument: Option<Instrument>,
    timeout: Duration,
}

#[cfg(feature = "instrument_visa")]
impl VisaHandle {
    fn instrument(&mut self) -> InstrumentResult<&mut Instrument> {
        self.instrument
            .as_mut()
            .ok_or_else(|| InstrumentError::Closed(self.resource.clone()))
    }
}

#[cfg(feature = "instrument_visa")]
impl Handle for VisaHandle {
    fn write(&mut self, bytes: &[u8]) -> InstrumentResult<usize> {
        use std::io::Write;

        let timeout = self.timeout;
        self.instrument()?
            .write(bytes)
            .map_err(|e| InstrumentError::from_io(e, timeout))
    }

    fn read(&mut self, buf: &mut [u8]) -> InstrumentResult<usize> {
        use std::io::Read;

        let timeout = self.timeout;
        match self.instrument()?.read(buf) {
            Ok(0) => Err(InstrumentError::Timeout(timeout)),
            Ok(n) => Ok(n),
            Err(e) => Err(InstrumentError::from_io(e, timeout)),
        }
    }

    fn native_framing(&self) -> bool {
        true
    }

    fn set_eoi(&mut self, enabled: bool) -> InstrumentResult<()> {
        let attr = attribute::AttrSendEndEn::new_checked(enabled.into())
            .ok_or_else(|| InstrumentError::Connection("Invalid EOI flag".to_string()))?;
        self.instrument()?.set_attr(attr).map_err(visa_err)
    }

    fn set_eos(&mut self, terminator: &[u8]) -> InstrumentResult<()> {
        // VISA can only watch for a single termination character: the last one.
        let instrument = self.instrument()?;
        match terminator.last() {
            Some(&last) => {
                let term = attribute::AttrTermchar::new_checked(last).ok_or_else(|| {
                    InstrumentError::Connection("Invalid termination character".to_string())
                })?;
                instrument.set_attr(term).map_err(visa_err)?;
                let enable = attribute::AttrTermcharEn::new_checked(true.into()).ok_or_else(
                    || InstrumentError::Connection("Invalid termchar flag".to_string()),
                )?;
                instrument.set_attr(enable).map_err(visa_err)
            }
            None => {
                let disable = attribute::AttrTermcharEn::new_checked(false.into()).ok_or_else(
                    || InstrumentError::Connection("Invalid termchar flag".to_string()),
                )?;
                instrument.set_attr(disable).map_err(visa_err)
            }
        }
    }

    fn set_timeout(&mut self, timeout: Duration) -> InstrumentResult<()> {
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let attr = attribute::AttrTmoValue::new_checked(millis)
            .ok_or_else(|| InstrumentError::Connection(format!("Invalid timeout {timeout:?}")))?;
        self.instrument()?.set_attr(attr).map_err(visa_err)?;
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear(&mut self) -> InstrumentResult<()> {
        self.instrument()?.clear().map_err(visa_err)
    }

    fn close(&mut self) -> InstrumentResult<()> {
        let instrument = self
            .instrument
            .take()
            .ok_or_else(|| InstrumentError::AlreadyClosed(self.resource.clone()))?;
        // Dropping the session calls viClose.
        drop(instrument);
        debug!(resource = %self.resource, "VISA resource closed");
        Ok(())
    }

    fn transport(&self) -> &str {
        "visa"
    }
}
