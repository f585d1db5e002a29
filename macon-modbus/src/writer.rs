//! Single-attempt setpoint writes.
//!
//! A write is validated against the register map before the bus is touched,
//! sent as exactly one transaction, and optionally verified by reading the
//! register back. Nothing here retries a write; the caller decides whether
//! to invoke it again.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{RegisterError, WriteError};
use crate::registers::{
    BRINE_PUMP, HOST_FREQUENCY_CONTROL, RegisterMap, SYSTEM_STATUS_3, Value,
};
use crate::snapshot::{ActiveFault, DeviceSnapshot};
use crate::transport::Bus;

/// Tolerance used when comparing read-back values.
const VERIFY_EPSILON: f64 = 1e-9;

/// Device state consulted before changing setpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusCheck {
    pub timestamp: DateTime<Utc>,
    pub pump_running: bool,
    pub faults: Vec<ActiveFault>,
}

impl StatusCheck {
    /// Derive the check from a polled snapshot.
    ///
    /// A snapshot without the status register reports the pump as stopped.
    pub fn from_snapshot(snapshot: &DeviceSnapshot) -> Self {
        Self {
            timestamp: snapshot.timestamp(),
            pump_running: snapshot.flag(BRINE_PUMP).unwrap_or(false),
            faults: snapshot.active_faults(),
        }
    }

    pub fn has_faults(&self) -> bool {
        !self.faults.is_empty()
    }

    /// Fail with [`WriteError::ActiveFault`] if any fault is reported.
    pub fn ensure_no_faults(&self) -> Result<(), WriteError> {
        if self.faults.is_empty() {
            return Ok(());
        }
        let faults: Vec<String> = self.faults.iter().map(ToString::to_string).collect();
        Err(WriteError::ActiveFault(faults.join("; ")))
    }
}

/// Read the pump status and every fault register (2134-2138) in one
/// transaction.
pub async fn read_status<B: Bus + ?Sized>(
    bus: &B,
    map: &'static RegisterMap,
) -> Result<StatusCheck, WriteError> {
    let status = map.lookup(SYSTEM_STATUS_3)?;
    let span = || map.fault_registers().chain([status]);
    let start = span().map(|d| d.address).min().unwrap_or(status.address);
    let end = span().map(|d| d.end_address()).max().unwrap_or(status.address);
    let count = end - start + 1;

    let words = bus.read_registers(start, count).await?;
    if words.len() < count as usize {
        return Err(RegisterError::ShortRead {
            register: status.name,
            expected: count as usize,
            actual: words.len(),
        }
        .into());
    }

    let values = map.decode_block(start, &words)?;
    let snapshot = DeviceSnapshot::new(Utc::now(), values, map);
    let check = StatusCheck::from_snapshot(&snapshot);
    debug!(
        pump_running = check.pump_running,
        faults = check.faults.len(),
        "Status check"
    );
    Ok(check)
}

/// Result of a successful write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    pub register: &'static str,
    pub address: u16,
    pub raw: u16,
    /// Engineering value the raw word represents.
    pub value: f64,
    /// Whether the value was confirmed by a read-back.
    pub verified: bool,
}

/// Writes setpoints through the bus.
pub struct SetpointWriter<B> {
    bus: Arc<B>,
    map: &'static RegisterMap,
}

impl<B> Clone for SetpointWriter<B> {
    fn clone(&self) -> Self {
        Self {
            bus: Arc::clone(&self.bus),
            map: self.map,
        }
    }
}

impl<B: Bus> SetpointWriter<B> {
    pub fn new(bus: Arc<B>, map: &'static RegisterMap) -> Self {
        Self { bus, map }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn map(&self) -> &'static RegisterMap {
        self.map
    }

    /// Write `value` to the named register.
    ///
    /// Issues exactly one write transaction, whatever the outcome. With
    /// `verify`, the register is read back and compared afterwards.
    pub async fn write(
        &self,
        name: &str,
        value: f64,
        verify: bool,
    ) -> Result<WriteOutcome, WriteError> {
        let desc = self.map.lookup(name)?;
        let raw = match desc.encode(&Value::Number(value))?.as_slice() {
            [word] => *word,
            _ => return Err(RegisterError::Unwritable(desc.name).into()),
        };
        let expected = desc
            .decode(&[raw])?
            .as_number()
            .ok_or(RegisterError::Unwritable(desc.name))?;

        debug!(register = desc.name, address = desc.address, raw, "Writing register");
        if let Err(e) = self.bus.write_register(desc.address, raw).await {
            warn!(register = desc.name, value, error = %e, "Write failed");
            return Err(e.into());
        }
        info!(register = desc.name, address = desc.address, value = expected, "Wrote register");

        if verify {
            let actual = self.read(desc.name).await?.as_number().unwrap_or(f64::NAN);
            if (actual - expected).abs() > VERIFY_EPSILON || actual.is_nan() {
                warn!(register = desc.name, expected, actual, "Read-back mismatch");
                return Err(WriteError::VerificationMismatch {
                    register: desc.name,
                    expected,
                    actual,
                });
            }
            debug!(register = desc.name, value = actual, "Write verified");
        }

        Ok(WriteOutcome {
            register: desc.name,
            address: desc.address,
            raw,
            value: expected,
            verified: verify,
        })
    }

    /// Read and decode the named register.
    pub async fn read(&self, name: &str) -> Result<Value, WriteError> {
        let desc = self.map.lookup(name)?;
        let words = self.bus.read_registers(desc.address, desc.count()).await?;
        Ok(desc.decode(&words)?)
    }

    /// Assert host frequency control, gated on the brine pump running.
    pub async fn enable_host_control(
        &self,
        status: &StatusCheck,
        verify: bool,
    ) -> Result<WriteOutcome, WriteError> {
        if !status.pump_running {
            return Err(WriteError::PumpNotRunning);
        }
        self.write(HOST_FREQUENCY_CONTROL, 1.0, verify).await
    }

    pub async fn disable_host_control(&self, verify: bool) -> Result<WriteOutcome, WriteError> {
        self.write(HOST_FREQUENCY_CONTROL, 0.0, verify).await
    }
}
