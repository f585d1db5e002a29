//! The setpoint control routine.
//!
//! One run reads the device status, refuses to touch anything while a fault
//! is active, applies the hot water setpoints, and then hands compressor
//! frequency control to the host only if the brine pump is running.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::ControlConfig;
use crate::error::WriteError;
use crate::registers::{
    HOST_COMPRESSOR_FREQUENCY, HOST_FREQUENCY_CONTROL, HOT_WATER_SETPOINT, HOT_WATER_TANK_DELTA_T,
    RegisterMap,
};
use crate::sink::WriteResult;
use crate::transport::Bus;
use crate::writer::{SetpointWriter, StatusCheck, read_status};

/// Setpoints applied by one control run.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlPlan {
    pub hot_water_delta_t: Option<f64>,
    pub hot_water_setpoint: Option<f64>,
    pub compressor_frequency: Option<f64>,
    pub verify: bool,
    /// Pause between consecutive writes.
    pub write_delay: Duration,
}

impl Default for ControlPlan {
    fn default() -> Self {
        Self {
            hot_water_delta_t: None,
            hot_water_setpoint: None,
            compressor_frequency: None,
            verify: true,
            write_delay: Duration::from_millis(200),
        }
    }
}

impl From<&ControlConfig> for ControlPlan {
    fn from(config: &ControlConfig) -> Self {
        Self {
            hot_water_delta_t: config.hot_water_delta_t,
            hot_water_setpoint: config.hot_water_setpoint,
            compressor_frequency: config.compressor_frequency,
            verify: config.verify,
            write_delay: config.write_delay(),
        }
    }
}

/// What a control run did.
#[derive(Debug, Clone)]
pub struct ControlReport {
    pub status: StatusCheck,
    /// One entry per attempted write, in order.
    pub writes: Vec<WriteResult>,
}

impl ControlReport {
    pub fn succeeded(&self) -> bool {
        self.writes.iter().all(|w| w.success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &WriteResult> {
        self.writes.iter().filter(|w| !w.success)
    }
}

enum Step {
    Set(&'static str, f64),
    EnableHostControl,
    DisableHostControl,
}

impl Step {
    fn target(&self) -> (&'static str, f64) {
        match self {
            Step::Set(name, value) => (*name, *value),
            Step::EnableHostControl => (HOST_FREQUENCY_CONTROL, 1.0),
            Step::DisableHostControl => (HOST_FREQUENCY_CONTROL, 0.0),
        }
    }
}

/// Applies a [`ControlPlan`] to the device.
pub struct Controller<B> {
    writer: SetpointWriter<B>,
}

impl<B: Bus> Controller<B> {
    pub fn new(bus: Arc<B>, map: &'static RegisterMap) -> Self {
        Self {
            writer: SetpointWriter::new(bus, map),
        }
    }

    /// Run the routine once.
    ///
    /// Fails without writing anything when the status cannot be read or a
    /// fault is active. Individual write failures are collected in the
    /// report; the frequency target is only written once host control was
    /// asserted.
    pub async fn apply(&self, plan: &ControlPlan) -> Result<ControlReport, WriteError> {
        let status = read_status(self.writer.bus(), self.writer.map()).await?;
        if let Err(e) = status.ensure_no_faults() {
            warn!(error = %e, "Refusing to change setpoints");
            return Err(e);
        }
        info!(pump_running = status.pump_running, "Device status checked");

        let mut steps = Vec::new();
        if let Some(delta_t) = plan.hot_water_delta_t {
            steps.push(Step::Set(HOT_WATER_TANK_DELTA_T, delta_t));
        }
        if let Some(setpoint) = plan.hot_water_setpoint {
            steps.push(Step::Set(HOT_WATER_SETPOINT, setpoint));
        }
        if status.pump_running {
            steps.push(Step::EnableHostControl);
        } else {
            info!("Brine pump is off; releasing host control");
            steps.push(Step::DisableHostControl);
        }

        let mut writes = Vec::with_capacity(steps.len() + 1);
        for step in &steps {
            self.pause(&writes, plan).await;
            let result = self.run_step(step, &status, plan.verify).await;
            writes.push(result);
        }

        if let Some(frequency) = plan.compressor_frequency {
            let host_control = writes.last().is_some_and(|w| w.success) && status.pump_running;
            if host_control {
                self.pause(&writes, plan).await;
                let step = Step::Set(HOST_COMPRESSOR_FREQUENCY, frequency);
                let result = self.run_step(&step, &status, plan.verify).await;
                writes.push(result);
            } else if status.pump_running {
                warn!("Host control not asserted; compressor frequency not written");
            }
        }

        let report = ControlReport { status, writes };
        if report.succeeded() {
            info!(writes = report.writes.len(), "Control run complete");
        } else {
            warn!(
                writes = report.writes.len(),
                failed = report.failures().count(),
                "Control run finished with failures"
            );
        }
        Ok(report)
    }

    async fn pause(&self, writes: &[WriteResult], plan: &ControlPlan) {
        if !writes.is_empty() && !plan.write_delay.is_zero() {
            tokio::time::sleep(plan.write_delay).await;
        }
    }

    async fn run_step(&self, step: &Step, status: &StatusCheck, verify: bool) -> WriteResult {
        let (target, value) = step.target();
        let result = match step {
            Step::Set(name, value) => self.writer.write(name, *value, verify).await,
            Step::EnableHostControl => self.writer.enable_host_control(status, verify).await,
            Step::DisableHostControl => self.writer.disable_host_control(verify).await,
        };
        WriteResult::from_result(target, Some(value), &result)
    }
}
