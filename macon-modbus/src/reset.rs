//! Soft reset of the heat pump through the unit on/off register.
//!
//! The device has no reset command; a reset is the unit being switched off,
//! left to de-energize, and switched back on. [`ResetSequencer`] walks this
//! as a linear state machine:
//!
//! `Idle -> TurningOff -> Settling -> TurningOn -> Verifying -> Done | Failed`
//!
//! A failed stage is never retried. The sequencer must be re-armed to
//! `Idle` before it can run again.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

use crate::error::WriteError;
use crate::registers::{RegisterMap, UNIT_ON_OFF};
use crate::transport::Bus;
use crate::writer::SetpointWriter;

const UNIT_OFF: f64 = 0.0;
const UNIT_ON: f64 = 1.0;

/// Stage of the reset sequence that can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetStage {
    TurningOff,
    Settling,
    TurningOn,
    Verifying,
}

impl ResetStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetStage::TurningOff => "turning_off",
            ResetStage::Settling => "settling",
            ResetStage::TurningOn => "turning_on",
            ResetStage::Verifying => "verifying",
        }
    }
}

impl fmt::Display for ResetStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResetState {
    Idle,
    TurningOff,
    Settling,
    TurningOn,
    Verifying,
    Done,
    Failed { stage: ResetStage, reason: String },
}

impl ResetState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResetState::Done | ResetState::Failed { .. })
    }
}

impl From<ResetStage> for ResetState {
    fn from(stage: ResetStage) -> Self {
        match stage {
            ResetStage::TurningOff => ResetState::TurningOff,
            ResetStage::Settling => ResetState::Settling,
            ResetStage::TurningOn => ResetState::TurningOn,
            ResetStage::Verifying => ResetState::Verifying,
        }
    }
}

impl fmt::Display for ResetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResetState::Idle => f.write_str("idle"),
            ResetState::TurningOff => f.write_str("turning_off"),
            ResetState::Settling => f.write_str("settling"),
            ResetState::TurningOn => f.write_str("turning_on"),
            ResetState::Verifying => f.write_str("verifying"),
            ResetState::Done => f.write_str("done"),
            ResetState::Failed { stage, reason } => write!(f, "failed at {}: {}", stage, reason),
        }
    }
}

#[derive(Debug, Error)]
pub enum ResetError {
    /// The sequencer has already run and was not re-armed.
    #[error("Reset sequencer is not idle (state: {0})")]
    NotIdle(ResetState),

    #[error("Reset failed at {stage}: {source}")]
    Stage {
        stage: ResetStage,
        #[source]
        source: WriteError,
    },
}

/// Drives one soft reset through a [`SetpointWriter`].
pub struct ResetSequencer<B> {
    writer: SetpointWriter<B>,
    settle: Duration,
    state: ResetState,
    history: Vec<ResetState>,
}

impl<B: Bus> ResetSequencer<B> {
    pub fn new(bus: Arc<B>, map: &'static RegisterMap, settle: Duration) -> Self {
        Self {
            writer: SetpointWriter::new(bus, map),
            settle,
            state: ResetState::Idle,
            history: vec![ResetState::Idle],
        }
    }

    pub fn state(&self) -> &ResetState {
        &self.state
    }

    /// Every state entered since the last re-arm, in order.
    pub fn history(&self) -> &[ResetState] {
        &self.history
    }

    /// Return a finished sequencer to `Idle`.
    pub fn rearm(&mut self) {
        self.state = ResetState::Idle;
        self.history = vec![ResetState::Idle];
    }

    fn enter(&mut self, state: ResetState) {
        info!(state = %state, "Reset state");
        self.history.push(state.clone());
        self.state = state;
    }

    fn fail(&mut self, stage: ResetStage, source: WriteError) -> ResetError {
        error!(stage = %stage, error = %source, "Reset failed");
        self.enter(ResetState::Failed {
            stage,
            reason: source.to_string(),
        });
        ResetError::Stage { stage, source }
    }

    async fn switch(&mut self, stage: ResetStage, value: f64) -> Result<(), ResetError> {
        self.enter(stage.into());
        match self.writer.write(UNIT_ON_OFF, value, false).await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.fail(stage, e)),
        }
    }

    /// Run the sequence once from `Idle`.
    pub async fn run(&mut self) -> Result<(), ResetError> {
        if self.state != ResetState::Idle {
            return Err(ResetError::NotIdle(self.state.clone()));
        }

        self.switch(ResetStage::TurningOff, UNIT_OFF).await?;

        self.enter(ResetStage::Settling.into());
        tokio::time::sleep(self.settle).await;

        self.switch(ResetStage::TurningOn, UNIT_ON).await?;

        self.enter(ResetStage::Verifying.into());
        let actual = match self.writer.read(UNIT_ON_OFF).await {
            Ok(value) => value.as_number().unwrap_or(f64::NAN),
            Err(e) => return Err(self.fail(ResetStage::Verifying, e)),
        };
        if actual != UNIT_ON {
            let mismatch = WriteError::VerificationMismatch {
                register: UNIT_ON_OFF,
                expected: UNIT_ON,
                actual,
            };
            return Err(self.fail(ResetStage::Verifying, mismatch));
        }

        self.enter(ResetState::Done);
        Ok(())
    }
}
