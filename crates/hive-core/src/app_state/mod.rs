//! Application-wide run state and error types for the hive node

use log::{error, info};
use thiserror_no_std::Error;

use crate::power::WakeLatch;
use crate::radio::NodeRole;
use crate::sensors::SensorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppRunState {
    Booting,
    /// Reading the log back to find the dataset counter
    Recovering,
    /// Field node (or radio-less node) sampling its sensors
    Sampling,
    Relaying(NodeRole),
    WaitingForSleep,
    /// A fatal configuration error; the node stays awake and observable
    Faulted,
}

/// Fatal configuration errors, surfaced at startup and not retried.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppError {
    #[error("no usable sensor bus: {0}")]
    NoSensorBus(SensorError),
    #[error("role {0:?} requires a radio, none found")]
    NoRadio(NodeRole),
}

/// Tracks the run state and logs every transition.
pub struct AppState {
    run_state: AppRunState,
    role: Option<NodeRole>,
}

impl AppState {
    pub fn new() -> Self {
        info!("App state: {:?}", AppRunState::Booting);
        Self {
            run_state: AppRunState::Booting,
            role: None,
        }
    }

    pub fn run_state(&self) -> AppRunState {
        self.run_state
    }

    pub fn role(&self) -> Option<NodeRole> {
        self.role
    }

    pub fn set_role(&mut self, role: NodeRole) {
        self.role = Some(role);
    }

    /// Move to `next`. A faulted node stays faulted.
    pub fn transition(&mut self, next: AppRunState) {
        if self.run_state == AppRunState::Faulted || self.run_state == next {
            return;
        }
        info!("App state: {:?} -> {:?}", self.run_state, next);
        self.run_state = next;
    }

    /// Record a fatal error: log it, enter [`AppRunState::Faulted`] and keep
    /// the node awake so it can be inspected.
    pub fn fail(&mut self, err: AppError, latch: &WakeLatch) {
        error!("Fatal: {}", err);
        self.run_state = AppRunState::Faulted;
        latch.force();
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
