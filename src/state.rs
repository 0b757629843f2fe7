//! Shared node state
//!
//! The live configuration, the model state and the loaded engine handle live
//! together behind exactly one mutex. Every read or write of any of the three
//! happens while that lock is held, which is what makes the non-reentrant
//! engine safe to call from both the scoring path and the config sync loop.
//!
//! The lock is a `std::sync::Mutex`: critical sections never `.await`, and the
//! engine call itself runs on the blocking pool.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config_store::Configuration;
use crate::engine::ScoringModel;
use crate::model_manager::ModelState;

/// Everything guarded by the node lock.
pub struct EdgeState {
    pub configuration: Configuration,
    pub model: ModelState,
    /// Loaded engine handle. `Some` whenever a working model exists.
    pub handle: Option<Box<dyn ScoringModel>>,
}

impl EdgeState {
    pub fn new(configuration: Configuration) -> Self {
        Self {
            configuration,
            model: ModelState::default(),
            handle: None,
        }
    }

    pub fn has_working_model(&self) -> bool {
        self.handle.is_some()
    }
}

/// Single owner of the node lock, shared by `Arc` between the scoring
/// coordinator and the config store.
pub struct SharedState {
    inner: Mutex<EdgeState>,
}

impl SharedState {
    pub fn new(configuration: Configuration) -> Self {
        Self {
            inner: Mutex::new(EdgeState::new(configuration)),
        }
    }

    /// Acquire the node lock.
    ///
    /// A panic inside a critical section leaves the state itself consistent
    /// (every mutation is a plain field assignment), so poisoning is cleared.
    pub fn lock(&self) -> MutexGuard<'_, EdgeState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let state = self.lock();
        StateSnapshot {
            configuration: state.configuration.clone(),
            model: state.model.clone(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Immutable copy of the node state for reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub configuration: Configuration,
    pub model: ModelState,
    pub timestamp: i64,
}
