//! Background config sync loop
//!
//! Receives desired-property patches from the twin, applies them through the
//! config store and reports the resulting model status back.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config_store::ConfigStore;
use crate::error::TransportError;
use crate::ports::{PatchSource, TwinPublisher};
use crate::twin::{ConfigPatch, ReportedStatus};

pub struct ConfigSyncLoop<S: PatchSource> {
    source: S,
    store: Arc<ConfigStore>,
    publisher: Arc<dyn TwinPublisher>,
}

impl<S: PatchSource + 'static> ConfigSyncLoop<S> {
    pub fn new(source: S, store: Arc<ConfigStore>, publisher: Arc<dyn TwinPublisher>) -> Self {
        Self {
            source,
            store,
            publisher,
        }
    }

    /// Apply the desired properties known at startup.
    ///
    /// Only a fatal transport error fails this; a malformed document is
    /// skipped and the node starts with its defaults.
    pub async fn initial_sync(&mut self) -> Result<(), TransportError> {
        info!("🔄 Running initial config sync");
        match self.source.desired_properties().await {
            Ok(patch) => {
                self.apply(&patch).await;
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable initial desired properties");
                self.report().await;
                Ok(())
            }
        }
    }

    /// Receive and apply patches until shutdown or a fatal transport error.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), TransportError> {
        info!("Config sync loop started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Config sync loop shutting down");
                        return Ok(());
                    }
                }
                next = self.source.next_patch() => match next {
                    Ok(patch) => apply_and_report(&self.store, self.publisher.as_ref(), &patch).await,
                    Err(e) if e.is_fatal() => {
                        error!(error = %e, "❌ Twin transport lost, stopping config sync");
                        return Err(e);
                    }
                    Err(e) => warn!(error = %e, "Skipping patch"),
                },
            }
        }
    }

    /// Spawn `run` on the runtime.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<Result<(), TransportError>> {
        tokio::spawn(self.run(shutdown))
    }

    async fn apply(&self, patch: &ConfigPatch) {
        apply_and_report(&self.store, self.publisher.as_ref(), patch).await;
    }

    async fn report(&self) {
        let model_state = self.store.model_state();
        publish(self.publisher.as_ref(), &ReportedStatus::from(&model_state)).await;
    }
}

// The spawned loop borrows only `store` and `publisher` across awaits; `S` is not `Sync`.
async fn apply_and_report(store: &ConfigStore, publisher: &dyn TwinPublisher, patch: &ConfigPatch) {
    if patch.is_empty() {
        debug!("Received patch with no known properties");
    }
    let model_state = store.apply_patch(patch).await;
    publish(publisher, &ReportedStatus::from(&model_state)).await;
}

async fn publish(publisher: &dyn TwinPublisher, status: &ReportedStatus) {
    if let Err(e) = publisher.publish_status(status).await {
        warn!(error = %e, "Failed to report status");
    }
}
