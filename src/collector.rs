// Instance collector - the per-device unit of work
//
// Each configured device gets exactly one InstanceCollector. It owns the
// device session, runs one fetch cycle per timer tick and feeds decoded
// documents into the shared metric registry.
//
// # State machine
// - Unauthenticated: no token; the next cycle logs in first
// - Authenticated: token held; the next cycle fetches straight away
// - Collecting: a cycle is in flight; further ticks are skipped
//
// Auth, transport and internal failures drop the session. A malformed
// document only skips its own update.

use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::client::{CollectError, DeviceApi};
use crate::metrics::{HistogramDocument, MetricRegistry};

/// Bearer token for one device, owned by its collector
#[derive(Debug, Default)]
pub struct Session {
    token: Option<String>,
}

impl Session {
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn is_valid(&self) -> bool {
        self.token.is_some()
    }

    fn establish(&mut self, token: String) {
        self.token = Some(token);
    }

    fn invalidate(&mut self) {
        self.token = None;
    }
}

/// Observable collector state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Unauthenticated,
    Authenticated,
    Collecting,
}

/// What a completed cycle managed to apply
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Histogram buckets updated, `None` if the document was malformed
    pub buckets: Option<usize>,
    /// Scalar descriptors updated, `None` if the document was malformed
    pub fields: Option<usize>,
}

pub struct InstanceCollector {
    name: String,
    api: Arc<dyn DeviceApi>,
    registry: Arc<MetricRegistry>,
    session: Session,
}

impl InstanceCollector {
    pub fn new(name: String, api: Arc<dyn DeviceApi>, registry: Arc<MetricRegistry>) -> Self {
        InstanceCollector {
            name,
            api,
            registry,
            session: Session::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> CollectorState {
        if self.session.is_valid() {
            CollectorState::Authenticated
        } else {
            CollectorState::Unauthenticated
        }
    }

    /// Runs one collection cycle
    ///
    /// Every failure, including a panic inside the cycle body, is caught
    /// here, logged against the device name and mapped onto the session.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, CollectError> {
        let outcome = AssertUnwindSafe(self.cycle_body())
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(CollectError::Internal(panic_message(panic.as_ref()))));

        match &outcome {
            Ok(report) => debug!(
                instance = %self.name,
                buckets = ?report.buckets,
                fields = ?report.fields,
                "Collection cycle complete"
            ),
            Err(e) => {
                if e.invalidates_session() {
                    self.session.invalidate();
                }
                error!(instance = %self.name, "Collection cycle failed: {}", e);
            }
        }

        outcome
    }

    async fn cycle_body(&mut self) -> Result<CycleReport, CollectError> {
        // Reuse the session token; log in only when there is none
        let token = match self.session.token() {
            Some(token) => token.to_string(),
            None => {
                let token = self.api.login().await?;
                self.session.establish(token.clone());
                token
            }
        };

        let mut report = CycleReport::default();

        // Fetch failures end the cycle; a bad document only skips its own update
        let body = self.api.fetch_histogram(&token).await?;
        match self.apply_histogram(&body) {
            Ok(count) => report.buckets = Some(count),
            Err(e) => warn!(instance = %self.name, "Skipping histogram update: {}", e),
        }

        let body = self.api.fetch_cyclic_backup(&token).await?;
        match self.apply_performance(&body) {
            Ok(count) => report.fields = Some(count),
            Err(e) => warn!(instance = %self.name, "Skipping performance update: {}", e),
        }

        Ok(report)
    }

    fn apply_histogram(&self, body: &str) -> Result<usize, CollectError> {
        let value: serde_json::Value =
            serde_json::from_str(body).map_err(|e| CollectError::Parse(format!("histogram: {e}")))?;

        // Every field has a default, so only an object counts as a histogram document
        if !value.is_object() {
            return Err(CollectError::Parse(
                "histogram: document is not a JSON object".to_string(),
            ));
        }

        let document: HistogramDocument = serde_json::from_value(value)
            .map_err(|e| CollectError::Parse(format!("histogram: {e}")))?;

        if let Some(captured_at) = document.captured_at() {
            debug!(instance = %self.name, "Histogram captured at {}", captured_at);
        }

        Ok(self.registry.update_histograms(&self.name, &document))
    }

    fn apply_performance(&self, body: &str) -> Result<usize, CollectError> {
        let document: serde_json::Value = serde_json::from_str(body)
            .map_err(|e| CollectError::Parse(format!("cyclic-backup: {e}")))?;

        self.registry
            .update_performance(&self.name, &document)
            .map_err(|e| CollectError::Parse(format!("cyclic-backup: {e}")))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("panic: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("panic: {msg}")
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Shared handle to one collector, doubling as its overlap guard
///
/// A tick starts a cycle only if the collector lock is free; the lock is
/// held by the spawned cycle until it completes.
#[derive(Clone)]
pub struct CollectorHandle {
    name: Arc<str>,
    inner: Arc<Mutex<InstanceCollector>>,
}

impl CollectorHandle {
    pub fn new(collector: InstanceCollector) -> Self {
        CollectorHandle {
            name: Arc::from(collector.name()),
            inner: Arc::new(Mutex::new(collector)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Starts a cycle unless the previous one is still in flight
    ///
    /// # Returns
    /// * `Some(JoinHandle)` - A cycle was spawned
    /// * `None` - The tick was skipped; no state was touched
    pub fn tick(&self) -> Option<JoinHandle<Result<CycleReport, CollectError>>> {
        // Held by the spawned cycle until it completes
        let mut guard = Arc::clone(&self.inner).try_lock_owned().ok()?;
        Some(tokio::spawn(async move { guard.run_cycle().await }))
    }

    pub fn state(&self) -> CollectorState {
        match self.inner.try_lock() {
            Ok(collector) => collector.state(),
            Err(_) => CollectorState::Collecting,
        }
    }
}
