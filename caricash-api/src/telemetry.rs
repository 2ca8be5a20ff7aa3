use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Context;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryCounters {
    pub journals_posted: usize,
    pub idempotent_replays: usize,
    pub idempotency_conflicts: usize,
    pub fraud_blocks: usize,
    pub fraud_reviews: usize,
    pub approvals_opened: usize,
    pub approvals_approved: usize,
    pub approvals_rejected: usize,
    pub reconciliation_runs: usize,
    pub reconciliation_findings: usize,
}

#[derive(Debug)]
struct TelemetryStore {
    path: PathBuf,
}

impl TelemetryStore {
    fn from_env() -> Option<Self> {
        let home = env::var_os("CARICASH_HOME")?;
        let mut path = PathBuf::from(home);
        path.push("telemetry.json");
        Some(Self { path })
    }

    fn read(&self) -> anyhow::Result<Option<TelemetryCounters>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = fs::read(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let counters = serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        Ok(Some(counters))
    }

    fn persist(&self, counters: &TelemetryCounters) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let data =
            serde_json::to_vec_pretty(counters).context("failed to encode telemetry counters")?;
        fs::write(&self.path, data)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TelemetryInner {
    counters: TelemetryCounters,
    store: Option<TelemetryStore>,
}

impl TelemetryInner {
    fn with_store(store: Option<TelemetryStore>) -> Self {
        match store {
            Some(store) => {
                let counters = match store.read() {
                    Ok(Some(existing)) => existing,
                    Ok(None) => TelemetryCounters::default(),
                    Err(err) => {
                        warn!(
                            path = %store.path.display(),
                            error = %err,
                            "failed to load persisted telemetry; continuing with defaults"
                        );
                        TelemetryCounters::default()
                    }
                };
                Self {
                    counters,
                    store: Some(store),
                }
            }
            None => Self::default(),
        }
    }

    fn persist(&self) {
        if let Some(store) = &self.store
            && let Err(err) = store.persist(&self.counters)
        {
            warn!(
                path = %store.path.display(),
                error = %err,
                "failed to persist telemetry counters"
            );
        }
    }
}

/// Operational counters for the wallet core. In-memory by default;
/// `CARICASH_HOME` switches on JSON persistence that survives restarts and
/// tolerates a corrupt file.
#[derive(Clone, Default)]
pub struct WalletTelemetry {
    inner: Arc<Mutex<TelemetryInner>>,
}

impl WalletTelemetry {
    #[must_use]
    pub fn new() -> Self {
        Self::from_store(None)
    }

    #[must_use]
    pub fn persistent_from_env() -> Self {
        Self::from_store(TelemetryStore::from_env())
    }

    #[must_use]
    pub fn with_store_path(path: PathBuf) -> Self {
        Self::from_store(Some(TelemetryStore { path }))
    }

    fn from_store(store: Option<TelemetryStore>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TelemetryInner::with_store(store))),
        }
    }

    fn update<F>(&self, mut updater: F)
    where
        F: FnMut(&mut TelemetryCounters),
    {
        if let Ok(mut inner) = self.inner.lock() {
            updater(&mut inner.counters);
            inner.persist();
        }
    }

    pub fn record_posted(&self) {
        self.update(|counters| counters.journals_posted += 1);
    }

    pub fn record_replay(&self) {
        self.update(|counters| counters.idempotent_replays += 1);
    }

    pub fn record_conflict(&self) {
        self.update(|counters| counters.idempotency_conflicts += 1);
    }

    pub fn record_fraud_block(&self) {
        self.update(|counters| counters.fraud_blocks += 1);
    }

    pub fn record_fraud_review(&self) {
        self.update(|counters| counters.fraud_reviews += 1);
    }

    pub fn record_approval_opened(&self) {
        self.update(|counters| counters.approvals_opened += 1);
    }

    pub fn record_approval_approved(&self) {
        self.update(|counters| counters.approvals_approved += 1);
    }

    pub fn record_approval_rejected(&self) {
        self.update(|counters| counters.approvals_rejected += 1);
    }

    pub fn record_reconciliation(&self, findings: usize) {
        self.update(|counters| {
            counters.reconciliation_runs += 1;
            counters.reconciliation_findings += findings;
        });
    }

    #[must_use]
    pub fn snapshot(&self) -> TelemetryCounters {
        self.inner
            .lock()
            .map(|inner| inner.counters.clone())
            .unwrap_or_default()
    }
}
