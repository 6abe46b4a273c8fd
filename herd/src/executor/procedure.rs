//! Procedures and their steps. A procedure is an ordered list of step
//! functions; a running step may append further steps, which the executor
//! runs in order, possibly on a different worker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::Error;
use crate::store::CatalogTxn;

pub type StepResult = Result<(), Error>;
type StepFn = Box<dyn FnOnce(StepCtx) -> BoxFuture<'static, StepResult> + Send + 'static>;

pub struct Step {
    pub name: &'static str,
    pub(super) run: StepFn,
}

/// Build a step from an async closure.
pub fn step<F, Fut>(name: &'static str, f: F) -> Step
where
    F: FnOnce(StepCtx) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = StepResult> + Send + 'static,
{
    Step {
        name,
        run: Box::new(move |ctx| Box::pin(f(ctx))),
    }
}

pub(super) type SharedTxn = Arc<tokio::sync::Mutex<Option<Box<dyn CatalogTxn>>>>;
pub(super) type PendingSteps = Arc<Mutex<VecDeque<Step>>>;

/// What a running step sees: its catalog transaction, the ability to
/// append follow-up steps, and a slot for a structured report.
pub struct StepCtx {
    pub(super) catalog: Arc<dyn crate::store::Catalog>,
    pub(super) txn: SharedTxn,
    pub(super) pending: PendingSteps,
    pub(super) report: Arc<Mutex<Option<serde_json::Value>>>,
}

impl StepCtx {
    /// The step's catalog transaction, opened on first use. Committed when
    /// the step returns Ok, rolled back when it returns Err.
    pub fn catalog(
        &self,
    ) -> BoxFuture<
        'static,
        Result<tokio::sync::OwnedMappedMutexGuard<Option<Box<dyn CatalogTxn>>, Box<dyn CatalogTxn>>, Error>,
    > {
        let txn = self.txn.clone();
        let catalog = self.catalog.clone();
        Box::pin(async move {
            let mut guard = txn.lock_owned().await;
            if guard.is_none() {
                *guard = Some(catalog.begin().await.map_err(Error::Database)?);
            }
            Ok(tokio::sync::OwnedMutexGuard::map(guard, |txn| {
                txn.as_mut().unwrap()
            }))
        })
    }

    /// Append a step to this procedure. It runs after every step already
    /// appended, in its own transaction.
    pub fn enqueue(&self, step: Step) {
        self.pending.lock().push_back(step);
    }

    /// Attach a structured result to this step's record. The procedure's
    /// result is the last report any step produced.
    pub fn report(&self, value: serde_json::Value) {
        *self.report.lock() = Some(value);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum StepState {
    Complete,
    Cancelled,
}

/// One executed (or cancelled) step.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StepRecord {
    pub step: String,
    pub success: bool,
    pub state: StepState,
    pub diagnosis: Option<String>,
    pub report: Option<serde_json::Value>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedureState {
    Queued,
    Running,
    Done { success: bool },
    Cancelled,
}

impl ProcedureState {
    pub fn terminal(&self) -> bool {
        matches!(self, ProcedureState::Done { .. } | ProcedureState::Cancelled)
    }
}

pub(super) struct ProcedureHandle {
    pub id: Uuid,
    pub name: String,
    pub records: Mutex<Vec<StepRecord>>,
    pub degraded: AtomicBool,
    pub state_tx: watch::Sender<ProcedureState>,
    pub state_rx: watch::Receiver<ProcedureState>,
}

impl ProcedureHandle {
    pub fn new(id: Uuid, name: &str) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(ProcedureState::Queued);
        Arc::new(Self {
            id,
            name: name.to_owned(),
            records: Mutex::new(vec![]),
            degraded: AtomicBool::new(false),
            state_tx,
            state_rx,
        })
    }

    pub fn set_state(&self, state: ProcedureState) {
        let _ = self.state_tx.send(state);
    }

    pub fn record(&self, record: StepRecord) {
        self.records.lock().push(record);
    }

    pub fn snapshot(&self) -> ProcedureStatus {
        ProcedureStatus {
            id: self.id,
            name: self.name.clone(),
            state: *self.state_rx.borrow(),
            degraded: self.degraded.load(Ordering::SeqCst),
            records: self.records.lock().clone(),
        }
    }
}

/// Caller-facing snapshot of a procedure.
#[derive(Debug, Clone)]
pub struct ProcedureStatus {
    pub id: Uuid,
    pub name: String,
    pub state: ProcedureState,
    pub degraded: bool,
    pub records: Vec<StepRecord>,
}

impl ProcedureStatus {
    /// The last record's success flag is the procedure outcome.
    pub fn success(&self) -> bool {
        matches!(self.state, ProcedureState::Done { success: true })
    }

    /// The last structured report any step attached.
    pub fn result(&self) -> Option<&serde_json::Value> {
        self.records.iter().rev().find_map(|r| r.report.as_ref())
    }

    /// Diagnosis of the failed step, if the procedure failed.
    pub fn diagnosis(&self) -> Option<&str> {
        self.records
            .iter()
            .rev()
            .find(|r| !r.success)
            .and_then(|r| r.diagnosis.as_deref())
    }
}
