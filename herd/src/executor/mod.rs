//! Procedure executor: a FIFO queue drained by a worker pool. Every
//! mutation of the model is a procedure; its steps run strictly in order,
//! each inside one state-store transaction, under the procedure's locks.

pub mod lock;
pub mod procedure;

pub use procedure::{
    step, ProcedureState, ProcedureStatus, Step, StepCtx, StepRecord, StepResult, StepState,
};

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::store::Catalog;
use lock::LockTable;
use procedure::{PendingSteps, ProcedureHandle};

struct Queued {
    id: Uuid,
    locks: BTreeSet<String>,
    steps: PendingSteps,
}

#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

struct Inner {
    catalog: Arc<dyn Catalog>,
    locks: LockTable,
    queue: mpsc::UnboundedSender<Queued>,
    registry: DashMap<Uuid, Arc<ProcedureHandle>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    heartbeat: Duration,
}

impl Executor {
    /// Bring up the executor with `workers` worker tasks.
    pub fn new(catalog: Arc<dyn Catalog>, workers: usize, heartbeat: Duration) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            catalog,
            locks: LockTable::new(),
            queue: queue_tx,
            registry: DashMap::new(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            heartbeat,
        });

        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
        for worker in 0..workers.max(1) {
            let inner = inner.clone();
            let queue_rx = queue_rx.clone();
            inner.tracker.clone().spawn(async move {
                worker_loop(inner, queue_rx, worker).await;
            });
        }

        Self { inner }
    }

    /// Enqueue a procedure: an entry step plus the lock names it needs.
    /// Returns the procedure id immediately.
    pub fn trigger(
        &self,
        name: &str,
        locks: impl IntoIterator<Item = String>,
        entry: Step,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let handle = ProcedureHandle::new(id, name);
        self.inner.registry.insert(id, handle.clone());

        let mut steps = VecDeque::new();
        steps.push_back(entry);

        let queued = Queued {
            id,
            locks: locks.into_iter().collect(),
            steps: Arc::new(Mutex::new(steps)),
        };

        debug!("procedure {} ({}) queued", name, id);

        if self.inner.queue.send(queued).is_err() {
            // Executor is shutting down; nothing will run this.
            handle.set_state(ProcedureState::Cancelled);
        }

        id
    }

    /// Snapshot of a procedure's records and state.
    pub fn status(&self, id: &Uuid) -> Option<ProcedureStatus> {
        self.inner.registry.get(id).map(|h| h.snapshot())
    }

    /// Block until the procedure reaches a terminal state.
    pub async fn wait(&self, id: &Uuid) -> Option<ProcedureStatus> {
        let handle = self.inner.registry.get(id)?.clone();
        let mut rx = handle.state_rx.clone();

        while !rx.borrow().terminal() {
            if rx.changed().await.is_err() {
                break;
            }
        }

        Some(handle.snapshot())
    }

    /// Wait for many procedures, or return their ids immediately.
    pub async fn wait_for_procedures(
        &self,
        ids: &[Uuid],
        synchronous: bool,
    ) -> Vec<ProcedureStatus> {
        if !synchronous {
            return ids.iter().filter_map(|id| self.status(id)).collect();
        }

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(status) = self.wait(id).await {
                out.push(status);
            }
        }
        out
    }

    /// Stop dequeuing, finish in-flight steps, cancel the rest.
    pub async fn shutdown(&self) {
        info!("executor draining");
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

async fn worker_loop(
    inner: Arc<Inner>,
    queue: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Queued>>>,
    worker: usize,
) {
    debug!("executor worker {} running", worker);

    loop {
        let queued = {
            let mut rx = queue.lock().await;
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                queued = rx.recv() => match queued {
                    Some(queued) => queued,
                    None => break,
                },
            }
        };

        run_procedure(&inner, queued).await;
    }

    debug!("executor worker {} shut down", worker);
}

async fn run_procedure(inner: &Arc<Inner>, queued: Queued) {
    let handle = match inner.registry.get(&queued.id) {
        Some(handle) => handle.clone(),
        None => return,
    };

    // Locks are taken in name order before the first step and held until
    // the procedure terminates.
    let held = tokio::select! {
        _ = inner.shutdown.cancelled() => {
            handle.set_state(ProcedureState::Cancelled);
            return;
        }
        held = inner.locks.acquire(&queued.locks) => held,
    };

    handle.set_state(ProcedureState::Running);

    loop {
        let next = queued.steps.lock().pop_front();
        let step = match next {
            Some(step) => step,
            None => {
                handle.set_state(ProcedureState::Done { success: true });
                break;
            }
        };

        // Shutdown is only honored between steps.
        if inner.shutdown.is_cancelled() {
            handle.record(StepRecord {
                step: step.name.to_owned(),
                success: false,
                state: StepState::Cancelled,
                diagnosis: Some(Error::Cancelled.to_string()),
                report: None,
                finished_at: Utc::now(),
            });
            handle.set_state(ProcedureState::Cancelled);
            break;
        }

        match run_step(inner, &handle, &queued, step).await {
            Ok(()) => {}
            Err(()) => {
                handle.set_state(ProcedureState::Done { success: false });
                break;
            }
        }
    }

    drop(held);
}

/// Run one step inside one catalog transaction. Err(()) means the
/// procedure is over.
async fn run_step(
    inner: &Arc<Inner>,
    handle: &Arc<ProcedureHandle>,
    queued: &Queued,
    step: Step,
) -> Result<(), ()> {
    let step_name = step.name;

    let txn: procedure::SharedTxn = Arc::new(tokio::sync::Mutex::new(None));
    let report = Arc::new(Mutex::new(None));
    let ctx = StepCtx {
        catalog: inner.catalog.clone(),
        txn: txn.clone(),
        pending: queued.steps.clone(),
        report: report.clone(),
    };

    let mut fut = (step.run)(ctx);
    let started = tokio::time::Instant::now();
    let mut warned = false;

    // A step never yields the worker, but a long blocking wait while
    // holding locks is worth flagging.
    let result = loop {
        tokio::select! {
            result = &mut fut => break result,
            _ = tokio::time::sleep_until(started + inner.heartbeat), if !warned => {
                warned = true;
                handle.degraded.store(true, Ordering::SeqCst);
                warn!(
                    "procedure {} ({}) step {} held locks past {:?}; marked degraded",
                    handle.name, handle.id, step_name, inner.heartbeat
                );
            }
        }
    };

    let txn = txn.lock().await.take();
    let outcome = match (result, txn) {
        (Ok(()), Some(mut txn)) => match txn.commit().await {
            Ok(()) => Ok(()),
            Err(err) => Err(Error::Database(err)),
        },
        (Ok(()), None) => Ok(()),
        (Err(err), Some(mut txn)) => {
            if let Err(rollback) = txn.rollback().await {
                error!(
                    "rollback failed after step {} of {}: {}",
                    step_name, handle.name, rollback
                );
            }
            Err(err)
        }
        (Err(err), None) => Err(err),
    };

    match outcome {
        Ok(()) => {
            handle.record(StepRecord {
                step: step_name.to_owned(),
                success: true,
                state: StepState::Complete,
                diagnosis: None,
                report: report.lock().take(),
                finished_at: Utc::now(),
            });
            Ok(())
        }
        Err(err) => {
            warn!(
                "procedure {} ({}) failed at step {}: {}",
                handle.name, handle.id, step_name, err
            );
            handle.record(StepRecord {
                step: step_name.to_owned(),
                success: false,
                state: StepState::Complete,
                diagnosis: Some(format!("[{}] {}", err.kind(), err)),
                report: report.lock().take(),
                finished_at: Utc::now(),
            });
            Err(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::MemCatalog;
    use crate::topology::Group;

    fn executor(workers: usize) -> Executor {
        Executor::new(
            Arc::new(MemCatalog::new()),
            workers,
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_steps_run_in_order() {
        let executor = executor(4);
        let order = Arc::new(Mutex::new(vec![]));

        let first = order.clone();
        let id = executor.trigger(
            "test.order",
            vec!["g1".into()],
            step("one", move |ctx| async move {
                first.lock().push(1);
                let second = first.clone();
                ctx.enqueue(step("two", move |ctx| async move {
                    second.lock().push(2);
                    let third = second.clone();
                    ctx.enqueue(step("three", move |_ctx| async move {
                        third.lock().push(3);
                        Ok(())
                    }));
                    Ok(())
                }));
                Ok(())
            }),
        );

        let status = executor.wait(&id).await.unwrap();
        assert!(status.success());
        assert_eq!(*order.lock(), vec![1, 2, 3]);
        assert_eq!(status.records.len(), 3);
        assert!(status.records.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn test_failed_step_keeps_earlier_commits() {
        let catalog = Arc::new(MemCatalog::new());
        let executor = Executor::new(catalog.clone(), 2, Duration::from_secs(60));

        let id = executor.trigger(
            "test.partial",
            vec!["g1".into()],
            step("create", |ctx| async move {
                ctx.catalog()
                    .await?
                    .insert_group(&Group::new("committed", ""))
                    .await?;
                ctx.enqueue(step("fail", |ctx| async move {
                    ctx.catalog()
                        .await?
                        .insert_group(&Group::new("rolled-back", ""))
                        .await?;
                    Err(Error::group("boom"))
                }));
                ctx.enqueue(step("never", |_ctx| async move {
                    panic!("must not run after failure");
                }));
                Ok(())
            }),
        );

        let status = executor.wait(&id).await.unwrap();
        assert!(!status.success());
        assert_eq!(status.records.len(), 2);
        assert!(status.diagnosis().unwrap().contains("boom"));

        let mut txn = catalog.begin().await.unwrap();
        assert!(txn.group("committed").await.unwrap().is_some());
        assert!(txn.group("rolled-back").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conflicting_procedures_serialize() {
        let executor = executor(4);
        let running = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut ids = vec![];
        for _ in 0..4 {
            let running = running.clone();
            ids.push(executor.trigger(
                "test.conflict",
                vec!["g1".into()],
                step("hold", move |_ctx| async move {
                    assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }),
            ));
        }

        for id in ids {
            assert!(executor.wait(&id).await.unwrap().success());
        }
    }

    #[tokio::test]
    async fn test_disjoint_procedures_interleave() {
        let executor = executor(4);
        let peak = Arc::new(Mutex::new((0usize, 0usize)));

        let mut ids = vec![];
        for i in 0..4 {
            let peak = peak.clone();
            ids.push(executor.trigger(
                "test.disjoint",
                vec![format!("g{}", i)],
                step("hold", move |_ctx| async move {
                    {
                        let mut p = peak.lock();
                        p.0 += 1;
                        p.1 = p.1.max(p.0);
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    peak.lock().0 -= 1;
                    Ok(())
                }),
            ));
        }

        for id in ids {
            executor.wait(&id).await.unwrap();
        }
        assert!(peak.lock().1 > 1, "disjoint lock sets never overlapped");
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_steps() {
        let executor = executor(1);

        let id = executor.trigger(
            "test.shutdown",
            vec![],
            step("first", |ctx| async move {
                ctx.enqueue(step("second", |_ctx| async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                }));
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            }),
        );

        // Give the first step a chance to start, then shut down.
        tokio::time::sleep(Duration::from_millis(5)).await;
        executor.shutdown().await;

        let status = executor.status(&id).unwrap();
        assert_eq!(status.state, ProcedureState::Cancelled);
        let cancelled: Vec<_> = status
            .records
            .iter()
            .filter(|r| r.state == StepState::Cancelled)
            .collect();
        assert_eq!(cancelled.len(), 1);
    }

    #[tokio::test]
    async fn test_async_wait_returns_immediately() {
        let executor = executor(1);
        let id = executor.trigger(
            "test.async",
            vec![],
            step("slow", |_ctx| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            }),
        );

        let statuses = executor.wait_for_procedures(&[id], false).await;
        assert_eq!(statuses.len(), 1);
        assert!(!statuses[0].state.terminal() || statuses[0].success());

        let done = executor.wait_for_procedures(&[id], true).await;
        assert!(done[0].success());
    }
}
