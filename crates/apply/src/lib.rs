//! Cluster apply: drives a change set through the per-change state machine
//! (Pending, Applying, Waiting, Done/Failed) with dependency ordering,
//! bounded parallelism, retry-on-conflict and cooperative cancellation.
//!
//! A single coordinator owns all mutable scheduling state; workers perform
//! cluster I/O and report transitions over a completion channel.

#![forbid(unsafe_code)]

pub mod wait;

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{info, warn};

use berth_cluster::{ClusterClient, ClusterError, DeletePropagation, UpdateStrategy};
use berth_core::ResourceId;
use berth_diff::{Change, ChangeFactory, ChangeOp, DiffError, ResourceWithHistory};
use berth_graph::ChangeGraph;
use wait::Readiness;

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("failed to update due to resource conflict (approved diff no longer matches): {0}")]
    ResourceConflict(String),
    #[error("timed out waiting for {0}")]
    WaitTimeout(String),
    #[error("{resource}: terminal state while waiting: {reason}")]
    WaitPermanentFailure { resource: String, reason: String },
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Diff(#[from] DiffError),
    #[error("internal: {0}")]
    Internal(String),
    #[error("{} change(s) failed: {}", failures.len(), failures.iter().map(|(res, err)| format!("{}: {}", res, err)).collect::<Vec<_>>().join("; "))]
    Composite { failures: Vec<(String, String)>, summary: ApplySummary },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangePhase {
    Pending,
    Applying,
    Waiting,
    Done,
    Failed,
    Skipped,
}

/// A change plus its execution state, owned by the coordinator.
#[derive(Debug)]
pub struct ClusterChange {
    pub change: Change,
    pub phase: ChangePhase,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub wait_started_at: Option<Instant>,
}

impl ClusterChange {
    fn new(change: Change) -> ClusterChange {
        ClusterChange {
            change,
            phase: ChangePhase::Pending,
            attempts: 0,
            last_error: None,
            wait_started_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApplyOpts {
    /// Concurrently applied changes.
    pub parallelism: usize,
    /// Conflict retries per change before giving up.
    pub conflict_retries: u32,
    pub backoff_base: Duration,
    pub wait_timeout: Duration,
    pub global_timeout: Duration,
    pub wait_poll: Duration,
    /// Stop dispatching new work after this many failures; 0 means keep
    /// driving independent branches until none remain.
    pub failure_threshold: usize,
    pub update_strategy: UpdateStrategy,
    pub delete_propagation: DeletePropagation,
}

impl Default for ApplyOpts {
    fn default() -> Self {
        ApplyOpts {
            parallelism: 4,
            conflict_retries: 5,
            backoff_base: Duration::from_millis(250),
            wait_timeout: Duration::from_secs(600),
            global_timeout: Duration::from_secs(900),
            wait_poll: Duration::from_secs(1),
            failure_threshold: 0,
            update_strategy: UpdateStrategy::JsonMergePatch,
            delete_propagation: DeletePropagation::Foreground,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub noop: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl std::fmt::Display for ApplySummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "created={} updated={} deleted={} noop={} failed={}",
            self.created, self.updated, self.deleted, self.noop, self.failed
        )
    }
}

struct Job {
    idx: usize,
    change: Change,
    /// Digest of the ops diff the user approved; retries must reproduce it.
    approved_digest: String,
}

enum WorkerMsg {
    Transition { idx: usize, phase: ChangePhase },
    Finished { idx: usize, result: Result<(), ApplyError> },
}

/// The apply driver for one computed change set.
pub struct ClusterChangeSet {
    states: Vec<ClusterChange>,
    graph: ChangeGraph,
    client: Arc<dyn ClusterClient>,
    factory: Arc<ChangeFactory>,
    opts: ApplyOpts,
}

impl ClusterChangeSet {
    pub fn new(
        changes: Vec<Change>,
        graph: ChangeGraph,
        client: Arc<dyn ClusterClient>,
        factory: Arc<ChangeFactory>,
        opts: ApplyOpts,
    ) -> ClusterChangeSet {
        let states = changes.into_iter().map(ClusterChange::new).collect();
        ClusterChangeSet { states, graph, client, factory, opts }
    }

    pub fn states(&self) -> &[ClusterChange] {
        &self.states
    }

    fn summary(&self) -> ApplySummary {
        let mut s = ApplySummary::default();
        for st in &self.states {
            match st.phase {
                ChangePhase::Done => match st.change.op() {
                    ChangeOp::Create => s.created += 1,
                    ChangeOp::Update => s.updated += 1,
                    ChangeOp::Delete => s.deleted += 1,
                    ChangeOp::Noop | ChangeOp::Exists => s.noop += 1,
                },
                ChangePhase::Failed => s.failed += 1,
                _ => s.skipped += 1,
            }
        }
        s
    }

    /// Runs every change to a terminal phase. A successor never starts
    /// Applying before all its predecessors are Done; failed predecessors
    /// leave their downstream changes Skipped.
    pub async fn apply(
        mut self,
        mut ext_cancel: watch::Receiver<bool>,
    ) -> Result<ApplySummary, ApplyError> {
        let n = self.states.len();
        if n == 0 {
            return Ok(ApplySummary::default());
        }
        if *ext_cancel.borrow() {
            return Err(ApplyError::Cancelled);
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let parallelism = self.opts.parallelism.max(1);
        let (job_tx, job_rx) = mpsc::channel::<Job>(parallelism);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (msg_tx, mut msg_rx) = mpsc::channel::<WorkerMsg>(n * 16 + 16);

        let mut handles = Vec::with_capacity(parallelism);
        for _ in 0..parallelism {
            handles.push(tokio::spawn(worker(
                job_rx.clone(),
                msg_tx.clone(),
                self.client.clone(),
                self.factory.clone(),
                self.opts.clone(),
                cancel_rx.clone(),
            )));
        }
        drop(msg_tx);

        let mut remaining_preds: Vec<usize> =
            (0..n).map(|i| self.graph.predecessors(i).len()).collect();
        let mut in_flight = 0usize;
        let mut failures: Vec<(String, String)> = Vec::new();
        let mut cancelled = false;
        let mut timed_out = false;
        let mut stop_dispatch = false;
        let mut ext_open = true;

        for idx in 0..n {
            if remaining_preds[idx] == 0 {
                let job = Job {
                    idx,
                    change: self.states[idx].change.clone(),
                    approved_digest: self.states[idx].change.ops_diff().minimal_md5(),
                };
                if job_tx.send(job).await.is_ok() {
                    in_flight += 1;
                }
            }
        }

        let deadline = Instant::now() + self.opts.global_timeout;

        while in_flight > 0 {
            tokio::select! {
                maybe = msg_rx.recv() => {
                    let Some(msg) = maybe else { break };
                    match msg {
                        WorkerMsg::Transition { idx, phase } => {
                            let st = &mut self.states[idx];
                            if phase == ChangePhase::Applying {
                                st.attempts += 1;
                            }
                            if phase == ChangePhase::Waiting && st.wait_started_at.is_none() {
                                st.wait_started_at = Some(Instant::now());
                            }
                            st.phase = phase;
                            info!(change = %st.change.description(), phase = ?phase, attempts = st.attempts, "apply progress");
                        }
                        WorkerMsg::Finished { idx, result } => {
                            in_flight -= 1;
                            match result {
                                Ok(()) => {
                                    counter!("apply_ok", 1u64);
                                    self.states[idx].phase = ChangePhase::Done;
                                    info!(change = %self.states[idx].change.description(), "done");
                                    for s in self.graph.successors(idx) {
                                        remaining_preds[s] = remaining_preds[s].saturating_sub(1);
                                        let dispatchable = remaining_preds[s] == 0
                                            && self.states[s].phase == ChangePhase::Pending
                                            && !cancelled
                                            && !stop_dispatch;
                                        if dispatchable {
                                            let job = Job {
                                                idx: s,
                                                change: self.states[s].change.clone(),
                                                approved_digest: self.states[s].change.ops_diff().minimal_md5(),
                                            };
                                            if job_tx.send(job).await.is_ok() {
                                                in_flight += 1;
                                            }
                                        }
                                    }
                                }
                                Err(err) => {
                                    counter!("apply_err", 1u64);
                                    let desc = self.states[idx].change.description();
                                    warn!(change = %desc, error = %err, "change failed");
                                    self.states[idx].last_error = Some(err.to_string());
                                    self.states[idx].phase = ChangePhase::Failed;
                                    failures.push((desc, err.to_string()));
                                    for s in self.graph.transitive_successors(idx) {
                                        if self.states[s].phase == ChangePhase::Pending {
                                            self.states[s].phase = ChangePhase::Skipped;
                                        }
                                    }
                                    if self.opts.failure_threshold > 0
                                        && failures.len() >= self.opts.failure_threshold
                                    {
                                        stop_dispatch = true;
                                    }
                                }
                            }
                        }
                    }
                }
                res = ext_cancel.changed(), if ext_open && !cancelled => {
                    match res {
                        Ok(()) if *ext_cancel.borrow() => {
                            warn!("cancel requested; letting in-flight changes settle");
                            cancelled = true;
                            let _ = cancel_tx.send(true);
                        }
                        Ok(()) => {}
                        Err(_) => ext_open = false,
                    }
                }
                _ = tokio::time::sleep_until(deadline), if !cancelled && !timed_out => {
                    counter!("wait_timeouts", 1u64);
                    warn!("global apply deadline reached");
                    timed_out = true;
                    let _ = cancel_tx.send(true);
                }
            }
        }

        drop(job_tx);
        for h in handles {
            let _ = h.await;
        }
        for st in &mut self.states {
            if st.phase == ChangePhase::Pending {
                st.phase = ChangePhase::Skipped;
            }
        }

        let summary = self.summary();
        if timed_out {
            return Err(ApplyError::WaitTimeout("global apply deadline".to_string()));
        }
        if cancelled {
            return Err(ApplyError::Cancelled);
        }
        if !failures.is_empty() {
            return Err(ApplyError::Composite { failures, summary });
        }
        info!(%summary, "apply finished");
        Ok(summary)
    }
}

async fn worker(
    job_rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    msg_tx: mpsc::Sender<WorkerMsg>,
    client: Arc<dyn ClusterClient>,
    factory: Arc<ChangeFactory>,
    opts: ApplyOpts,
    cancel: watch::Receiver<bool>,
) {
    loop {
        let job = { job_rx.lock().await.recv().await };
        let Some(job) = job else { break };
        let idx = job.idx;
        let result = execute_change(job, &client, &factory, &opts, &cancel, &msg_tx).await;
        if msg_tx.send(WorkerMsg::Finished { idx, result }).await.is_err() {
            break;
        }
    }
}

async fn transition(msg_tx: &mpsc::Sender<WorkerMsg>, idx: usize, phase: ChangePhase) {
    let _ = msg_tx.send(WorkerMsg::Transition { idx, phase }).await;
}

async fn execute_change(
    job: Job,
    client: &Arc<dyn ClusterClient>,
    factory: &ChangeFactory,
    opts: &ApplyOpts,
    cancel: &watch::Receiver<bool>,
    msg_tx: &mpsc::Sender<WorkerMsg>,
) -> Result<(), ApplyError> {
    // Noop: zero cluster calls by contract.
    if job.change.op() == ChangeOp::Noop {
        return Ok(());
    }
    if *cancel.borrow() {
        return Err(ApplyError::Cancelled);
    }
    let t0 = std::time::Instant::now();
    counter!("apply_attempts", 1u64);
    let idx = job.idx;
    let id = job.change.resource().id();
    transition(msg_tx, idx, ChangePhase::Applying).await;

    match job.change.op() {
        ChangeOp::Noop => unreachable!(),
        ChangeOp::Exists => {
            transition(msg_tx, idx, ChangePhase::Waiting).await;
            wait_until(client, &id, opts, cancel, WaitKind::Present).await?;
        }
        ChangeOp::Create => {
            let applied = job
                .change
                .applied_resource()
                .cloned()
                .ok_or_else(|| ApplyError::Internal("create without applied resource".into()))?;
            let payload =
                ResourceWithHistory::new(&applied, factory).record_last_applied(&applied)?;
            client.create(&payload).await?;
            transition(msg_tx, idx, ChangePhase::Waiting).await;
            wait_until(client, &id, opts, cancel, WaitKind::Ready).await?;
        }
        ChangeOp::Delete => {
            match client.delete(&id, opts.delete_propagation).await {
                Ok(()) => {}
                // Someone else got there first; that's the desired state.
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
            transition(msg_tx, idx, ChangePhase::Waiting).await;
            wait_until(client, &id, opts, cancel, WaitKind::Gone).await?;
        }
        ChangeOp::Update => {
            update_with_retry(&job, client, factory, opts, cancel, msg_tx).await?;
            transition(msg_tx, idx, ChangePhase::Waiting).await;
            wait_until(client, &id, opts, cancel, WaitKind::Ready).await?;
        }
    }
    histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    Ok(())
}

/// One cluster mutation with transparent conflict retry. A conflict means the
/// live resourceVersion moved; the change is recomputed against the fresh
/// resource and retried only if the recomputed diff digest still equals the
/// one the user approved. The user's "yes" authorizes a specific delta, not
/// an arbitrary one.
async fn update_with_retry(
    job: &Job,
    client: &Arc<dyn ClusterClient>,
    factory: &ChangeFactory,
    opts: &ApplyOpts,
    cancel: &watch::Receiver<bool>,
    msg_tx: &mpsc::Sender<WorkerMsg>,
) -> Result<(), ApplyError> {
    let desired = job
        .change
        .new_resource()
        .cloned()
        .ok_or_else(|| ApplyError::Internal("update without desired resource".into()))?;
    let mut current = job.change.clone();
    let mut attempts: u32 = 0;
    loop {
        if *cancel.borrow() {
            return Err(ApplyError::Cancelled);
        }
        let applied = current
            .applied_resource()
            .cloned()
            .ok_or_else(|| ApplyError::Internal("update without applied resource".into()))?;
        let mut payload = ResourceWithHistory::new(&applied, factory).record_last_applied(&applied)?;
        // The live resourceVersion rides along so the cluster can detect a
        // concurrent writer; a stale one comes back as Conflict.
        if let Some(rv) = current.existing().and_then(|e| e.resource_version()) {
            payload
                .set(
                    &berth_core::Path::from_keys(&["metadata", "resourceVersion"]),
                    serde_json::Value::String(rv.to_string()),
                )
                .map_err(DiffError::Core)?;
        }
        match client.update(&payload, opts.update_strategy).await {
            Ok(_) => return Ok(()),
            Err(err) if err.is_conflict() => {
                attempts += 1;
                counter!("apply_conflict_retries", 1u64);
                if attempts > opts.conflict_retries {
                    return Err(err.into());
                }
                let fresh = client.get(&job.change.resource().id()).await?;
                let recomputed = factory.new_change(Some(&fresh), Some(&desired))?;
                if recomputed.ops_diff().minimal_md5() != job.approved_digest {
                    return Err(ApplyError::ResourceConflict(err.to_string()));
                }
                current = recomputed;
                transition(msg_tx, job.idx, ChangePhase::Applying).await;
                backoff_sleep(attempts, opts, cancel).await?;
            }
            Err(other) => return Err(other.into()),
        }
    }
}

enum WaitKind {
    Ready,
    Gone,
    Present,
}

async fn wait_until(
    client: &Arc<dyn ClusterClient>,
    id: &ResourceId,
    opts: &ApplyOpts,
    cancel: &watch::Receiver<bool>,
    kind: WaitKind,
) -> Result<(), ApplyError> {
    let deadline = Instant::now() + opts.wait_timeout;
    loop {
        if *cancel.borrow() {
            return Err(ApplyError::Cancelled);
        }
        match (&kind, client.get(id).await) {
            (WaitKind::Gone, Err(e)) if e.is_not_found() => return Ok(()),
            (WaitKind::Gone, Ok(_)) => {}
            (WaitKind::Gone, Err(e)) => return Err(e.into()),
            (WaitKind::Present, Ok(_)) => return Ok(()),
            (WaitKind::Present, Err(e)) if e.is_not_found() => {}
            (WaitKind::Present, Err(e)) => return Err(e.into()),
            (WaitKind::Ready, Ok(res)) => match wait::check(&res) {
                Readiness::Ready => return Ok(()),
                Readiness::Terminal(reason) => {
                    return Err(ApplyError::WaitPermanentFailure {
                        resource: id.to_string(),
                        reason,
                    })
                }
                Readiness::NotReady(_) => {}
            },
            // A read raced the write; keep polling.
            (WaitKind::Ready, Err(e)) if e.is_not_found() => {}
            (WaitKind::Ready, Err(e)) => return Err(e.into()),
        }
        if Instant::now() >= deadline {
            counter!("wait_timeouts", 1u64);
            return Err(ApplyError::WaitTimeout(id.to_string()));
        }
        sleep_or_cancel(opts.wait_poll, cancel).await?;
    }
}

async fn backoff_sleep(
    attempt: u32,
    opts: &ApplyOpts,
    cancel: &watch::Receiver<bool>,
) -> Result<(), ApplyError> {
    use rand::Rng;
    let exp = opts.backoff_base.saturating_mul(1 << attempt.min(6).saturating_sub(1));
    let jitter_cap = (opts.backoff_base.as_millis() as u64 / 2).max(1);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap));
    sleep_or_cancel(exp + jitter, cancel).await
}

async fn sleep_or_cancel(d: Duration, cancel: &watch::Receiver<bool>) -> Result<(), ApplyError> {
    let mut cancel = cancel.clone();
    let sleep = tokio::time::sleep(d);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = sleep.as_mut() => return Ok(()),
            res = cancel.changed() => {
                if *cancel.borrow() {
                    return Err(ApplyError::Cancelled);
                }
                if res.is_err() {
                    sleep.as_mut().await;
                    return Ok(());
                }
            }
        }
    }
}
