//! Saga coordinator.
//!
//! A saga is one logical operation spread over several external systems. It is made of
//! [`Step`]s, each pairing a forward [`Action`] with the compensation that undoes it.
//!
//! ## Execution
//!
//! 1. Every forward action starts at once in its own task. All tasks share one
//!    [`CancellationToken`], fired by the first failure or when the forward deadline
//!    passes. Actions that ignore the token run to completion and their result is
//!    still recorded.
//! 2. The coordinator waits for every task. Successes are logged in completion order.
//! 3. If nothing failed, the optional commit action runs (usually the store
//!    transaction). Its success makes the saga [`SagaState::Committed`].
//! 4. Otherwise the saga rolls back: compensations run one at a time in reverse
//!    completion order, each under its own timeout, whatever the others do.
//!
//! The whole saga runs in a spawned task, so dropping the caller's future (a client
//! disconnecting, say) cannot interrupt a rollback halfway.
//!
//! ```text
//! Pending ──> Running ──┬──> Committed
//!                       └──> RollingBack ──> RolledBack { partial }
//! ```

use async_trait::async_trait;
use futures::{FutureExt, future::BoxFuture};
use parking_lot::Mutex;
use std::{any::Any, collections::HashSet, fmt, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{
    adapters::{AdapterError, ExternalSystem},
    config::SagaConfig,
    errors::Error,
};

pub mod steps;

/// One side effect of a saga and the way to undo it.
#[async_trait]
pub trait Action: Send + Sync + 'static {
    /// Whatever the compensation needs to undo the forward action.
    type Output: Send + 'static;

    fn system(&self) -> ExternalSystem;

    async fn forward(&self, cancel: CancellationToken) -> Result<Self::Output, AdapterError>;

    async fn compensate(&self, output: Self::Output) -> Result<(), AdapterError>;
}

type Artifact = Box<dyn Any + Send>;

#[async_trait]
trait ErasedAction: Send + Sync {
    fn system(&self) -> ExternalSystem;

    async fn forward_erased(&self, cancel: CancellationToken) -> Result<Artifact, AdapterError>;

    async fn compensate_erased(&self, artifact: Artifact) -> Result<(), AdapterError>;
}

#[async_trait]
impl<A: Action> ErasedAction for A {
    fn system(&self) -> ExternalSystem {
        Action::system(self)
    }

    async fn forward_erased(&self, cancel: CancellationToken) -> Result<Artifact, AdapterError> {
        let output = Action::forward(self, cancel).await?;
        Ok(Box::new(output))
    }

    async fn compensate_erased(&self, artifact: Artifact) -> Result<(), AdapterError> {
        match artifact.downcast::<A::Output>() {
            Ok(output) => Action::compensate(self, *output).await,
            Err(_) => Err(AdapterError::Request {
                system: Action::system(self),
                message: "artifact does not belong to this step".to_string(),
            }),
        }
    }
}

/// A named action inside a saga.
#[derive(Clone)]
pub struct Step {
    name: String,
    action: Arc<dyn ErasedAction>,
}

impl Step {
    pub fn new(name: impl Into<String>, action: impl Action) -> Self {
        Self {
            name: name.into(),
            action: Arc::new(action),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn system(&self) -> ExternalSystem {
        self.action.system()
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("system", &self.system())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaState {
    Pending,
    Running,
    Committed,
    RollingBack,
    /// `partial` is set when at least one compensation failed
    RolledBack { partial: bool },
}

impl fmt::Display for SagaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SagaState::Pending => write!(f, "pending"),
            SagaState::Running => write!(f, "running"),
            SagaState::Committed => write!(f, "committed"),
            SagaState::RollingBack => write!(f, "rolling_back"),
            SagaState::RolledBack { partial: false } => write!(f, "rolled_back"),
            SagaState::RolledBack { partial: true } => write!(f, "partially_rolled_back"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub step: String,
    pub error: AdapterError,
}

/// What started a rollback.
#[derive(Debug)]
pub enum SagaTrigger {
    /// The first forward action to fail
    Step(StepFailure),
    /// The forward deadline passed with these steps still running
    DeadlineExceeded { pending: Vec<(String, ExternalSystem)> },
    /// Every step succeeded but the commit action failed
    Commit(Error),
}

impl fmt::Display for SagaTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SagaTrigger::Step(failure) => write!(f, "step {} failed: {}", failure.step, failure.error),
            SagaTrigger::DeadlineExceeded { pending } => {
                let names: Vec<&str> = pending.iter().map(|(name, _)| name.as_str()).collect();
                write!(f, "deadline exceeded waiting for {}", names.join(", "))
            }
            SagaTrigger::Commit(error) => write!(f, "commit failed: {error}"),
        }
    }
}

/// A saga that did not commit.
#[derive(Debug)]
pub struct SagaFailure {
    pub saga: &'static str,
    pub trigger: SagaTrigger,
    pub compensation_failures: Vec<StepFailure>,
    pub state: SagaState,
}

impl SagaFailure {
    pub fn is_partial(&self) -> bool {
        matches!(self.state, SagaState::RolledBack { partial: true })
    }
}

impl fmt::Display for SagaFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "saga {} {} after {}", self.saga, self.state, self.trigger)
    }
}

impl From<SagaFailure> for Error {
    fn from(failure: SagaFailure) -> Self {
        if failure.is_partial() {
            return Error::SagaPartialRollback {
                operation: failure.saga.to_string(),
                trigger: failure.trigger.to_string(),
                failures: failure
                    .compensation_failures
                    .iter()
                    .map(|f| format!("{}: {}", f.step, f.error))
                    .collect(),
            };
        }

        match failure.trigger {
            SagaTrigger::Step(step) => Error::ExternalService {
                service: step.error.system(),
                operation: failure.saga.to_string(),
                source: step.error,
            },
            SagaTrigger::DeadlineExceeded { pending } => {
                let system = pending
                    .first()
                    .map(|(_, system)| *system)
                    .unwrap_or(ExternalSystem::Provisioner);
                Error::ExternalService {
                    service: system,
                    operation: failure.saga.to_string(),
                    source: AdapterError::Timeout { system },
                }
            }
            SagaTrigger::Commit(error) => error,
        }
    }
}

/// Forward results of a committed saga, in completion order.
pub struct SagaOutput {
    completed: Vec<Completed>,
}

impl SagaOutput {
    /// The artifact produced by the step called `name`.
    pub fn get<T: 'static>(&self, name: &str) -> Option<&T> {
        self.completed
            .iter()
            .find(|c| c.name == name)
            .and_then(|c| c.artifact.downcast_ref::<T>())
    }

    /// Step names in the order they completed.
    pub fn completion_order(&self) -> Vec<&str> {
        self.completed.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }
}

impl fmt::Debug for SagaOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaOutput")
            .field("completed", &self.completion_order())
            .finish()
    }
}

struct Completed {
    index: usize,
    name: String,
    artifact: Artifact,
}

#[derive(Default)]
struct SagaLog {
    completed: Vec<Completed>,
    finished: HashSet<usize>,
    trigger: Option<SagaTrigger>,
}

type CommitFn = Box<dyn FnOnce(&SagaOutput) -> BoxFuture<'static, crate::errors::Result<()>> + Send>;

/// Builds sagas with the configured deadlines.
#[derive(Debug, Clone, Copy)]
pub struct SagaCoordinator {
    forward_timeout: Duration,
    compensation_timeout: Duration,
}

impl SagaCoordinator {
    pub fn new(config: &SagaConfig) -> Self {
        Self {
            forward_timeout: config.forward_timeout,
            compensation_timeout: config.compensation_timeout,
        }
    }

    pub fn saga(&self, name: &'static str) -> Saga {
        Saga {
            name,
            steps: Vec::new(),
            commit: None,
            forward_timeout: self.forward_timeout,
            compensation_timeout: self.compensation_timeout,
        }
    }
}

impl Default for SagaCoordinator {
    fn default() -> Self {
        Self::new(&SagaConfig::default())
    }
}

#[must_use = "a saga does nothing until run"]
pub struct Saga {
    name: &'static str,
    steps: Vec<Step>,
    commit: Option<CommitFn>,
    forward_timeout: Duration,
    compensation_timeout: Duration,
}

impl Saga {
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.steps.extend(steps);
        self
    }

    /// Action that makes a successful forward phase durable. Its failure rolls the saga back.
    pub fn commit<F>(mut self, commit: F) -> Self
    where
        F: FnOnce(&SagaOutput) -> BoxFuture<'static, crate::errors::Result<()>> + Send + 'static,
    {
        self.commit = Some(Box::new(commit));
        self
    }

    pub async fn run(self) -> Result<SagaOutput, SagaFailure> {
        let name = self.name;
        match tokio::spawn(self.execute()).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(saga = name, error = %e, "Saga task aborted, external state unknown");
                metrics::counter!("resctl_saga_outcomes_total", "saga" => name, "outcome" => "aborted").increment(1);
                Err(SagaFailure {
                    saga: name,
                    trigger: SagaTrigger::Commit(Error::Other(anyhow::anyhow!("saga task aborted: {e}"))),
                    compensation_failures: Vec::new(),
                    state: SagaState::RolledBack { partial: true },
                })
            }
        }
    }

    async fn execute(self) -> Result<SagaOutput, SagaFailure> {
        let Saga {
            name,
            steps,
            commit,
            forward_timeout,
            compensation_timeout,
        } = self;
        let mut state = SagaState::Pending;
        let steps: Arc<[Step]> = steps.into();
        let log = Arc::new(Mutex::new(SagaLog::default()));
        let cancel = CancellationToken::new();

        transition(name, &mut state, SagaState::Running);
        let mut tasks = JoinSet::new();
        for (index, step) in steps.iter().enumerate() {
            tasks.spawn(run_forward(name, index, step.clone(), log.clone(), cancel.clone()));
        }

        let deadline = tokio::time::sleep(forward_timeout);
        tokio::pin!(deadline);
        let mut deadline_passed = false;
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(())) => {}
                    Some(Err(e)) => tracing::error!(saga = name, error = %e, "Saga step task did not finish"),
                },
                _ = &mut deadline, if !deadline_passed => {
                    deadline_passed = true;
                    record_deadline(name, &log, &steps);
                    cancel.cancel();
                }
            }
        }

        let SagaLog { completed, trigger, .. } = std::mem::take(&mut *log.lock());
        let (completed, trigger) = match trigger {
            Some(trigger) => (completed, trigger),
            None => {
                let output = SagaOutput { completed };
                let committed = match commit {
                    Some(commit) => commit(&output).await,
                    None => Ok(()),
                };
                match committed {
                    Ok(()) => {
                        transition(name, &mut state, SagaState::Committed);
                        metrics::counter!("resctl_saga_outcomes_total", "saga" => name, "outcome" => "committed")
                            .increment(1);
                        return Ok(output);
                    }
                    Err(e) => {
                        tracing::warn!(saga = name, error = %e, "Saga commit failed");
                        (output.completed, SagaTrigger::Commit(e))
                    }
                }
            }
        };

        transition(name, &mut state, SagaState::RollingBack);
        tracing::info!(saga = name, trigger = %trigger, compensations = completed.len(), "Rolling back saga");

        let mut compensation_failures = Vec::new();
        for completed in completed.into_iter().rev() {
            let step = &steps[completed.index];
            if let Err(error) = compensate(step, completed.artifact, compensation_timeout).await {
                tracing::error!(saga = name, step = %step.name, error = %error, "Compensation failed");
                compensation_failures.push(StepFailure {
                    step: step.name.clone(),
                    error,
                });
            } else {
                tracing::debug!(saga = name, step = %step.name, "Compensated");
            }
        }

        let partial = !compensation_failures.is_empty();
        transition(name, &mut state, SagaState::RolledBack { partial });
        let outcome = if partial {
            tracing::error!(
                saga = name,
                failures = compensation_failures.len(),
                "Saga rollback incomplete, external resources may be orphaned"
            );
            "partially_rolled_back"
        } else {
            "rolled_back"
        };
        metrics::counter!("resctl_saga_outcomes_total", "saga" => name, "outcome" => outcome).increment(1);

        Err(SagaFailure {
            saga: name,
            trigger,
            compensation_failures,
            state,
        })
    }
}

fn transition(saga: &'static str, state: &mut SagaState, next: SagaState) {
    tracing::debug!(saga, from = %state, to = %next, "Saga transition");
    *state = next;
}

async fn run_forward(
    saga: &'static str,
    index: usize,
    step: Step,
    log: Arc<Mutex<SagaLog>>,
    cancel: CancellationToken,
) {
    let result = AssertUnwindSafe(step.action.forward_erased(cancel.clone()))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            Err(AdapterError::Request {
                system: step.system(),
                message: "step panicked".to_string(),
            })
        });
    record_outcome(saga, index, &step, result, &log, &cancel);
}

fn record_outcome(
    saga: &'static str,
    index: usize,
    step: &Step,
    result: Result<Artifact, AdapterError>,
    log: &Mutex<SagaLog>,
    cancel: &CancellationToken,
) {
    let mut log = log.lock();
    log.finished.insert(index);
    match result {
        Ok(artifact) => {
            if cancel.is_cancelled() {
                tracing::warn!(saga, step = %step.name, "Step succeeded after cancellation, will be compensated");
            } else {
                tracing::debug!(saga, step = %step.name, "Step succeeded");
            }
            log.completed.push(Completed {
                index,
                name: step.name.clone(),
                artifact,
            });
        }
        Err(error) => {
            if log.trigger.is_none() {
                tracing::warn!(saga, step = %step.name, error = %error, "Step failed, cancelling saga");
                log.trigger = Some(SagaTrigger::Step(StepFailure {
                    step: step.name.clone(),
                    error,
                }));
                cancel.cancel();
            } else {
                tracing::debug!(saga, step = %step.name, error = %error, "Step failed after saga was cancelled");
            }
        }
    }
}

fn record_deadline(saga: &'static str, log: &Mutex<SagaLog>, steps: &[Step]) {
    let mut log = log.lock();
    if log.trigger.is_some() {
        return;
    }
    let pending: Vec<(String, ExternalSystem)> = steps
        .iter()
        .enumerate()
        .filter(|(index, _)| !log.finished.contains(index))
        .map(|(_, step)| (step.name.clone(), step.system()))
        .collect();
    tracing::warn!(saga, pending = pending.len(), "Saga deadline exceeded, cancelling");
    log.trigger = Some(SagaTrigger::DeadlineExceeded { pending });
}

async fn compensate(step: &Step, artifact: Artifact, timeout: Duration) -> Result<(), AdapterError> {
    let system = step.system();
    let attempt = AssertUnwindSafe(step.action.compensate_erased(artifact)).catch_unwind();
    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(AdapterError::Request {
            system,
            message: "compensation panicked".to_string(),
        }),
        Err(_) => Err(AdapterError::Timeout { system }),
    }
}
