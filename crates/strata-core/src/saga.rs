//! Saga coordination.
//!
//! A saga is an ordered list of steps spanning several aggregates. Each
//! step dispatches a command and then waits, with a timeout, for the event
//! confirming it. The event bus only shortens the wait: whether a step was
//! confirmed is decided by the event store. When a step fails, every step
//! whose command was accepted is compensated in reverse order. Saga progress
//! is persisted after every transition, so an interrupted saga can be
//! resumed and a failed one inspected.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::clock::Clock;
use crate::error::{DomainError, SagaError};
use crate::repository::{EventRepository, StoredEvent};

/// Lifecycle of a saga instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    /// Steps are being executed.
    Running,
    /// A step failed and completed steps are being compensated.
    Compensating,
    /// Every step succeeded.
    Completed,
    /// The saga was rolled back, or compensation failed.
    Failed,
}

impl SagaStatus {
    /// Returns the status's stable name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Compensating => "compensating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for SagaStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "compensating" => Ok(Self::Compensating),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(DomainError::Validation(format!(
                "unknown saga status `{other}`"
            ))),
        }
    }
}

/// Outcome of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not executed yet.
    Pending,
    /// Command accepted, confirmation not yet observed.
    Dispatched,
    /// Executed and confirmed.
    Succeeded,
    /// Command rejected.
    Failed,
    /// Undone by its compensation.
    Compensated,
    /// Its compensation failed.
    CompensationFailed,
}

/// Persisted record of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepLog {
    /// Step name.
    pub name: String,
    /// Step outcome so far.
    pub status: StepStatus,
    /// Error message of the step or its compensation.
    pub error: Option<String>,
}

/// Persisted state of a saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaInstance {
    /// Saga identifier, also the correlation ID of the commands it sends.
    pub saga_id: Uuid,
    /// Saga type name.
    pub saga_type: String,
    /// Lifecycle status.
    pub status: SagaStatus,
    /// Index of the step currently or last executed.
    pub current_step: usize,
    /// Per-step log in definition order.
    pub steps: Vec<StepLog>,
    /// Aggregates the saga touches.
    pub correlated_aggregate_ids: Vec<Uuid>,
    /// Why the saga failed, if it did.
    pub failure_reason: Option<String>,
    /// When the saga started.
    pub started_at: DateTime<Utc>,
    /// When the saga last changed.
    pub updated_at: DateTime<Utc>,
}

/// The event a step waits for after dispatching its command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwaitedEvent {
    /// Aggregate expected to record the event.
    pub aggregate_id: Uuid,
    /// Expected event type.
    pub event_type: String,
    /// Correlation ID the event must carry.
    pub correlation_id: Uuid,
}

impl AwaitedEvent {
    /// Returns `true` if `event` confirms the step.
    #[must_use]
    pub fn matches(&self, event: &StoredEvent) -> bool {
        event.aggregate_id == self.aggregate_id
            && event.event_type == self.event_type
            && event.correlation_id == self.correlation_id
    }
}

/// One step of a saga.
#[async_trait]
pub trait SagaStep: Send + Sync {
    /// Step name, recorded in the step log.
    fn name(&self) -> &'static str;

    /// Names the event confirming this step for saga `saga_id`.
    fn awaits(&self, saga_id: Uuid) -> AwaitedEvent;

    /// Dispatches the step's command.
    ///
    /// # Errors
    ///
    /// Returns a `DomainError` if the command is rejected.
    async fn execute(&self, saga_id: Uuid) -> Result<(), DomainError>;

    /// Undoes an accepted step. Steps with nothing to undo keep the default.
    /// May run more than once for the same saga when a saga is resumed.
    ///
    /// # Errors
    ///
    /// Returns a `DomainError` if the compensating command fails.
    async fn compensate(&self, _saga_id: Uuid) -> Result<(), DomainError> {
        Ok(())
    }
}

/// Persistence for saga instances and saga reactor checkpoints.
#[async_trait]
pub trait SagaRepository: Send + Sync {
    /// Stores a new saga instance. Returns `false` if one with the same ID
    /// already exists.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` for store failures.
    async fn insert(&self, instance: &SagaInstance) -> Result<bool, DomainError>;

    /// Inserts or replaces a saga instance.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` for store failures.
    async fn save(&self, instance: &SagaInstance) -> Result<(), DomainError>;

    /// Loads a saga instance.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` for store failures.
    async fn load(&self, saga_id: Uuid) -> Result<Option<SagaInstance>, DomainError>;

    /// Deletes a saga instance.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` for store failures.
    async fn delete(&self, saga_id: Uuid) -> Result<(), DomainError>;

    /// Lists `Running` and `Compensating` sagas of a type, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` for store failures.
    async fn list_unfinished(&self, saga_type: &str) -> Result<Vec<SagaInstance>, DomainError>;

    /// Returns the last global position a saga reactor processed (0 if none).
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` for store failures.
    async fn checkpoint(&self, subscriber: &str) -> Result<i64, DomainError>;

    /// Records the last global position a saga reactor processed.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` for store failures.
    async fn save_checkpoint(&self, subscriber: &str, position: i64) -> Result<(), DomainError>;
}

/// A saga ready to run.
pub struct SagaDefinition {
    /// Saga type name.
    pub saga_type: String,
    /// Aggregates the saga touches.
    pub correlated_aggregate_ids: Vec<Uuid>,
    /// Steps in execution order.
    pub steps: Vec<Box<dyn SagaStep>>,
}

/// How a saga ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaOutcome {
    /// Every step succeeded.
    Completed,
    /// A step failed and every accepted step was compensated.
    Compensated {
        /// Why the failing step failed.
        reason: String,
    },
}

/// Runs sagas step by step, compensating on failure.
pub struct SagaCoordinator {
    repository: Arc<dyn SagaRepository>,
    events: Arc<dyn EventRepository>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    step_timeout: Duration,
}

impl SagaCoordinator {
    /// Creates a coordinator. Confirmations are awaited on `bus` and
    /// looked up in `events`.
    #[must_use]
    pub fn new(
        repository: Arc<dyn SagaRepository>,
        events: Arc<dyn EventRepository>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
        step_timeout: Duration,
    ) -> Self {
        Self {
            repository,
            events,
            bus,
            clock,
            step_timeout,
        }
    }

    /// Returns the bus the coordinator listens on.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Returns the event store confirmations are looked up in.
    #[must_use]
    pub fn events(&self) -> &Arc<dyn EventRepository> {
        &self.events
    }

    /// Returns the saga store.
    #[must_use]
    pub fn repository(&self) -> &Arc<dyn SagaRepository> {
        &self.repository
    }

    /// Runs a saga to completion or compensation.
    ///
    /// Completed and cleanly compensated sagas are deleted once finished.
    /// A saga whose compensation failed stays persisted in `Failed`.
    ///
    /// # Errors
    ///
    /// Returns `SagaError::AlreadyStarted` if `saga_id` is taken,
    /// `SagaError::CompensationFailure` if any compensation failed, and
    /// `SagaError::Domain` if the saga state cannot be persisted.
    #[instrument(skip(self, definition), fields(saga_type = %definition.saga_type))]
    pub async fn execute(
        &self,
        saga_id: Uuid,
        definition: SagaDefinition,
    ) -> Result<SagaOutcome, SagaError> {
        let instance = self.start(saga_id, &definition).await?;
        self.resume(instance, definition).await
    }

    /// Persists a new `Running` instance of `definition` without running
    /// any step.
    ///
    /// # Errors
    ///
    /// Returns `SagaError::AlreadyStarted` if `saga_id` is taken and
    /// `SagaError::Domain` if the instance cannot be persisted.
    pub async fn start(
        &self,
        saga_id: Uuid,
        definition: &SagaDefinition,
    ) -> Result<SagaInstance, SagaError> {
        let now = self.clock.now();
        let instance = SagaInstance {
            saga_id,
            saga_type: definition.saga_type.clone(),
            status: SagaStatus::Running,
            current_step: 0,
            steps: definition
                .steps
                .iter()
                .map(|step| StepLog {
                    name: step.name().to_owned(),
                    status: StepStatus::Pending,
                    error: None,
                })
                .collect(),
            correlated_aggregate_ids: definition.correlated_aggregate_ids.clone(),
            failure_reason: None,
            started_at: now,
            updated_at: now,
        };
        if !self.repository.insert(&instance).await? {
            return Err(SagaError::AlreadyStarted(saga_id));
        }
        info!(%saga_id, saga_type = %instance.saga_type, "saga started");
        Ok(instance)
    }

    /// Continues a persisted saga from where it stopped: a `Running` saga
    /// carries on with its current step, a `Compensating` one finishes its
    /// compensation. Steps confirmed in the event store are not dispatched
    /// again.
    ///
    /// # Errors
    ///
    /// Returns `SagaError::CompensationFailure` if any compensation failed
    /// or the saga was already parked in `Failed`, and `SagaError::Domain`
    /// if `definition` does not fit the instance or the saga state cannot
    /// be persisted.
    pub async fn resume(
        &self,
        mut instance: SagaInstance,
        definition: SagaDefinition,
    ) -> Result<SagaOutcome, SagaError> {
        if instance.steps.len() != definition.steps.len() {
            return Err(DomainError::Validation(format!(
                "saga {} logged {} steps but its definition has {}",
                instance.saga_id,
                instance.steps.len(),
                definition.steps.len()
            ))
            .into());
        }

        match instance.status {
            SagaStatus::Running => self.run_steps(&mut instance, &definition).await,
            SagaStatus::Compensating => {
                let reason = instance.failure_reason.clone().unwrap_or_default();
                self.compensate(&mut instance, &definition, reason).await
            }
            SagaStatus::Completed => {
                self.repository.delete(instance.saga_id).await?;
                Ok(SagaOutcome::Completed)
            }
            SagaStatus::Failed => Err(SagaError::CompensationFailure {
                saga_id: instance.saga_id,
                failed_steps: compensation_failures(&instance),
                reason: instance.failure_reason.unwrap_or_default(),
            }),
        }
    }

    async fn run_steps(
        &self,
        instance: &mut SagaInstance,
        definition: &SagaDefinition,
    ) -> Result<SagaOutcome, SagaError> {
        let saga_id = instance.saga_id;
        for index in instance.current_step..definition.steps.len() {
            instance.current_step = index;
            if instance.steps[index].status == StepStatus::Succeeded {
                continue;
            }
            let step = definition.steps[index].as_ref();
            match self.run_step(instance, index, step).await {
                Ok(()) => {
                    instance.steps[index].status = StepStatus::Succeeded;
                    self.persist(instance).await?;
                }
                Err(e) => {
                    let reason = e.to_string();
                    warn!(%saga_id, step = step.name(), error = %reason, "saga step failed");
                    let log = &mut instance.steps[index];
                    if log.status != StepStatus::Dispatched {
                        log.status = StepStatus::Failed;
                    }
                    log.error = Some(reason.clone());
                    return self.compensate(instance, definition, reason).await;
                }
            }
        }

        self.repository.delete(saga_id).await?;
        info!(%saga_id, "saga completed");
        Ok(SagaOutcome::Completed)
    }

    async fn run_step(
        &self,
        instance: &mut SagaInstance,
        index: usize,
        step: &dyn SagaStep,
    ) -> Result<(), SagaError> {
        let saga_id = instance.saga_id;
        let awaited = step.awaits(saga_id);
        if self.confirmed(&awaited).await? {
            debug!(%saga_id, step = step.name(), "step already confirmed");
            return Ok(());
        }

        // Subscribe before dispatching so the confirming event cannot be missed.
        let mut events = self.bus.subscribe();
        if let Err(e) = step.execute(saga_id).await {
            // An error reported after the command was committed still counts.
            if self.confirmed(&awaited).await? {
                return Ok(());
            }
            return Err(e.into());
        }
        instance.steps[index].status = StepStatus::Dispatched;
        self.persist(instance).await?;

        let waited = tokio::time::timeout(self.step_timeout, self.wait_for(&mut events, &awaited))
            .await;
        if matches!(waited, Ok(Ok(()))) || self.confirmed(&awaited).await? {
            return Ok(());
        }
        match waited {
            Ok(result) => result,
            Err(_) => Err(SagaError::Timeout {
                saga_id,
                step: step.name().to_owned(),
                timeout_ms: u64::try_from(self.step_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    async fn wait_for(
        &self,
        events: &mut broadcast::Receiver<StoredEvent>,
        awaited: &AwaitedEvent,
    ) -> Result<(), SagaError> {
        loop {
            match events.recv().await {
                Ok(event) if awaited.matches(&event) => return Ok(()),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "saga listener lagged behind the event bus");
                    if self.confirmed(awaited).await? {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(DomainError::Infrastructure("event bus closed".to_owned()).into());
                }
            }
        }
    }

    /// Returns `true` if the awaited event is in the event store.
    async fn confirmed(&self, awaited: &AwaitedEvent) -> Result<bool, DomainError> {
        let mut stream = self.events.read_stream(awaited.aggregate_id, 1);
        while let Some(event) = stream.try_next().await? {
            if awaited.matches(&event) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn compensate(
        &self,
        instance: &mut SagaInstance,
        definition: &SagaDefinition,
        reason: String,
    ) -> Result<SagaOutcome, SagaError> {
        let saga_id = instance.saga_id;
        instance.status = SagaStatus::Compensating;
        instance.failure_reason = Some(reason.clone());
        self.persist(instance).await?;

        for index in (0..definition.steps.len()).rev() {
            if !matches!(
                instance.steps[index].status,
                StepStatus::Dispatched | StepStatus::Succeeded | StepStatus::CompensationFailed
            ) {
                continue;
            }
            let step = &definition.steps[index];
            match step.compensate(saga_id).await {
                Ok(()) => {
                    instance.steps[index].status = StepStatus::Compensated;
                    info!(%saga_id, step = step.name(), "step compensated");
                }
                Err(e) => {
                    error!(%saga_id, step = step.name(), error = %e, "compensation failed");
                    instance.steps[index].status = StepStatus::CompensationFailed;
                    instance.steps[index].error = Some(e.to_string());
                }
            }
            self.persist(instance).await?;
        }

        instance.status = SagaStatus::Failed;
        self.persist(instance).await?;

        let failed_steps = compensation_failures(instance);
        if failed_steps.is_empty() {
            self.repository.delete(saga_id).await?;
            info!(%saga_id, "saga compensated");
            Ok(SagaOutcome::Compensated { reason })
        } else {
            error!(%saga_id, ?failed_steps, "saga parked for manual intervention");
            Err(SagaError::CompensationFailure {
                saga_id,
                failed_steps,
                reason,
            })
        }
    }

    async fn persist(&self, instance: &mut SagaInstance) -> Result<(), DomainError> {
        instance.updated_at = self.clock.now();
        self.repository.save(instance).await
    }
}

/// Names of the steps whose compensation failed, last step first.
fn compensation_failures(instance: &SagaInstance) -> Vec<String> {
    instance
        .steps
        .iter()
        .rev()
        .filter(|s| s.status == StepStatus::CompensationFailed)
        .map(|s| s.name.clone())
        .collect()
}

/// Maps a committed event to the saga it starts, if any.
pub trait SagaTrigger: Send + Sync {
    /// Type name of the sagas this trigger starts.
    fn saga_type(&self) -> &'static str;

    /// Returns the saga `event` starts.
    fn saga_for(&self, event: &StoredEvent) -> Option<SagaDefinition>;
}

/// Starts sagas in response to committed events.
///
/// The reactor reads the event store in global position order from a
/// persisted checkpoint; the bus only wakes it up. The triggering event's
/// ID becomes the saga ID, so an event delivered twice cannot start two
/// sagas. On startup, sagas left `Running` or `Compensating` by a previous
/// process are resumed.
pub struct SagaReactor<T: SagaTrigger> {
    coordinator: Arc<SagaCoordinator>,
    trigger: T,
    batch_size: usize,
}

impl<T: SagaTrigger> SagaReactor<T> {
    /// Creates a reactor.
    #[must_use]
    pub fn new(coordinator: Arc<SagaCoordinator>, trigger: T) -> Self {
        Self {
            coordinator,
            trigger,
            batch_size: 256,
        }
    }

    /// Sets how many events are read per store round trip.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn subscriber(&self) -> String {
        format!("saga:{}", self.trigger.saga_type())
    }

    /// Reacts to committed events until `shutdown` turns `true`, then waits
    /// for in-flight sagas to finish.
    ///
    /// Catches up whenever an event is published on the coordinator's bus
    /// and at least every `poll_interval`, which is raised to one millisecond
    /// if zero. Errors are logged and retried on the next wake-up.
    pub async fn run(&self, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let saga_type = self.trigger.saga_type();
        let mut notifications = self.coordinator.bus().subscribe();
        let mut ticker = tokio::time::interval(poll_interval.max(Duration::from_millis(1)));
        let mut in_flight = JoinSet::new();
        info!(saga_type, "saga reactor started");

        let resumed = match self.resume_unfinished(&mut in_flight).await {
            Ok(resumed) => resumed,
            Err(e) => {
                error!(saga_type, error = %e, "resuming unfinished sagas failed");
                HashSet::new()
            }
        };

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = notifications.recv() => {
                    if let Err(broadcast::error::RecvError::Closed) = received {
                        break;
                    }
                }
                _ = ticker.tick() => {}
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => continue,
            }

            if let Err(e) = self.catch_up(&mut in_flight, &resumed).await {
                error!(saga_type, error = %e, "saga reactor catch-up failed");
            }
        }

        while in_flight.join_next().await.is_some() {}
        info!(saga_type, "saga reactor stopped");
    }

    /// Spawns every unfinished saga of this reactor's type. Returns their IDs.
    async fn resume_unfinished(
        &self,
        in_flight: &mut JoinSet<()>,
    ) -> Result<HashSet<Uuid>, SagaError> {
        let unfinished = self
            .coordinator
            .repository()
            .list_unfinished(self.trigger.saga_type())
            .await?;
        let mut resumed = HashSet::new();

        for instance in unfinished {
            let saga_id = instance.saga_id;
            let Some(trigger) = self.coordinator.events().load_event(saga_id).await? else {
                error!(%saga_id, "triggering event of unfinished saga not found");
                continue;
            };
            let Some(definition) = self.trigger.saga_for(&trigger) else {
                error!(%saga_id, "triggering event no longer starts a saga");
                continue;
            };
            info!(%saga_id, status = instance.status.as_str(), "resuming saga");
            resumed.insert(saga_id);
            self.spawn(in_flight, instance, definition);
        }
        Ok(resumed)
    }

    async fn catch_up(
        &self,
        in_flight: &mut JoinSet<()>,
        resumed: &HashSet<Uuid>,
    ) -> Result<usize, SagaError> {
        let subscriber = self.subscriber();
        let repository = self.coordinator.repository();
        let mut position = repository.checkpoint(&subscriber).await?;
        let mut started = 0;

        loop {
            let batch = self
                .coordinator
                .events()
                .read_all(position, self.batch_size)
                .await?;
            for event in &batch {
                let definition = if resumed.contains(&event.event_id) {
                    None
                } else {
                    self.trigger.saga_for(event)
                };
                if let Some(definition) = definition {
                    match self.coordinator.start(event.event_id, &definition).await {
                        Ok(instance) => {
                            self.spawn(in_flight, instance, definition);
                            started += 1;
                        }
                        Err(SagaError::AlreadyStarted(saga_id)) => {
                            debug!(%saga_id, "saga already started");
                        }
                        Err(e) => return Err(e),
                    }
                }
                position = event.position;
                repository.save_checkpoint(&subscriber, position).await?;
            }
            if batch.len() < self.batch_size {
                return Ok(started);
            }
        }
    }

    fn spawn(
        &self,
        in_flight: &mut JoinSet<()>,
        instance: SagaInstance,
        definition: SagaDefinition,
    ) {
        let coordinator = Arc::clone(&self.coordinator);
        in_flight.spawn(async move {
            let saga_id = instance.saga_id;
            match coordinator.resume(instance, definition).await {
                Ok(outcome) => info!(%saga_id, ?outcome, "saga finished"),
                Err(e) => error!(%saga_id, error = %e, "saga failed"),
            }
        });
    }
}
