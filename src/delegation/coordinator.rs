//! Delegation coordinator: turns submissions into routed, dispatched and
//! tracked tasks.
//!
//! Per task: `pending -> processing -> {completed | failed | cancelled}`.
//! The tracker owns the authoritative history; the coordinator keeps a
//! copy of each task plus its routing decisions and the worker slot it
//! holds in the registry.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::message::{
    Cancellation, Endpoint, ErrorNotification, HandoffRequest, HeartbeatPayload, Message,
    MessageType, StatusUpdate, TaskRequest,
};
use crate::bus::subscription::{Callback, EventFilter, Subscription};
use crate::bus::SendOptions;
use crate::classifier::{ClassificationContext, ClassificationResult};
use crate::delegation::context::DelegationContext;
use crate::delegation::task::{Priority, Task, TaskCategory, TaskStatus};
use crate::embedding::cosine_similarity;
use crate::error::{DelegationError, Error};
use crate::routing::RoutingDecision;
use crate::store::{Record, RecordKind};
use crate::tracker::{EntryKind, ProgressUpdate, TaskResult};
use crate::workers::TaskOutcome;

/// Caller overrides for [`Coordinator::submit`].
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub priority: Option<Priority>,
    /// Forces the category regardless of classification.
    pub category: Option<TaskCategory>,
    pub context: Option<ClassificationContext>,
    /// Skip the classifier and use this result.
    pub classification: Option<ClassificationResult>,
    /// Skip routing and send to this worker.
    pub assign_to: Option<String>,
    pub parameters: HashMap<String, serde_json::Value>,
    pub deadline: Option<DateTime<Utc>>,
    /// Dispatch later instead of now.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_retries: Option<u32>,
}

/// What `submit` produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub task: Task,
    pub classification: ClassificationResult,
    pub decision: RoutingDecision,
}

struct TaskEntry {
    task: Task,
    classification: ClassificationResult,
    decisions: Vec<RoutingDecision>,
    /// Worker whose registry slot this task holds.
    slot: Option<String>,
    dispatched_at: Option<DateTime<Utc>>,
}

impl TaskEntry {
    fn sync_status(&mut self, status: TaskStatus) {
        if self.task.status == status {
            return;
        }
        if let Err(e) = self.task.transition_to(status) {
            debug!(task_id = %self.task.id, "Local status not updated: {e}");
        }
    }
}

pub struct Coordinator {
    ctx: DelegationContext,
    tasks: RwLock<HashMap<Uuid, TaskEntry>>,
    scheduled: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    pump: Mutex<Option<(Uuid, JoinHandle<()>)>>,
}

impl Coordinator {
    pub fn new(ctx: DelegationContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            tasks: RwLock::new(HashMap::new()),
            scheduled: Mutex::new(HashMap::new()),
            pump: Mutex::new(None),
        })
    }

    pub fn context(&self) -> &DelegationContext {
        &self.ctx
    }

    /// Classify, route, persist and dispatch (or schedule) a new task.
    pub async fn submit(
        self: &Arc<Self>,
        title: &str,
        description: &str,
        options: SubmitOptions,
    ) -> Result<Submission, Error> {
        if title.trim().is_empty() && description.trim().is_empty() {
            return Err(
                DelegationError::InvalidTask("title and description are empty".into()).into(),
            );
        }

        let text = if description.trim().is_empty() { title } else { description };
        let classification = match options.classification {
            Some(c) => c,
            None => self.ctx.classifier.classify(text, options.context.as_ref()),
        };

        let mut task = Task::new(title, description)
            .with_priority(options.priority.unwrap_or_default())
            .with_category(options.category.unwrap_or(classification.category))
            .with_complexity(classification.complexity)
            .with_requirements(classification.resource_requirements);
        task.task_type = classification.task_type;
        task.parameters = options.parameters;
        task.deadline = options.deadline;
        task.scheduled_at = options.scheduled_at;
        task.max_retries = options.max_retries.unwrap_or(self.ctx.config.max_task_retries);
        let task_id = task.id;

        self.reserve(&task, &classification).await?;

        let decision = match options.assign_to.as_deref() {
            Some(worker_id) => self.ctx.routing.direct(&task, &classification, worker_id).await,
            None => self.ctx.routing.decide(&task, &classification).await,
        };
        apply_decision(&mut task, &decision);

        if let Err(e) = self.append(RecordKind::Task, task_id, &task).await {
            self.tasks.write().await.remove(&task_id);
            return Err(e);
        }
        if let Err(e) = self.append(RecordKind::Decision, task_id, &decision).await {
            warn!(task_id = %task_id, "Failed to persist routing decision: {e}");
        }

        if let Some(entry) = self.tasks.write().await.get_mut(&task_id) {
            entry.task = task.clone();
            entry.decisions.push(decision.clone());
        }
        self.ctx
            .tracker
            .register(&task, Some(classification.estimated_duration))
            .await;
        self.embed(&task).await;

        info!(
            task_id = %task_id,
            category = %task.category.as_str(),
            worker = %decision.worker_id,
            "Task submitted"
        );

        match task.scheduled_at.filter(|at| *at > Utc::now()) {
            Some(at) => self.schedule(task_id, at).await,
            None => self.dispatch(task_id).await?,
        }

        let task = self.task(task_id).await.unwrap_or(task);
        Ok(Submission {
            task,
            classification,
            decision,
        })
    }

    /// Send a pending task to its assigned worker.
    ///
    /// On failure the task is marked failed and its slot released.
    pub async fn dispatch(&self, task_id: Uuid) -> Result<(), Error> {
        let (task, decision) = {
            let tasks = self.tasks.read().await;
            let entry = tasks
                .get(&task_id)
                .ok_or(DelegationError::NotFound { id: task_id })?;
            if entry.task.status != TaskStatus::Pending {
                debug!(task_id = %task_id, status = %entry.task.status, "Skipping dispatch");
                return Ok(());
            }
            let decision = entry
                .decisions
                .last()
                .cloned()
                .ok_or_else(|| {
                    DelegationError::InvalidTask(format!("task {task_id} has no routing decision"))
                })?;
            (entry.task.clone(), decision)
        };

        match self.send_request(&task, &decision).await {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(e) => {
                error!(task_id = %task_id, worker = %decision.worker_id, "Dispatch failed: {e}");
                self.finish(task_id, TaskStatus::Failed, &format!("Dispatch failed: {e}"), None)
                    .await;
                return Err(DelegationError::DispatchFailed {
                    task_id,
                    source: Box::new(e),
                }
                .into());
            }
        }

        let entry = self
            .ctx
            .tracker
            .update_status(
                task_id,
                TaskStatus::Processing,
                Some("Dispatched"),
                Some(&decision.worker_id),
            )
            .await?;
        let snapshot = {
            let mut tasks = self.tasks.write().await;
            tasks.get_mut(&task_id).map(|e| {
                e.sync_status(entry.status);
                e.task.clone()
            })
        };
        if let Some(task) = snapshot {
            self.snapshot(&task).await;
        }
        Ok(())
    }

    /// Cancel a pending or processing task.
    ///
    /// Returns `false` when the task had already finished, in which case
    /// nothing is sent.
    pub async fn cancel(&self, task_id: Uuid, reason: &str) -> Result<bool, Error> {
        let (worker_id, kind, priority) = {
            let mut tasks = self.tasks.write().await;
            let entry = tasks
                .get_mut(&task_id)
                .ok_or(DelegationError::NotFound { id: task_id })?;
            if entry.task.status.is_terminal() {
                return Ok(false);
            }
            entry.sync_status(TaskStatus::Cancelled);
            let kind = entry.decisions.last().map(|d| d.worker_kind);
            (entry.task.assigned_to.clone(), kind, entry.task.priority)
        };

        if let Some(handle) = self.scheduled.lock().await.remove(&task_id) {
            handle.abort();
        }
        self.ctx
            .tracker
            .update_status(task_id, TaskStatus::Cancelled, Some(reason), None)
            .await?;
        self.release_slot(task_id, None).await;

        if let Some(kind) = kind {
            let payload = Cancellation {
                task_id,
                reason: reason.to_string(),
            };
            let options = SendOptions {
                priority,
                recipient: worker_id,
                ..Default::default()
            };
            if let Err(e) = self
                .ctx
                .bus
                .send_payload(&payload, Endpoint::Worker(kind), options)
                .await
            {
                warn!(task_id = %task_id, "Cancellation not delivered: {e}");
            }
        }

        if let Some(task) = self.task(task_id).await {
            self.snapshot(&task).await;
        }
        info!(task_id = %task_id, reason, "Task cancelled");
        Ok(true)
    }

    /// Apply a message that arrived from a worker.
    pub async fn handle_worker_message(&self, message: &Message) -> Result<(), Error> {
        match message.message_type {
            MessageType::StatusUpdate => {
                let update: StatusUpdate = message.payload_as()?;
                self.apply_status(update.task_id, update.status, update.message.as_deref())
                    .await
            }
            MessageType::ProgressUpdate => {
                let update: ProgressUpdate = message.payload_as()?;
                self.ctx.tracker.update_progress(update).await?;
                Ok(())
            }
            MessageType::TaskResponse => {
                let result: TaskResult = message.payload_as()?;
                self.complete(result).await
            }
            MessageType::ErrorNotification => {
                let notification: ErrorNotification = message.payload_as()?;
                self.handle_error(notification).await
            }
            MessageType::HandoffRequest => {
                let request: HandoffRequest = message.payload_as()?;
                self.handoff(request.task_id, request.to_worker.as_deref(), &request.reason)
                    .await
                    .map(|_| ())
            }
            MessageType::Heartbeat => {
                let beat: HeartbeatPayload = message.payload_as()?;
                let known = match (beat.sender_id, beat.report) {
                    (Some(worker_id), Some(report)) => {
                        self.ctx.registry.heartbeat(&worker_id, report).await
                    }
                    _ => true,
                };
                if !known {
                    debug!("Heartbeat from unregistered worker ignored");
                }
                Ok(())
            }
            MessageType::TaskRequest | MessageType::Cancellation | MessageType::ContextSharing => {
                debug!(message_type = %message.message_type.as_str(), "Ignoring inbound message");
                Ok(())
            }
        }
    }

    /// Move a processing task to another worker.
    ///
    /// With no target the routing engine picks one. Returns the new decision.
    pub async fn handoff(
        &self,
        task_id: Uuid,
        to_worker: Option<&str>,
        reason: &str,
    ) -> Result<RoutingDecision, Error> {
        let (task, classification) = self.processing_task(task_id, "handoff").await?;
        let from = task.assigned_to.clone();

        let decision = match to_worker {
            Some(worker_id) => self.ctx.routing.direct(&task, &classification, worker_id).await,
            None => self.ctx.routing.decide(&task, &classification).await,
        };

        let request = HandoffRequest {
            task_id,
            from_worker: from.clone(),
            to_worker: Some(decision.worker_id.clone()),
            reason: reason.to_string(),
        };
        self.ctx
            .bus
            .request_handoff(&request, decision.worker_kind)
            .await?;

        self.reassign(task_id, &decision).await?;
        self.claim_slot(task_id, &decision.worker_id).await;
        let note = format!(
            "Handed off from {} to {}: {reason}",
            from.as_deref().unwrap_or("unassigned"),
            decision.worker_id
        );
        self.ctx
            .tracker
            .annotate(task_id, &note, Some(&decision.worker_id))
            .await?;
        info!(task_id = %task_id, worker = %decision.worker_id, "Task handed off");
        Ok(decision)
    }

    /// Route incoming worker messages into this coordinator and start the
    /// bus heartbeat. Calling it twice has no effect.
    pub async fn start(self: &Arc<Self>) {
        let mut pump = self.pump.lock().await;
        if pump.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let callback: Callback = Arc::new(move |message: &Message| -> anyhow::Result<()> {
            if message.source == Endpoint::Coordinator {
                return Ok(());
            }
            tx.send(message.clone())
                .map_err(|e| anyhow::anyhow!("coordinator pump closed: {e}"))
        });
        let subscription = self
            .ctx
            .bus
            .subscribe(Subscription::new(EventFilter::Any, callback))
            .await;

        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = coordinator.handle_worker_message(&message).await {
                    warn!(
                        message_id = %message.id,
                        message_type = %message.message_type.as_str(),
                        "Worker message not applied: {e}"
                    );
                }
            }
        });
        *pump = Some((subscription, handle));
        drop(pump);

        self.ctx.bus.start_heartbeat().await;
        info!("Coordinator started");
    }

    /// Stop the message pump, heartbeat and any scheduled dispatches.
    pub async fn shutdown(&self) {
        for (_, handle) in self.scheduled.lock().await.drain() {
            handle.abort();
        }
        if let Some((subscription, handle)) = self.pump.lock().await.take() {
            if let Err(e) = self.ctx.bus.unsubscribe(subscription).await {
                debug!("Pump subscription already gone: {e}");
            }
            handle.abort();
        }
        self.ctx.bus.stop_heartbeat().await;
        info!("Coordinator stopped");
    }

    pub async fn task(&self, task_id: Uuid) -> Option<Task> {
        self.tasks.read().await.get(&task_id).map(|e| e.task.clone())
    }

    /// All tasks, oldest first.
    pub async fn tasks(&self) -> Vec<Task> {
        let mut all: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .map(|e| e.task.clone())
            .collect();
        all.sort_by_key(|t| t.created_at);
        all
    }

    /// Every decision issued for a task, oldest first.
    pub async fn decisions(&self, task_id: Uuid) -> Vec<RoutingDecision> {
        self.tasks
            .read()
            .await
            .get(&task_id)
            .map(|e| e.decisions.clone())
            .unwrap_or_default()
    }

    pub async fn classification(&self, task_id: Uuid) -> Option<ClassificationResult> {
        self.tasks
            .read()
            .await
            .get(&task_id)
            .map(|e| e.classification.clone())
    }

    /// Pending plus processing tasks.
    pub async fn active_count(&self) -> usize {
        self.tasks
            .read()
            .await
            .values()
            .filter(|e| e.task.status.is_active())
            .count()
    }

    /// Tasks waiting for their scheduled time.
    pub async fn scheduled_count(&self) -> usize {
        self.scheduled.lock().await.len()
    }

    /// Stored tasks ranked by similarity to `text`.
    pub async fn similar_tasks(&self, text: &str, limit: usize) -> Result<Vec<(Uuid, f32)>, Error> {
        let query = self.ctx.embeddings.embed(text).await;
        let mut ranked: Vec<(Uuid, f32)> = self
            .ctx
            .store
            .list_vectors()
            .await?
            .into_iter()
            .filter_map(|(key, vector)| {
                let id = Uuid::parse_str(&key).ok()?;
                Some((id, cosine_similarity(&query, &vector)))
            })
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked.truncate(limit);
        Ok(ranked)
    }

    /// Insert the task if the active ceiling allows it.
    async fn reserve(
        &self,
        task: &Task,
        classification: &ClassificationResult,
    ) -> Result<(), Error> {
        let max = self.ctx.config.max_concurrent_tasks;
        let mut tasks = self.tasks.write().await;
        let active = tasks.values().filter(|e| e.task.status.is_active()).count();
        if active >= max {
            warn!(active, max, "Rejecting submission at capacity");
            return Err(DelegationError::CapacityExceeded { max }.into());
        }
        tasks.insert(
            task.id,
            TaskEntry {
                task: task.clone(),
                classification: classification.clone(),
                decisions: Vec::new(),
                slot: None,
                dispatched_at: None,
            },
        );
        Ok(())
    }

    async fn schedule(self: &Arc<Self>, task_id: Uuid, at: DateTime<Utc>) {
        let delay = (at - Utc::now()).to_std().unwrap_or_default();
        let coordinator = Arc::clone(self);
        // held until the handle is stored, so the job's removal comes after
        let mut scheduled = self.scheduled.lock().await;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            coordinator.scheduled.lock().await.remove(&task_id);
            if let Err(e) = coordinator.dispatch(task_id).await {
                warn!(task_id = %task_id, "Scheduled dispatch failed: {e}");
            }
        });
        scheduled.insert(task_id, handle);
        drop(scheduled);
        info!(task_id = %task_id, at = %at, "Task scheduled");
    }

    /// Reserve a slot on the decided worker and send the request.
    ///
    /// Workers the registry does not know are sent to without a slot.
    /// Returns `false` when the task reached a terminal status meanwhile.
    async fn send_request(&self, task: &Task, decision: &RoutingDecision) -> Result<bool, Error> {
        let holds_slot = match self.ctx.registry.acquire(&decision.worker_id).await {
            Ok(()) => true,
            Err(DelegationError::UnknownWorker { .. }) => {
                debug!(worker = %decision.worker_id, "Dispatching to unregistered worker");
                false
            }
            Err(e) => return Err(e.into()),
        };

        let request = TaskRequest {
            task: task.clone(),
            worker_id: decision.worker_id.clone(),
        };
        let options = SendOptions {
            priority: task.priority,
            requires_ack: true,
            correlation_id: Some(task.id),
            recipient: Some(decision.worker_id.clone()),
            ..Default::default()
        };
        let sent = self
            .ctx
            .bus
            .send_payload(&request, Endpoint::Worker(decision.worker_kind), options)
            .await;
        if let Err(e) = sent {
            if holds_slot {
                self.ctx.registry.release(&decision.worker_id, None).await;
            }
            return Err(e.into());
        }

        let live = {
            let mut tasks = self.tasks.write().await;
            match tasks.get_mut(&task.id) {
                Some(entry) if !entry.task.status.is_terminal() => {
                    entry.slot = holds_slot.then(|| decision.worker_id.clone());
                    entry.dispatched_at = Some(Utc::now());
                    true
                }
                _ => false,
            }
        };
        if !live {
            // finished while the request was in flight; nothing else will free the slot
            debug!(task_id = %task.id, worker = %decision.worker_id, "Task ended during dispatch");
            if holds_slot {
                self.ctx.registry.release(&decision.worker_id, None).await;
            }
        }
        Ok(live)
    }

    async fn apply_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        message: Option<&str>,
    ) -> Result<(), Error> {
        let source = self.task(task_id).await.and_then(|t| t.assigned_to);
        let entry = self
            .ctx
            .tracker
            .update_status(task_id, status, message, source.as_deref())
            .await?;
        if entry.kind == EntryKind::Transition {
            if let Some(e) = self.tasks.write().await.get_mut(&task_id) {
                e.sync_status(entry.status);
            }
            if entry.status.is_terminal() {
                self.release_slot(task_id, Some(entry.status == TaskStatus::Completed))
                    .await;
                if let Some(task) = self.task(task_id).await {
                    self.snapshot(&task).await;
                }
            }
        }
        Ok(())
    }

    async fn complete(&self, result: TaskResult) -> Result<(), Error> {
        let task_id = result.task_id;
        let success = result.success;
        let Some(analytics) = self.ctx.tracker.record_result(result).await? else {
            return Ok(());
        };
        let status = if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        let slot = {
            let mut tasks = self.tasks.write().await;
            tasks.get_mut(&task_id).and_then(|e| {
                e.sync_status(status);
                e.slot.take()
            })
        };
        if let Some(worker_id) = slot {
            self.ctx
                .registry
                .release(
                    &worker_id,
                    Some(TaskOutcome {
                        success,
                        duration: analytics.duration,
                    }),
                )
                .await;
        }
        if let Some(task) = self.task(task_id).await {
            self.snapshot(&task).await;
        }
        info!(task_id = %task_id, success, "Task finished");
        Ok(())
    }

    /// Retry on another routing pass while retries remain, else fail.
    async fn handle_error(&self, notification: ErrorNotification) -> Result<(), Error> {
        let task_id = notification.task_id;
        let retry = {
            let tasks = self.tasks.read().await;
            let entry = tasks
                .get(&task_id)
                .ok_or(DelegationError::NotFound { id: task_id })?;
            if entry.task.status.is_terminal() {
                debug!(task_id = %task_id, "Error for finished task ignored");
                return Ok(());
            }
            notification.retryable && entry.task.retry_count < entry.task.max_retries
        };

        if !retry {
            self.finish(task_id, TaskStatus::Failed, &notification.error, Some(false))
                .await;
            return Ok(());
        }

        self.release_slot(task_id, Some(false)).await;
        let (task, classification) = {
            let mut tasks = self.tasks.write().await;
            let entry = tasks
                .get_mut(&task_id)
                .ok_or(DelegationError::NotFound { id: task_id })?;
            entry.task.retry_count += 1;
            (entry.task.clone(), entry.classification.clone())
        };
        let decision = self.ctx.routing.decide(&task, &classification).await;
        warn!(
            task_id = %task_id,
            attempt = task.retry_count,
            worker = %decision.worker_id,
            "Retrying task after error: {}",
            notification.error
        );

        self.reassign(task_id, &decision).await?;
        let task = self.task(task_id).await.unwrap_or(task);
        match self.send_request(&task, &decision).await {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(e) => {
                let message = format!("Retry dispatch failed: {e}");
                self.finish(task_id, TaskStatus::Failed, &message, None).await;
                return Err(DelegationError::DispatchFailed {
                    task_id,
                    source: Box::new(e),
                }
                .into());
            }
        }
        self.ctx
            .tracker
            .annotate(
                task_id,
                &format!(
                    "Retry {} of {} on {}: {}",
                    task.retry_count, task.max_retries, decision.worker_id, notification.error
                ),
                Some(&decision.worker_id),
            )
            .await?;
        Ok(())
    }

    /// Record a new decision and move the task's slot to its worker.
    async fn reassign(&self, task_id: Uuid, decision: &RoutingDecision) -> Result<(), Error> {
        if let Err(e) = self.append(RecordKind::Decision, task_id, decision).await {
            warn!(task_id = %task_id, "Failed to persist routing decision: {e}");
        }
        let old_slot = {
            let mut tasks = self.tasks.write().await;
            let entry = tasks
                .get_mut(&task_id)
                .ok_or(DelegationError::NotFound { id: task_id })?;
            apply_decision(&mut entry.task, decision);
            entry.decisions.push(decision.clone());
            entry.slot.take()
        };
        if let Some(worker_id) = old_slot {
            self.ctx.registry.release(&worker_id, None).await;
        }
        self.ctx.tracker.set_worker(task_id, &decision.worker_id).await?;
        Ok(())
    }

    async fn claim_slot(&self, task_id: Uuid, worker_id: &str) {
        match self.ctx.registry.acquire(worker_id).await {
            Ok(()) => {
                if let Some(e) = self.tasks.write().await.get_mut(&task_id) {
                    e.slot = Some(worker_id.to_string());
                }
            }
            Err(DelegationError::UnknownWorker { .. }) => {}
            Err(e) => warn!(task_id = %task_id, worker = %worker_id, "No slot after handoff: {e}"),
        }
    }

    async fn processing_task(
        &self,
        task_id: Uuid,
        action: &str,
    ) -> Result<(Task, ClassificationResult), Error> {
        let tasks = self.tasks.read().await;
        let entry = tasks
            .get(&task_id)
            .ok_or(DelegationError::NotFound { id: task_id })?;
        if entry.task.status != TaskStatus::Processing {
            return Err(DelegationError::InvalidTransition {
                id: task_id,
                state: entry.task.status.to_string(),
                target: action.to_string(),
            }
            .into());
        }
        Ok((entry.task.clone(), entry.classification.clone()))
    }

    /// Drive a task to a terminal status, tolerating an already finished one.
    async fn finish(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        message: &str,
        success: Option<bool>,
    ) {
        match self
            .ctx
            .tracker
            .update_status(task_id, status, Some(message), None)
            .await
        {
            Ok(entry) if entry.kind == EntryKind::Transition => {
                if let Some(e) = self.tasks.write().await.get_mut(&task_id) {
                    e.sync_status(entry.status);
                }
            }
            Ok(_) => {}
            Err(e) => warn!(task_id = %task_id, "Could not record {status}: {e}"),
        }
        self.release_slot(task_id, success).await;
        if let Some(task) = self.task(task_id).await {
            self.snapshot(&task).await;
        }
    }

    /// Free the task's worker slot, if it holds one.
    async fn release_slot(&self, task_id: Uuid, success: Option<bool>) {
        let held = {
            let mut tasks = self.tasks.write().await;
            tasks
                .get_mut(&task_id)
                .and_then(|e| e.slot.take().map(|w| (w, e.dispatched_at)))
        };
        let Some((worker_id, dispatched_at)) = held else {
            return;
        };
        let outcome = success.map(|success| TaskOutcome {
            success,
            duration: dispatched_at
                .and_then(|at| (Utc::now() - at).to_std().ok())
                .unwrap_or_default(),
        });
        self.ctx.registry.release(&worker_id, outcome).await;
    }

    async fn embed(&self, task: &Task) {
        if !self.ctx.config.embed_tasks {
            return;
        }
        let text = format!("{}\n{}", task.title, task.description);
        let vector = self.ctx.embeddings.embed(&text).await;
        if let Err(e) = self.ctx.store.put_vector(&task.id.to_string(), &vector).await {
            warn!(task_id = %task.id, "Failed to store task embedding: {e}");
        }
    }

    async fn snapshot(&self, task: &Task) {
        if let Err(e) = self.append(RecordKind::Task, task.id, task).await {
            warn!(task_id = %task.id, "Failed to persist task snapshot: {e}");
        }
    }

    async fn append<T: Serialize>(
        &self,
        kind: RecordKind,
        task_id: Uuid,
        value: &T,
    ) -> Result<(), Error> {
        let record =
            Record::from_value(kind, task_id.to_string(), value)?.with_correlation(task_id);
        self.ctx.store.append(&record).await?;
        Ok(())
    }
}

fn apply_decision(task: &mut Task, decision: &RoutingDecision) {
    task.assigned_to = Some(decision.worker_id.clone());
    if let Some(priority) = decision.priority_override {
        task.priority = priority;
    }
    task.metadata
        .extend(decision.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
    task.parameters
        .extend(decision.parameters.iter().map(|(k, v)| (k.clone(), v.clone())));
    task.updated_at = Utc::now();
}
