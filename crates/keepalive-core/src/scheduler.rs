use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::KeepaliveConfig;
use crate::credential::Credential;
use crate::error::{KeepaliveError, Result, UpstreamError};
use crate::notify::{Notification, Notifier, RemovalReason};
use crate::store::{LoadReport, Task, TaskStore, now_ms};
use crate::upstream::{AccountClient, AccountId, AccountInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HeartbeatOutcome {
    Succeeded,
    Failed { failures: u32 },
    /// The failure ceiling was reached and the task was deleted.
    Evicted { failures: u32 },
}

struct ScheduleHandle {
    generation: u64,
    token: CancellationToken,
}

/// Runs periodic heartbeats for every task in the store.
///
/// Heartbeats for one account are single-flight: scheduled runs, manual
/// triggers and replacement all pass through a per-account gate, and
/// notifications are emitted while the gate is held so they arrive in
/// execution order.
pub struct Scheduler {
    store: Arc<TaskStore>,
    client: Arc<dyn AccountClient>,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
    jitter: Duration,
    max_failures: u32,
    gates: DashMap<AccountId, Arc<Mutex<()>>>,
    handles: DashMap<Uuid, ScheduleHandle>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        store: Arc<TaskStore>,
        client: Arc<dyn AccountClient>,
        notifier: Arc<dyn Notifier>,
        config: &KeepaliveConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            client,
            notifier,
            interval: config.interval,
            jitter: config.jitter,
            max_failures: config.max_consecutive_failures,
            gates: DashMap::new(),
            handles: DashMap::new(),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    /// Announce duplicates dropped at load time and schedule every stored task.
    pub async fn start(self: &Arc<Self>, report: LoadReport) {
        for task in report.displaced {
            self.notify(
                &task,
                Notification::TaskRemoved {
                    reason: RemovalReason::ReplacedByNewTask,
                },
            )
            .await;
        }
        let tasks = self.store.list().await;
        info!(tasks = tasks.len(), "scheduling stored tasks");
        for task in &tasks {
            self.schedule(task);
        }
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Read-only identity probe for a credential.
    pub async fn validate(&self, credential: &Credential) -> Result<AccountInfo> {
        if credential.is_blank() {
            return Err(KeepaliveError::InvalidInput("credential must not be empty".into()));
        }
        self.client
            .get_me(credential)
            .await
            .map_err(|e| match e {
                UpstreamError::Unauthorized(reason) => KeepaliveError::InvalidCredential(reason),
                other => KeepaliveError::Upstream(other),
            })
    }

    /// Create a task for the credential's account, replacing any existing one.
    ///
    /// `notify_target` defaults to the account itself.
    pub async fn create_or_replace(
        self: &Arc<Self>,
        credential: Credential,
        notify_target: Option<i64>,
    ) -> Result<Task> {
        let info = self.validate(&credential).await?;
        let task = Task::new(
            info.account_id,
            credential,
            notify_target.unwrap_or(info.account_id),
        );

        let gate = self.gate(task.account_id);
        let _flight = gate.lock().await;
        let previous = self.store.insert_replacing(task.clone()).await?;
        if let Some(old) = previous {
            self.cancel(&old.uuid);
            info!(old = %old.uuid, new = %task.uuid, account_id = task.account_id, "task replaced");
            self.notify(
                &old,
                Notification::TaskRemoved {
                    reason: RemovalReason::ReplacedByNewTask,
                },
            )
            .await;
        }
        info!(uuid = %task.uuid, account_id = task.account_id, "task created");
        self.schedule(&task);
        Ok(task)
    }

    /// Delete a task and stop its scheduling.
    pub async fn delete(&self, uuid: Uuid) -> Result<Task> {
        let task = self
            .store
            .remove(&uuid)
            .await?
            .ok_or(KeepaliveError::TaskNotFound(uuid))?;
        self.cancel(&uuid);
        info!(uuid = %uuid, account_id = task.account_id, "task deleted by user");

        let gate = self.gate(task.account_id);
        let _flight = gate.lock().await;
        self.notify(
            &task,
            Notification::TaskRemoved {
                reason: RemovalReason::DeletedByUser,
            },
        )
        .await;
        Ok(task)
    }

    /// Run one heartbeat now, through the same gate as scheduled runs.
    pub async fn trigger(&self, uuid: Uuid) -> Result<HeartbeatOutcome> {
        self.run_heartbeat(uuid).await
    }

    pub async fn run_heartbeat(&self, uuid: Uuid) -> Result<HeartbeatOutcome> {
        let account_id = self
            .store
            .get(&uuid)
            .await
            .ok_or(KeepaliveError::TaskNotFound(uuid))?
            .account_id;
        let gate = self.gate(account_id);
        let _flight = gate.lock().await;

        // Re-read under the gate: the task may have been deleted or replaced.
        let task = self
            .store
            .get(&uuid)
            .await
            .ok_or(KeepaliveError::TaskNotFound(uuid))?;

        match self.client.get_me(&task.credential).await {
            Ok(_) => {
                let task = self
                    .store
                    .record_success(&uuid, now_ms())
                    .await?
                    .ok_or(KeepaliveError::TaskNotFound(uuid))?;
                info!(uuid = %uuid, account_id = task.account_id, "heartbeat succeeded");
                self.notify(&task, Notification::HeartbeatSucceeded).await;
                Ok(HeartbeatOutcome::Succeeded)
            }
            Err(e) => {
                let task = self
                    .store
                    .record_failure(&uuid)
                    .await?
                    .ok_or(KeepaliveError::TaskNotFound(uuid))?;
                let failures = task.consecutive_failures;
                warn!(
                    uuid = %uuid,
                    failures,
                    max = self.max_failures,
                    "heartbeat failed: {e}"
                );
                self.notify(
                    &task,
                    Notification::HeartbeatFailed {
                        reason: e.to_string(),
                    },
                )
                .await;

                if failures < self.max_failures {
                    return Ok(HeartbeatOutcome::Failed { failures });
                }
                self.store.remove(&uuid).await?;
                warn!(uuid = %uuid, failures, "task evicted after repeated heartbeat failures");
                self.notify(
                    &task,
                    Notification::TaskRemoved {
                        reason: RemovalReason::TooManyFailures { failures },
                    },
                )
                .await;
                self.cancel(&uuid);
                Ok(HeartbeatOutcome::Evicted { failures })
            }
        }
    }

    /// Number of tasks with a live schedule.
    pub fn scheduled(&self) -> usize {
        self.handles.len()
    }

    pub fn is_scheduled(&self, uuid: &Uuid) -> bool {
        self.handles.contains_key(uuid)
    }

    /// Stop every scheduled heartbeat.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.handles.clear();
    }

    fn schedule(self: &Arc<Self>, task: &Task) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        if let Some(old) = self.handles.insert(
            task.uuid,
            ScheduleHandle {
                generation,
                token: token.clone(),
            },
        ) {
            old.token.cancel();
        }

        let base = task.last_heartbeat_ms.unwrap_or(task.created_at_ms);
        let due = base.saturating_add(self.next_delay().as_millis() as u64);
        let first = Duration::from_millis(due.saturating_sub(now_ms()));
        debug!(uuid = %task.uuid, delay_secs = first.as_secs(), "heartbeat scheduled");

        let scheduler = Arc::clone(self);
        let uuid = task.uuid;
        tokio::spawn(async move {
            scheduler.run_loop(uuid, token, first).await;
            scheduler
                .handles
                .remove_if(&uuid, |_, h| h.generation == generation);
        });
    }

    async fn run_loop(&self, uuid: Uuid, token: CancellationToken, mut delay: Duration) {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            // A started heartbeat always finishes so its record and
            // notification stay paired.
            match self.run_heartbeat(uuid).await {
                Ok(HeartbeatOutcome::Evicted { .. }) => return,
                Ok(_) => {}
                Err(KeepaliveError::TaskNotFound(_)) => {
                    debug!(uuid = %uuid, "task gone, schedule ends");
                    return;
                }
                Err(e) => error!(uuid = %uuid, "heartbeat could not be recorded: {e}"),
            }
            delay = self.next_delay();
        }
    }

    fn next_delay(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.interval + Duration::from_millis(extra)
    }

    fn cancel(&self, uuid: &Uuid) {
        if let Some((_, handle)) = self.handles.remove(uuid) {
            handle.token.cancel();
        }
    }

    fn gate(&self, account_id: AccountId) -> Arc<Mutex<()>> {
        self.gates.entry(account_id).or_default().clone()
    }

    async fn notify(&self, task: &Task, notification: Notification) {
        self.notifier
            .notify(task.notify_target, task.uuid, notification)
            .await;
    }
}
