//! Bounded, time-limited subscriptions for incoming login codes.

use futures_util::StreamExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::code::extract_code;
use crate::config::KeepaliveConfig;
use crate::credential::Credential;
use crate::error::{KeepaliveError, Result, UpstreamError};
use crate::upstream::{AccountClient, AccountId, MessageStream};

const EVENT_BUFFER: usize = 16;

/// Events delivered to one subscriber, in order. Exactly one terminal event
/// (`Code`, `Timeout` or `Error`) ends every subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationEvent {
    Connected,
    Heartbeat { elapsed: u64, remaining: u64 },
    Code { code: String },
    Timeout { timeout: u64 },
    Error {
        error: String,
        error_type: Option<&'static str>,
    },
}

impl VerificationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            VerificationEvent::Connected => "connected",
            VerificationEvent::Heartbeat { .. } => "heartbeat",
            VerificationEvent::Code { .. } => "code",
            VerificationEvent::Timeout { .. } => "timeout",
            VerificationEvent::Error { .. } => "error",
        }
    }

    pub fn data(&self) -> Value {
        match self {
            VerificationEvent::Connected => json!({
                "status": "waiting",
                "message": "Listening for verification code...",
            }),
            VerificationEvent::Heartbeat { elapsed, remaining } => {
                json!({ "elapsed": elapsed, "remaining": remaining })
            }
            VerificationEvent::Code { code } => json!({ "code": code }),
            VerificationEvent::Timeout { timeout } => json!({
                "error": "Timeout waiting for verification code",
                "timeout": timeout,
            }),
            VerificationEvent::Error { error, error_type } => match error_type {
                Some(kind) => json!({ "error": error, "error_type": kind }),
                None => json!({ "error": error }),
            },
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VerificationEvent::Code { .. }
                | VerificationEvent::Timeout { .. }
                | VerificationEvent::Error { .. }
        )
    }

    fn from_upstream(err: &UpstreamError) -> Self {
        match err {
            UpstreamError::Unauthorized(_) => VerificationEvent::Error {
                error: "Session expired or invalid".to_string(),
                error_type: Some("auth_key_unregistered"),
            },
            other => VerificationEvent::Error {
                error: other.to_string(),
                error_type: None,
            },
        }
    }
}

/// Receiving side of a subscription. Dropping it cancels the subscription.
pub struct Subscription {
    pub id: Uuid,
    events: mpsc::Receiver<VerificationEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<VerificationEvent> {
        self.events.recv().await
    }

    pub fn into_receiver(self) -> mpsc::Receiver<VerificationEvent> {
        self.events
    }
}

#[derive(Clone, Copy)]
struct Timing {
    timeout: Duration,
    heartbeat: Duration,
    code_sender_id: AccountId,
}

pub struct VerificationBroker {
    client: Arc<dyn AccountClient>,
    permits: Arc<Semaphore>,
    capacity: usize,
    timing: Timing,
    shutdown: CancellationToken,
}

impl VerificationBroker {
    pub fn new(client: Arc<dyn AccountClient>, config: &KeepaliveConfig) -> Self {
        Self {
            client,
            permits: Arc::new(Semaphore::new(config.subscription_capacity)),
            capacity: config.subscription_capacity,
            timing: Timing {
                timeout: config.subscription_timeout,
                heartbeat: config.subscription_heartbeat,
                code_sender_id: config.code_sender_id,
            },
            shutdown: CancellationToken::new(),
        }
    }

    /// Open a subscription for the next login code sent to `credential`'s account.
    ///
    /// Fails immediately with `CapacityExceeded` when every slot is taken.
    pub fn subscribe(&self, credential: Credential) -> Result<Subscription> {
        if credential.is_blank() {
            return Err(KeepaliveError::InvalidInput("credential must not be empty".into()));
        }
        let permit = Arc::clone(&self.permits).try_acquire_owned().map_err(|_| {
            warn!(capacity = self.capacity, "verification subscription limit reached");
            KeepaliveError::CapacityExceeded {
                capacity: self.capacity,
            }
        })?;

        let id = Uuid::new_v4();
        let (tx, events) = mpsc::channel(EVENT_BUFFER);
        info!(
            subscription = %id,
            active = self.active(),
            capacity = self.capacity,
            "verification subscription opened"
        );
        tokio::spawn(drive(
            Arc::clone(&self.client),
            credential,
            self.timing,
            permit,
            tx,
            self.shutdown.child_token(),
            id,
        ));
        Ok(Subscription { id, events })
    }

    pub fn active(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// End every open subscription with an `error` event.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Owns the permit and the upstream listener for one subscription; both are
/// released when this returns. Only this task sends on `tx` and it never
/// waits for the subscriber to make room.
async fn drive(
    client: Arc<dyn AccountClient>,
    credential: Credential,
    timing: Timing,
    _permit: OwnedSemaphorePermit,
    tx: mpsc::Sender<VerificationEvent>,
    shutdown: CancellationToken,
    id: Uuid,
) {
    let started = Instant::now();
    let deadline = started + timing.timeout;
    let timeout_secs = timing.timeout.as_secs();

    let opened = tokio::select! {
        _ = tx.closed() => {
            debug!(subscription = %id, "subscriber left before listener opened");
            return;
        }
        _ = tokio::time::sleep_until(deadline) => {
            let _ = tx.try_send(VerificationEvent::Timeout { timeout: timeout_secs });
            return;
        }
        opened = client.listen(&credential, timing.code_sender_id) => opened,
    };
    let mut messages: MessageStream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            warn!(subscription = %id, "failed to open code listener: {e}");
            let _ = tx.try_send(VerificationEvent::from_upstream(&e));
            return;
        }
    };
    if tx.try_send(VerificationEvent::Connected).is_err() {
        return;
    }

    let mut ticker = tokio::time::interval_at(started + timing.heartbeat, timing.heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let expiry = tokio::time::sleep_until(deadline);
    tokio::pin!(expiry);

    let terminal = loop {
        tokio::select! {
            biased;
            _ = tx.closed() => {
                info!(subscription = %id, "subscriber disconnected");
                return;
            }
            _ = shutdown.cancelled() => {
                break VerificationEvent::Error {
                    error: "server is shutting down".to_string(),
                    error_type: None,
                };
            }
            _ = &mut expiry => {
                info!(subscription = %id, "no verification code before deadline");
                break VerificationEvent::Timeout { timeout: timeout_secs };
            }
            next = messages.next() => match next {
                Some(Ok(msg)) => {
                    if msg.sender_id != timing.code_sender_id {
                        continue;
                    }
                    if let Some(code) = extract_code(&msg.text) {
                        info!(subscription = %id, "verification code received");
                        break VerificationEvent::Code { code: code.to_string() };
                    }
                    debug!(subscription = %id, "ignoring service message without a code");
                }
                Some(Err(e)) => {
                    warn!(subscription = %id, "code listener failed: {e}");
                    break VerificationEvent::from_upstream(&e);
                }
                None => {
                    break VerificationEvent::Error {
                        error: "listener closed unexpectedly".to_string(),
                        error_type: None,
                    };
                }
            },
            at = ticker.tick() => {
                // The last free slot belongs to the terminal event.
                if tx.capacity() <= 1 {
                    debug!(subscription = %id, "subscriber not reading, heartbeat skipped");
                    continue;
                }
                let elapsed = at.duration_since(started).as_secs();
                let heartbeat = VerificationEvent::Heartbeat {
                    elapsed,
                    remaining: timeout_secs.saturating_sub(elapsed),
                };
                if tx.try_send(heartbeat).is_err() {
                    return;
                }
            }
        }
    };
    drop(messages);
    let _ = tx.try_send(terminal);
}
