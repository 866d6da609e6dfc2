//! Interactive login flows: phone -> code -> optional two-factor password.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::credential::Credential;
use crate::error::{KeepaliveError, Result, UpstreamError};
use crate::upstream::{AccountClient, AccountId, LoginChallenge, SignInOutcome};

const SESSION_ID_BYTES: usize = 32;
const MIN_PHONE_DIGITS: usize = 5;
const MAX_PHONE_DIGITS: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    AwaitingCode,
    AwaitingPassword,
    Authenticated,
    Expired,
}

/// Result of submitting a login code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeOutcome {
    Authenticated {
        credential: Credential,
        account_id: AccountId,
    },
    PasswordRequired,
}

struct LoginSession {
    phone: String,
    state: AuthState,
    challenge: LoginChallenge,
    expires_at: Instant,
}

impl LoginSession {
    fn is_live(&self, now: Instant) -> bool {
        matches!(self.state, AuthState::AwaitingCode | AuthState::AwaitingPassword)
            && now < self.expires_at
    }
}

type SessionRef = Arc<Mutex<LoginSession>>;

/// Registry of in-flight login flows.
///
/// Each flow sits behind its own mutex: calls on one session id are
/// serialized, calls on different ids never contend.
pub struct LoginManager {
    client: Arc<dyn AccountClient>,
    ttl: Duration,
    sessions: DashMap<String, SessionRef>,
}

impl LoginManager {
    pub fn new(client: Arc<dyn AccountClient>, ttl: Duration) -> Self {
        Self {
            client,
            ttl,
            sessions: DashMap::new(),
        }
    }

    /// Ask the platform for a login code and open a flow for `phone`.
    pub async fn start(&self, phone: &str) -> Result<String> {
        let phone = normalize_phone(phone)?;
        let challenge = self.client.send_code(&phone).await?;

        let session = Arc::new(Mutex::new(LoginSession {
            phone,
            state: AuthState::AwaitingCode,
            challenge,
            expires_at: Instant::now() + self.ttl,
        }));
        loop {
            let id = new_session_id();
            if let Entry::Vacant(slot) = self.sessions.entry(id.clone()) {
                slot.insert(session);
                info!(active = self.sessions.len(), "login session started");
                return Ok(id);
            }
        }
    }

    pub async fn submit_code(&self, session_id: &str, code: &str) -> Result<CodeOutcome> {
        let code = code.trim();
        if code.is_empty() {
            return Err(KeepaliveError::InvalidInput("code must not be empty".into()));
        }
        let session = self.lookup(session_id)?;
        let mut guard = session.lock().await;
        self.ensure_live(session_id, &session, &mut guard).await?;
        if guard.state != AuthState::AwaitingCode {
            return Err(KeepaliveError::InvalidInput(
                "login is waiting for the two-factor password".into(),
            ));
        }

        let result = self.client.sign_in(&guard.challenge, code).await;
        match result {
            Ok(SignInOutcome::Authorized {
                credential,
                account_id,
            }) => {
                guard.state = AuthState::Authenticated;
                self.discard(session_id, &session);
                info!(account_id, "login completed with code");
                Ok(CodeOutcome::Authenticated {
                    credential,
                    account_id,
                })
            }
            Ok(SignInOutcome::PasswordRequired) => {
                guard.state = AuthState::AwaitingPassword;
                debug!("login requires two-factor password");
                Ok(CodeOutcome::PasswordRequired)
            }
            Err(UpstreamError::CodeInvalid) => Err(KeepaliveError::ChallengeRejected(
                "verification code is invalid or expired".into(),
            )),
            Err(e) => {
                self.abort(session_id, &session, &mut guard).await;
                Err(e.into())
            }
        }
    }

    pub async fn submit_password(
        &self,
        session_id: &str,
        password: &str,
    ) -> Result<(Credential, AccountId)> {
        if password.trim().is_empty() {
            return Err(KeepaliveError::InvalidInput("password must not be empty".into()));
        }
        let session = self.lookup(session_id)?;
        let mut guard = session.lock().await;
        self.ensure_live(session_id, &session, &mut guard).await?;
        if guard.state != AuthState::AwaitingPassword {
            return Err(KeepaliveError::InvalidInput(
                "login is not waiting for a password".into(),
            ));
        }

        let result = self.client.check_password(&guard.challenge, password).await;
        match result {
            Ok((credential, account_id)) => {
                guard.state = AuthState::Authenticated;
                self.discard(session_id, &session);
                info!(account_id, "login completed with password");
                Ok((credential, account_id))
            }
            Err(UpstreamError::PasswordInvalid) => Err(KeepaliveError::ChallengeRejected(
                "two-factor password is invalid".into(),
            )),
            Err(e) => {
                self.abort(session_id, &session, &mut guard).await;
                Err(e.into())
            }
        }
    }

    /// State of a live session, or `None` if it is gone or expired.
    pub async fn state(&self, session_id: &str) -> Option<AuthState> {
        let session = self.lookup(session_id).ok()?;
        let guard = session.lock().await;
        guard.is_live(Instant::now()).then_some(guard.state)
    }

    pub fn active(&self) -> usize {
        self.sessions.len()
    }

    /// Expire and release every session past its deadline.
    ///
    /// Sessions whose lock is held by an in-progress call are skipped; the
    /// call itself re-checks expiry.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        for entry in self.sessions.iter() {
            let Ok(mut guard) = entry.value().try_lock() else {
                continue;
            };
            if guard.is_live(now) {
                continue;
            }
            guard.state = AuthState::Expired;
            expired.push((entry.key().clone(), entry.value().clone(), guard.challenge.clone()));
        }

        let mut released = 0;
        for (id, session, challenge) in expired {
            if self.discard(&id, &session) {
                self.release(&challenge).await;
                released += 1;
            }
        }
        if released > 0 {
            info!(released, active = self.sessions.len(), "expired login sessions swept");
        }
        released
    }

    pub fn spawn_sweeper(
        self: &Arc<Self>,
        every: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.sweep_expired().await;
                    }
                }
            }
        })
    }

    /// Release every pending login. Used on shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let Some((_, session)) = self.sessions.remove(&id) else {
                continue;
            };
            let mut guard = session.lock().await;
            guard.state = AuthState::Expired;
            self.release(&guard.challenge).await;
        }
    }

    fn lookup(&self, session_id: &str) -> Result<SessionRef> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(KeepaliveError::SessionNotFound)
    }

    async fn ensure_live(
        &self,
        session_id: &str,
        session: &SessionRef,
        guard: &mut LoginSession,
    ) -> Result<()> {
        if guard.is_live(Instant::now()) {
            return Ok(());
        }
        if guard.state != AuthState::Authenticated && guard.state != AuthState::Expired {
            guard.state = AuthState::Expired;
            if self.discard(session_id, session) {
                self.release(&guard.challenge).await;
            }
        }
        Err(KeepaliveError::SessionNotFound)
    }

    async fn abort(&self, session_id: &str, session: &SessionRef, guard: &mut LoginSession) {
        warn!(phone = %mask_phone(&guard.phone), "login aborted after upstream error");
        guard.state = AuthState::Expired;
        if self.discard(session_id, session) {
            self.release(&guard.challenge).await;
        }
    }

    /// Remove the map entry if it still refers to `session`.
    fn discard(&self, session_id: &str, session: &SessionRef) -> bool {
        self.sessions
            .remove_if(session_id, |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    async fn release(&self, challenge: &LoginChallenge) {
        if let Err(e) = self.client.cancel_login(challenge).await {
            debug!("failed to release login upstream: {e}");
        }
    }
}

fn new_session_id() -> String {
    let bytes: [u8; SESSION_ID_BYTES] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Strip spaces and dashes; require an optional `+` followed by digits.
pub fn normalize_phone(raw: &str) -> Result<String> {
    let cleaned: String = raw.chars().filter(|c| *c != ' ' && *c != '-').collect();
    let digits = cleaned.strip_prefix('+').unwrap_or(&cleaned);
    if digits.is_empty() {
        return Err(KeepaliveError::InvalidInput("phone number must not be empty".into()));
    }
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(KeepaliveError::InvalidInput(
            "phone number must contain only digits and an optional leading +".into(),
        ));
    }
    if !(MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits.len()) {
        return Err(KeepaliveError::InvalidInput(format!(
            "phone number must have {MIN_PHONE_DIGITS} to {MAX_PHONE_DIGITS} digits"
        )));
    }
    Ok(cleaned)
}

fn mask_phone(phone: &str) -> String {
    let keep = phone.len().saturating_sub(4);
    format!("{}****", &phone[..keep])
}
