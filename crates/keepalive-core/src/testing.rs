//! In-memory doubles for the upstream client and notifier.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::credential::Credential;
use crate::error::UpstreamError;
use crate::notify::{Notification, Notifier};
use crate::upstream::{
    AccountClient, AccountId, AccountInfo, InboundMessage, LoginChallenge, MessageStream,
    SignInOutcome,
};

type Listener = mpsc::UnboundedSender<Result<InboundMessage, UpstreamError>>;

struct FakeAccount {
    account_id: AccountId,
    code: String,
    password: Option<String>,
}

#[derive(Default)]
struct FakeState {
    accounts: HashMap<String, FakeAccount>,
    challenges: HashMap<String, String>,
    /// credential -> (account, revoked)
    credentials: HashMap<String, (AccountId, bool)>,
    listeners: HashMap<String, Vec<Listener>>,
    next_sign_in_error: Option<UpstreamError>,
    issued: u64,
    cancelled: usize,
    sign_in_calls: usize,
    probes: HashMap<String, usize>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
}

/// Scripted platform: accounts log in with a fixed code (and optional
/// password), credentials can be revoked and restored, and messages can be
/// pushed to open listeners.
#[derive(Default)]
pub struct FakeClient {
    state: Mutex<FakeState>,
    latency: Mutex<Duration>,
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn delay(&self) {
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    pub fn add_account(
        &self,
        phone: &str,
        account_id: AccountId,
        code: &str,
        password: Option<&str>,
    ) {
        self.state().accounts.insert(
            phone.to_string(),
            FakeAccount {
                account_id,
                code: code.to_string(),
                password: password.map(str::to_string),
            },
        );
    }

    /// Register a fresh, valid credential for `account_id`.
    pub fn add_credential(&self, account_id: AccountId) -> Credential {
        let mut state = self.state();
        Self::issue(&mut state, account_id)
    }

    fn issue(state: &mut FakeState, account_id: AccountId) -> Credential {
        state.issued += 1;
        let value = format!("fake-session-{account_id}-{}", state.issued);
        state.credentials.insert(value.clone(), (account_id, false));
        Credential::new(value)
    }

    pub fn revoke(&self, credential: &Credential) {
        if let Some(entry) = self.state().credentials.get_mut(credential.expose()) {
            entry.1 = true;
        }
    }

    pub fn restore(&self, credential: &Credential) {
        if let Some(entry) = self.state().credentials.get_mut(credential.expose()) {
            entry.1 = false;
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Make the next `sign_in` fail with `err`.
    pub fn fail_sign_in(&self, err: UpstreamError) {
        self.state().next_sign_in_error = Some(err);
    }

    pub fn push_message(&self, credential: &Credential, sender_id: AccountId, text: &str) {
        let mut state = self.state();
        if let Some(listeners) = state.listeners.get_mut(credential.expose()) {
            listeners.retain(|tx| {
                tx.send(Ok(InboundMessage {
                    sender_id,
                    text: text.to_string(),
                }))
                .is_ok()
            });
        }
    }

    /// Fail and close every listener for `credential`.
    pub fn break_listeners(&self, credential: &Credential, err: UpstreamError) {
        if let Some(listeners) = self.state().listeners.remove(credential.expose()) {
            for tx in listeners {
                let _ = tx.send(Err(err.clone()));
            }
        }
    }

    pub fn active_listeners(&self, credential: &Credential) -> usize {
        self.state()
            .listeners
            .get(credential.expose())
            .map(|l| l.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn cancelled_logins(&self) -> usize {
        self.state().cancelled
    }

    pub fn sign_in_calls(&self) -> usize {
        self.state().sign_in_calls
    }

    pub fn probe_count(&self, credential: &Credential) -> usize {
        self.state().probes.get(credential.expose()).copied().unwrap_or(0)
    }

    /// Highest number of overlapping `get_me` calls seen for `credential`.
    pub fn max_concurrent_probes(&self, credential: &Credential) -> usize {
        self.state()
            .max_in_flight
            .get(credential.expose())
            .copied()
            .unwrap_or(0)
    }

    fn account_for(
        &self,
        challenge: &LoginChallenge,
    ) -> Result<(AccountId, String, Option<String>), UpstreamError> {
        let state = self.state();
        let phone = state
            .challenges
            .get(&challenge.token)
            .ok_or_else(|| UpstreamError::Rejected("unknown login token".into()))?;
        let account = state
            .accounts
            .get(phone)
            .ok_or_else(|| UpstreamError::Rejected("unknown phone".into()))?;
        Ok((account.account_id, account.code.clone(), account.password.clone()))
    }
}

#[async_trait]
impl AccountClient for FakeClient {
    async fn send_code(&self, phone: &str) -> Result<LoginChallenge, UpstreamError> {
        self.delay().await;
        let mut state = self.state();
        if !state.accounts.contains_key(phone) {
            return Err(UpstreamError::Rejected("phone number is invalid".into()));
        }
        let token = Uuid::new_v4().to_string();
        state.challenges.insert(token.clone(), phone.to_string());
        Ok(LoginChallenge { token })
    }

    async fn sign_in(
        &self,
        challenge: &LoginChallenge,
        code: &str,
    ) -> Result<SignInOutcome, UpstreamError> {
        self.state().sign_in_calls += 1;
        self.delay().await;
        if let Some(err) = self.state().next_sign_in_error.take() {
            return Err(err);
        }
        let (account_id, expected, password) = self.account_for(challenge)?;
        if code != expected {
            return Err(UpstreamError::CodeInvalid);
        }
        if password.is_some() {
            return Ok(SignInOutcome::PasswordRequired);
        }
        let credential = Self::issue(&mut self.state(), account_id);
        Ok(SignInOutcome::Authorized {
            credential,
            account_id,
        })
    }

    async fn check_password(
        &self,
        challenge: &LoginChallenge,
        password: &str,
    ) -> Result<(Credential, AccountId), UpstreamError> {
        self.delay().await;
        let (account_id, _, expected) = self.account_for(challenge)?;
        if expected.as_deref() != Some(password) {
            return Err(UpstreamError::PasswordInvalid);
        }
        Ok((Self::issue(&mut self.state(), account_id), account_id))
    }

    async fn cancel_login(&self, challenge: &LoginChallenge) -> Result<(), UpstreamError> {
        let mut state = self.state();
        state.challenges.remove(&challenge.token);
        state.cancelled += 1;
        Ok(())
    }

    async fn get_me(&self, credential: &Credential) -> Result<AccountInfo, UpstreamError> {
        let key = credential.expose().to_string();
        {
            let mut state = self.state();
            *state.probes.entry(key.clone()).or_default() += 1;
            let now = {
                let n = state.in_flight.entry(key.clone()).or_default();
                *n += 1;
                *n
            };
            let max = state.max_in_flight.entry(key.clone()).or_default();
            *max = (*max).max(now);
        }
        self.delay().await;

        let mut state = self.state();
        if let Some(n) = state.in_flight.get_mut(&key) {
            *n -= 1;
        }
        match state.credentials.get(&key) {
            Some((account_id, false)) => Ok(AccountInfo {
                account_id: *account_id,
                username: Some(format!("user{account_id}")),
                phone: None,
                first_name: None,
                last_name: None,
            }),
            Some((_, true)) => Err(UpstreamError::Unauthorized("AUTH_KEY_UNREGISTERED".into())),
            None => Err(UpstreamError::Unauthorized("session string is not valid".into())),
        }
    }

    async fn listen(
        &self,
        credential: &Credential,
        _from_user: AccountId,
    ) -> Result<MessageStream, UpstreamError> {
        let mut state = self.state();
        match state.credentials.get(credential.expose()) {
            Some((_, false)) => {}
            _ => return Err(UpstreamError::Unauthorized("AUTH_KEY_UNREGISTERED".into())),
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state
            .listeners
            .entry(credential.expose().to_string())
            .or_default()
            .push(tx);
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }
}

/// Notifier that keeps every notification for later inspection.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(i64, Uuid, Notification)>>,
}

impl RecordingNotifier {
    pub fn all(&self) -> Vec<(i64, Uuid, Notification)> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn for_task(&self, uuid: Uuid) -> Vec<Notification> {
        self.all()
            .into_iter()
            .filter(|(_, u, _)| *u == uuid)
            .map(|(_, _, n)| n)
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, target: i64, uuid: Uuid, notification: Notification) {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((target, uuid, notification));
    }
}
