//! Seam between the core and the remote chat platform.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::credential::Credential;
use crate::error::UpstreamError;

pub use keepalive_protocol::{AccountId, AccountInfo};

/// Continuation token for a login the platform has sent a code for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginChallenge {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignInOutcome {
    Authorized {
        credential: Credential,
        account_id: AccountId,
    },
    PasswordRequired,
}

/// A raw message delivered to a listening account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub sender_id: AccountId,
    pub text: String,
}

/// Inbound messages for one account; dropping the stream releases the listener.
pub type MessageStream = BoxStream<'static, Result<InboundMessage, UpstreamError>>;

/// Primitive operations the platform offers.
#[async_trait]
pub trait AccountClient: Send + Sync {
    async fn send_code(&self, phone: &str) -> Result<LoginChallenge, UpstreamError>;

    async fn sign_in(
        &self,
        challenge: &LoginChallenge,
        code: &str,
    ) -> Result<SignInOutcome, UpstreamError>;

    /// Finish a login that requires the two-factor password.
    async fn check_password(
        &self,
        challenge: &LoginChallenge,
        password: &str,
    ) -> Result<(Credential, AccountId), UpstreamError>;

    /// Release a half-finished login.
    async fn cancel_login(&self, challenge: &LoginChallenge) -> Result<(), UpstreamError>;

    /// Read-only identity probe; also serves as the keepalive heartbeat.
    async fn get_me(&self, credential: &Credential) -> Result<AccountInfo, UpstreamError>;

    /// Open a listener for messages sent to the account by `from_user`.
    async fn listen(
        &self,
        credential: &Credential,
        from_user: AccountId,
    ) -> Result<MessageStream, UpstreamError>;
}
