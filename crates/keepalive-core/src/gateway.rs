//! [`AccountClient`] backed by an account gateway process on a Unix socket.
//!
//! Each call opens a connection, writes one JSON-lines request and reads one
//! response. `listen` keeps its connection open and turns the following
//! event lines into a message stream; closing the stream closes the socket,
//! which tells the gateway to stop listening.
//!
//! Calls are spaced at least `min_interval` apart. A flood-wait reply is
//! retried once after the requested wait plus a short margin, unless the
//! wait exceeds `flood_wait_limit`.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use keepalive_protocol::{
    Authorized, ErrorCode, Event, MAX_LINE_BYTES, Request, Response, SentCode, SignIn,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, warn};

use crate::credential::Credential;
use crate::error::UpstreamError;
use crate::upstream::{
    AccountClient, AccountId, AccountInfo, InboundMessage, LoginChallenge, MessageStream,
    SignInOutcome,
};

pub const DEFAULT_MAX_CONCURRENT: usize = 10;
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_FLOOD_WAIT_LIMIT: Duration = Duration::from_secs(300);
const FLOOD_WAIT_MARGIN: Duration = Duration::from_secs(5);

type Reader = FramedRead<OwnedReadHalf, LinesCodec>;
type Writer = FramedWrite<OwnedWriteHalf, LinesCodec>;

pub struct GatewayClient {
    socket_path: PathBuf,
    limiter: Arc<Semaphore>,
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
    flood_wait_limit: Duration,
}

impl GatewayClient {
    pub fn new(socket_path: impl Into<PathBuf>, max_concurrent: usize) -> Self {
        Self {
            socket_path: socket_path.into(),
            limiter: Arc::new(Semaphore::new(max_concurrent.max(1))),
            min_interval: DEFAULT_MIN_INTERVAL,
            last_request: Mutex::new(None),
            flood_wait_limit: DEFAULT_FLOOD_WAIT_LIMIT,
        }
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    /// Longest flood wait that is sat out and retried; longer ones fail at once.
    pub fn with_flood_wait_limit(mut self, limit: Duration) -> Self {
        self.flood_wait_limit = limit;
        self
    }

    /// Take a concurrency slot, then wait until `min_interval` has passed
    /// since the previous request started.
    async fn admit(&self) -> Result<SemaphorePermit<'_>, UpstreamError> {
        let permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| UpstreamError::Unavailable("gateway client closed".into()))?;
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            tokio::time::sleep_until(prev + self.min_interval).await;
        }
        *last = Some(Instant::now());
        Ok(permit)
    }

    async fn connect(&self) -> Result<(Reader, Writer), UpstreamError> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            UpstreamError::Unavailable(format!(
                "failed to connect {}: {e}",
                self.socket_path.display()
            ))
        })?;
        let (read_half, write_half) = stream.into_split();
        Ok((
            FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
            FramedWrite::new(write_half, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
        ))
    }

    /// Send `req` and return the `data` of the first non-event reply.
    async fn request_data(
        &self,
        req: &Request,
    ) -> Result<(Option<Value>, Reader, Writer), UpstreamError> {
        let (mut reader, mut writer) = self.connect().await?;
        let line = serde_json::to_string(req)
            .map_err(|e| UpstreamError::Unavailable(format!("failed to encode request: {e}")))?;
        writer
            .send(line)
            .await
            .map_err(|e| UpstreamError::Unavailable(format!("failed to send request: {e}")))?;

        loop {
            match read_response(&mut reader).await? {
                Response::Ok { data } => return Ok((data, reader, writer)),
                Response::Error {
                    message,
                    code,
                    retry_after_secs,
                } => return Err(map_error(code, message, retry_after_secs)),
                Response::Event(_) => continue,
            }
        }
    }

    async fn call<T: DeserializeOwned>(&self, req: Request) -> Result<T, UpstreamError> {
        match self.call_once(&req).await {
            Err(UpstreamError::RateLimited { retry_after_secs }) => {
                let wait = Duration::from_secs(retry_after_secs.unwrap_or(0)) + FLOOD_WAIT_MARGIN;
                if wait > self.flood_wait_limit {
                    return Err(UpstreamError::RateLimited { retry_after_secs });
                }
                warn!(wait_secs = wait.as_secs(), "gateway flood wait, retrying once");
                tokio::time::sleep(wait).await;
                self.call_once(&req).await
            }
            other => other,
        }
    }

    async fn call_once<T: DeserializeOwned>(&self, req: &Request) -> Result<T, UpstreamError> {
        let _permit = self.admit().await?;
        let (data, _, _) = self.request_data(req).await?;
        decode(data)
    }
}

async fn read_response(reader: &mut Reader) -> Result<Response, UpstreamError> {
    let Some(line) = reader.next().await else {
        return Err(UpstreamError::Unavailable("gateway disconnected".into()));
    };
    let line =
        line.map_err(|e| UpstreamError::Unavailable(format!("failed to read response: {e}")))?;
    serde_json::from_str(&line)
        .map_err(|e| UpstreamError::Unavailable(format!("malformed gateway response: {e}")))
}

fn decode<T: DeserializeOwned>(data: Option<Value>) -> Result<T, UpstreamError> {
    serde_json::from_value(data.unwrap_or(Value::Null))
        .map_err(|e| UpstreamError::Unavailable(format!("unexpected gateway payload: {e}")))
}

fn map_error(code: ErrorCode, message: String, retry_after_secs: Option<u64>) -> UpstreamError {
    match code {
        ErrorCode::CodeInvalid => UpstreamError::CodeInvalid,
        ErrorCode::PasswordInvalid => UpstreamError::PasswordInvalid,
        ErrorCode::Unauthorized => UpstreamError::Unauthorized(message),
        ErrorCode::FloodWait => UpstreamError::RateLimited { retry_after_secs },
        ErrorCode::InvalidRequest => UpstreamError::Rejected(message),
        ErrorCode::ServerError => UpstreamError::Unavailable(message),
    }
}

#[async_trait]
impl AccountClient for GatewayClient {
    async fn send_code(&self, phone: &str) -> Result<LoginChallenge, UpstreamError> {
        let sent: SentCode = self
            .call(Request::SendCode {
                phone: phone.to_string(),
            })
            .await?;
        Ok(LoginChallenge {
            token: sent.login_token,
        })
    }

    async fn sign_in(
        &self,
        challenge: &LoginChallenge,
        code: &str,
    ) -> Result<SignInOutcome, UpstreamError> {
        let result: SignIn = self
            .call(Request::SignIn {
                login_token: challenge.token.clone(),
                code: code.to_string(),
            })
            .await?;
        Ok(match result {
            SignIn::Authorized(Authorized {
                session,
                account_id,
            }) => SignInOutcome::Authorized {
                credential: Credential::new(session),
                account_id,
            },
            SignIn::PasswordRequired => SignInOutcome::PasswordRequired,
        })
    }

    async fn check_password(
        &self,
        challenge: &LoginChallenge,
        password: &str,
    ) -> Result<(Credential, AccountId), UpstreamError> {
        let auth: Authorized = self
            .call(Request::CheckPassword {
                login_token: challenge.token.clone(),
                password: password.to_string(),
            })
            .await?;
        Ok((Credential::new(auth.session), auth.account_id))
    }

    async fn cancel_login(&self, challenge: &LoginChallenge) -> Result<(), UpstreamError> {
        let _: Value = self
            .call(Request::CancelLogin {
                login_token: challenge.token.clone(),
            })
            .await?;
        Ok(())
    }

    async fn get_me(&self, credential: &Credential) -> Result<AccountInfo, UpstreamError> {
        self.call(Request::GetMe {
            session: credential.expose().to_string(),
        })
        .await
    }

    async fn listen(
        &self,
        credential: &Credential,
        from_user: AccountId,
    ) -> Result<MessageStream, UpstreamError> {
        let (_, reader, writer) = {
            let _permit = self.admit().await?;
            self.request_data(&Request::Listen {
                session: credential.expose().to_string(),
                from_user,
            })
            .await?
        };
        debug!(from_user, "gateway listener opened");

        // The writer rides along in the stream state so the socket stays open
        // until the stream is dropped.
        let stream = futures_util::stream::unfold(
            Some((reader, writer)),
            |state| async move {
                let (mut reader, writer) = state?;
                match read_response(&mut reader).await {
                    Ok(Response::Event(Event::Message { sender_id, text })) => Some((
                        Ok(InboundMessage { sender_id, text }),
                        Some((reader, writer)),
                    )),
                    Ok(Response::Error {
                        message,
                        code,
                        retry_after_secs,
                    }) => Some((Err(map_error(code, message, retry_after_secs)), None)),
                    Ok(Response::Ok { .. }) => Some((
                        Err(UpstreamError::Unavailable("unexpected reply on listener".into())),
                        None,
                    )),
                    Err(e) => Some((Err(e), None)),
                }
            },
        );
        Ok(stream.boxed())
    }
}
