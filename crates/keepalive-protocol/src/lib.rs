use serde::{Deserialize, Serialize};

/// Maximum size of a JSON-lines frame on the gateway socket (64 KiB).
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Numeric identity of a remote account.
pub type AccountId = i64;

/// Requests sent to the account gateway as JSON lines.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    /// Ask the platform to send a login code to `phone`.
    SendCode { phone: String },
    /// Complete a pending login with the code the user received.
    SignIn { login_token: String, code: String },
    /// Complete a pending login with the two-factor password.
    CheckPassword {
        login_token: String,
        password: String,
    },
    /// Drop a pending login and its upstream connection.
    CancelLogin { login_token: String },
    /// Read-only identity probe for an authorized session.
    GetMe { session: String },
    /// Keep the connection open and stream inbound messages from `from_user`.
    Listen { session: String, from_user: AccountId },
}

/// Gateway-to-client lines.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        message: String,
        code: ErrorCode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
    Event(Event),
}

/// Events streamed on a `listen` connection.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Message { sender_id: AccountId, text: String },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Wrong or expired login code.
    CodeInvalid,
    /// Wrong two-factor password.
    PasswordInvalid,
    /// Session revoked, expired, or never authorized.
    Unauthorized,
    /// Platform flood control; see `retry_after_secs`.
    FloodWait,
    /// Malformed phone number, unknown login token, and similar.
    InvalidRequest,
    ServerError,
}

/// Payload of a successful `send_code`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SentCode {
    pub login_token: String,
}

/// Payload of a successful `sign_in`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SignIn {
    Authorized(Authorized),
    PasswordRequired,
}

/// A finished login: the reusable session string and who it belongs to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Authorized {
    pub session: String,
    pub account_id: AccountId,
}

/// Payload of a successful `get_me`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    pub account_id: AccountId,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}
