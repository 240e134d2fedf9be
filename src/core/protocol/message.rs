// src/core/protocol/message.rs

//! Client-facing request and response messages carried in binary WebSocket frames.

use super::storage::{MessageKind, StorageResponse};
use bincode::{Decode, Encode};

/// A chat message from one user to another.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Post {
    /// Overwritten by the gateway with the authenticated sender.
    pub from_id: String,
    pub to_id: String,
    pub content: Vec<u8>,
    pub kind: MessageKind,
    pub is_group: bool,
    pub timestamp: i64,
}

/// How a login proves the caller's identity.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum Credential {
    Password(String),
    Token(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum RequestPayload {
    Login {
        account: String,
        credential: Credential,
    },
    Signup {
        account: String,
        password: String,
        user_name: String,
    },
    Logout,
    Post(Post),
    QueryUser {
        user_id: String,
    },
    UpdateUserName {
        user_name: String,
    },
    UpdateUserAvatar {
        avatar_url: String,
    },
    QueryMessage {
        message_id: i64,
    },
    QuerySyncMessages {
        since: i64,
    },
    QueryFileExists {
        file_hash: String,
    },
}

impl RequestPayload {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            RequestPayload::Login { .. } => "login",
            RequestPayload::Signup { .. } => "signup",
            RequestPayload::Logout => "logout",
            RequestPayload::Post(_) => "post",
            RequestPayload::QueryUser { .. } => "query_user",
            RequestPayload::UpdateUserName { .. } => "update_user_name",
            RequestPayload::UpdateUserAvatar { .. } => "update_user_avatar",
            RequestPayload::QueryMessage { .. } => "query_message",
            RequestPayload::QuerySyncMessages { .. } => "query_sync_messages",
            RequestPayload::QueryFileExists { .. } => "query_file_exists",
        }
    }
}

/// One client frame. `token` is the session token issued at login.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct RequestMessage {
    pub token: String,
    pub payload: RequestPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum LoginResult {
    Ok,
    AccountNotExist,
    PasswordError,
    TokenError,
    ServiceError,
    /// The session could not be bound yet; the client should retry.
    TryAgain,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct LoginResponse {
    pub result: LoginResult,
    pub token: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum SignupResult {
    Ok,
    AccountExist,
    AccountEmpty,
    PasswordEmpty,
    AccountTooLong,
    ServiceError,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SignupResponse {
    pub result: SignupResult,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum ResponseMessage {
    Login(LoginResponse),
    Signup(SignupResponse),
    Post(Post),
    Refused { reason: String },
    Storage(StorageResponse),
    ServerError { message: String },
}
