// src/core/protocol/storage.rs

//! Request and response records exchanged with the remote storage service.

use bincode::{Decode, Encode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum MessageKind {
    Text,
    Image,
    File,
}

/// A persisted chat message as returned by the storage service.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredMessage {
    pub message_id: i64,
    pub from_id: String,
    pub to_id: String,
    pub content: Vec<u8>,
    pub kind: MessageKind,
    pub is_group: bool,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct UserInfo {
    pub user_id: String,
    pub user_name: String,
    pub avatar_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum StoragePayload {
    StoreMessage {
        from_id: String,
        to_id: String,
        content: Vec<u8>,
        kind: MessageKind,
        is_group: bool,
        timestamp: i64,
    },
    QueryMessage {
        message_id: i64,
    },
    QuerySyncMessages {
        user_id: String,
        since: i64,
    },
    UpdateUserName {
        user_id: String,
        user_name: String,
    },
    UpdateUserAvatar {
        user_id: String,
        avatar_url: String,
    },
    QueryUser {
        user_id: String,
    },
    QueryFileExists {
        file_hash: String,
    },
}

/// A request published on the storage topic. Replies go to `from_topic`.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StorageRequest {
    pub request_id: String,
    pub from_topic: String,
    /// The user the eventual response is delivered to.
    pub target_user_id: String,
    pub payload: StoragePayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum StorageResult {
    Ok,
    RecordNotExist,
    ServiceError,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum StorageResponsePayload {
    Empty,
    StoredMessage { message_id: i64 },
    Message(StoredMessage),
    SyncMessages(Vec<StoredMessage>),
    User(UserInfo),
    FileExists { exists: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StorageResponse {
    pub request_id: String,
    pub result: StorageResult,
    pub target_user_id: String,
    pub payload: StorageResponsePayload,
}
