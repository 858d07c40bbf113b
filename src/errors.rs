use thiserror::Error;

/// Typed failures reported by the remote mail API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Cursor is too old or has too many diffs")]
    CursorInvalid,
    #[error("Message is not snoozed")]
    MessageNotSnoozed,
    #[error("Object not found")]
    ObjectNotFound,
    #[error("Sender identity not found")]
    IdentityNotFound,
    #[error("Network error: {0}")]
    Network(String),
    #[error("Server error {code}: {description}")]
    Server { code: String, description: String },
}

impl ApiError {
    /// The server already is where we wanted it to be; fix local state instead of failing.
    pub fn is_already_in_target_state(&self) -> bool {
        matches!(self, ApiError::MessageNotSnoozed | ApiError::ObjectNotFound)
    }

    /// Errors the user can fix (the local record must survive).
    pub fn is_identity_error(&self) -> bool {
        matches!(self, ApiError::IdentityNotFound)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Network(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Sync cancelled")]
    Cancelled,
    #[error("Folder not found: {0}")]
    FolderNotFound(String),
}
