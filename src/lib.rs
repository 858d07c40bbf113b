pub mod actions;
pub mod app;
pub mod cli;
pub mod config;
pub mod errors;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod threading;
pub mod types;

pub use actions::{MailAction, UndoAction};
pub use config::SyncSettings;
pub use errors::{ApiError, SyncError};
pub use remote::MailApi;
pub use storage::Database;
pub use sync::MailboxManager;
