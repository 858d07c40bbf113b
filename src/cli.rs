use clap::{Parser, Subcommand};

/// Inspects and maintains the local store of one mailbox.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Owner of the mailbox (first half of the store file name).
    #[arg(long)]
    pub user: String,

    /// Mailbox id (second half of the store file name).
    #[arg(long)]
    pub mailbox: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List folders with their counters and sync state.
    Folders,
    /// List the threads of a folder, newest first.
    Threads {
        folder: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Recompute every thread and unread counter from stored messages.
    Recompute,
    /// Drop a folder's local content; the next sync starts from scratch.
    Reset { folder: String },
    /// Search stored messages by subject or sender.
    Search { text: String },
}
