pub mod app;
pub mod autoresponder;
pub mod checkpoint;
pub mod config;
pub mod credentials;
pub mod email;
pub mod filter;
pub mod imap_store;
pub mod local;
pub mod remote;
pub mod shutdown;
pub mod store;
pub mod sync;
pub mod watch;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use app::{App, AppError, AppResult};
pub use config::{Config, SyncMode};
pub use email::{MailError, Uid};
pub use shutdown::Shutdown;
pub use sync::{SyncEngine, SyncReport};
pub use watch::{WatchSettings, WatchState, WatchSupervisor};
