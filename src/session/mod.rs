//! Sessions: the shared handle every request set and scheduler is bound to

pub mod config;
pub mod handle;
pub mod stats;

pub use config::SessionConfig;
pub use handle::{Session, SessionId};
pub use stats::{SessionStats, SessionStatsSnapshot};
