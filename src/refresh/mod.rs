//! Background cache refresh
//!
//! A refresh loop periodically tells the transport to refresh one cache
//! category for one session. Loops are keyed by (session, option) in a
//! process-wide registry; at most one loop exists per key. Disposing a
//! session stops all of its loops.

pub mod option;
pub mod scheduler;

pub use option::RefreshOption;
pub use scheduler::{
    is_registered, register, register_default, registered_count, registered_for, unregister,
    unregister_all,
};
