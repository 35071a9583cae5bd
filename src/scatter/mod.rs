//! Batch scatter-access engine
//!
//! - [`ScatterRequestSet`]: one batch, one transport round trip per execute
//! - [`ScatterCompletion`] / [`CompletionReceiver`]: per-read notifications
//! - [`ScatterRoundMap`]: ordered rounds for dependent, multi-hop reads
//! - [`RoundMapHandle`]: weak reference receivers use to add rounds

pub mod dispatch;
pub mod request;
pub mod round_map;
pub mod set;

pub use dispatch::{CompletionReceiver, ScatterCompletion};
pub use request::{PreparedRequest, RequestKind, SetState};
pub use round_map::{RoundMapHandle, ScatterRoundMap};
pub use set::ScatterRequestSet;
