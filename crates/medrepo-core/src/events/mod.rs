//! Change events for committed resource writes.
//!
//! ```text
//!   ResourceRepository ──commit──▶ publish(ChangeEvent)
//!                                     │
//!                     ┌───────────────┼────────────────┐
//!                     ▼                                ▼
//!              EventBroadcaster                Subscription dispatcher
//!           (broadcast, may lag)             (unbounded, lossless sink)
//! ```
//!
//! - [`types`]: `ChangeEvent` and `ChangeKind`
//! - [`broadcaster`]: the `ChangeEventSink` trait and the broadcast sink

pub mod broadcaster;
pub mod types;

pub use broadcaster::{ChangeEventSink, EventBroadcaster, EventError};
pub use types::{ChangeEvent, ChangeKind};
