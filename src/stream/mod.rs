//! Per-stream state machines
//!
//! [`Broadcaster`] and [`Relayer`] share the [`ListenerSet`] fan-out and
//! differ only in where frames come from: a local producer or an upstream
//! connection. [`Subscriber`] is the leaf that hands segments to a callback.

pub mod broadcaster;
pub mod fanout;
pub mod relayer;
pub mod subscriber;

pub use broadcaster::Broadcaster;
pub use fanout::ListenerSet;
pub use relayer::Relayer;
pub use subscriber::{SegmentCallback, Subscriber, SubscriptionHandle};
