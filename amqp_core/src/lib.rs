//! AMQP 1.0 client transport core.
//!
//! This library is based on async tokio runtime. It drives a protocol engine through a
//! single-threaded dispatcher and layers recovery on top of it: cached connections and
//! `$cbs` channels that are replaced once closed, a message stream that survives link
//! failures, and a sender that retries deliveries until they are settled.
//!
//! The protocol engine itself is plugged in through the traits of [`engine`].
//!
pub mod engine;
mod net;
mod api;

// public API
pub use api::*;
pub use net::ShutdownSignal;

#[cfg(test)]
mod test_utils;
