//! Common functionality for Courier.
//!
//! This crate holds the small concurrency primitives shared by the aggregation engine and the
//! transmission channel, as well as utilities to deal with wall-clock time.
#![warn(missing_docs)]

mod random;
mod throttle;
pub mod time;

pub use self::random::*;
pub use self::throttle::*;
