//! Configuration for the Courier CLI.
//!
//! The configuration is read from a `config.yml` file in a configuration directory. Every section
//! is optional, so an empty file yields the defaults:
//!
//! ```yaml
//! logging:
//!   level: debug
//! channel:
//!   endpoint: https://ingest.example.com/v2/track
//!   sending_interval_ms: 5000
//! statsd:
//!   host: 127.0.0.1:8125
//! ```
//!
//! Selected values can be overridden from the command line with [`OverridableConfig`].

#![warn(missing_docs)]

mod config;

pub use self::config::*;
