//! The Courier command line.
//!
//! Courier reads metric values from standard input, aggregates them in memory and transmits the
//! aggregates to a telemetry ingestion endpoint. It doubles as a harness for exercising the
//! aggregation engine and the transmission channel end to end.
//!
//! # Usage
//!
//! ```text
//! $ courier config init --config ./courier
//! $ printf 'app/latency 12.5 route=/home\ntrace deployment finished\n' \
//!     | courier run --config ./courier --endpoint http://localhost:3000/v2/track
//! ```
//!
//! Every input line is either a metric value `name value [dimension=value ...]` or a message
//! starting with `trace `. Metric names may carry a namespace separated by a slash. On the end of
//! input, Courier completes the current aggregation period and sends everything still buffered.

mod cli;
mod cliapp;
mod input;
mod pipeline;
mod setup;

use std::process;

pub fn main() {
    let exit_code = match cli::execute() {
        Ok(()) => 0,
        Err(err) => {
            courier_log::ensure_error(&err);
            1
        }
    };

    process::exit(exit_code);
}
