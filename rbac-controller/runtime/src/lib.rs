#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod admin;
mod args;
mod metrics;
mod sync;

pub use self::{
    args::Args,
    metrics::{Phase, SyncMetrics},
    sync::{PassSummary, ReconciliationLoop, SyncError},
};
