#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Invocation engine for `pywren-client`: a token-bucket-governed dispatcher
//! that drives the calls of a job against a serverless compute backend and
//! turns remote completion evidence back into dispatch permissions.

/// Public API for the engine crate.
pub mod api;
/// Compute and storage collaborator contracts.
pub mod backend;

mod board;
mod fifo;
mod invoke;
mod invoker;
mod runtime;
mod watcher;

pub use api::{
    ByteRange, CallError, CallHandle, CallState, DispatchMode, InvokerEvent, InvokerOptions,
    JobError, JobSpec,
};
pub use backend::{ActivationId, ComputeHandler, InternalStorage, InvokePayload, RuntimeMeta};
pub use invoker::{FunctionInvoker, running_inside_faas};
pub use runtime::RuntimeError;
