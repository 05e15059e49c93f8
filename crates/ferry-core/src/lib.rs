//! Ferry Core - resumable download jobs
//!
//! A [`JobRegistry`] owns every job and arbitrates start, pause, resume,
//! cancel, retry and removal. Each running job is driven by the
//! [`TransferEngine`], which resumes from the job's byte count with a range
//! request and falls back to a fresh connection once if the body stream
//! closes early. Status flows out through a [`StatusStore`] (throttled per
//! job) and a [`StatusReporter`] that polls the registry and sends
//! notifications.

mod engine;
mod error;
mod notify;
mod persistence;
mod sink;
mod store;
mod transport;

pub use engine::*;
pub use error::*;
pub use notify::*;
pub use persistence::*;
pub use sink::*;
pub use store::*;
pub use transport::*;

pub use ferry_types::*;
