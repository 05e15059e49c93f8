//! Download engine - the moving parts behind the registry
//!
//! - `job`: per-job record and state machine
//! - `transfer`: fetch and copy with resume and one-shot fallback
//! - `registry`: concurrent job map and control calls
//! - `reporter`: periodic outward notifications
//! - `throttle`: per-key rate limiting shared by status and notifications

mod job;
mod registry;
mod reporter;
mod throttle;
mod transfer;

pub use job::*;
pub use registry::*;
pub use reporter::*;
pub use throttle::*;
pub use transfer::*;
