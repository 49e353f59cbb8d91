//! botshard-tracker — registration lifecycle.
//!
//! ```text
//! PENDING ──(inject)──► PROCESSING ──(result ok)────► COMPLETED
//!    ▲                      │
//!    │                      ├──(result error)───────► FAILED
//!    │                      └──(stuck timeout)──────► FAILED
//!    └──────────(retry_failed, retry_count < max)───────┘
//! ```
//!
//! Every transition is a compare-and-set on the stored row, so the
//! tracker and the injection pipeline can run concurrently: the pipeline
//! only moves PENDING rows, the tracker only moves PROCESSING and FAILED
//! rows.

pub mod error;
pub mod hook;
pub mod tracker;

pub use error::{TrackerError, TrackerResult};
pub use hook::{NoopHook, PostCreateHook};
pub use tracker::{ReconcileOutcome, RegistrationTracker, TrackerSettings};
