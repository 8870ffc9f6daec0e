//! Arvak Hardware Abstraction Layer
//!
//! The slice of the HAL that experiment tracking consumes: handles to jobs
//! running on a backend, their lifecycle states, and the results they
//! produce.
//!
//! # Overview
//!
//! - [`Backend`] identifies a device and re-attaches to jobs by id
//! - [`Job`] is a shared handle to one submitted job
//! - [`JobResult`] carries per-circuit data; [`Counts`] is a decoded
//!   measurement histogram
//!
//! # Implementing a Job Handle
//!
//! ```ignore
//! use std::sync::Arc;
//! use arvak_hal::{Backend, HalResult, Job, JobId, JobResult, JobStatus};
//! use async_trait::async_trait;
//!
//! struct MyJob {
//!     id: JobId,
//!     backend: Arc<dyn Backend>,
//! }
//!
//! #[async_trait]
//! impl Job for MyJob {
//!     fn job_id(&self) -> &JobId { &self.id }
//!
//!     fn backend(&self) -> Arc<dyn Backend> { self.backend.clone() }
//!
//!     async fn status(&self) -> HalResult<JobStatus> {
//!         // Poll the device
//!         # todo!()
//!     }
//!
//!     async fn result(&self) -> HalResult<JobResult> {
//!         // Wait for completion and fetch results
//!         # todo!()
//!     }
//!
//!     async fn cancel(&self) -> HalResult<()> {
//!         # todo!()
//!     }
//! }
//! ```

pub mod backend;
pub mod error;
pub mod job;
pub mod result;

pub use backend::{Backend, same_backend};
pub use error::{HalError, HalResult};
pub use job::{Job, JobId, JobStatus};
pub use result::{CircuitResult, Counts, JobResult, MeasReturn, ResultHeader, decode_outcome};
