//! # dispatcher-core
//!
//! The distributed job queue and dispatcher for card-verification
//! automation: a persisted work queue, a claim/visibility-timeout
//! protocol, a multi-backend dispatcher, and the bookkeeping that
//! guarantees at-most-one active attempt per backend and per card.
//!
//! ## Architecture
//!
//! ```text
//! Producer (producer::create_job) ──insert──> JobStore  ("pending")
//!                                                 │
//!                                      Dispatcher::tick()
//!                                    ┌────────────┼────────────┐
//!                             purge_stale   free_healthy()   claim()
//!                                                              │
//!                                                     pair with backend
//!                                                              │
//!                                                    spawn worker::run_worker
//!                                                              │
//!                                               POST <backend>/verify_path
//!                                                              │
//!                                                complete() / fail()
//! ```
//!
//! ## Key invariants
//!
//! 1. `status = processing` implies all three lease fields are non-null
//!    ([`job::Job::lease_consistent`]).
//! 2. `attempts` only increases, and only on a transition into
//!    `processing`.
//! 3. At most one row per `card_number` is `processing` with a live lease
//!    at any instant (single-flight).
//! 4. Terminal transitions (`complete`/`fail`) are guarded on the exact
//!    `worker_id` that holds the lease; a stolen or expired lease makes them
//!    safe no-ops rather than corrupting state.
//!
//! For durability beyond the process lifetime, every state transition is a
//! single predicate-guarded SQL statement against the `JobStore`
//! implementation — there is no in-memory authority over job state.

pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod lock;
pub mod producer;
pub mod worker;

pub use backend::{BackendHealth, BackendRegistry, FreeBackend};
pub use config::Config;
pub use dispatcher::Dispatcher;
pub use error::{Categorizable, DispatcherError, ErrorCategory, Result};
pub use job::{Job, JobStatus, JobStore, JOB_TYPE_SGUCARD};
pub use lock::CoordinatorLock;
pub use producer::{
    create_job, run_batch, CardRef, CardSource, CreateOutcome, ProducerSummary, SkipReason,
};
pub use worker::{map_verify_response, run_worker, Dispatch, VerifyOutcome};

#[cfg(test)]
mod dispatcher_tests;
