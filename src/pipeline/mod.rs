//! Pipeline stages for one thumbnail request.
//!
//! Each submodule implements exactly one stage, so each can be tested on its
//! own and the orchestrator in [`crate::convert`] stays a short sequence of
//! calls.
//!
//! ## Data Flow
//!
//! ```text
//! fetch ──▶ scratch ──▶ queue ──▶ runner ──▶ cleanup
//! (HTTP)    (raw file)  (FIFO)    (convert)  (delete both)
//! ```
//!
//! 1. [`fetch`]   : GET the source, keep cache headers, stream body to disk
//! 2. [`scratch`] : allocate unique raw/converted paths in the scratch dir
//! 3. [`queue`]   : bounded worker pool with staleness eviction
//! 4. [`runner`]  : spawn the external tool under a wall-clock limit
//! 5. [`cleanup`] : delete the request's files on every exit path

pub mod cleanup;
pub mod fetch;
pub mod queue;
pub mod runner;
pub mod scratch;
