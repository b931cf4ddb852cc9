//! Storage migrator - keeps persisted Kubernetes objects aligned with the
//! cluster's current storage encoding.
//!
//! When an API server starts encoding a resource under a new version,
//! objects written earlier stay on disk in the old encoding. This crate
//! detects those transitions and rewrites every affected object with a
//! no-op read-modify-write so the server re-persists it, then records the
//! migration as complete.
//!
//! # Architecture
//!
//! Three cooperating processes, selected by subcommand:
//! - The **initializer** runs once: it installs the migration CRD,
//!   discovers which resources are served under multiple versions, and
//!   seeds one pending migration per resource.
//! - The **trigger** is a leader-elected controller that watches discovery
//!   and per-resource StorageVersion records, maintains the StorageState
//!   ledger of persisted encodings, and relaunches migrations whenever the
//!   advertised encoding moves.
//! - The **migrator** is a leader-elected controller that executes one
//!   migration at a time as a resumable paginated sweep.
//!
//! # Modules
//!
//! - [`crd`] - the StorageVersionMigration and StorageState record kinds
//! - [`clients`] - trait seams over the Kubernetes API
//! - [`discovery`] - served-resource discovery and migratable filtering
//! - [`index`] - status/resource-indexed cache of migrations
//! - [`initializer`] - the seeding job
//! - [`trigger`] - the storage-state reconciliation controller
//! - [`migrator`] - the migration execution controller
//! - [`leader_election`] - Lease-based leader election
//! - [`metrics`] - Prometheus counters and the HTTP surface
//! - [`retry`] - the shared backoff profile
//! - [`error`] - error types and the API error taxonomy

#![deny(missing_docs)]

pub mod clients;
pub mod crd;
pub mod discovery;
pub mod error;
pub mod index;
pub mod initializer;
pub mod leader_election;
pub mod metrics;
pub mod migrator;
pub mod resource;
pub mod retry;
pub mod trigger;

pub use error::{ApiError, Error};

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;
