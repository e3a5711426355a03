//! Core pipeline components for the cluster-to-Git reverser.
//!
//! Each module owns one component from the data-flow diagram: events enter
//! through [`watch`], pass through [`router`] and [`destination`], and are
//! applied to Git by [`worker`] via [`git`]. [`rules`] and [`correlation`]
//! are the shared state the Watch Manager and Event Router read. [`admission`]
//! feeds [`correlation`] from the admission webhook path. [`reconciler`]
//! drives each destination's lifecycle and detects orphaned files.

pub mod admission;
pub mod correlation;
pub mod destination;
pub mod error;
pub mod git;
pub mod metrics;
pub mod reconciler;
pub mod router;
pub mod rules;
pub mod sanitize;
pub mod watch;
pub mod worker;

pub use admission::AdmissionCollector;
pub use correlation::CorrelationStore;
pub use destination::DestinationStream;
pub use error::{ConfigConflict, GitError, SanitizeError, ValidationError};
pub use git::GitFacade;
pub use metrics::Metrics;
pub use reconciler::{DestinationPhase, ReconcilerManager};
pub use router::EventRouter;
pub use rules::RuleStore;
pub use watch::WatchManager;
pub use worker::{BranchWorker, BranchWorkerHandle, Envelope, WorkerFault};
