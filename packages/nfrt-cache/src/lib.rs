//! A content-addressed intermediate-result cache for a build/transformation
//! pipeline.
//!
//! A pipeline node produces a deterministic set of output files from a
//! declared set of inputs. [`key::CacheKey`] canonicalises those inputs into
//! a stable digest; [`store::Store`] uses that digest to either hand back
//! previously published outputs ([`store::Store::restore`]) or atomically
//! record freshly produced ones ([`store::Store::publish`]);
//! [`maintenance::Maintenance`] periodically bounds the store's age and
//! size; [`diagnostics::diagnose`] explains a miss by ranking nearby
//! fingerprints.
//!
//! This crate owns none of: the DAG executor that decides when to consult
//! the cache, the resolver producing inputs to fingerprint, or a CLI/config
//! surface. It does, however, log its own operations via `tracing` — see
//! [`logging`].

pub mod diagnostics;
pub mod fsops;
pub mod key;
pub mod layout;
pub mod logging;
pub mod maintenance;
pub mod store;

pub use diagnostics::{MissCandidate, MissReport, diagnose};
pub use key::{AnnotatedValue, CacheKey, Delta};
pub use layout::StoreLayout;
pub use maintenance::{Maintenance, MaintenanceConfig, MaintenanceReport};
pub use store::{HasExtension, Node, RestoreOutcome, SimpleOutputSpec, Store};
