//! Warden Core Library
//!
//! Policy-domain types shared by every Warden node: the policy [`Model`],
//! its per-section rule storage ([`Assertion`]), the derived role hierarchy
//! ([`RoleGraph`]) and the [`PolicyEvaluator`] seam used to answer
//! allow/deny questions.
//!
//! Nothing in this crate performs I/O or knows about replication. The
//! cluster crate owns ordering; this crate owns what a single ordered
//! mutation does to a model.
//!
//! # Example
//!
//! ```ignore
//! use warden_core::{MatcherEvaluator, Model, PolicyEvaluator};
//!
//! let mut model = Model::from_text(RBAC_MODEL)?;
//! model.add_policies("p", "p", vec![vec!["alice".into(), "data1".into(), "read".into()]])?;
//!
//! let allowed = MatcherEvaluator::new().evaluate(&model, &["alice".into(), "data1".into(), "read".into()])?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod eval;
pub mod model;
pub mod rbac;

pub use error::{PolicyError, Result};
pub use eval::{MatcherEvaluator, PolicyEvaluator};
pub use model::{Assertion, Model};
pub use rbac::RoleGraph;
