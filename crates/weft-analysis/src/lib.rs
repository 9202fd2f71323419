//! Region-tree analysis core: logical dependence analysis, restriction
//! tracking, and equivalence-set versioning for a task-based parallel
//! runtime.
//!
//! The engine consumes a stream of `(operation, field mask, usage)` region
//! requirements and produces the happens-before edges and data-movement
//! obligations that let those operations run in parallel while preserving
//! sequential semantics. Collaborators (the region forest, operations,
//! physical managers, the host runtime's events and transport) stay behind
//! the traits in `weft-forest`, [`operation`], [`instances`], and
//! `weft-rt`.

mod analyzer;
pub mod closer;
pub mod context;
pub mod field_state;
pub mod instances;
pub mod logical;
pub mod operation;
pub mod projection;
pub mod restrict;
pub mod traverse;
pub mod users;
pub mod version;

pub use closer::LogicalCloser;
pub use context::{AnalysisContext, LogicalTraceInfo, RegionRequirement};
pub use field_state::{FieldState, OpenState};
pub use instances::{InstanceRef, InstanceSet, ManagerResolver, PhysicalManager};
pub use logical::LogicalState;
pub use operation::{MergeCloseOp, OpHandle, Operation};
pub use projection::{ProjectionEpoch, ProjectionFunction, ProjectionInfo};
pub use restrict::{OpAttribution, RestrictInfo, RestrictionTracker};
pub use traverse::{NodeVisitor, traverse_path, traverse_subtree};
pub use users::{GenericUser, LOGICAL_USER_TIMEOUT, LogicalUser, PhysicalUser};
pub use version::{EquivalenceSet, EquivalenceSetRegistry, VersionInfo, VersionManager};
