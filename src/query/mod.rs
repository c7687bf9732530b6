//! Query planning and execution: the typed plan model, the cost-based
//! planner, the streaming executor with its hybrid pipelines, and
//! cursor pagination.

pub mod cursor;
pub mod executor;
pub mod plan;
pub mod planner;

pub use cursor::{Cursor, SnapshotRegistry};
pub use executor::{Candidate, CandidateStream, Executor, ResultRow, StreamOrdering};
pub use plan::{FtClause, OrderBy, Predicate, QueryPlan, SpatialClause, VectorClause};
pub use planner::{rank_sources, ScoredSource, SourceChoice};
