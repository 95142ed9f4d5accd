//! Run planning: issue ordering and per-issue phase selection.

pub mod dependencies;
pub mod phases;

pub use dependencies::{parse_dependencies, sort_by_dependencies};
pub use phases::{PhasePlan, PlanSource, Recommendation, determine_phases_for_issue, parse_recommendation};
