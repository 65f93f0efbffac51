//! Plan items, request parsing and reports.

pub mod model;
pub mod parser;
pub mod report;

pub use model::{
    HistoryRecord, PlanCounts, PlanItem, PlanItemPatch, PlanPriority, PlanStatus, PlanVersion,
};
pub use parser::{PlanParser, PlanQuery, PlanRequest};
