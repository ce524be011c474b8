//! Per-player gameplay statistics: the record shape, its sanity rules, and
//! the notable-change detection used for audit logging.

pub mod audit;
pub mod record;
pub mod validation;

pub use audit::{notable_changes, NotableChange};
pub use record::{StatField, StatisticsRecord};
pub use validation::{validate, RecordError};
