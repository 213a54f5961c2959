//! Condition correlation for sensor triggers
//!
//! This crate decides when a trigger fires:
//!
//! - [`DependencyExpression`] - `&&`/`||` formula over dependency names
//! - [`ConditionWindow`] - which dependencies fired since the last reset
//! - [`ConditionEngine`] - feeds deliveries through filter and transform
//!   into the window and reports when the expression is satisfied
//! - [`RecentEvents`] - duplicate-delivery detection
//! - [`ResetEngine`] - cron and manual window resets

mod dedup;
mod engine;
mod expr;
mod reset;
mod window;

pub use dedup::RecentEvents;
pub use engine::{
    ConditionEngine, Delivery, FilterFn, Firing, Outcome, TransformError, TransformFn,
    DEFAULT_HELD_ENTRY_TTL_SECS,
};
pub use expr::{DependencyExpression, Expr, ExpressionError, MAX_NESTING_DEPTH, MAX_TERMS};
pub use reset::{
    CronSchedule, ManualReset, ResetEngine, ResetReceiver, ResetScheduleError,
    ResetScheduleResult, ResetSignal, ResetSource,
};
pub use window::{ConditionWindow, WindowEntry};
