#![deny(missing_docs)]
//! Event classification, alerting, and budget accounting.
//!
//! Three components share this crate because they form the decision path
//! between raw telemetry and agent work: the [`Classifier`] assigns
//! severities, the [`AlertEngine`] turns classified events into alert
//! lifecycles, and the [`BudgetManager`] decides whether LLM work may be
//! admitted at all.

mod alerts;
mod budget;
mod classifier;
mod notify;
mod seed;

pub use alerts::{AlertEngine, AlertError, AlertFilter, DedupKeyFn};
pub use budget::{BudgetError, BudgetManager, Reservation};
pub use classifier::Classifier;
pub use notify::{LogNotifier, NotifierRegistry, Notifier, NotifyError};
pub use seed::default_rules;
