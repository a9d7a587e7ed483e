#![deny(missing_docs)]
//! The agent layer: ReAct runs, gated actions, and auto-investigations.
//!
//! A [`ReactRunner`] drives one LLM conversation with interleaved tool
//! calls, streaming every user-visible step onto the bus in run order.
//! The [`ActionEngine`] suspends risky tool calls until an operator
//! approves them. The [`Investigator`] turns urgent alerts into runs of
//! their own. The [`RunManager`] owns the cancellation scopes tying all
//! of it to connections and alerts.

mod action;
mod investigate;
mod manager;
mod react;

pub use action::{ActionEngine, ActionError, BLOCKED_COMMAND_PATTERNS};
pub use investigate::Investigator;
pub use manager::{RunManager, RunScope, load_conversation, save_conversation};
pub use react::{ReactConfig, ReactRunner, RunInitiator, RunOutcome, RunRecord, RunSpec,
    RunTermination};

use std::sync::Arc;

use argus_bus::{Bus, BusMessage, Topic};
use argus_types::{Envelope, ServerMessage};

/// Publish a push message on the run-ordered delta topic.
pub(crate) fn emit(bus: &Bus, message: ServerMessage) {
    bus.publish(
        Topic::ReactDelta,
        BusMessage::ReactDelta(Arc::new(Envelope::new(message))),
    );
}
