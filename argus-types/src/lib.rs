#![deny(missing_docs)]
//! Shared data model and protocol types for the Argus agent server.
//!
//! Everything that crosses a component boundary lives here: telemetry
//! events, alert rules and instances, action requests, budget accounting
//! types, the LLM conversation lingua franca, the push protocol, the
//! error taxonomy, and server configuration. Components exchange these
//! by value; ownership of live state stays with the owning component.

pub mod action;
pub mod alert;
pub mod budget;
pub mod config;
pub mod error;
pub mod event;
pub mod id;
pub mod llm;
pub mod push;
pub mod stream;

pub use action::*;
pub use alert::*;
pub use budget::*;
pub use config::*;
pub use error::*;
pub use event::*;
pub use id::*;
pub use llm::*;
pub use push::*;
pub use stream::*;
