//! Arbor is an agent execution runtime.
//!
//! It drives a loop in which a language model alternates with tools,
//! delegates to nested sub-agents, suspends for human-in-the-loop
//! approval, and resumes across an arbitrarily deep tree of saved
//! executions. Execution is exposed as an event stream with a single
//! terminal result.
//!
//! # Example
//!
//! ```rust,ignore
//! let runtime = Runtime::new(store, gateway);
//! let outcome = runtime
//!     .run(vec![manifest], "assistant", AgentRequest::prompt("hi"))
//!     .collect_outcome()
//!     .await;
//! ```

// Shared vocabulary
pub mod error;
pub mod message;
pub mod usage;

// Configuration and external interfaces
pub mod gateway;
pub mod hooks;
pub mod manifest;
pub mod state;
pub mod tool;

// Execution
pub mod runner;
pub mod runtime;

pub mod prelude;

pub use error::{Error, Result};
pub use runtime::Runtime;
