//! Typed evidence extracted from supervised process logs.
//!
//! The orchestrator never calls the code-change actor synchronously for
//! feedback; its only evidence channel is the pair of line-oriented log
//! streams (`test-output`, `dev-server`). This module turns those lines
//! into `Signal`s.

pub mod parser;
pub mod types;

pub use parser::LineExtractor;
pub use types::{Signal, SignalKind, TestRunSummary};
