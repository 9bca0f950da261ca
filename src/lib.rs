//! vigil: an unattended TDD orchestration core.
//!
//! vigil drives tickets through RED, GREEN, REFACTOR, and REVIEW without a
//! human in the loop, using supervised process logs as its only evidence
//! channel. Code editing and review judgment live behind the actor seams in
//! [`actors`]; everything else here is observation, sequencing, and durable
//! bookkeeping.

pub mod actors;
pub mod config;
pub mod errors;
pub mod machine;
pub mod policy;
pub mod scheduler;
pub mod signals;
pub mod snapshot;
pub mod store;
pub mod supervisor;
pub mod tailer;
pub mod ticket;
pub mod workitem;
