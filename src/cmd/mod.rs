//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module    | Command handled                              |
//! |-----------|----------------------------------------------|
//! | `enqueue` | `Enqueue` — validate a ticket into the queue |
//! | `status`  | `Status` — session, queue, and item overview |
//! | `resume`  | `Resume` — unfreeze an escalated item        |
//! | `pause`   | `Pause` — stop the window at a checkpoint    |
//! | `cancel`  | `Cancel` — abandon one item                  |
//! | `run`     | `Run` — open an attention window             |

pub mod cancel;
pub mod enqueue;
pub mod pause;
pub mod resume;
pub mod run;
pub mod status;

pub use cancel::cmd_cancel;
pub use enqueue::cmd_enqueue;
pub use pause::cmd_pause;
pub use resume::cmd_resume;
pub use run::cmd_run;
pub use status::cmd_status;
