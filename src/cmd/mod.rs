//! CLI command implementations.
//!
//! | Module        | Commands handled |
//! |---------------|------------------|
//! | `orchestrate` | `Orchestrate`    |
//! | `issue`       | `Issue`          |
//! | `diff`        | `Diff`           |
//! | `plan`        | `Plan`           |
//! | `config`      | `Config`         |

pub mod config;
pub mod diff;
pub mod issue;
pub mod orchestrate;
pub mod plan;

pub use config::cmd_config;
pub use diff::cmd_diff;
pub use issue::cmd_issue;
pub use orchestrate::cmd_orchestrate;
pub use plan::cmd_plan;
