//! CLI command implementations.
//!
//! | Module     | Commands handled          |
//! |------------|---------------------------|
//! | `run`      | `Run`                     |
//! | `status`   | `Status`                  |
//! | `state`    | `State` subcommands       |
//! | `worktree` | `Worktree` subcommands    |
//! | `logs`     | `Logs`                    |

pub mod logs;
pub mod run;
pub mod state;
pub mod status;
pub mod worktree;

pub use logs::cmd_logs;
pub use run::cmd_run;
pub use state::cmd_state;
pub use status::cmd_status;
pub use worktree::cmd_worktree;

use console::style;

pub(crate) fn print_warning(message: impl std::fmt::Display) {
    println!("  {} {}", style("⚠").yellow(), message);
}
