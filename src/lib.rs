pub mod audit;
pub mod config;
pub mod errors;
pub mod github;
pub mod orchestrator;
pub mod phase;
pub mod planner;
pub mod process;
pub mod settings;
pub mod state;
pub mod tracker;
pub mod util;
pub mod worktree;
