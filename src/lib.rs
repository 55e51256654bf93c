pub mod agent;
pub mod analyzer;
pub mod config;
pub mod conveyor_config;
pub mod errors;
pub mod executor;
pub mod exit_codes;
pub mod git;
pub mod logging;
pub mod orchestrator;
pub mod phase;
pub mod resolver;
pub mod resources;
pub mod router;
pub mod state;
pub mod tracker;
pub mod util;
