pub mod config;
pub mod errors;
pub mod exec;
pub mod issues;
pub mod logging;
pub mod orchestrator;
pub mod patch;
pub mod planner;
pub mod requester;
pub mod util;
pub mod worker;
