pub mod artifact;
pub mod config;
pub mod db;
pub mod errors;
pub mod flow_config;
pub mod gates;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod phase;
pub mod registry;
pub mod tracker;
pub mod vcs;
pub mod worker;
pub mod workspace;
