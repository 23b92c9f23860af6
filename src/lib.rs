pub mod agent;
pub mod config;
pub mod epic;
pub mod errors;
pub mod fixloop;
pub mod flow_config;
pub mod gates;
pub mod logging;
pub mod orchestrator;
pub mod phase;
pub mod prompt;
pub mod report;
pub mod signals;
pub mod story;
pub mod tracker;
pub mod util;
