//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled              |
//! |-----------|-------------------------------|
//! | `run`     | `Run`, `Chain`                |
//! | `status`  | `Status`, `List`, `Reset`     |
//! | `config`  | `Config`                      |

pub mod config;
pub mod run;
pub mod status;

pub use config::cmd_config;
pub use run::{cmd_chain, cmd_run};
pub use status::{cmd_list, cmd_reset, cmd_status};
