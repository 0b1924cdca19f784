//! Fixed command templates behind each HTTP endpoint.
//!
//! Every endpoint turns a validated field set into a [`CommandSpec`]. Caller
//! values only ever become whole argument tokens.

pub mod bamcheck;
pub mod coverage_matrix;
pub mod panel_data;

use crate::config::ServeConfig;
use crate::support::command_spec::CommandSpec;

/// Applies the server-wide child environment and working directory.
pub fn prepare(spec: CommandSpec, config: &ServeConfig) -> CommandSpec {
    spec.envs(&config.child_env)
        .current_dir(config.working_dir.clone())
}
