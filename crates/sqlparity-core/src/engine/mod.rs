mod runner;

pub use runner::{run_stage, CMD_EXECUTE, CMD_IGNORE_ERRORS, CMD_QUERY};
