//! hopper-types: value types shared by the engine and the CLI.
//!
//! This crate carries no async machinery — it is the data contract:
//!
//! - **Spec / JumpSpec**: immutable run configuration with validation
//! - **ExecResult**: one serialised record per command execution
//! - **LineSet**: ordered string sets loaded from newline-delimited files

pub mod lineset;
pub mod result;
pub mod spec;

pub use lineset::LineSet;
pub use result::ExecResult;
pub use spec::{JumpSpec, Spec, SpecError, DEFAULT_JUMP_COMMAND, HOP_TOKEN, TARGET_TOKEN};
