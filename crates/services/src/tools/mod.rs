//! Tool registry and executors
//!
//! One uniform call surface over in-process tools and remote tool-providing
//! servers. Every call returns the standard result envelope
//! `{success, message, action_taken, data?, empty_result?, error_code?}`.

pub mod executor;
pub mod internal;
pub mod remote;

pub use executor::{
    validate_params, ParamSpec, ParamType, ToolCall, ToolContext, ToolExecutor, ToolRegistry,
    ToolSpec,
};
pub use internal::InternalTools;
pub use remote::RemoteTools;
