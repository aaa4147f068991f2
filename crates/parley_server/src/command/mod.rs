#![forbid(unsafe_code)]

mod builtin;
mod registry;

pub use builtin::register_builtins;
pub use registry::{CommandContext, CommandError, CommandRegistry, CommandSpec, RegisterError};
