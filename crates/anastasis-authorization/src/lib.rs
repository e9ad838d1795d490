pub mod command;
pub mod file;
pub mod plugin;
pub mod registry;
pub mod totp;

pub use plugin::{
    AuthorizationPlugin, ChallengeProcess, MethodProperties, ProcessResult, Reply, StartError,
    Trigger, ValidationError,
};
pub use registry::{LoadError, PluginRegistry};
