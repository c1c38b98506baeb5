pub use command::{CommandSpec, CommandStdin, CompletedCommand};
pub use config::{ReapMode, SandboxOptions};
pub use engine::{ContainerEngine, ContainerStatus};
pub use error::{Result, RunnerExit, SandboxError};
pub use sandbox::{FileOwner, Sandbox, SandboxState};

pub mod command;
pub mod config;
pub mod docker;
pub mod engine;
mod error;
pub mod limits;
pub mod protocol;
pub mod reaper;
pub mod runner;
mod sandbox;
pub mod utils;
