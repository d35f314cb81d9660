//! Agent orchestrator for strengthened regression-test pipelines.
//!
//! Drives an LLM agent against live instance containers to generate tests,
//! mutate gold patches, and augment tests until they kill every known
//! non-equivalent mutation. The three top-level stages decompose into
//! resumable phases that communicate exclusively through the shared result
//! store in `harness`.

pub mod agent;
pub mod config;
pub mod env;
pub mod model;
pub mod pty;
pub mod runs;
pub mod stages;
pub mod template;
pub mod traj;

pub use agent::{AgentError, DefaultAgent, ExitStatus, MutationAgent, SingleStepAgent};
pub use config::AgentConfig;
pub use env::{ContainerEnv, Environment, EnvironmentError, ExecResult};
pub use model::{HttpModel, HttpModelConfig, Message, Model, ModelResponse};
pub use template::render_template;
pub use traj::save_trajectory;
