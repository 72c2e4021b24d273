//! Docker Compose compatible orchestration
//!
//! Loading turns compose files into a [`Project`]; the [`ComposeEngine`]
//! converges the runtime toward it. All state after creation lives in
//! labels on runtime objects.

pub mod engine;
pub mod envfile;
pub mod interpolate;
pub mod labels;
pub mod loader;
pub mod lock;
pub mod merge;
pub mod model;
pub mod mounts;
pub mod options;
pub mod output;
pub mod planner;
pub mod ports;
pub mod project;
pub mod reconciler;
pub mod report;
pub mod scheduler;
pub mod service;

pub use engine::ComposeEngine;
pub use loader::{load, ProjectOptions};
pub use project::Project;
