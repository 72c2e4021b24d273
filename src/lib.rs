//! runectl - A Docker-compatible container CLI
//!
//! The interesting part is the Compose engine, a local orchestrator that
//! converges a container runtime toward a declarative multi-service
//! description:
//!
//! - Project loading (file merging, variable substitution, profiles)
//! - Config-hash based recreation
//! - Dependency ordered, parallel lifecycle operations
//! - Multiplexed logs and `up --abort-on-container-exit`
//!
//! The engine talks to containers through [`runtime::RuntimeClient`].

pub mod compose;
pub mod config;
pub mod error;
pub mod runtime;

pub use error::{CtlError, Result};
