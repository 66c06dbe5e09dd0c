//! Tripwire engine: assembles the risk pipeline and serves the control plane.

pub mod engine;
pub mod http;

pub use engine::{Engine, EngineStatus, StartError};
pub use http::{router, ApiError};
