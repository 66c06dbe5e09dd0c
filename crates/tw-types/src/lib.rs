pub mod alerts;
pub mod clock;
pub mod config;
pub mod counters;
pub mod errors;
pub mod isolation;
pub mod market;
pub mod metrics;
pub mod portfolio;
pub mod rules;
pub mod serde_utils;
pub mod target;

pub use alerts::*;
pub use clock::*;
pub use config::*;
pub use counters::*;
pub use errors::*;
pub use isolation::*;
pub use market::*;
pub use metrics::*;
pub use portfolio::*;
pub use rules::*;
pub use target::*;
