//! Risk computation pipeline for Tripwire.
//!
//! Provides:
//! - Mark-to-market exposures with strategy, asset-class, instrument and factor decomposition
//! - Historical VaR / expected shortfall at several confidences, √10 scaled 10-day VaR
//! - Windowed drawdown, volatility and tail-loss probability
//! - The seq-ordered worker thread and the bounded metrics history

pub mod calculator;
pub mod history;
pub mod pipeline;
pub mod stats;
pub mod window;

pub use calculator::{CalculatorParams, RiskCalculator};
pub use history::MetricsHistory;
pub use pipeline::{BackpressureHook, EquityHandle, RiskWorker};
pub use window::{MarkWindow, Marks};
