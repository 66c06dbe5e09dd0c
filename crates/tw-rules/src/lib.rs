//! Rule engine: metric paths, validated and versioned rule sets, and
//! cooldown-debounced evaluation of each metrics record.

pub mod book;
pub mod engine;
pub mod path;

pub use book::{compile, CompiledIsolationRule, CompiledRule, PathContext, RuleBook, RuleSet};
pub use engine::{Evaluation, RuleEngine};
pub use path::MetricPath;
