//! Market & position store: instrument registry, concurrent ingest of
//! ticks and fills, and the snapshot publisher feeding the risk pipeline.

pub mod publisher;
pub mod queue;
pub mod registry;
pub mod store;

pub use publisher::spawn_publisher;
pub use queue::{snapshot_queue, SnapshotQueue};
pub use registry::{InstrumentMap, InstrumentRegistry};
pub use store::MarketStore;
