//! Alert & isolation manager.
//!
//! Turns candidate alerts and isolation candidates into a deduplicated,
//! acknowledged, escalated alert book and an isolation state machine.
//! Every transition is journaled before it is applied so a restart can
//! replay to the same state.

pub mod alert_book;
pub mod events;
pub mod isolation_book;
pub mod journal;
pub mod manager;
pub mod router;
pub mod sinks;
pub mod worker;

pub use alert_book::AlertBook;
pub use events::{AimEvent, JournalRecord};
pub use isolation_book::{IsolationBook, IsolationPolicy};
pub use journal::{read_journal, FileJournal, Journal, JournalWriter, MemoryJournal, NullJournal};
pub use manager::{AlertManager, FatalHook, ReplaySummary};
pub use router::{build_router, LogRouter, OrderRouter, WebhookRouter};
pub use sinks::{
    build_sink, AlertSink, DeliveryOutcome, FileSink, FlushReport, Notifier, StderrSink, WebhookSink,
};
pub use worker::{spawn, AimCommand, AimExit, AimHandle, AimTiming};
