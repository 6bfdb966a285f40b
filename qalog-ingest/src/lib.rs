pub mod bucket;
pub mod engine;
pub mod payload;
pub mod pipeline;
pub mod sink;
pub mod store;

pub use engine::{AssignError, Assignment, IterationEngine, IterationPolicy, Outcome};
pub use pipeline::{DropReason, IngestError, IngestOutcome, IngestPipeline};
pub use sink::{LogSink, MemoryLogSink, PgLogSink};
pub use store::{MemorySessionStore, PgSessionStore, SessionStateStore, StateTxn, StoreError};
