#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod metrics;
pub mod model;
pub mod server;
pub mod source;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::model::{
    apply, diff, merge, ChangeNotification, ConflictRecord, Diff, DiffId, DiffOp, DiffOpId,
    Document, DocumentPath, EntityName, ForeignKey, InternalKey, MergeOutcome, MergePolicy,
    SourceName, WorkItem,
};
