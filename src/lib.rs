pub mod catalog;
pub mod conn;
pub mod engine;
pub mod error;
pub mod event;
pub mod ledger;
pub mod pipeline;
pub mod sqlgen;

pub use conn::{ConnectionOptions, Driver, EventSource, ExecOutcome, QueryResults, SqlClient};
pub use engine::{marker_table_key, BoundaryStrategy, Engine, EngineOptions};
pub use error::{Error, Result};
pub use ledger::Batch;
pub use event::{EventPacket, LogEvent, LogPosition, MutationKind, RowValue};
pub use sqlgen::RowErrorPolicy;
