use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the capture/synthesis pipeline and the control
/// surface. Fatal variants terminate the pipeline; the embedding host
/// decides whether to tear down or degrade.
#[derive(Debug, Error)]
pub enum Error {
  #[error("connection failed: {0}")]
  Connection(String),

  #[error("metadata query failed: {0}")]
  MetadataQuery(String),

  #[error("schema drift for {table}: row image has {row_width} values, cached schema has {cached_width} columns after refresh")]
  SchemaDrift {
    table: String,
    row_width: usize,
    cached_width: usize,
  },

  #[error("sql generation failed for {table}: {reason}")]
  SqlGeneration { table: String, reason: String },

  #[error("marker mismatch: observed control entry {observed}, expected {expected}")]
  MarkerMismatch { observed: i64, expected: i64 },

  #[error("no table structure found for {table} at {position}")]
  TableNotFound { table: String, position: String },

  #[error("invalid table name {0:?}, must be schema.table")]
  InvalidTableName(String),

  #[error("replication stream fault: {0}")]
  Stream(String),

  #[error("pipeline is not running")]
  NotRunning,
}
