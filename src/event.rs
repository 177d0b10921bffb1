use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use bytes::Bytes;

/// A point in the replication stream: log file name + byte offset.
/// Offsets advance monotonically within a file and reset on rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPosition {
  pub file: String,
  pub position: u32,
}

impl fmt::Display for LogPosition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.file, self.position)
  }
}

impl FromStr for LogPosition {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (file, position) = s
      .split_once('/')
      .ok_or_else(|| "Failed to parse log position. Expected format is <prefix>.<file>/<position>".to_string())?;
    let file = file.to_string();
    let position = position
      .parse()
      .map_err(|_| "Failed to parse log position offset. Expected format is u32.".to_string())?;
    Ok(Self { file, position })
  }
}

bitflags! {
  /// Header flag bits carried on every replication event.
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct EventFlags: u16 {
    const BINLOG_IN_USE = 0x0001;
    const THREAD_SPECIFIC = 0x0004;
    const SUPPRESS_USE = 0x0008;
    const ARTIFICIAL = 0x0020;
    const RELAY_LOG = 0x0040;
    const IGNORABLE = 0x0080;
  }
}

/// One decoded column value out of a row image. Temporal values arrive
/// pre-rendered as `Text`; BLOB and TEXT columns both arrive as `Bytes`
/// (the wire does not distinguish them, the column's declared type does).
#[derive(Debug, Clone, PartialEq)]
pub enum RowValue {
  Null,
  UInt(u64),
  Int(i64),
  Float(f64),
  Decimal(String),
  Text(String),
  Bytes(Bytes),
}

impl RowValue {
  pub fn as_i64(&self) -> Option<i64> {
    match self {
      RowValue::Int(v) => Some(*v),
      RowValue::UInt(v) => i64::try_from(*v).ok(),
      _ => None,
    }
  }
}

#[derive(Debug, Clone)]
pub struct RotateEvent {
  pub next_log_file: String,
  pub next_log_position: u32,
}

/// The wire-level event preceding row images: names the affected table and
/// carries the per-column wire type codes and metadata.
#[derive(Debug, Clone)]
pub struct TableMapEvent {
  pub schema: String,
  pub table: String,
  pub column_types: Vec<u8>,
  pub column_metas: Vec<u16>,
}

/// Decoded row images. For update events rows are interleaved
/// (after, before) pairs, reflecting the wire format.
#[derive(Debug, Clone)]
pub struct RowsData {
  pub rows: Vec<Vec<RowValue>>,
}

#[derive(Debug, Clone)]
pub enum LogEvent {
  Rotate(RotateEvent),
  TableMap(TableMapEvent),
  Insert(RowsData),
  Update(RowsData),
  Delete(RowsData),
  Query,
  Other(u8),
}

/// What the upstream capture capability yields: a typed event plus its
/// header coordinates. `position` is the event's end offset in the
/// current log file.
#[derive(Debug, Clone)]
pub struct EventPacket {
  pub timestamp: u32,
  pub position: u32,
  pub event_size: u32,
  pub flags: EventFlags,
  pub event: LogEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
  Insert,
  Update,
  Delete,
}

impl fmt::Display for MutationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      MutationKind::Insert => write!(f, "insert"),
      MutationKind::Update => write!(f, "update"),
      MutationKind::Delete => write!(f, "delete"),
    }
  }
}

/// A classified row mutation, immutable once built and consumed exactly
/// once by the synthesizer.
#[derive(Debug, Clone)]
pub struct RowMutationEvent {
  pub schema: String,
  pub table: String,
  pub kind: MutationKind,
  pub start: LogPosition,
  pub end: LogPosition,
  pub column_types: Vec<u8>,
  pub column_metas: Vec<u16>,
  pub rows: Vec<Vec<RowValue>>,
}

impl RowMutationEvent {
  pub fn table_key(&self) -> String {
    format!("{}.{}", self.schema, self.table)
  }

  pub fn position_str(&self) -> String {
    format!("{} {}-{}", self.end.file, self.start.position, self.end.position)
  }
}

/// Mutable per-stream classification state. The anchor records the
/// position *before* the most recent table map event so the eventual
/// mutation's start points at the map, not the row image.
#[derive(Debug)]
pub struct StreamState {
  pub current_file: String,
  pub pending_anchor: u32,
  table_map: Option<TableMapEvent>,
}

impl StreamState {
  pub fn new(start: &LogPosition) -> Self {
    Self {
      current_file: start.file.clone(),
      pending_anchor: start.position,
      table_map: None,
    }
  }
}

#[derive(Debug)]
pub enum Classification {
  Rotate,
  RowMutation(RowMutationEvent),
  Ignore,
}

/// Classifies one raw event against the stream state. Table filtering
/// (skip set, catalog membership) happens one layer up in the capture
/// task; here every well-formed row event becomes a mutation.
pub fn classify(packet: EventPacket, state: &mut StreamState) -> Classification {
  match packet.event {
    LogEvent::Rotate(v) => {
      tracing::info!(file = %v.next_log_file, position = v.next_log_position, "log rotate");
      state.current_file = v.next_log_file;
      state.pending_anchor = v.next_log_position;
      state.table_map = None;
      Classification::Rotate
    }
    LogEvent::TableMap(v) => {
      state.pending_anchor = packet.position - packet.event_size;
      state.table_map = Some(v);
      Classification::Ignore
    }
    LogEvent::Insert(v) => classify_rows(MutationKind::Insert, v, packet.position, state),
    LogEvent::Update(v) => classify_rows(MutationKind::Update, v, packet.position, state),
    LogEvent::Delete(v) => classify_rows(MutationKind::Delete, v, packet.position, state),
    LogEvent::Query | LogEvent::Other(_) => Classification::Ignore,
  }
}

fn classify_rows(kind: MutationKind, data: RowsData, end_position: u32, state: &mut StreamState) -> Classification {
  let Some(table_map) = state.table_map.take() else {
    tracing::warn!(%kind, position = end_position, "row event without a preceding table map, ignoring");
    return Classification::Ignore;
  };

  Classification::RowMutation(RowMutationEvent {
    schema: table_map.schema,
    table: table_map.table,
    kind,
    start: LogPosition {
      file: state.current_file.clone(),
      position: state.pending_anchor,
    },
    end: LogPosition {
      file: state.current_file.clone(),
      position: end_position,
    },
    column_types: table_map.column_types,
    column_metas: table_map.column_metas,
    rows: data.rows,
  })
}
