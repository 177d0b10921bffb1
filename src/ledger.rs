use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One unit of rollback work in append (capture) order. Control entries
/// carry the sync-barrier id instead of SQL.
#[derive(Debug, Clone)]
pub enum LedgerEntry {
  Data {
    sql: String,
    table_key: String,
    restore_auto_increment: bool,
  },
  Marker(i64),
}

/// A drained cycle: statements newest-first (execution order for the
/// rollback), plus the distinct tables whose auto-increment counters
/// were disturbed by inserts or deletes.
#[derive(Debug, Default)]
pub struct Batch {
  pub statements: Vec<String>,
  pub auto_increment_tables: Vec<String>,
}

impl Batch {
  fn push_data(&mut self, sql: String, table_key: String, restore_auto_increment: bool) {
    if restore_auto_increment && !self.auto_increment_tables.contains(&table_key) {
      self.auto_increment_tables.push(table_key);
    }
    self.statements.push(sql);
  }

  pub fn is_empty(&self) -> bool {
    self.statements.is_empty()
  }
}

#[derive(Debug)]
struct State {
  entries: VecDeque<LedgerEntry>,
  last_append: Instant,
}

/// Accumulates inverse statements between cycle boundaries. The
/// synthesis task appends, the control surface drains; the two sides
/// never hold the lock across an await.
#[derive(Debug)]
pub struct RollbackLedger {
  inner: Mutex<State>,
}

impl Default for RollbackLedger {
  fn default() -> Self {
    Self::new()
  }
}

impl RollbackLedger {
  pub fn new() -> Self {
    Self {
      inner: Mutex::new(State {
        entries: VecDeque::new(),
        last_append: Instant::now(),
      }),
    }
  }

  pub fn append(&self, entry: LedgerEntry) {
    let mut state = self.inner.lock().unwrap();
    state.entries.push_back(entry);
    state.last_append = Instant::now();
  }

  pub fn len(&self) -> usize {
    self.inner.lock().unwrap().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Starts a fresh cycle. Entries left over from a previous cycle are
  /// stale and must not leak into the next rollback.
  pub fn begin_cycle(&self) {
    let mut state = self.inner.lock().unwrap();
    if !state.entries.is_empty() {
      tracing::warn!(discarded = state.entries.len(), "discarding entries from a previous cycle");
      state.entries.clear();
    }
    state.last_append = Instant::now();
  }

  /// Drains data entries until the control entry for `expected` arrives,
  /// polling while the capture side catches up. A control entry with any
  /// other id is an ordering violation and fails the cycle.
  pub async fn collect_up_to(&self, expected: i64) -> Result<Batch> {
    let mut batch = Batch::default();
    loop {
      loop {
        let entry = self.inner.lock().unwrap().entries.pop_front();
        match entry {
          None => break,
          Some(LedgerEntry::Data {
            sql,
            table_key,
            restore_auto_increment,
          }) => batch.push_data(sql, table_key, restore_auto_increment),
          Some(LedgerEntry::Marker(id)) if id == expected => {
            batch.statements.reverse();
            return Ok(batch);
          }
          Some(LedgerEntry::Marker(id)) => {
            return Err(Error::MarkerMismatch {
              observed: id,
              expected,
            })
          }
        }
      }
      sleep(POLL_INTERVAL).await;
    }
  }

  /// Drains everything once no append has landed for `delay`. The
  /// fallback boundary for servers where the marker table cannot be
  /// provisioned.
  pub async fn collect_quiescent(&self, delay: Duration) -> Batch {
    loop {
      let drained = {
        let mut state = self.inner.lock().unwrap();
        if state.last_append.elapsed() >= delay {
          Some(std::mem::take(&mut state.entries))
        } else {
          None
        }
      };
      if let Some(entries) = drained {
        let mut batch = Batch::default();
        for entry in entries {
          match entry {
            LedgerEntry::Data {
              sql,
              table_key,
              restore_auto_increment,
            } => batch.push_data(sql, table_key, restore_auto_increment),
            LedgerEntry::Marker(id) => {
              tracing::warn!(id, "control entry in a quiescence-bounded cycle, ignoring")
            }
          }
        }
        batch.statements.reverse();
        return batch;
      }
      sleep(POLL_INTERVAL).await;
    }
  }
}
