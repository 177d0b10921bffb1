use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::catalog::CatalogView;
use crate::conn::{EventSource, SqlClient};
use crate::error::Result;
use crate::event::{classify, Classification, RowMutationEvent, StreamState};
use crate::ledger::{LedgerEntry, RollbackLedger};
use crate::sqlgen::{Synthesis, Synthesizer};

/// Bounded hand-off between capture and synthesis. Capture blocks when
/// synthesis falls behind, which in turn backpressures the upstream
/// stream reads.
const CHANNEL_CAPACITY: usize = 100;

/// Tables excluded from capture, shared between the control surface and
/// the capture task. Keys are `schema.table`.
#[derive(Debug, Clone, Default)]
pub struct SkipSet {
  inner: Arc<RwLock<HashSet<String>>>,
}

impl SkipSet {
  pub fn insert(&self, table_key: String) -> bool {
    self.inner.write().unwrap().insert(table_key)
  }

  pub fn remove(&self, table_key: &str) -> bool {
    self.inner.write().unwrap().remove(table_key)
  }

  pub fn contains(&self, table_key: &str) -> bool {
    self.inner.read().unwrap().contains(table_key)
  }

  pub fn len(&self) -> usize {
    self.inner.read().unwrap().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// The two long-running tasks: capture (classify raw events, filter,
/// hand off) and synthesis (inverse SQL into the ledger). Either task
/// returning an error is fatal for the whole pipeline.
#[derive(Debug)]
pub struct Pipeline {
  shutdown: watch::Sender<bool>,
  capture: JoinHandle<Result<()>>,
  synthesis: JoinHandle<Result<()>>,
}

impl Pipeline {
  pub fn spawn<S, C>(
    source: S,
    start: StreamState,
    synthesizer: Synthesizer<C>,
    view: CatalogView,
    skip: SkipSet,
    ledger: Arc<RollbackLedger>,
    marker_table_key: String,
  ) -> Self
  where
    S: EventSource,
    C: SqlClient,
  {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    let capture = tokio::spawn(capture_loop(source, start, view, skip, marker_table_key, tx, shutdown_rx));
    let synthesis = tokio::spawn(synthesis_loop(synthesizer, rx, ledger));

    Self {
      shutdown,
      capture,
      synthesis,
    }
  }

  /// True once either task has exited, normally or not.
  pub fn is_finished(&self) -> bool {
    self.capture.is_finished() || self.synthesis.is_finished()
  }

  /// Signals shutdown and waits for both tasks, surfacing the first
  /// task failure.
  pub async fn shutdown(self) -> Result<()> {
    // receivers may already be gone when a task failed early
    let _ = self.shutdown.send(true);

    let capture = flatten(self.capture.await);
    let synthesis = flatten(self.synthesis.await);
    capture.and(synthesis)
  }
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
  match joined {
    Ok(result) => result,
    Err(err) if err.is_cancelled() => Ok(()),
    Err(err) => Err(crate::error::Error::Stream(format!("pipeline task panicked: {}", err))),
  }
}

async fn capture_loop<S: EventSource>(
  mut source: S,
  mut state: StreamState,
  view: CatalogView,
  skip: SkipSet,
  marker_table_key: String,
  tx: mpsc::Sender<RowMutationEvent>,
  mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
  loop {
    let packet = tokio::select! {
      _ = shutdown.changed() => break,
      packet = source.recv() => packet,
    };

    match packet {
      None => {
        tracing::info!("capture stream exhausted");
        break;
      }
      Some(Err(err)) => {
        let _ = source.close().await;
        return Err(err);
      }
      Some(Ok(packet)) => match classify(packet, &mut state) {
        Classification::RowMutation(event) => {
          let table_key = event.table_key();
          if skip.contains(&table_key) {
            tracing::debug!(table = %table_key, "table on the skip list, dropping");
            continue;
          }
          if table_key != marker_table_key && !view.contains(&table_key) {
            tracing::debug!(table = %table_key, "table not under capture, dropping");
            continue;
          }
          if tx.send(event).await.is_err() {
            // synthesis exited, its JoinHandle carries the reason
            break;
          }
        }
        Classification::Rotate | Classification::Ignore => {}
      },
    }
  }
  source.close().await
}

async fn synthesis_loop<C: SqlClient>(
  mut synthesizer: Synthesizer<C>,
  mut rx: mpsc::Receiver<RowMutationEvent>,
  ledger: Arc<RollbackLedger>,
) -> Result<()> {
  let result = run_synthesis(&mut synthesizer, &mut rx, &ledger).await;
  rx.close();
  let _ = synthesizer.into_catalog().close().await;
  result
}

async fn run_synthesis<C: SqlClient>(
  synthesizer: &mut Synthesizer<C>,
  rx: &mut mpsc::Receiver<RowMutationEvent>,
  ledger: &RollbackLedger,
) -> Result<()> {
  while let Some(event) = rx.recv().await {
    let table_key = event.table_key();
    let kind = event.kind;
    match synthesizer.process(event).await? {
      Synthesis::Statements {
        sqls,
        restore_auto_increment,
      } => {
        for sql in sqls {
          tracing::debug!(table = %table_key, %kind, sql = %sql, "ledger append");
          ledger.append(LedgerEntry::Data {
            sql,
            table_key: table_key.clone(),
            restore_auto_increment,
          });
        }
      }
      Synthesis::Marker(id) => {
        tracing::debug!(id, "sync barrier observed");
        ledger.append(LedgerEntry::Marker(id));
      }
      Synthesis::Nothing => {}
    }
  }
  Ok(())
}
