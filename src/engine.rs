use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::catalog::{CatalogView, SchemaCatalog};
use crate::conn::{log_cursor, ConnectionOptions, Driver, SqlClient};
use crate::error::{Error, Result};
use crate::event::{LogPosition, StreamState};
use crate::ledger::{Batch, RollbackLedger};
use crate::pipeline::{Pipeline, SkipSet};
use crate::sqlgen::{quote_ident, RowErrorPolicy, Synthesizer};

pub const MARKER_SCHEMA: &str = "_rewind_marker";
pub const MARKER_TABLE: &str = "marker";

const CREATE_MARKER_SCHEMA: &str = "CREATE DATABASE IF NOT EXISTS `_rewind_marker`";
const CREATE_MARKER_TABLE: &str =
  "CREATE TABLE IF NOT EXISTS `_rewind_marker`.`marker` (`id` BIGINT UNSIGNED NOT NULL AUTO_INCREMENT, PRIMARY KEY (`id`))";
const DROP_MARKER_SCHEMA: &str = "DROP DATABASE IF EXISTS `_rewind_marker`";
const INSERT_MARKER: &str = "INSERT INTO `_rewind_marker`.`marker` (`id`) VALUES (NULL)";

pub fn marker_table_key() -> String {
  format!("{}.{}", MARKER_SCHEMA, MARKER_TABLE)
}

/// How a rollback decides it has seen every entry belonging to the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BoundaryStrategy {
  /// Insert a sentinel row through the normal DML path and collect until
  /// its id comes back through the stream. Exact.
  #[default]
  Marker,
  /// Drain once no entry has been appended for `quiescence_delay`. For
  /// servers where the marker schema cannot be provisioned.
  Quiescence,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
  pub rows_per_sql: usize,
  pub metadata_batch: usize,
  pub boundary: BoundaryStrategy,
  pub quiescence_delay: Duration,
  pub row_error_policy: RowErrorPolicy,
  pub key_cache_dir: Option<PathBuf>,
  /// Capture from here instead of the server's current cursor.
  pub start_position: Option<LogPosition>,
}

impl Default for EngineOptions {
  fn default() -> Self {
    Self {
      rows_per_sql: 20,
      metadata_batch: 50,
      boundary: BoundaryStrategy::default(),
      quiescence_delay: Duration::from_secs(1),
      row_error_policy: RowErrorPolicy::default(),
      key_cache_dir: None,
      start_position: None,
    }
  }
}

struct Running<D: Driver> {
  pipeline: Pipeline,
  control: D::Client,
  marker: Option<D::Client>,
  view: CatalogView,
}

/// The control surface: owns the capture pipeline, the binlog-off
/// control session used to execute rollbacks, and the cycle boundary.
pub struct Engine<D: Driver> {
  driver: D,
  connection: ConnectionOptions,
  options: EngineOptions,
  skip: SkipSet,
  ledger: Arc<RollbackLedger>,
  running: Option<Running<D>>,
}

impl<D: Driver> Engine<D> {
  pub fn new(driver: D, connection: ConnectionOptions, options: EngineOptions) -> Self {
    Self {
      driver,
      connection,
      options,
      skip: SkipSet::default(),
      ledger: Arc::new(RollbackLedger::new()),
      running: None,
    }
  }

  /// Excludes a `schema.table` from capture. May be called before or
  /// during a run; takes effect for events classified afterwards.
  pub fn skip_table(&self, name: &str) -> Result<bool> {
    validate_table_key(name)?;
    Ok(self.skip.insert(name.to_string()))
  }

  pub fn unskip_table(&self, name: &str) -> Result<bool> {
    validate_table_key(name)?;
    Ok(self.skip.remove(name))
  }

  /// Entries accumulated in the current cycle so far.
  pub fn pending(&self) -> usize {
    self.ledger.len()
  }

  /// Connects the control and metadata sessions, bootstraps the table
  /// structure cache, provisions the marker objects, and spawns the
  /// capture pipeline from the server's current log cursor.
  pub async fn start(&mut self) -> Result<()> {
    if self.running.is_some() {
      return Err(Error::Stream("pipeline already running".to_string()));
    }

    let mut control = self.driver.connect(&self.connection).await?;
    // changes made through this session (rollbacks, marker DDL) must not
    // re-enter the capture stream
    control.execute("SET sql_log_bin = OFF").await?;
    control.execute("SET FOREIGN_KEY_CHECKS = 0").await?;

    let marker = match self.options.boundary {
      BoundaryStrategy::Marker => {
        control.execute(CREATE_MARKER_SCHEMA).await?;
        control.execute(CREATE_MARKER_TABLE).await?;
        // sentinel inserts go through a separate session with binary
        // logging on, sharing the commit order of the observed traffic
        Some(self.driver.connect(&self.connection).await?)
      }
      BoundaryStrategy::Quiescence => None,
    };

    let metadata = self.driver.connect(&self.connection).await?;
    let mut catalog = SchemaCatalog::new(metadata, self.options.metadata_batch, self.options.key_cache_dir.clone());
    catalog.bootstrap().await?;
    let view = catalog.view();

    let cursor = match &self.options.start_position {
      Some(position) => position.clone(),
      None => log_cursor(&mut control).await?,
    };
    tracing::info!(%cursor, "starting capture");
    let source = self.driver.start_capture(&self.connection, cursor.clone()).await?;
    let state = StreamState::new(&cursor);

    let synthesizer = Synthesizer::new(
      catalog,
      marker_table_key(),
      self.options.rows_per_sql,
      self.options.row_error_policy,
    );

    self.ledger.begin_cycle();
    let pipeline = Pipeline::spawn(
      source,
      state,
      synthesizer,
      view.clone(),
      self.skip.clone(),
      Arc::clone(&self.ledger),
      marker_table_key(),
    );

    self.running = Some(Running {
      pipeline,
      control,
      marker,
      view,
    });
    Ok(())
  }

  /// Opens a new cycle: everything captured from here belongs to the
  /// next rollback. Entries still in flight from before the boundary are
  /// collected and discarded.
  pub async fn begin(&mut self) -> Result<()> {
    let batch = self.collect_boundary().await?;
    if !batch.is_empty() {
      tracing::warn!(
        discarded = batch.statements.len(),
        "discarding statements accumulated before the cycle start"
      );
    }
    Ok(())
  }

  /// Closes the cycle at the configured boundary and collects the
  /// accumulated entries, newest-first.
  async fn collect_boundary(&mut self) -> Result<Batch> {
    match self.options.boundary {
      BoundaryStrategy::Marker => {
        let collected = {
          let running = self.running.as_mut().ok_or(Error::NotRunning)?;
          let marker = running
            .marker
            .as_mut()
            .ok_or_else(|| Error::Stream("marker session missing".to_string()))?;
          let expected = insert_marker(marker).await?;
          tracing::debug!(expected, "cycle boundary inserted");

          tokio::select! {
            batch = self.ledger.collect_up_to(expected) => Some(batch),
            _ = wait_finished(&running.pipeline) => None,
          }
        };
        match collected {
          Some(batch) => batch,
          // a task died before the marker came back, surface its error
          None => Err(self.teardown().await.err().unwrap_or_else(|| {
            Error::Stream("pipeline terminated before the cycle boundary".to_string())
          })),
        }
      }
      BoundaryStrategy::Quiescence => {
        if self.running.is_none() {
          return Err(Error::NotRunning);
        }
        Ok(self.ledger.collect_quiescent(self.options.quiescence_delay).await)
      }
    }
  }

  /// Closes the cycle and executes the inverse statements newest-first,
  /// then restores auto-increment counters for tables disturbed by
  /// inserts or deletes. Returns the executed batch.
  pub async fn rollback(&mut self) -> Result<Batch> {
    let batch = self.collect_boundary().await?;

    let running = self.running.as_mut().ok_or(Error::NotRunning)?;
    tracing::info!(statements = batch.statements.len(), "executing rollback");
    for sql in &batch.statements {
      tracing::info!(sql = %sql, "rollback");
      running.control.execute(sql).await?;
    }

    for table_key in &batch.auto_increment_tables {
      let Some(value) = running.view.auto_increment(table_key) else {
        continue;
      };
      let Some((schema, table)) = table_key.split_once('.') else {
        continue;
      };
      let sql = format!(
        "ALTER TABLE {}.{} AUTO_INCREMENT={}",
        quote_ident(schema),
        quote_ident(table),
        value
      );
      tracing::info!(sql = %sql, "restoring auto-increment");
      running.control.execute(&sql).await?;
    }

    Ok(batch)
  }

  /// Stops the pipeline, removes the marker objects and closes every
  /// session. Surfaces an error a pipeline task died with.
  pub async fn stop(&mut self) -> Result<()> {
    self.teardown().await
  }

  async fn teardown(&mut self) -> Result<()> {
    let mut running = self.running.take().ok_or(Error::NotRunning)?;
    let result = running.pipeline.shutdown().await;

    if let Some(mut marker) = running.marker {
      let _ = marker.close().await;
      let _ = running.control.execute(DROP_MARKER_SCHEMA).await;
    }
    let _ = running.control.close().await;
    result
  }
}

async fn insert_marker<C: SqlClient>(client: &mut C) -> Result<i64> {
  let outcome = client.execute(INSERT_MARKER).await?;
  i64::try_from(outcome.last_insert_id).map_err(|_| Error::Stream("marker id overflows i64".to_string()))
}

async fn wait_finished(pipeline: &Pipeline) {
  while !pipeline.is_finished() {
    sleep(Duration::from_millis(10)).await;
  }
}

fn validate_table_key(name: &str) -> Result<()> {
  match name.split_once('.') {
    Some((schema, table)) if !schema.is_empty() && !table.is_empty() && !table.contains('.') => Ok(()),
    _ => Err(Error::InvalidTableName(name.to_string())),
  }
}
