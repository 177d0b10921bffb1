use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::sleep;

use rewind::conn::{ConnectionOptions, Driver, EventSource, ExecOutcome, QueryResults, SqlClient};
use rewind::event::{EventFlags, EventPacket, LogEvent, LogPosition, MutationKind, RowValue, RowsData, TableMapEvent};
use rewind::{BoundaryStrategy, Engine, EngineOptions, Error};

const TYPE_LONGLONG: u8 = 8;
const TYPE_VARCHAR: u8 = 15;

#[derive(Debug, Clone)]
struct FakeTable {
  schema: String,
  name: String,
  columns: Vec<(String, String, String)>,
  primary_key: Vec<String>,
  auto_increment: Option<u64>,
}

impl FakeTable {
  fn new(schema: &str, name: &str, columns: &[(&str, &str)], primary_key: &[&str], auto_increment: Option<u64>) -> Self {
    Self {
      schema: schema.to_string(),
      name: name.to_string(),
      columns: columns
        .iter()
        .map(|(n, t)| (n.to_string(), t.to_string(), String::new()))
        .collect(),
      primary_key: primary_key.iter().map(|s| s.to_string()).collect(),
      auto_increment,
    }
  }

  fn with_extra(mut self, column: &str, extra: &str) -> Self {
    for c in self.columns.iter_mut() {
      if c.0 == column {
        c.2 = extra.to_string();
      }
    }
    self
  }
}

#[derive(Debug)]
struct ServerState {
  tables: Vec<FakeTable>,
  executed: Vec<String>,
  events: VecDeque<EventPacket>,
  next_error: Option<String>,
  position: u32,
  marker_seq: i64,
  closed: bool,
}

impl ServerState {
  fn push_packet(&mut self, event: LogEvent, event_size: u32) {
    self.position += event_size;
    self.events.push_back(EventPacket {
      timestamp: 0,
      position: self.position,
      event_size,
      flags: EventFlags::empty(),
      event,
    });
  }
}

/// An in-memory server: answers metadata queries from `tables`, records
/// everything executed, and reflects marker inserts back into the event
/// stream the way the binary log would.
#[derive(Debug, Clone)]
struct FakeServer {
  inner: Arc<Mutex<ServerState>>,
}

impl FakeServer {
  fn new(tables: Vec<FakeTable>) -> Self {
    Self {
      inner: Arc::new(Mutex::new(ServerState {
        tables,
        executed: Vec::new(),
        events: VecDeque::new(),
        next_error: None,
        position: 4,
        marker_seq: 0,
        closed: false,
      })),
    }
  }

  fn driver(&self) -> FakeDriver {
    FakeDriver { server: self.clone() }
  }

  fn push_dml(&self, schema: &str, table: &str, kind: MutationKind, types: &[u8], metas: &[u16], rows: Vec<Vec<RowValue>>) {
    let mut state = self.inner.lock().unwrap();
    state.push_packet(
      LogEvent::TableMap(TableMapEvent {
        schema: schema.to_string(),
        table: table.to_string(),
        column_types: types.to_vec(),
        column_metas: metas.to_vec(),
      }),
      40,
    );
    let data = RowsData { rows };
    let event = match kind {
      MutationKind::Insert => LogEvent::Insert(data),
      MutationKind::Update => LogEvent::Update(data),
      MutationKind::Delete => LogEvent::Delete(data),
    };
    state.push_packet(event, 60);
  }

  fn push_error(&self, message: &str) {
    self.inner.lock().unwrap().next_error = Some(message.to_string());
  }

  fn add_column(&self, schema: &str, table: &str, name: &str, sql_type: &str) {
    let mut state = self.inner.lock().unwrap();
    for t in state.tables.iter_mut() {
      if t.schema == schema && t.name == table {
        t.columns.push((name.to_string(), sql_type.to_string(), String::new()));
      }
    }
  }

  fn executed(&self) -> Vec<String> {
    self.inner.lock().unwrap().executed.clone()
  }
}

#[derive(Debug, Clone)]
struct FakeDriver {
  server: FakeServer,
}

impl Driver for FakeDriver {
  type Client = FakeClient;
  type Events = FakeEvents;

  fn connect(&self, _options: &ConnectionOptions) -> impl Future<Output = rewind::Result<FakeClient>> + Send {
    let server = self.server.clone();
    async move { Ok(FakeClient { server }) }
  }

  fn start_capture(
    &self,
    _options: &ConnectionOptions,
    _position: LogPosition,
  ) -> impl Future<Output = rewind::Result<FakeEvents>> + Send {
    let server = self.server.clone();
    async move {
      server.inner.lock().unwrap().closed = false;
      Ok(FakeEvents { server })
    }
  }
}

#[derive(Debug)]
struct FakeClient {
  server: FakeServer,
}

fn results(columns: &[&str], rows: Vec<Vec<Option<String>>>) -> QueryResults {
  QueryResults {
    columns: columns.iter().map(|c| c.to_string()).collect(),
    values: rows.into_iter().flatten().collect(),
  }
}

impl SqlClient for FakeClient {
  fn query(&mut self, sql: &str) -> impl Future<Output = rewind::Result<QueryResults>> + Send {
    let server = self.server.clone();
    let sql = sql.to_string();
    async move {
      let state = server.inner.lock().unwrap();

      if sql == "SHOW MASTER STATUS" {
        return Ok(results(
          &["File", "Position"],
          vec![vec![Some("binlog.000001".to_string()), Some("4".to_string())]],
        ));
      }

      if sql.contains("table_type='BASE TABLE'") {
        let rows = state
          .tables
          .iter()
          .map(|t| vec![Some(t.schema.clone()), Some(t.name.clone())])
          .collect();
        return Ok(results(&["table_schema", "table_name"], rows));
      }

      let selected: Vec<&FakeTable> = state
        .tables
        .iter()
        .filter(|t| sql.contains(&format!("table_schema='{}'", t.schema)) && sql.contains(&format!("'{}'", t.name)))
        .collect();

      if sql.contains("information_schema.columns") {
        let mut rows = Vec::new();
        for t in &selected {
          for (i, (name, sql_type, extra)) in t.columns.iter().enumerate() {
            rows.push(vec![
              Some(t.schema.clone()),
              Some(t.name.clone()),
              Some(name.clone()),
              Some(sql_type.clone()),
              Some((i + 1).to_string()),
              Some(extra.clone()),
            ]);
          }
        }
        return Ok(results(
          &["table_schema", "table_name", "COLUMN_NAME", "DATA_TYPE", "ORDINAL_POSITION", "EXTRA"],
          rows,
        ));
      }

      if sql.contains("TABLE_CONSTRAINTS") {
        let mut rows = Vec::new();
        for t in &selected {
          for (i, column) in t.primary_key.iter().enumerate() {
            rows.push(vec![
              Some(t.schema.clone()),
              Some(t.name.clone()),
              Some("PRIMARY".to_string()),
              Some(column.clone()),
              Some("PRIMARY KEY".to_string()),
              Some((i + 1).to_string()),
            ]);
          }
        }
        return Ok(results(
          &["table_schema", "table_name", "CONSTRAINT_NAME", "COLUMN_NAME", "CONSTRAINT_TYPE", "ORDINAL_POSITION"],
          rows,
        ));
      }

      if sql.contains("AUTO_INCREMENT FROM") {
        let rows = state
          .tables
          .iter()
          .filter(|t| sql.contains(&format!("TABLE_SCHEMA='{}'", t.schema)) && sql.contains(&format!("'{}'", t.name)))
          .map(|t| {
            vec![
              Some(t.schema.clone()),
              Some(t.name.clone()),
              t.auto_increment.map(|v| v.to_string()),
            ]
          })
          .collect();
        return Ok(results(&["TABLE_SCHEMA", "TABLE_NAME", "AUTO_INCREMENT"], rows));
      }

      Ok(QueryResults::default())
    }
  }

  fn execute(&mut self, sql: &str) -> impl Future<Output = rewind::Result<ExecOutcome>> + Send {
    let server = self.server.clone();
    let sql = sql.to_string();
    async move {
      let mut state = server.inner.lock().unwrap();
      state.executed.push(sql.clone());

      if sql.starts_with("INSERT INTO `_rewind_marker`") {
        state.marker_seq += 1;
        let seq = state.marker_seq;
        state.push_packet(
          LogEvent::TableMap(TableMapEvent {
            schema: "_rewind_marker".to_string(),
            table: "marker".to_string(),
            column_types: vec![TYPE_LONGLONG],
            column_metas: vec![0],
          }),
          40,
        );
        state.push_packet(
          LogEvent::Insert(RowsData {
            rows: vec![vec![RowValue::Int(seq)]],
          }),
          45,
        );
        return Ok(ExecOutcome {
          affected_rows: 1,
          last_insert_id: seq as u64,
        });
      }

      Ok(ExecOutcome {
        affected_rows: 1,
        last_insert_id: 0,
      })
    }
  }

  fn close(&mut self) -> impl Future<Output = rewind::Result<()>> + Send {
    async { Ok(()) }
  }
}

#[derive(Debug)]
struct FakeEvents {
  server: FakeServer,
}

impl EventSource for FakeEvents {
  fn recv(&mut self) -> impl Future<Output = Option<rewind::Result<EventPacket>>> + Send {
    let server = self.server.clone();
    async move {
      loop {
        {
          let mut state = server.inner.lock().unwrap();
          if let Some(message) = state.next_error.take() {
            return Some(Err(Error::Stream(message)));
          }
          if let Some(packet) = state.events.pop_front() {
            return Some(Ok(packet));
          }
          if state.closed {
            return None;
          }
        }
        sleep(Duration::from_millis(2)).await;
      }
    }
  }

  fn close(&mut self) -> impl Future<Output = rewind::Result<()>> + Send {
    let server = self.server.clone();
    async move {
      server.inner.lock().unwrap().closed = true;
      Ok(())
    }
  }
}

fn users_table() -> FakeTable {
  FakeTable::new(
    "app",
    "users",
    &[("id", "bigint"), ("name", "varchar")],
    &["id"],
    Some(100),
  )
}

fn users_types() -> (Vec<u8>, Vec<u16>) {
  (vec![TYPE_LONGLONG, TYPE_VARCHAR], vec![0, 255])
}

async fn started_engine(server: &FakeServer, options: EngineOptions) -> Engine<FakeDriver> {
  let mut engine = Engine::new(server.driver(), ConnectionOptions::default(), options);
  engine.start().await.unwrap();
  engine
}

#[tokio::test]
async fn insert_rolls_back_with_deletes_and_auto_increment_restore() {
  let server = FakeServer::new(vec![users_table()]);
  let mut engine = started_engine(&server, EngineOptions::default()).await;

  let (types, metas) = users_types();
  server.push_dml(
    "app",
    "users",
    MutationKind::Insert,
    &types,
    &metas,
    vec![
      vec![RowValue::Int(1), RowValue::Text("ada".to_string())],
      vec![RowValue::Int(2), RowValue::Text("bob".to_string())],
    ],
  );

  let batch = engine.rollback().await.unwrap();
  assert_eq!(
    vec![
      "DELETE FROM `app`.`users` WHERE `id`=2",
      "DELETE FROM `app`.`users` WHERE `id`=1",
    ],
    batch.statements
  );

  let executed = server.executed();
  assert!(executed.contains(&"DELETE FROM `app`.`users` WHERE `id`=1".to_string()));
  assert!(executed.contains(&"ALTER TABLE `app`.`users` AUTO_INCREMENT=100".to_string()));

  engine.stop().await.unwrap();
}

#[tokio::test]
async fn generated_columns_do_not_shift_key_addressing() {
  // the generated column comes before the primary key, so dropping it
  // from the image moves the key's position
  let table = FakeTable::new(
    "app",
    "orders",
    &[("total", "bigint"), ("id", "bigint")],
    &["id"],
    None,
  )
  .with_extra("total", "STORED GENERATED");
  let server = FakeServer::new(vec![table]);
  let mut engine = started_engine(&server, EngineOptions::default()).await;

  server.push_dml(
    "app",
    "orders",
    MutationKind::Insert,
    &[TYPE_LONGLONG, TYPE_LONGLONG],
    &[0, 0],
    vec![vec![RowValue::Int(10), RowValue::Int(1)]],
  );

  let batch = engine.rollback().await.unwrap();
  assert_eq!(vec!["DELETE FROM `app`.`orders` WHERE `id`=1"], batch.statements);

  engine.stop().await.unwrap();
}

#[tokio::test]
async fn delete_rolls_back_with_chunked_inserts() {
  let server = FakeServer::new(vec![users_table()]);
  let options = EngineOptions {
    rows_per_sql: 2,
    ..Default::default()
  };
  let mut engine = started_engine(&server, options).await;

  let (types, metas) = users_types();
  server.push_dml(
    "app",
    "users",
    MutationKind::Delete,
    &types,
    &metas,
    vec![
      vec![RowValue::Int(1), RowValue::Text("ada".to_string())],
      vec![RowValue::Int(2), RowValue::Text("bob".to_string())],
      vec![RowValue::Int(3), RowValue::Text("eve".to_string())],
    ],
  );

  let batch = engine.rollback().await.unwrap();
  // newest-first: the trailing chunk comes back before the leading one,
  // key values verbatim so identity is restored exactly
  assert_eq!(
    vec![
      "INSERT INTO `app`.`users` (`id`,`name`) VALUES (3,'eve')",
      "INSERT INTO `app`.`users` (`id`,`name`) VALUES (1,'ada'),(2,'bob')",
    ],
    batch.statements
  );

  engine.stop().await.unwrap();
}

#[tokio::test]
async fn update_rolls_back_with_a_minimal_diff() {
  let server = FakeServer::new(vec![users_table()]);
  let mut engine = started_engine(&server, EngineOptions::default()).await;

  let (types, metas) = users_types();
  server.push_dml(
    "app",
    "users",
    MutationKind::Update,
    &types,
    &metas,
    vec![
      vec![RowValue::Int(1), RowValue::Text("a".to_string())],
      vec![RowValue::Int(1), RowValue::Text("b".to_string())],
    ],
  );

  let batch = engine.rollback().await.unwrap();
  assert_eq!(vec!["UPDATE `app`.`users` SET `name`='a' WHERE `id`=1"], batch.statements);
  // updates do not disturb auto-increment counters
  assert!(batch.auto_increment_tables.is_empty());
  assert!(!server.executed().iter().any(|s| s.starts_with("ALTER TABLE")));

  engine.stop().await.unwrap();
}

#[tokio::test]
async fn inverse_statements_run_newest_first_across_events() {
  let server = FakeServer::new(vec![users_table()]);
  let mut engine = started_engine(&server, EngineOptions::default()).await;

  let (types, metas) = users_types();
  server.push_dml(
    "app",
    "users",
    MutationKind::Insert,
    &types,
    &metas,
    vec![vec![RowValue::Int(1), RowValue::Text("a".to_string())]],
  );
  server.push_dml(
    "app",
    "users",
    MutationKind::Update,
    &types,
    &metas,
    vec![
      vec![RowValue::Int(1), RowValue::Text("a".to_string())],
      vec![RowValue::Int(1), RowValue::Text("b".to_string())],
    ],
  );

  let batch = engine.rollback().await.unwrap();
  assert_eq!(
    vec![
      "UPDATE `app`.`users` SET `name`='a' WHERE `id`=1",
      "DELETE FROM `app`.`users` WHERE `id`=1",
    ],
    batch.statements
  );

  engine.stop().await.unwrap();
}

#[tokio::test]
async fn skipped_and_unknown_tables_are_not_captured() {
  let server = FakeServer::new(vec![
    users_table(),
    FakeTable::new("app", "audit", &[("id", "bigint")], &["id"], None),
  ]);
  let mut engine = started_engine(&server, EngineOptions::default()).await;
  engine.skip_table("app.audit").unwrap();
  assert!(engine.skip_table("audit").is_err());

  let (types, metas) = users_types();
  server.push_dml(
    "app",
    "audit",
    MutationKind::Insert,
    &[TYPE_LONGLONG],
    &[0],
    vec![vec![RowValue::Int(9)]],
  );
  // a table absent from the structure cache is dropped too
  server.push_dml(
    "other",
    "mystery",
    MutationKind::Insert,
    &[TYPE_LONGLONG],
    &[0],
    vec![vec![RowValue::Int(5)]],
  );
  server.push_dml(
    "app",
    "users",
    MutationKind::Insert,
    &types,
    &metas,
    vec![vec![RowValue::Int(1), RowValue::Text("a".to_string())]],
  );

  let batch = engine.rollback().await.unwrap();
  assert_eq!(vec!["DELETE FROM `app`.`users` WHERE `id`=1"], batch.statements);

  engine.stop().await.unwrap();
}

#[tokio::test]
async fn consecutive_cycles_are_isolated() {
  let server = FakeServer::new(vec![users_table()]);
  let mut engine = started_engine(&server, EngineOptions::default()).await;

  let (types, metas) = users_types();
  server.push_dml(
    "app",
    "users",
    MutationKind::Insert,
    &types,
    &metas,
    vec![vec![RowValue::Int(1), RowValue::Text("a".to_string())]],
  );
  let first = engine.rollback().await.unwrap();
  assert_eq!(1, first.statements.len());

  engine.begin().await.unwrap();
  server.push_dml(
    "app",
    "users",
    MutationKind::Insert,
    &types,
    &metas,
    vec![vec![RowValue::Int(2), RowValue::Text("b".to_string())]],
  );
  let second = engine.rollback().await.unwrap();
  assert_eq!(vec!["DELETE FROM `app`.`users` WHERE `id`=2"], second.statements);

  engine.stop().await.unwrap();
}

#[tokio::test]
async fn wider_rows_trigger_a_structure_refresh() {
  let server = FakeServer::new(vec![users_table()]);
  let mut engine = started_engine(&server, EngineOptions::default()).await;

  // a column lands via DDL after the cache was bootstrapped
  server.add_column("app", "users", "email", "varchar");
  server.push_dml(
    "app",
    "users",
    MutationKind::Insert,
    &[TYPE_LONGLONG, TYPE_VARCHAR, TYPE_VARCHAR],
    &[0, 255, 255],
    vec![vec![
      RowValue::Int(1),
      RowValue::Text("a".to_string()),
      RowValue::Text("a@example.com".to_string()),
    ]],
  );

  let batch = engine.rollback().await.unwrap();
  assert_eq!(vec!["DELETE FROM `app`.`users` WHERE `id`=1"], batch.statements);

  engine.stop().await.unwrap();
}

#[tokio::test]
async fn quiescence_boundary_needs_no_marker_objects() {
  let server = FakeServer::new(vec![users_table()]);
  let options = EngineOptions {
    boundary: BoundaryStrategy::Quiescence,
    quiescence_delay: Duration::from_millis(50),
    ..Default::default()
  };
  let mut engine = started_engine(&server, options).await;

  let (types, metas) = users_types();
  server.push_dml(
    "app",
    "users",
    MutationKind::Insert,
    &types,
    &metas,
    vec![vec![RowValue::Int(1), RowValue::Text("a".to_string())]],
  );
  sleep(Duration::from_millis(120)).await;

  let batch = engine.rollback().await.unwrap();
  assert_eq!(vec!["DELETE FROM `app`.`users` WHERE `id`=1"], batch.statements);
  assert!(!server.executed().iter().any(|s| s.contains("_rewind_marker")));

  engine.stop().await.unwrap();
}

#[tokio::test]
async fn key_metadata_is_cached_on_disk() {
  let dir = tempfile::tempdir().unwrap();
  let server = FakeServer::new(vec![users_table()]);
  let options = EngineOptions {
    key_cache_dir: Some(dir.path().to_path_buf()),
    ..Default::default()
  };

  let mut engine = started_engine(&server, options.clone()).await;
  engine.stop().await.unwrap();
  assert!(dir.path().join("rewind.keys.json").exists());

  // a later run bootstraps key metadata from the cache file
  let mut engine = Engine::new(server.driver(), ConnectionOptions::default(), options);
  engine.start().await.unwrap();

  let (types, metas) = users_types();
  server.push_dml(
    "app",
    "users",
    MutationKind::Insert,
    &types,
    &metas,
    vec![vec![RowValue::Int(4), RowValue::Text("d".to_string())]],
  );
  let batch = engine.rollback().await.unwrap();
  assert_eq!(vec!["DELETE FROM `app`.`users` WHERE `id`=4"], batch.statements);

  engine.stop().await.unwrap();
}

#[tokio::test]
async fn stream_fault_surfaces_through_rollback() {
  let server = FakeServer::new(vec![users_table()]);
  let mut engine = started_engine(&server, EngineOptions::default()).await;

  server.push_error("connection reset by peer");
  match engine.rollback().await {
    Err(Error::Stream(message)) => assert_eq!("connection reset by peer", message),
    unexpected => panic!("unexpected {:?}", unexpected),
  }
  // the pipeline is gone after a fatal fault
  match engine.stop().await {
    Err(Error::NotRunning) => {}
    unexpected => panic!("unexpected {:?}", unexpected),
  }
}
