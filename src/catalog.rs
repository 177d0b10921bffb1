use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::conn::{QueryResults, SqlClient};
use crate::error::{Error, Result};

pub const UNKNOWN_COLUMN_PREFIX: &str = "dropped_column_";
pub const UNKNOWN_COLUMN_TYPE: &str = "unknown_type";
pub const STORED_GENERATED: &str = "STORED GENERATED";

const DISCOVER_TABLES_SQL: &str = "SELECT table_schema, table_name FROM information_schema.tables \
   WHERE table_type='BASE TABLE' AND table_schema NOT IN ('information_schema', 'performance_schema')";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
  pub name: String,
  pub sql_type: String,
  pub extra: String,
}

impl ColumnDescriptor {
  pub fn placeholder(idx: usize) -> Self {
    Self {
      name: format!("{}{}", UNKNOWN_COLUMN_PREFIX, idx),
      sql_type: UNKNOWN_COLUMN_TYPE.to_string(),
      extra: String::new(),
    }
  }
}

/// Per-table structure, keyed by `schema.table`. Created lazily on first
/// metadata fetch, mutated in place on drift refresh, never deleted
/// during a run.
#[derive(Debug, Clone, Default)]
pub struct TableSchema {
  pub columns: Vec<ColumnDescriptor>,
  pub primary_key: Vec<String>,
  pub unique_keys: Vec<Vec<String>>,
  pub auto_increment: Option<u64>,
}

impl TableSchema {
  /// Primary key wins; otherwise the first unique key in metadata result
  /// order. Callers must not assume which unique key is chosen when more
  /// than one exists.
  pub fn select_unique_key(&self) -> Option<&Vec<String>> {
    if !self.primary_key.is_empty() {
      Some(&self.primary_key)
    } else {
      self.unique_keys.first()
    }
  }

  /// Columns padded with trailing placeholders so a row image wider than
  /// the cached schema (DDL-add-column race) never indexes out of range.
  pub fn padded_columns(&self, row_len: usize) -> Vec<ColumnDescriptor> {
    let mut columns = self.columns.clone();
    for i in columns.len()..row_len {
      columns.push(ColumnDescriptor::placeholder(i - self.columns.len()));
    }
    columns
  }
}

type CatalogState = HashMap<String, TableSchema>;

/// Read-only handle onto the catalog, shared with the capture task and
/// the control surface. Never blocks on the network.
#[derive(Debug, Clone)]
pub struct CatalogView {
  state: Arc<RwLock<CatalogState>>,
}

impl CatalogView {
  pub fn contains(&self, table_key: &str) -> bool {
    self.state.read().unwrap().contains_key(table_key)
  }

  pub fn get(&self, table_key: &str) -> Option<TableSchema> {
    self.state.read().unwrap().get(table_key).cloned()
  }

  pub fn auto_increment(&self, table_key: &str) -> Option<u64> {
    self.state.read().unwrap().get(table_key).and_then(|t| t.auto_increment)
  }
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedKeys {
  primary_key: Vec<String>,
  unique_keys: Vec<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyCacheFile {
  created_at: chrono::DateTime<chrono::Utc>,
  keys: HashMap<String, CachedKeys>,
}

/// Caches per-table structure, bootstrapped via batched metadata queries
/// against information_schema and refreshed on demand when the
/// synthesizer detects drift.
#[derive(Debug)]
pub struct SchemaCatalog<C> {
  client: C,
  state: Arc<RwLock<CatalogState>>,
  metadata_batch: usize,
  key_cache_dir: Option<PathBuf>,
}

impl<C: SqlClient> SchemaCatalog<C> {
  pub fn new(client: C, metadata_batch: usize, key_cache_dir: Option<PathBuf>) -> Self {
    Self {
      client,
      state: Arc::new(RwLock::new(HashMap::new())),
      metadata_batch,
      key_cache_dir,
    }
  }

  pub fn view(&self) -> CatalogView {
    CatalogView {
      state: Arc::clone(&self.state),
    }
  }

  pub fn resolve(&self, table_key: &str) -> Option<TableSchema> {
    self.state.read().unwrap().get(table_key).cloned()
  }

  /// Fetches structure for every base table on the server. Fatal when the
  /// server yields nothing, which usually means missing privileges on
  /// information_schema.
  pub async fn bootstrap(&mut self) -> Result<()> {
    tracing::info!("fetching table structure from the server");
    let tables = self.discover_tables().await?;

    self.fetch_columns(&tables).await?;
    self.fetch_keys(&tables).await?;
    self.fetch_auto_increments(&tables).await?;

    if self.state.read().unwrap().is_empty() {
      return Err(Error::MetadataQuery(
        "no table definitions found, check privileges on information_schema".to_string(),
      ));
    }
    tracing::info!("table structure cached");
    Ok(())
  }

  /// Re-runs the full bootstrap in place. Invoked by the synthesizer when
  /// an event refers to an unknown table or a wider row image.
  pub async fn refresh(&mut self) -> Result<()> {
    tracing::info!("refreshing table structure");
    self.bootstrap().await
  }

  pub async fn close(&mut self) -> Result<()> {
    self.client.close().await
  }

  async fn discover_tables(&mut self) -> Result<HashMap<String, Vec<String>>> {
    let results = self.client.query(DISCOVER_TABLES_SQL).await?;
    let mut tables: HashMap<String, Vec<String>> = HashMap::new();
    for row in results.rows().into_iter().flatten() {
      let (Some(schema), Some(table)) = (row[0].clone(), row[1].clone()) else {
        continue;
      };
      tables.entry(schema).or_default().push(table);
    }
    Ok(tables)
  }

  async fn fetch_columns(&mut self, tables: &HashMap<String, Vec<String>>) -> Result<()> {
    let mut fetched: HashMap<String, Vec<ColumnDescriptor>> = HashMap::new();
    for sql in batched_queries(columns_query, tables, self.metadata_batch) {
      let results = self.query_metadata(&sql).await?;
      for row in results.rows().into_iter().flatten() {
        let [schema, table, name, sql_type, _ordinal, extra] = row else {
          continue;
        };
        let (Some(schema), Some(table), Some(name), Some(sql_type)) = (schema, table, name, sql_type) else {
          continue;
        };
        fetched.entry(format!("{}.{}", schema, table)).or_default().push(ColumnDescriptor {
          name: name.clone(),
          sql_type: sql_type.clone(),
          extra: extra.clone().unwrap_or_default(),
        });
      }
    }

    let mut state = self.state.write().unwrap();
    for (table_key, columns) in fetched {
      state.entry(table_key).or_default().columns = columns;
    }
    Ok(())
  }

  async fn fetch_keys(&mut self, tables: &HashMap<String, Vec<String>>) -> Result<()> {
    if let Some(cached) = self.read_key_cache() {
      tracing::info!("using cached key metadata");
      let mut state = self.state.write().unwrap();
      for (table_key, keys) in cached.keys {
        let entry = state.entry(table_key).or_default();
        entry.primary_key = keys.primary_key;
        entry.unique_keys = keys.unique_keys;
      }
      return Ok(());
    }

    // constraint name -> (is_primary, columns in ordinal order), with
    // first-seen constraint order preserved per table.
    let mut fetched: HashMap<String, Vec<(String, bool, Vec<String>)>> = HashMap::new();
    for sql in batched_queries(keys_query, tables, self.metadata_batch) {
      let results = self.query_metadata(&sql).await?;
      for row in results.rows().into_iter().flatten() {
        let [schema, table, constraint, column, kind, _ordinal] = row else {
          continue;
        };
        let (Some(schema), Some(table), Some(constraint), Some(column), Some(kind)) =
          (schema, table, constraint, column, kind)
        else {
          continue;
        };
        let keys = fetched.entry(format!("{}.{}", schema, table)).or_default();
        match keys.iter_mut().find(|(name, _, _)| name.as_str() == constraint.as_str()) {
          Some((_, _, columns)) => {
            if !columns.contains(column) {
              columns.push(column.clone());
            }
          }
          None => keys.push((constraint.clone(), kind.as_str() == "PRIMARY KEY", vec![column.clone()])),
        }
      }
    }

    let mut cache = self.key_cache_dir.is_some().then(HashMap::new);
    {
      let mut state = self.state.write().unwrap();
      for (table_key, keys) in fetched {
        let entry = state.entry(table_key.clone()).or_default();
        entry.primary_key = Vec::new();
        entry.unique_keys = Vec::new();
        for (_, is_primary, columns) in keys {
          if is_primary {
            entry.primary_key = columns;
          } else {
            entry.unique_keys.push(columns);
          }
        }
        if let Some(cache) = cache.as_mut() {
          cache.insert(
            table_key,
            CachedKeys {
              primary_key: entry.primary_key.clone(),
              unique_keys: entry.unique_keys.clone(),
            },
          );
        }
      }
    }
    if let Some(keys) = cache {
      self.write_key_cache(keys);
    }
    Ok(())
  }

  async fn fetch_auto_increments(&mut self, tables: &HashMap<String, Vec<String>>) -> Result<()> {
    let mut fetched: HashMap<String, u64> = HashMap::new();
    for sql in batched_queries(auto_increment_query, tables, self.metadata_batch) {
      let results = self.query_metadata(&sql).await?;
      for row in results.rows().into_iter().flatten() {
        let [schema, table, auto_increment] = row else {
          continue;
        };
        let (Some(schema), Some(table)) = (schema, table) else {
          continue;
        };
        // AUTO_INCREMENT is NULL for tables without one.
        if let Some(value) = auto_increment.as_deref().and_then(|v| v.parse().ok()) {
          fetched.insert(format!("{}.{}", schema, table), value);
        }
      }
    }

    let mut state = self.state.write().unwrap();
    for (table_key, value) in fetched {
      state.entry(table_key).or_default().auto_increment = Some(value);
    }
    Ok(())
  }

  async fn query_metadata(&mut self, sql: &str) -> Result<QueryResults> {
    self.client.query(sql).await.map_err(|err| {
      tracing::error!(%sql, %err, "metadata query failed");
      Error::MetadataQuery(err.to_string())
    })
  }

  fn key_cache_path(&self) -> Option<PathBuf> {
    self.key_cache_dir.as_ref().map(|dir| dir.join("rewind.keys.json"))
  }

  fn read_key_cache(&self) -> Option<KeyCacheFile> {
    let path = self.key_cache_path()?;
    let bytes = std::fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
  }

  fn write_key_cache(&self, keys: HashMap<String, CachedKeys>) {
    let Some(path) = self.key_cache_path() else {
      return;
    };
    let file = KeyCacheFile {
      created_at: chrono::Utc::now(),
      keys,
    };
    let written = serde_json::to_vec(&file)
      .map_err(|err| err.to_string())
      .and_then(|bytes| std::fs::write(&path, bytes).map_err(|err| err.to_string()));
    match written {
      Ok(()) => tracing::info!(path = %path.display(), "wrote key metadata cache"),
      Err(err) => tracing::warn!(%err, "failed to write key metadata cache"),
    }
  }
}

fn quoted_list(names: &[String]) -> String {
  names.iter().map(|n| format!("'{}'", n)).collect::<Vec<_>>().join(",")
}

fn columns_query(schema: &str, tables: &[String]) -> String {
  format!(
    "SELECT table_schema, table_name, COLUMN_NAME, DATA_TYPE, ORDINAL_POSITION, EXTRA \
     FROM information_schema.columns WHERE table_schema='{}' AND table_name IN ({}) \
     ORDER BY table_schema ASC, table_name ASC, ORDINAL_POSITION ASC",
    schema,
    quoted_list(tables)
  )
}

fn keys_query(schema: &str, tables: &[String]) -> String {
  format!(
    "SELECT k.table_schema, k.table_name, k.CONSTRAINT_NAME, k.COLUMN_NAME, c.CONSTRAINT_TYPE, k.ORDINAL_POSITION \
     FROM information_schema.TABLE_CONSTRAINTS AS c \
     INNER JOIN information_schema.KEY_COLUMN_USAGE AS k \
     ON c.CONSTRAINT_NAME = k.CONSTRAINT_NAME AND c.table_schema = k.table_schema AND c.table_name = k.table_name \
     WHERE c.CONSTRAINT_TYPE IN ('PRIMARY KEY', 'UNIQUE') AND c.table_schema='{}' AND c.table_name IN ({}) \
     ORDER BY k.table_schema ASC, k.table_name ASC, k.CONSTRAINT_NAME ASC, k.ORDINAL_POSITION ASC",
    schema,
    quoted_list(tables)
  )
}

fn auto_increment_query(schema: &str, tables: &[String]) -> String {
  format!(
    "SELECT TABLE_SCHEMA, TABLE_NAME, AUTO_INCREMENT FROM INFORMATION_SCHEMA.TABLES \
     WHERE TABLE_SCHEMA='{}' AND TABLE_NAME IN ({})",
    schema,
    quoted_list(tables)
  )
}

/// Splits per-schema table lists into fixed-size groups to bound query
/// length, one query string per group.
fn batched_queries(
  build: fn(&str, &[String]) -> String,
  tables: &HashMap<String, Vec<String>>,
  batch: usize,
) -> Vec<String> {
  let mut queries = Vec::new();
  for (schema, names) in tables {
    for group in names.chunks(batch.max(1)) {
      queries.push(build(schema, group));
    }
  }
  queries
}

#[cfg(test)]
mod test {
  use super::*;

  fn schema_with_keys(primary: &[&str], uniques: &[&[&str]]) -> TableSchema {
    TableSchema {
      columns: vec![
        ColumnDescriptor {
          name: "id".to_string(),
          sql_type: "bigint".to_string(),
          extra: String::new(),
        },
        ColumnDescriptor {
          name: "v".to_string(),
          sql_type: "varchar".to_string(),
          extra: String::new(),
        },
      ],
      primary_key: primary.iter().map(|s| s.to_string()).collect(),
      unique_keys: uniques
        .iter()
        .map(|k| k.iter().map(|s| s.to_string()).collect())
        .collect(),
      auto_increment: None,
    }
  }

  #[test]
  fn primary_key_wins_over_unique() {
    let schema = schema_with_keys(&["id"], &[&["v"]]);
    assert_eq!(Some(&vec!["id".to_string()]), schema.select_unique_key());
  }

  #[test]
  fn first_unique_key_when_no_primary() {
    let schema = schema_with_keys(&[], &[&["v"], &["id", "v"]]);
    assert_eq!(Some(&vec!["v".to_string()]), schema.select_unique_key());
  }

  #[test]
  fn no_key_at_all() {
    let schema = schema_with_keys(&[], &[]);
    assert_eq!(None, schema.select_unique_key());
  }

  #[test]
  fn padded_columns_synthesizes_placeholders() {
    let schema = schema_with_keys(&["id"], &[]);
    let padded = schema.padded_columns(4);
    assert_eq!(4, padded.len());
    assert_eq!("dropped_column_0", padded[2].name);
    assert_eq!("dropped_column_1", padded[3].name);
    assert_eq!(UNKNOWN_COLUMN_TYPE, padded[3].sql_type);

    // narrower or equal rows leave the columns untouched
    assert_eq!(2, schema.padded_columns(1).len());
  }

  #[test]
  fn key_cache_file_round_trips_through_json() {
    let mut keys = HashMap::new();
    keys.insert(
      "app.users".to_string(),
      CachedKeys {
        primary_key: vec!["id".to_string()],
        unique_keys: vec![vec!["email".to_string()]],
      },
    );
    let file = KeyCacheFile {
      created_at: chrono::Utc::now(),
      keys,
    };

    let bytes = serde_json::to_vec(&file).unwrap();
    let parsed: KeyCacheFile = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(file.created_at, parsed.created_at);
    assert_eq!(vec!["id".to_string()], parsed.keys["app.users"].primary_key);
    assert_eq!(vec![vec!["email".to_string()]], parsed.keys["app.users"].unique_keys);
  }

  #[test]
  fn batched_queries_bound_group_size() {
    let mut tables = HashMap::new();
    tables.insert(
      "app".to_string(),
      (0..5).map(|i| format!("t{}", i)).collect::<Vec<_>>(),
    );
    let queries = batched_queries(columns_query, &tables, 2);
    assert_eq!(3, queries.len());
    assert!(queries.iter().all(|q| q.contains("table_schema='app'")));
  }
}
