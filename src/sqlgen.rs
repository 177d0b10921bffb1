use crate::catalog::{ColumnDescriptor, SchemaCatalog, STORED_GENERATED};
use crate::conn::SqlClient;
use crate::error::{Error, Result};
use crate::event::{MutationKind, RowMutationEvent, RowValue};

// Wire-level column type codes.
// https://dev.mysql.com/doc/dev/mysql-server/latest/field__types_8h.html
const MYSQL_TYPE_DECIMAL: u8 = 0;
const MYSQL_TYPE_TINY: u8 = 1;
const MYSQL_TYPE_SHORT: u8 = 2;
const MYSQL_TYPE_LONG: u8 = 3;
const MYSQL_TYPE_FLOAT: u8 = 4;
const MYSQL_TYPE_DOUBLE: u8 = 5;
const MYSQL_TYPE_NULL: u8 = 6;
const MYSQL_TYPE_TIMESTAMP: u8 = 7;
const MYSQL_TYPE_LONGLONG: u8 = 8;
const MYSQL_TYPE_INT24: u8 = 9;
const MYSQL_TYPE_DATE: u8 = 10;
const MYSQL_TYPE_TIME: u8 = 11;
const MYSQL_TYPE_DATETIME: u8 = 12;
const MYSQL_TYPE_YEAR: u8 = 13;
const MYSQL_TYPE_NEWDATE: u8 = 14;
const MYSQL_TYPE_VARCHAR: u8 = 15;
const MYSQL_TYPE_BIT: u8 = 16;
const MYSQL_TYPE_TIMESTAMP2: u8 = 17;
const MYSQL_TYPE_DATETIME2: u8 = 18;
const MYSQL_TYPE_TIME2: u8 = 19;
const MYSQL_TYPE_JSON: u8 = 245;
const MYSQL_TYPE_NEWDECIMAL: u8 = 246;
const MYSQL_TYPE_ENUM: u8 = 247;
const MYSQL_TYPE_SET: u8 = 248;
const MYSQL_TYPE_TINY_BLOB: u8 = 249;
const MYSQL_TYPE_MEDIUM_BLOB: u8 = 250;
const MYSQL_TYPE_LONG_BLOB: u8 = 251;
const MYSQL_TYPE_BLOB: u8 = 252;
const MYSQL_TYPE_VAR_STRING: u8 = 253;
const MYSQL_TYPE_STRING: u8 = 254;
const MYSQL_TYPE_GEOMETRY: u8 = 255;

/// Semantic category driving quoting, escaping and equality-comparison
/// semantics for a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnCategory {
  Integer,
  Float,
  Decimal,
  Temporal,
  Text,
  Binary,
  Unknown,
}

/// Maps a wire type code (plus metadata for variable-width types) and the
/// declared SQL type to a semantic category. A blob wire type whose
/// declared type contains "text" is textual, not binary.
pub fn column_category(wire_type: u8, meta: u16, declared_type: &str) -> ColumnCategory {
  // For MYSQL_TYPE_STRING the real type may be packed into the metadata.
  let mut wire_type = wire_type;
  if wire_type == MYSQL_TYPE_STRING && meta >= 256 {
    let b0 = (meta >> 8) as u8;
    wire_type = if b0 & 0x30 != 0x30 { b0 | 0x30 } else { b0 };
  }

  match wire_type {
    MYSQL_TYPE_TINY | MYSQL_TYPE_SHORT | MYSQL_TYPE_INT24 | MYSQL_TYPE_LONG | MYSQL_TYPE_LONGLONG
    | MYSQL_TYPE_BIT | MYSQL_TYPE_YEAR | MYSQL_TYPE_ENUM | MYSQL_TYPE_SET => ColumnCategory::Integer,
    MYSQL_TYPE_FLOAT | MYSQL_TYPE_DOUBLE => ColumnCategory::Float,
    MYSQL_TYPE_DECIMAL | MYSQL_TYPE_NEWDECIMAL => ColumnCategory::Decimal,
    MYSQL_TYPE_TIMESTAMP | MYSQL_TYPE_TIMESTAMP2 | MYSQL_TYPE_DATETIME | MYSQL_TYPE_DATETIME2
    | MYSQL_TYPE_DATE | MYSQL_TYPE_NEWDATE | MYSQL_TYPE_TIME | MYSQL_TYPE_TIME2 => ColumnCategory::Temporal,
    MYSQL_TYPE_VARCHAR | MYSQL_TYPE_VAR_STRING | MYSQL_TYPE_STRING => ColumnCategory::Text,
    MYSQL_TYPE_TINY_BLOB | MYSQL_TYPE_MEDIUM_BLOB | MYSQL_TYPE_LONG_BLOB | MYSQL_TYPE_BLOB
    | MYSQL_TYPE_JSON | MYSQL_TYPE_GEOMETRY => {
      if declared_type.to_lowercase().contains("text") {
        ColumnCategory::Text
      } else {
        ColumnCategory::Binary
      }
    }
    MYSQL_TYPE_NULL => ColumnCategory::Unknown,
    _ => ColumnCategory::Unknown,
  }
}

#[derive(Debug, Clone)]
pub struct ColumnModel {
  pub name: String,
  pub category: ColumnCategory,
}

pub fn quote_ident(name: &str) -> String {
  format!("`{}`", name.replace('`', "``"))
}

pub fn escape_string(s: &str) -> String {
  let mut out = String::with_capacity(s.len());
  for c in s.chars() {
    match c {
      '\'' => out.push_str("\\'"),
      '"' => out.push_str("\\\""),
      '\\' => out.push_str("\\\\"),
      '\n' => out.push_str("\\n"),
      '\r' => out.push_str("\\r"),
      '\0' => out.push_str("\\0"),
      '\x1a' => out.push_str("\\Z"),
      c => out.push(c),
    }
  }
  out
}

fn hex_literal(bytes: &[u8]) -> String {
  if bytes.is_empty() {
    return "''".to_string();
  }
  let mut out = String::with_capacity(2 + bytes.len() * 2);
  out.push_str("0x");
  for b in bytes {
    out.push_str(&format!("{:02x}", b));
  }
  out
}

/// Renders one value as a SQL literal under the column's category.
pub fn render_literal(value: &RowValue, category: ColumnCategory) -> std::result::Result<String, String> {
  match value {
    RowValue::Null => Ok("NULL".to_string()),
    RowValue::UInt(v) => Ok(v.to_string()),
    RowValue::Int(v) => Ok(v.to_string()),
    RowValue::Float(v) => Ok(v.to_string()),
    RowValue::Decimal(v) => Ok(v.clone()),
    RowValue::Text(v) => Ok(format!("'{}'", escape_string(v))),
    RowValue::Bytes(v) => match category {
      ColumnCategory::Binary | ColumnCategory::Unknown => Ok(hex_literal(v)),
      _ => std::str::from_utf8(v)
        .map(|s| format!("'{}'", escape_string(s)))
        .map_err(|_| "invalid utf-8 in a textual column value".to_string()),
    },
  }
}

/// Category-specific equality: byte-wise for binary columns, plain value
/// equality otherwise. Text-flavored blobs are converted to `Text`
/// before diffing, so string equality applies to them.
pub fn values_equal(a: &RowValue, b: &RowValue, category: ColumnCategory) -> bool {
  match category {
    ColumnCategory::Binary | ColumnCategory::Unknown => match (a, b) {
      (RowValue::Null, RowValue::Null) => true,
      (RowValue::Bytes(x), RowValue::Bytes(y)) => x == y,
      _ => false,
    },
    _ => a == b,
  }
}

fn equality_predicate(model: &ColumnModel, value: &RowValue) -> std::result::Result<String, String> {
  if matches!(value, RowValue::Null) {
    return Ok(format!("{} IS NULL", quote_ident(&model.name)));
  }
  Ok(format!("{}={}", quote_ident(&model.name), render_literal(value, model.category)?))
}

fn where_clause(models: &[ColumnModel], row: &[RowValue], key_idx: &[usize]) -> std::result::Result<String, String> {
  let indices: Vec<usize> = if key_idx.is_empty() {
    (0..row.len()).collect()
  } else {
    key_idx.to_vec()
  };
  let mut parts = Vec::with_capacity(indices.len());
  for i in indices {
    parts.push(equality_predicate(&models[i], &row[i])?);
  }
  Ok(parts.join(" AND "))
}

fn qualified_table(schema: &str, table: &str) -> String {
  format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Inverse of an insert: one DELETE per affected row, addressed by the
/// unique key when one exists, else by a full-row match.
pub fn build_deletes(
  schema: &str,
  table: &str,
  models: &[ColumnModel],
  rows: &[Vec<RowValue>],
  key_idx: &[usize],
) -> Vec<std::result::Result<String, String>> {
  rows
    .iter()
    .map(|row| {
      where_clause(models, row, key_idx).map(|cond| format!("DELETE FROM {} WHERE {}", qualified_table(schema, table), cond))
    })
    .collect()
}

/// Inverse of a delete: INSERT statements of at most `rows_per_sql` rows
/// each, values verbatim so identity (including auto-increment keys) is
/// restored exactly.
pub fn build_inserts(
  schema: &str,
  table: &str,
  models: &[ColumnModel],
  rows: &[Vec<RowValue>],
  rows_per_sql: usize,
) -> Vec<std::result::Result<String, String>> {
  let column_list = models.iter().map(|m| quote_ident(&m.name)).collect::<Vec<_>>().join(",");

  rows
    .chunks(rows_per_sql.max(1))
    .map(|chunk| {
      let mut tuples = Vec::with_capacity(chunk.len());
      for row in chunk {
        let mut literals = Vec::with_capacity(row.len());
        for (model, value) in models.iter().zip(row) {
          literals.push(render_literal(value, model.category)?);
        }
        tuples.push(format!("({})", literals.join(",")));
      }
      Ok(format!(
        "INSERT INTO {} ({}) VALUES {}",
        qualified_table(schema, table),
        column_list,
        tuples.join(",")
      ))
    })
    .collect()
}

/// Inverse of an update. Rows arrive as interleaved image pairs: the
/// first carries the values to restore, the second identifies the row as
/// it now exists. The SET clause contains only columns whose value
/// actually changed under the category-specific equality.
pub fn build_updates(
  schema: &str,
  table: &str,
  models: &[ColumnModel],
  rows: &[Vec<RowValue>],
  key_idx: &[usize],
) -> Vec<std::result::Result<String, String>> {
  if rows.len() % 2 != 0 {
    tracing::warn!(table, "odd number of row images in an update event, dropping the trailing image");
  }

  rows
    .chunks_exact(2)
    .filter_map(|pair| {
      let (restored, current) = (&pair[0], &pair[1]);

      let mut assignments = Vec::new();
      for (i, model) in models.iter().enumerate() {
        if !values_equal(&restored[i], &current[i], model.category) {
          match render_literal(&restored[i], model.category) {
            Ok(lit) => assignments.push(format!("{}={}", quote_ident(&model.name), lit)),
            Err(reason) => return Some(Err(reason)),
          }
        }
      }
      if assignments.is_empty() {
        // nothing changed under category equality, no inverse needed
        return None;
      }

      Some(where_clause(models, current, key_idx).map(|cond| {
        format!(
          "UPDATE {} SET {} WHERE {}",
          qualified_table(schema, table),
          assignments.join(", "),
          cond
        )
      }))
    })
    .collect()
}

/// What to do when a single row's inverse statement cannot be built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowErrorPolicy {
  /// Log and skip the row, keep the stream going (fail-open). The
  /// rollback set is incomplete and that is only visible in the logs.
  #[default]
  Skip,
  /// Abort the pipeline on the first row failure.
  Fatal,
}

#[derive(Debug)]
pub enum Synthesis {
  Statements {
    sqls: Vec<String>,
    restore_auto_increment: bool,
  },
  Marker(i64),
  Nothing,
}

/// Turns row mutations into inverse SQL, resolving table structure
/// through the catalog with a bounded refresh-and-retry on drift.
#[derive(Debug)]
pub struct Synthesizer<C> {
  catalog: SchemaCatalog<C>,
  marker_table_key: String,
  rows_per_sql: usize,
  row_error_policy: RowErrorPolicy,
}

impl<C: SqlClient> Synthesizer<C> {
  pub fn new(
    catalog: SchemaCatalog<C>,
    marker_table_key: String,
    rows_per_sql: usize,
    row_error_policy: RowErrorPolicy,
  ) -> Self {
    Self {
      catalog,
      marker_table_key,
      rows_per_sql,
      row_error_policy,
    }
  }

  pub async fn process(&mut self, event: RowMutationEvent) -> Result<Synthesis> {
    if event.table_key() == self.marker_table_key {
      return self.extract_marker(&event);
    }

    let Some(first_row) = event.rows.first() else {
      return Ok(Synthesis::Nothing);
    };
    let row_len = first_row.len();
    let table_key = event.table_key();
    let position = event.position_str();

    // Resolve the schema, allowing exactly one refresh when the table is
    // unknown or the row image is wider than the cache (DDL mid-run).
    let mut refreshed = false;
    let schema = loop {
      match self.catalog.resolve(&table_key) {
        None => {
          if refreshed {
            return Err(Error::TableNotFound {
              table: table_key,
              position,
            });
          }
          tracing::warn!(table = %table_key, %position, "no table structure cached, refreshing");
          self.catalog.refresh().await?;
          refreshed = true;
        }
        Some(schema) => {
          if row_len > schema.columns.len() {
            if refreshed {
              return Err(Error::SchemaDrift {
                table: table_key,
                row_width: row_len,
                cached_width: schema.columns.len(),
              });
            }
            tracing::warn!(
              table = %table_key,
              row_width = row_len,
              cached_width = schema.columns.len(),
              "row image wider than cached schema, refreshing"
            );
            self.catalog.refresh().await?;
            refreshed = true;
            continue;
          }
          break schema;
        }
      }
    };

    // Placeholder descriptors keep every row position addressable while a
    // refresh races concurrent DDL; truncation drops columns the image
    // predates.
    let mut columns = schema.padded_columns(row_len);
    columns.truncate(row_len);

    let mut rows = event.rows;
    let (models, rows) = build_models(&columns, &event.column_types, &event.column_metas, &mut rows);

    // key columns are addressed by position, so the indices must come
    // from the same filtered set the row images were narrowed to
    let key_idx = schema
      .select_unique_key()
      .map(|key| key_indices(key, &models))
      .unwrap_or_default();

    let results = match event.kind {
      MutationKind::Insert => build_deletes(&event.schema, &event.table, &models, rows, &key_idx),
      MutationKind::Delete => build_inserts(&event.schema, &event.table, &models, rows, self.rows_per_sql),
      MutationKind::Update => build_updates(&event.schema, &event.table, &models, rows, &key_idx),
    };

    let mut sqls = Vec::with_capacity(results.len());
    for result in results {
      match result {
        Ok(sql) => sqls.push(sql),
        Err(reason) => {
          let err = Error::SqlGeneration {
            table: table_key.clone(),
            reason,
          };
          match self.row_error_policy {
            RowErrorPolicy::Skip => {
              tracing::error!(%err, %position, "skipping row, rollback set is incomplete")
            }
            RowErrorPolicy::Fatal => return Err(err),
          }
        }
      }
    }

    Ok(Synthesis::Statements {
      sqls,
      restore_auto_increment: matches!(event.kind, MutationKind::Insert | MutationKind::Delete),
    })
  }

  fn extract_marker(&self, event: &RowMutationEvent) -> Result<Synthesis> {
    if event.kind != MutationKind::Insert {
      tracing::warn!(kind = %event.kind, position = %event.position_str(), "non-insert event on the marker table, ignoring");
      return Ok(Synthesis::Nothing);
    }
    let id = match event.rows.as_slice() {
      [row] => row.first().and_then(RowValue::as_i64),
      _ => None,
    };
    match id {
      Some(id) => Ok(Synthesis::Marker(id)),
      None => Err(Error::Stream(format!(
        "marker table insert at {} does not carry a single integer id",
        event.position_str()
      ))),
    }
  }

  pub fn into_catalog(self) -> SchemaCatalog<C> {
    self.catalog
  }
}

/// Builds per-column type models and normalizes the row images:
/// stored-generated columns are removed everywhere (they cannot be
/// written back) and text-flavored blob values are decoded to `Text` so
/// diffing compares strings rather than representations.
fn build_models<'a>(
  columns: &[ColumnDescriptor],
  column_types: &[u8],
  column_metas: &[u16],
  rows: &'a mut Vec<Vec<RowValue>>,
) -> (Vec<ColumnModel>, &'a Vec<Vec<RowValue>>) {
  let mut models = Vec::with_capacity(columns.len());
  let mut kept = Vec::with_capacity(columns.len());

  for (i, column) in columns.iter().enumerate() {
    if column.extra == STORED_GENERATED {
      continue;
    }
    kept.push(i);
    let wire_type = column_types.get(i).copied().unwrap_or(MYSQL_TYPE_NULL);
    let meta = column_metas.get(i).copied().unwrap_or(0);
    models.push(ColumnModel {
      name: column.name.clone(),
      category: column_category(wire_type, meta, &column.sql_type),
    });
  }

  if kept.len() != columns.len() {
    for row in rows.iter_mut() {
      *row = kept.iter().filter_map(|&i| row.get(i).cloned()).collect();
    }
  }

  for row in rows.iter_mut() {
    for (model, value) in models.iter().zip(row.iter_mut()) {
      if model.category == ColumnCategory::Text {
        if let RowValue::Bytes(bytes) = value {
          if let Ok(text) = std::str::from_utf8(bytes) {
            *value = RowValue::Text(text.to_string());
          }
        }
      }
    }
  }

  (models, rows)
}

fn key_indices(key: &[String], models: &[ColumnModel]) -> Vec<usize> {
  let mut indices = Vec::with_capacity(key.len());
  for name in key {
    match models.iter().position(|m| &m.name == name) {
      Some(i) => indices.push(i),
      // a key column that vanished from the usable set, fall back to a
      // full-row match
      None => return Vec::new(),
    }
  }
  indices
}
