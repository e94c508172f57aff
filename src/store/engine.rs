//! Change detection and archival.
//!
//! One transaction per ingestion cycle. The `last_update` marker is the
//! sole source of truth: an identical (date, time) stamp is a no-op, a
//! changed date freezes the previous snapshot under date-qualified archive
//! table names before the live tables are rebuilt, a changed time on the
//! same date overwrites the live tables in place with no archival.

use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;
use tracing::debug;

use crate::sheet::{DataRow, Snapshot, Stamp, Title};

use super::{PersistenceError, Store, Table};

/// What one `apply` call did, for the caller's log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The feed's stamp matches the marker; nothing was written.
    Unchanged,
    /// The live tables were rebuilt. `archived` carries the previous
    /// snapshot's date when a date change froze it first.
    Applied { archived: Option<String> },
}

/// The persisted `last_update` marker.
#[derive(Debug, Clone, Serialize)]
pub struct Marker {
    pub date: String,
    pub time: String,
    pub updated_at: i64,
}

/// One row of the archive index.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveEntry {
    pub date: String,
    pub time: String,
    pub titles_table: String,
    pub data_table: String,
    pub archived_at: i64,
}

/// Replace the live snapshot with `snapshot` if its stamp differs from the
/// marker. Everything happens in a single transaction; any failure leaves
/// the previous live snapshot and marker untouched.
pub fn apply(
    store: &mut Store,
    snapshot: &Snapshot,
    stamp: &Stamp,
) -> Result<ApplyOutcome, PersistenceError> {
    let now = unix_now();
    let tx = store.connection().transaction()?;

    let prior = read_marker(&tx)?;

    if let Some(prev) = &prior {
        if prev.date == stamp.date && prev.time == stamp.time {
            debug!(date = %stamp.date, time = %stamp.time, "stamp unchanged, skipping");
            // dropping the transaction rolls it back
            return Ok(ApplyOutcome::Unchanged);
        }
    }

    let mut archived = None;
    if let Some(prev) = &prior {
        if prev.date != stamp.date {
            freeze_previous(&tx, prev, now)?;
            archived = Some(prev.date.clone());
        }
    }

    rebuild_titles(&tx, &snapshot.titles)?;
    rebuild_rows(&tx, snapshot)?;

    tx.execute(&format!("DELETE FROM {}", Table::LastUpdate.name()), [])?;
    tx.execute(
        &format!(
            "INSERT INTO {} ( date, time, updated_at ) VALUES ( ?1, ?2, ?3 )",
            Table::LastUpdate.name()
        ),
        params![stamp.date, stamp.time, now],
    )?;

    tx.commit()?;
    Ok(ApplyOutcome::Applied { archived })
}

/// Rename the live tables to their archive names and index them. Runs only
/// on a date change, so intraday refreshes overwrite silently.
fn freeze_previous(tx: &Transaction, prev: &Marker, now: i64) -> Result<(), PersistenceError> {
    let titles_table = archive_table_name(Table::DataTitles, &prev.date);
    let data_table = archive_table_name(Table::StockData, &prev.date);

    tx.execute(
        &format!(
            "ALTER TABLE {} RENAME TO {}",
            Table::StockData.name(),
            data_table
        ),
        [],
    )?;
    tx.execute(
        &format!(
            "ALTER TABLE {} RENAME TO {}",
            Table::DataTitles.name(),
            titles_table
        ),
        [],
    )?;

    tx.execute(
        &format!(
            "INSERT INTO {} ( date, time, titles_table, data_table, archived_at ) \
             VALUES ( ?1, ?2, ?3, ?4, ?5 )",
            Table::Archive.name()
        ),
        params![prev.date, prev.time, titles_table, data_table, now],
    )?;

    debug!(date = %prev.date, "froze previous snapshot");
    Ok(())
}

fn rebuild_titles(tx: &Transaction, titles: &[Title]) -> Result<(), PersistenceError> {
    let table = Table::DataTitles.name();

    tx.execute(&format!("DROP TABLE IF EXISTS {table}"), [])?;
    tx.execute(
        &format!("CREATE TABLE {table} ( {} )", Table::DataTitles.columns()),
        [],
    )?;

    let mut stmt = tx.prepare(&format!(
        "INSERT INTO {table} ( pos, id, title ) VALUES ( ?1, ?2, ?3 )"
    ))?;
    for (pos, title) in titles.iter().enumerate() {
        stmt.execute(params![pos as i64, title.column, title.label])?;
    }

    Ok(())
}

/// The data table is recreated from scratch each apply because the feed's
/// column set can change between snapshots.
fn rebuild_rows(tx: &Transaction, snapshot: &Snapshot) -> Result<(), PersistenceError> {
    let table = Table::StockData.name();

    let idents = snapshot
        .titles
        .iter()
        .map(|t| column_ident(&t.column))
        .collect::<Result<Vec<_>, _>>()?;

    let mut defs = String::from(" r INTEGER NOT NULL, ");
    for ident in &idents {
        defs.push_str(&format!(" {ident} TEXT, "));
    }
    defs.push_str(" PRIMARY KEY ( r ) ");

    tx.execute(&format!("DROP TABLE IF EXISTS {table}"), [])?;
    tx.execute(&format!("CREATE TABLE {table} ( {defs} )"), [])?;

    let placeholders = (1..=idents.len() + 1)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let columns = std::iter::once("r".to_string())
        .chain(idents.iter().cloned())
        .collect::<Vec<_>>()
        .join(", ");

    let mut stmt = tx.prepare(&format!(
        "INSERT INTO {table} ( {columns} ) VALUES ( {placeholders} )"
    ))?;

    for row in &snapshot.rows {
        let values = std::iter::once(Value::Integer(row.index))
            .chain(row.values.iter().map(|v| Value::Text(v.clone())));
        stmt.execute(rusqlite::params_from_iter(values))?;
    }

    Ok(())
}

/// `archive__<table>__<date with / as _>`, the naming scheme the archive
/// index refers to.
fn archive_table_name(table: Table, date: &str) -> String {
    format!("archive__{}__{}", table.name(), date.replace('/', "_"))
}

/// Bracket-quote a feed column reference for use in DDL. Only plain
/// alphanumeric identifiers pass; anything else never reaches the SQL text.
fn column_ident(column: &str) -> Result<String, PersistenceError> {
    if column.is_empty() || !column.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        return Err(PersistenceError::InvalidColumn(column.to_string()));
    }
    Ok(format!("[{column}]"))
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// --- read surface ---------------------------------------------------------

/// Current `last_update` marker, if any snapshot has ever been applied.
pub fn last_update(store: &Store) -> Result<Option<Marker>, PersistenceError> {
    read_marker(store.connection_ref())
}

fn read_marker(conn: &Connection) -> Result<Option<Marker>, PersistenceError> {
    let marker = conn
        .query_row(
            &format!(
                "SELECT date, time, updated_at FROM {} LIMIT 1",
                Table::LastUpdate.name()
            ),
            [],
            |row| {
                Ok(Marker {
                    date: row.get(0)?,
                    time: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            },
        )
        .optional()?;

    Ok(marker)
}

/// Archive index, oldest first.
pub fn archive_entries(store: &Store) -> Result<Vec<ArchiveEntry>, PersistenceError> {
    let conn = store.connection_ref();
    let mut stmt = conn.prepare(&format!(
        "SELECT date, time, titles_table, data_table, archived_at FROM {} ORDER BY archived_at, date",
        Table::Archive.name()
    ))?;

    let entries = stmt
        .query_map([], |row| {
            Ok(ArchiveEntry {
                date: row.get(0)?,
                time: row.get(1)?,
                titles_table: row.get(2)?,
                data_table: row.get(3)?,
                archived_at: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(entries)
}

/// Titles of the live snapshot; empty before the first successful apply.
pub fn live_titles(store: &Store) -> Result<Vec<Title>, PersistenceError> {
    read_titles(store.connection_ref(), Table::DataTitles.name())
}

/// Rows of the live snapshot, projected onto the live title order.
pub fn live_rows(store: &Store) -> Result<Vec<DataRow>, PersistenceError> {
    let conn = store.connection_ref();
    let titles = read_titles(conn, Table::DataTitles.name())?;
    read_rows(conn, Table::StockData.name(), &titles)
}

/// Number of live data rows without materializing them.
pub fn live_row_count(store: &Store) -> Result<i64, PersistenceError> {
    let conn = store.connection_ref();
    if !table_exists(conn, Table::StockData.name())? {
        return Ok(0);
    }

    let count = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", Table::StockData.name()),
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Titles of an archived snapshot, resolved through the archive index.
pub fn archived_titles(
    store: &Store,
    entry: &ArchiveEntry,
) -> Result<Vec<Title>, PersistenceError> {
    read_titles(store.connection_ref(), &table_from_index(&entry.titles_table)?)
}

/// Rows of an archived snapshot, resolved through the archive index.
pub fn archived_rows(store: &Store, entry: &ArchiveEntry) -> Result<Vec<DataRow>, PersistenceError> {
    let conn = store.connection_ref();
    let titles = read_titles(conn, &table_from_index(&entry.titles_table)?)?;
    read_rows(conn, &table_from_index(&entry.data_table)?, &titles)
}

/// Archive table names come from our own index rows, but they still pass
/// the identifier check before reaching SQL text.
fn table_from_index(name: &str) -> Result<String, PersistenceError> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        return Err(PersistenceError::InvalidColumn(name.to_string()));
    }
    Ok(name.to_string())
}

fn read_titles(conn: &Connection, table: &str) -> Result<Vec<Title>, PersistenceError> {
    if !table_exists(conn, table)? {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(&format!("SELECT id, title FROM {table} ORDER BY pos"))?;
    let titles = stmt
        .query_map([], |row| {
            Ok(Title {
                column: row.get(0)?,
                label: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(titles)
}

fn read_rows(
    conn: &Connection,
    table: &str,
    titles: &[Title],
) -> Result<Vec<DataRow>, PersistenceError> {
    if !table_exists(conn, table)? {
        return Ok(Vec::new());
    }

    let idents = titles
        .iter()
        .map(|t| column_ident(&t.column))
        .collect::<Result<Vec<_>, _>>()?;
    let columns = std::iter::once("r".to_string())
        .chain(idents)
        .collect::<Vec<_>>()
        .join(", ");

    let mut stmt = conn.prepare(&format!("SELECT {columns} FROM {table} ORDER BY r"))?;
    let rows = stmt
        .query_map([], |row| {
            let index: i64 = row.get(0)?;
            let mut values = Vec::with_capacity(titles.len());
            for i in 0..titles.len() {
                values.push(row.get::<_, Option<String>>(i + 1)?.unwrap_or_default());
            }
            Ok(DataRow { index, values })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool, PersistenceError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
