//! SQLite persistence.
//!
//! Four logical tables, registered once as a typed descriptor map:
//! - last_update: the single (date, time) marker for the live snapshot
//! - data_titles: ordered column titles of the live snapshot
//! - stock_data: the live rows, one TEXT column per title
//! - archive: index of frozen per-date copies of superseded snapshots
//!
//! `stock_data` has no static column list; the engine recreates it from
//! each feed's titles because the published column set can change between
//! snapshots.

pub mod engine;

use std::path::{Path, PathBuf};

use rusqlite::Connection;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("could not create {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("column reference {0:?} is not a valid identifier")]
    InvalidColumn(String),
}

/// Logical table ids. Everything that touches a table name goes through
/// this enum, never through ad hoc strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    LastUpdate,
    DataTitles,
    StockData,
    Archive,
}

impl Table {
    pub const fn name(self) -> &'static str {
        match self {
            Table::LastUpdate => "last_update",
            Table::DataTitles => "data_titles",
            Table::StockData => "stock_data",
            Table::Archive => "archive",
        }
    }

    /// Static column definitions. `StockData` has none: its columns come
    /// from the feed and the engine builds them at apply time.
    const fn columns(self) -> &'static str {
        match self {
            Table::LastUpdate => "date TEXT NOT NULL, time TEXT NOT NULL, updated_at INTEGER NOT NULL",
            Table::DataTitles => "pos INTEGER NOT NULL, id TEXT NOT NULL, title TEXT NOT NULL, PRIMARY KEY ( pos )",
            Table::StockData => "",
            Table::Archive => "date TEXT NOT NULL, time TEXT NOT NULL, titles_table TEXT NOT NULL, data_table TEXT NOT NULL, archived_at INTEGER NOT NULL, PRIMARY KEY ( date )",
        }
    }
}

/// Database handle. Opened once by the host, then used by exactly one
/// cycle at a time.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if needed) the database at `path` and ensure the
    /// statically-defined tables exist.
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PersistenceError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        Ok(Store { conn })
    }

    /// In-memory store, for tests and fault drills.
    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Store { conn })
    }

    pub(crate) fn connection(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub(crate) fn connection_ref(&self) -> &Connection {
        &self.conn
    }
}

/// Create the marker and archive-index tables. The snapshot tables
/// themselves are created by the engine on first apply.
fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    for table in [Table::LastUpdate, Table::Archive] {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} ( {} )",
                table.name(),
                table.columns()
            ),
            [],
        )?;
    }
    Ok(())
}
