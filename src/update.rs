//! One ingestion cycle.
//!
//! Download the feed archive, unpack it, parse the worksheet, hand the
//! result to the change engine. The cycle's scratch space under the work
//! directory is cleared both before and after the run, whatever the
//! outcome, so a crashed or failed cycle never poisons the next one.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::extract::{self, ExtractError};
use crate::fetch::{Fetch, FetchError};
use crate::sheet::{self, ParseError, Stamp};
use crate::store::engine::{self, ApplyOutcome};
use crate::store::{PersistenceError, Store};

// scratch names, stable across cycles so stale leftovers are found again
const FEED_FILE_NAME: &str = "stock-quotes-latest.xlsx";
const EXTRACT_DIR_NAME: &str = "stock-quotes-extract";

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("workspace {}: {source}", path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("download failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("extraction failed: {0}")]
    Extract(#[from] ExtractError),

    #[error("parse failed: {0}")]
    Parse(#[from] ParseError),

    #[error("persistence failed: {0}")]
    Persist(#[from] PersistenceError),
}

/// Summary of a finished cycle, for the caller's log line.
#[derive(Debug)]
pub struct CycleOutcome {
    pub stamp: Stamp,
    pub outcome: ApplyOutcome,
    pub titles: usize,
    pub rows: usize,
}

/// Run one complete cycle: fetch → extract → parse → apply.
pub fn run_cycle(
    fetcher: &dyn Fetch,
    store: &mut Store,
    source_url: &str,
    work_dir: &Path,
) -> Result<CycleOutcome, CycleError> {
    let feed_file = work_dir.join(FEED_FILE_NAME);
    let extract_dir = work_dir.join(EXTRACT_DIR_NAME);

    prepare_workspace(work_dir, &feed_file, &extract_dir)?;
    let result = ingest(fetcher, store, source_url, &feed_file, &extract_dir);
    clear_artifacts(&feed_file, &extract_dir);
    result
}

fn ingest(
    fetcher: &dyn Fetch,
    store: &mut Store,
    source_url: &str,
    feed_file: &Path,
    extract_dir: &Path,
) -> Result<CycleOutcome, CycleError> {
    fetcher.download(source_url, feed_file)?;
    extract::unzip(feed_file, extract_dir)?;

    let (snapshot, stamp) = sheet::parse(extract_dir)?;
    let outcome = engine::apply(store, &snapshot, &stamp)?;

    Ok(CycleOutcome {
        stamp,
        outcome,
        titles: snapshot.titles.len(),
        rows: snapshot.rows.len(),
    })
}

/// Clear anything a previous cycle may have left behind and make sure the
/// work directory exists.
fn prepare_workspace(
    work_dir: &Path,
    feed_file: &Path,
    extract_dir: &Path,
) -> Result<(), CycleError> {
    fs::create_dir_all(work_dir).map_err(|e| CycleError::Workspace {
        path: work_dir.to_path_buf(),
        source: e,
    })?;

    for (path, result) in [
        (extract_dir, remove_dir(extract_dir)),
        (feed_file, remove_file(feed_file)),
    ] {
        result.map_err(|e| CycleError::Workspace {
            path: path.to_path_buf(),
            source: e,
        })?;
    }

    Ok(())
}

/// Post-cycle cleanup is best effort; the pre-cycle pass will catch
/// anything it misses.
fn clear_artifacts(feed_file: &Path, extract_dir: &Path) {
    if let Err(e) = remove_file(feed_file) {
        warn!(path = %feed_file.display(), error = %e, "could not remove feed file");
    }
    if let Err(e) = remove_dir(extract_dir) {
        warn!(path = %extract_dir.display(), error = %e, "could not remove extraction directory");
    }
}

fn remove_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn remove_dir(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
