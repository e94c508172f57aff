//! Archive extraction.
//!
//! Unpacks the downloaded zip package into the cycle's work directory:
//! directory entries are recreated, file entries are streamed to disk in
//! archive order. The caller clears the destination beforehand, so
//! re-extraction after a failed cycle is idempotent.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use zip::ZipArchive;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("could not open archive {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("archive entry {0:?} escapes the extraction directory")]
    UnsafeEntry(String),

    #[error("could not write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Extract every entry of `archive` under `dest`, creating directories as
/// needed. Fails on the first unreadable or unwritable entry.
pub fn unzip(archive: &Path, dest: &Path) -> Result<(), ExtractError> {
    let file = File::open(archive).map_err(|e| ExtractError::Open {
        path: archive.to_path_buf(),
        source: e,
    })?;

    let mut zip = ZipArchive::new(file)?;

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;

        let relative = entry
            .enclosed_name()
            .ok_or_else(|| ExtractError::UnsafeEntry(entry.name().to_string()))?;
        let path = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&path).map_err(|e| ExtractError::Io {
                path: path.clone(),
                source: e,
            })?;
            continue;
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ExtractError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let mut out = File::create(&path).map_err(|e| ExtractError::Io {
            path: path.clone(),
            source: e,
        })?;

        io::copy(&mut entry, &mut out).map_err(|e| ExtractError::Io {
            path: path.clone(),
            source: e,
        })?;
    }

    Ok(())
}
