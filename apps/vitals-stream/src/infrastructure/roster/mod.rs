//! Roster Seed File
//!
//! Loads the classroom roster from a JSON array of
//! `{ "studentId": .., "name": .. }` records. `physicalId` is accepted in
//! place of `studentId`. Later duplicates of an id are dropped.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::domain::vitals::RosterEntry;

/// Roster loading error.
#[derive(Debug, thiserror::Error)]
pub enum RosterError {
    /// The file could not be read.
    #[error("failed to read roster file {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not a JSON array of roster records.
    #[error("failed to parse roster file {path}: {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// A record carries neither `studentId` nor `physicalId`.
    #[error("roster record {index} has no student id")]
    MissingId {
        /// Zero-based record position.
        index: usize,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RosterRecord {
    #[serde(default)]
    student_id: Option<String>,
    #[serde(default)]
    physical_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// Load a roster seed file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not valid JSON, or
/// contains a record without an id.
pub fn load_roster(path: impl AsRef<Path>) -> Result<Vec<RosterEntry>, RosterError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| RosterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_roster(&text).map_err(|e| match e {
        RosterError::Parse { source, .. } => RosterError::Parse {
            path: path.to_path_buf(),
            source,
        },
        other => other,
    })
}

fn parse_roster(text: &str) -> Result<Vec<RosterEntry>, RosterError> {
    let records: Vec<RosterRecord> =
        serde_json::from_str(text).map_err(|source| RosterError::Parse {
            path: PathBuf::new(),
            source,
        })?;

    let mut seen = HashSet::with_capacity(records.len());
    let mut entries = Vec::with_capacity(records.len());

    for (index, record) in records.into_iter().enumerate() {
        let id = record
            .student_id
            .or(record.physical_id)
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or(RosterError::MissingId { index })?;

        if !seen.insert(id.clone()) {
            tracing::debug!(student_id = %id, "Duplicate roster entry ignored");
            continue;
        }

        let name = record.name.filter(|n| !n.trim().is_empty());
        entries.push(RosterEntry::new(id, name));
    }

    Ok(entries)
}
