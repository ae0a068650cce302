use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_derive::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Last-known presence of every person that has been sampled at least once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub people: BTreeMap<String, PersonSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonSnapshot {
    pub home: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn log_summary(&self) {
        if self.people.is_empty() {
            info!("No presence recorded yet");
            return;
        }
        for (name, person) in &self.people {
            let status = if person.home { "home" } else { "away" };
            match person.last_seen_at {
                Some(seen) => info!("{}: {} (last seen {})", name, status, seen.to_rfc3339()),
                None => info!("{}: {} (never seen)", name, status),
            }
        }
    }
}

/// JSON file holding the snapshot between runs.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SnapshotStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing files load as `None`. A file that does not parse is reported
    /// and ignored so a corrupt state file never blocks startup.
    pub fn load(&self) -> Result<Option<Snapshot>, SnapshotError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("No snapshot at {}", self.path.display());
                return Ok(None);
            }
            Err(source) => {
                return Err(SnapshotError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        match serde_json::from_str(&contents) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(err) => {
                warn!("Ignoring unreadable snapshot {}: {}", self.path.display(), err);
                Ok(None)
            }
        }
    }

    pub fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let encoded = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.path.with_extension("tmp");
        let io_err = |source| SnapshotError::Io {
            path: self.path.clone(),
            source,
        };
        std::fs::write(&tmp, encoded).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;
        debug!("Saved snapshot to {}", self.path.display());
        Ok(())
    }
}
