use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to persist cursor to {path}: {source}")]
    CursorPersist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unreadable state file {path}: {raw:?}")]
    Parse { path: PathBuf, raw: String },
}

/// Single-integer cursor file.
#[derive(Debug, Clone)]
pub struct CursorFile {
    path: PathBuf,
}

impl CursorFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when the file does not exist yet.
    pub fn load(&self) -> Result<Option<i64>, StateError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(_) => {
                return Err(StateError::Parse {
                    path: self.path.clone(),
                    raw: String::new(),
                });
            }
        };

        match raw.trim().parse::<i64>() {
            Ok(id) if id >= 0 => Ok(Some(id)),
            _ => Err(StateError::Parse {
                path: self.path.clone(),
                raw,
            }),
        }
    }

    /// Write through a temp file and rename, so a crash mid-write never
    /// leaves a truncated cursor behind.
    pub fn store(&self, cursor: i64) -> Result<(), StateError> {
        let persist_err = |source| StateError::CursorPersist {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(persist_err)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, cursor.to_string()).map_err(persist_err)?;
        fs::rename(&tmp, &self.path).map_err(persist_err)?;
        Ok(())
    }
}
