//! Durable storage for the captured browser session.
//!
//! The session lives at `<session_dir>/session.json` (default
//! `auth/session.json`). The file is an envelope holding a format version and
//! a SHA-256 checksum of the session, so a truncated or edited file is
//! recognised and treated as absent rather than as a valid session.

use crate::atomic_file::write_atomic;
use crate::error::{Error, Result};
use crate::models::Session;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

pub const SESSION_FILE_NAME: &str = "session.json";
pub const SESSION_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SessionEnvelope {
    version: u32,
    checksum: String,
    session: Session,
}

fn checksum(session: &Session) -> Result<String> {
    // Compact form; load() must hash the same representation.
    let json = serde_json::to_string(session)?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

pub struct SessionStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Store using the fixed file name inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(SESSION_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Returns the stored session, or `None` when there is nothing usable.
    ///
    /// Missing, unreadable, corrupt and checksum-mismatched files all mean
    /// "must authenticate" and are never reported as errors.
    pub fn load(&self) -> Option<Session> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No stored session at {}", self.path.display());
                return None;
            }
            Err(e) => {
                log::warn!("Cannot read session file {}: {}", self.path.display(), e);
                return None;
            }
        };

        let envelope: SessionEnvelope = match serde_json::from_str(&content) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Ignoring corrupt session file {}: {}", self.path.display(), e);
                return None;
            }
        };

        if envelope.version != SESSION_FORMAT_VERSION {
            log::warn!(
                "Ignoring session file with unsupported version {}",
                envelope.version
            );
            return None;
        }

        match checksum(&envelope.session) {
            Ok(sum) if sum == envelope.checksum => Some(envelope.session),
            _ => {
                log::warn!(
                    "Session file {} failed its integrity check",
                    self.path.display()
                );
                None
            }
        }
    }

    pub fn save(&self, session: &Session) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let envelope = SessionEnvelope {
            version: SESSION_FORMAT_VERSION,
            checksum: checksum(session)?,
            session: session.clone(),
        };
        let json = serde_json::to_string_pretty(&envelope)?;
        write_atomic(&self.path, json.as_bytes())?;
        log::info!("Session saved to: {}", self.path.display());
        Ok(())
    }

    /// Removes the stored session. Clearing an absent session is fine.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                log::info!("Session removed: {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(&self.path, e)),
        }
    }
}
