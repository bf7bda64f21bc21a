//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "JSON credential file holding the pump id and access token."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::{write_atomic, Result};

/// Contents of the credential file, `{"pumpid": <id>, "accesstoken": "<token>"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Device identity the token was issued for.
    #[serde(rename = "pumpid", default)]
    pub device_id: u64,
    /// Empty when no token is held.
    #[serde(rename = "accesstoken", default)]
    pub token: String,
    /// Keys written by other tools are carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CredentialRecord {
    /// Record for `device_id` with the given token.
    pub fn new(device_id: u64, token: impl Into<String>) -> Self {
        Self {
            device_id,
            token: token.into(),
            extra: Map::new(),
        }
    }

    /// True when a non-empty token is present.
    pub fn has_token(&self) -> bool {
        !self.token.trim().is_empty()
    }
}

/// Reads and atomically rewrites the credential file.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Store backed by the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record; `Ok(None)` when the file does not exist yet.
    pub fn load(&self) -> Result<Option<CredentialRecord>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let record = serde_json::from_slice(&bytes)?;
        debug!(path = %self.path.display(), "loaded credential file");
        Ok(Some(record))
    }

    /// Persist the record, replacing the previous file in one rename.
    pub fn save(&self, record: &CredentialRecord) -> Result<()> {
        let json = serde_json::to_vec(record)?;
        write_atomic(&self.path, &json)?;
        debug!(path = %self.path.display(), has_token = record.has_token(), "stored credential file");
        Ok(())
    }

    /// Rewrite only the token, keeping every other key of the existing file.
    pub fn store_token(&self, device_id: u64, token: &str) -> Result<CredentialRecord> {
        let mut record = self
            .load()?
            .unwrap_or_else(|| CredentialRecord::new(device_id, ""));
        record.device_id = device_id;
        record.token = token.to_owned();
        self.save(&record)?;
        Ok(record)
    }
}
