//! Durable storage for the OAuth credential triple.
//!
//! Writes replace the whole record atomically (write to a temp file in the
//! same directory, then rename). Only the token authority writes.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const AUTH_FILE: &str = "auth.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix seconds. Not consulted before use; the upstream's 401 is
    /// authoritative for expiry.
    pub expires_at: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("credential store i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential store parse: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let mut path = dir.into();
        path.push(AUTH_FILE);
        Self { path }
    }

    pub fn load(&self) -> Result<Option<Credential>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub fn save(&self, credential: &Credential) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(credential)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn credential(access: &str) -> Credential {
        Credential {
            access_token: access.to_string(),
            refresh_token: "rt".to_string(),
            expires_at: 1_700_000_000,
        }
    }

    #[test]
    fn load_missing_returns_none() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        store.save(&credential("at-1")).unwrap();
        assert_eq!(store.load().unwrap(), Some(credential("at-1")));

        store.save(&credential("at-2")).unwrap();
        assert_eq!(store.load().unwrap().unwrap().access_token, "at-2");
    }

    #[test]
    fn file_uses_camel_case_keys() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        store.save(&credential("at")).unwrap();
        let raw = fs::read_to_string(dir.path().join(AUTH_FILE)).unwrap();
        assert!(raw.contains("\"accessToken\""));
        assert!(raw.contains("\"refreshToken\""));
        assert!(raw.contains("\"expiresAt\""));
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        store.save(&credential("at")).unwrap();
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![AUTH_FILE.to_string()]);
    }

    #[test]
    fn clear_removes_credential() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        store.save(&credential("at")).unwrap();
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
        store.clear().unwrap();
    }
}
