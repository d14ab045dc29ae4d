//! Reusable login credentials.
//!
//! After a successful login the access point hands out a credential blob
//! that can replace the access token on the next login. It is stored as a
//! small JSON document:
//!
//! ```json
//! {"username": "...", "credentials": "<base64>"}
//! ```
//!
//! Writes go to a temporary file in the same directory that is then renamed
//! into place, so a crash never leaves a half-written file behind. A
//! missing or unreadable file means no stored session.

use std::{
    fs,
    path::{Path, PathBuf},
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use veil::Redact;

use crate::{error::Result, uuid::Uuid};

/// File name of the stored credentials inside the credentials directory.
pub const FILE_NAME: &str = "reusable_credentials.json";

/// Credentials that can be used for a login without access token.
#[derive(Clone, Eq, PartialEq, Redact)]
pub struct StoredCredentials {
    pub username: String,

    #[redact]
    pub auth_data: Vec<u8>,
}

/// On-disk form with the blob in base64.
#[derive(Serialize, Deserialize)]
struct CredentialsFile {
    username: String,
    credentials: String,
}

impl StoredCredentials {
    #[must_use]
    pub fn new(username: impl Into<String>, auth_data: Vec<u8>) -> Self {
        Self {
            username: username.into(),
            auth_data,
        }
    }

    /// Loads stored credentials from `path`.
    ///
    /// Returns `None` if the file is missing or corrupt; the cause is logged.
    #[must_use]
    pub fn load(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match Self::try_load(path) {
            Ok(credentials) => Some(credentials),
            Err(e) => {
                warn!("ignoring stored credentials in {}: {e}", path.display());
                None
            }
        }
    }

    fn try_load(path: &Path) -> Result<Self> {
        let contents = fs::read(path)?;
        let file: CredentialsFile = serde_json::from_slice(&contents)?;
        let auth_data = BASE64.decode(file.credentials)?;
        Ok(Self::new(file.username, auth_data))
    }

    /// Writes the credentials to `path`, replacing any previous file.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be written or renamed.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;

        let file = CredentialsFile {
            username: self.username.clone(),
            credentials: BASE64.encode(&self.auth_data),
        };
        let contents = serde_json::to_vec(&file)?;

        let temp = temp_path(dir);
        if let Err(e) = fs::write(&temp, contents).and_then(|()| fs::rename(&temp, path)) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }

        debug!("stored credentials for {} in {}", self.username, path.display());
        Ok(())
    }
}

fn temp_path(dir: &Path) -> PathBuf {
    dir.join(format!(".{FILE_NAME}.{}.tmp", Uuid::fast_v4()))
}
