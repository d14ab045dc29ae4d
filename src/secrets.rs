//! Tokens loaded from the secrets file.
//!
//! The secrets file is a small TOML document:
//!
//! ```toml
//! access_token = "BQD..."
//! client_token = "AAC..."
//! license_token = "01234567..."
//! ```
//!
//! Only `access_token` is required. None of the tokens are ever shown in
//! `Debug` output.

use std::{fs, path::Path};

use serde::Deserialize;
use veil::Redact;

use crate::error::{Error, Result};

/// Largest secrets file that will be read.
const MAX_FILE_SIZE: u64 = 8 * 1024;

#[derive(Clone, Default, Eq, PartialEq, Hash, Deserialize, Redact)]
pub struct Secrets {
    /// Bearer token for login and HTTP APIs.
    #[redact]
    pub access_token: String,

    /// Anti-abuse token sent as the `client-token` header.
    #[redact]
    pub client_token: Option<String>,

    /// Hex token embedded in license server requests.
    #[redact]
    pub license_token: Option<String>,
}

impl Secrets {
    /// Loads secrets from a TOML file.
    ///
    /// # Errors
    ///
    /// * `NotFound` if the file does not exist
    /// * `OutOfRange` if the file is larger than 8 KiB
    /// * `InvalidArgument` if the file is not valid TOML or the access
    ///   token is empty
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Prevent out-of-memory condition: the secrets file should be small.
        let file_size = fs::metadata(path)?.len();
        if file_size > MAX_FILE_SIZE {
            return Err(Error::out_of_range(format!(
                "{} is too large ({file_size} bytes)",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)?;
        contents.parse()
    }
}

impl std::str::FromStr for Secrets {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let secrets: Self = toml::from_str(s)?;
        if secrets.access_token.trim().is_empty() {
            return Err(Error::invalid_argument("access token is empty"));
        }
        Ok(secrets)
    }
}
