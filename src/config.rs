//! Client configuration.
//!
//! [`Config`] carries the identity the client presents to the service
//! (application name and version, device id, `User-Agent`) and the knobs of
//! the download pipeline. Secrets are kept separately in
//! [`Secrets`](crate::secrets::Secrets).

use std::path::PathBuf;

use machine_uid;
use sysinfo;
use uuid::Uuid;

/// Default number of concurrent download workers.
pub const DEFAULT_WORKERS: usize = 2;

/// Default number of connection attempts per access point.
pub const DEFAULT_CONNECT_ATTEMPTS: usize = 5;

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Config {
    pub app_name: String,
    pub app_version: String,
    pub app_lang: String,

    pub device_id: Uuid,

    pub user_agent: String,

    /// Directory holding reusable login credentials.
    pub credentials_dir: PathBuf,

    /// Number of download workers.
    pub workers: usize,

    /// Chunk cache bound per stream; `0` keeps every chunk.
    pub max_cached_chunks: usize,

    /// Attempts per access point before moving on to the next.
    pub connect_attempts: usize,

    /// Path of the external MP4 decryption tool, searched on `PATH` if
    /// unset.
    pub decrypt_tool: Option<PathBuf>,
}

impl Config {
    /// Creates a configuration with defaults for this machine.
    ///
    /// # Panics
    ///
    /// Panics if the application name, version or the OS identification
    /// cannot be used in a `User-Agent` header.
    #[must_use]
    pub fn new() -> Self {
        let app_name = env!("CARGO_PKG_NAME").to_owned();
        let app_version = env!("CARGO_PKG_VERSION").to_owned();
        let app_lang = "en".to_owned();

        let device_id = match machine_uid::get() {
            Ok(machine_id) => {
                let namespace = Uuid::new_v5(&Uuid::NAMESPACE_DNS, b"spotify.com");
                Uuid::new_v5(&namespace, machine_id.as_bytes())
            }
            Err(e) => {
                warn!("could not get machine id, using random device id: {e}");
                Uuid::new_v4()
            }
        };
        trace!("device uuid: {device_id}");

        // Additional `User-Agent` string checks on top of `reqwest::HeaderValue`.
        let illegal_chars = |chr| chr == '/' || chr == ';';
        if app_name.is_empty()
            || app_name.contains(illegal_chars)
            || app_version.is_empty()
            || app_version.contains(illegal_chars)
            || app_lang.chars().count() != 2
            || app_lang.contains(illegal_chars)
        {
            panic!(
                "application name, version and/or language invalid (\"{app_name}\"; \"{app_version}\"; \"{app_lang}\")"
            );
        }

        let os_name = match std::env::consts::OS {
            "macos" => "osx",
            other => other,
        };
        let os_version = sysinfo::System::os_version().unwrap_or_else(|| String::from("0"));
        if os_name.is_empty()
            || os_name.contains(illegal_chars)
            || os_version.is_empty()
            || os_version.contains(illegal_chars)
        {
            panic!("os name and/or version invalid (\"{os_name}\"; \"{os_version}\")");
        }

        let user_agent =
            format!("{app_name}/{app_version} (Rust; {os_name}/{os_version}; Desktop; {app_lang})");
        trace!("user agent: {user_agent}");

        Self {
            app_name,
            app_version,
            app_lang,

            device_id,

            user_agent,

            credentials_dir: PathBuf::from("credentials"),
            workers: DEFAULT_WORKERS,
            max_cached_chunks: 0,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            decrypt_tool: None,
        }
    }

    /// Device id as sent in the login system info.
    #[must_use]
    pub fn device_id_string(&self) -> String {
        self.device_id.simple().to_string()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
