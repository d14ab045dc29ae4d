//! Resolution of access points, service endpoints and CDN URLs.
//!
//! * [`access_points`] lists the servers that accept the binary handshake
//! * [`spclients`] lists the HTTP API hosts
//! * [`StorageResolver`] turns a file id into the CDN URLs serving it
//!
//! The download pipeline only depends on the [`CdnResolver`] trait, so CDN
//! resolution can be replaced.

use std::sync::Arc;

use reqwest::header::{HeaderValue, AUTHORIZATION};
use url::Url;

use crate::{
    error::{Error, Result},
    http,
    protocol::{
        self,
        resolve::{ApResolve, Endpoint, StorageResolve},
    },
    track::FileId,
};

/// Endpoint resolver.
pub const APRESOLVE_URL: &str = "https://apresolve.spotify.com/";

/// Storage resolver for interactive audio files.
pub const STORAGE_RESOLVE_URL: &str =
    "https://gew4-spclient.spotify.com/storage-resolve/v2/files/audio/interactive/10/";

/// Header carrying the anti-abuse client token.
pub const CLIENT_TOKEN_HEADER: &str = "client-token";

/// Lists the access points.
///
/// # Errors
///
/// Returns an error if the request fails or no access point is listed.
pub fn access_points(client: &http::Client) -> Result<Vec<Endpoint>> {
    let access_points = apresolve(client, "accesspoint")?.accesspoint;
    if access_points.is_empty() {
        return Err(Error::not_found("no access points"));
    }
    Ok(access_points)
}

/// Lists the HTTP API hosts.
///
/// # Errors
///
/// Returns an error if the request fails or no host is listed.
pub fn spclients(client: &http::Client) -> Result<Vec<Endpoint>> {
    let spclients = apresolve(client, "spclient")?.spclient;
    if spclients.is_empty() {
        return Err(Error::not_found("no spclients"));
    }
    Ok(spclients)
}

fn apresolve(client: &http::Client, kind: &str) -> Result<ApResolve> {
    let mut url = Url::parse(APRESOLVE_URL)?;
    url.query_pairs_mut().append_pair("type", kind);

    let body = client.execute(client.get(url))?.text()?;
    protocol::json(&body, "apresolve")
}

/// Resolves the CDN URLs of a file.
pub trait CdnResolver: Send + Sync {
    /// Returns the URLs to try, in order.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no URL is known for the file.
    fn cdn_urls(&self, file_id: &FileId) -> Result<Vec<Url>>;
}

/// CDN resolution through the storage resolver.
pub struct StorageResolver {
    client: Arc<http::Client>,
    access_token: String,
    client_token: Option<String>,

    base: Url,
}

impl StorageResolver {
    /// # Errors
    ///
    /// Never fails with the built-in base URL.
    pub fn new(
        client: Arc<http::Client>,
        access_token: impl Into<String>,
        client_token: Option<String>,
    ) -> Result<Self> {
        Ok(Self::with_base(
            client,
            access_token,
            client_token,
            Url::parse(STORAGE_RESOLVE_URL)?,
        ))
    }

    /// Resolves against another storage resolver.
    #[must_use]
    pub fn with_base(
        client: Arc<http::Client>,
        access_token: impl Into<String>,
        client_token: Option<String>,
        base: Url,
    ) -> Self {
        Self {
            client,
            access_token: access_token.into(),
            client_token,
            base,
        }
    }

    /// Queries the storage resolver for `file_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the response is malformed.
    pub fn storage_resolve(&self, file_id: &FileId) -> Result<StorageResolve> {
        let mut url = self.base.join(&file_id.to_hex())?;
        url.query_pairs_mut()
            .append_pair("version", "10000000")
            .append_pair("product", "9")
            .append_pair("platform", "39")
            .append_pair("alt", "json");

        let mut request = self.client.get(url);
        let headers = request.headers_mut();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.access_token))?,
        );
        if let Some(ref token) = self.client_token {
            headers.insert(CLIENT_TOKEN_HEADER, HeaderValue::from_str(token)?);
        }

        let body = self.client.execute(request)?.text()?;
        protocol::json(&body, "storage-resolve")
    }
}

impl CdnResolver for StorageResolver {
    fn cdn_urls(&self, file_id: &FileId) -> Result<Vec<Url>> {
        let resolved = self.storage_resolve(file_id)?;
        if resolved.cdnurl.is_empty() {
            return Err(Error::not_found(format!(
                "{file_id}: no cdn urls ({})",
                resolved.result
            )));
        }

        debug!(
            "{file_id}: {} cdn urls valid for {}s",
            resolved.cdnurl.len(),
            resolved.ttl
        );
        Ok(resolved.cdnurl)
    }
}
