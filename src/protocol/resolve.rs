//! Responses of the endpoint and storage resolvers.

use std::{fmt, str::FromStr};

use serde::Deserialize;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use url::Url;

use crate::error::{Error, Result};

/// A `host:port` pair as listed by the endpoint resolver.
#[derive(Clone, Debug, Eq, PartialEq, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::invalid_argument(format!("endpoint {s} has no port")))?;
        if host.is_empty() {
            return Err(Error::invalid_argument(format!("endpoint {s} has no host")));
        }

        Ok(Self {
            host: host.to_owned(),
            port: port.parse()?,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Endpoint resolver response. Only the requested type is filled.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ApResolve {
    #[serde(default)]
    pub accesspoint: Vec<Endpoint>,

    #[serde(default)]
    pub spclient: Vec<Endpoint>,
}

/// Storage resolver response with the CDN URLs of a file.
#[derive(Clone, Debug, Deserialize)]
pub struct StorageResolve {
    pub result: String,

    #[serde(default)]
    pub cdnurl: Vec<Url>,

    pub fileid: String,

    /// Validity of the URLs in seconds.
    #[serde(default)]
    pub ttl: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::json;

    #[test]
    fn parses_access_points() {
        let body = r#"{"accesspoint": ["ap-gew4.spotify.com:4070", "ap-gue1.spotify.com:443"]}"#;
        let resolve: ApResolve = json(body, "apresolve").unwrap();

        assert_eq!(
            resolve.accesspoint,
            vec![
                Endpoint {
                    host: "ap-gew4.spotify.com".to_owned(),
                    port: 4070
                },
                Endpoint {
                    host: "ap-gue1.spotify.com".to_owned(),
                    port: 443
                },
            ]
        );
        assert!(resolve.spclient.is_empty());
    }

    #[test]
    fn endpoint_needs_port() {
        assert!("ap.spotify.com".parse::<Endpoint>().is_err());
        assert!("ap.spotify.com:http".parse::<Endpoint>().is_err());
        assert!(":443".parse::<Endpoint>().is_err());
    }

    #[test]
    fn parses_storage_resolve() {
        let body = r#"{
            "result": "CDN",
            "cdnurl": ["https://audio4-ak.spotifycdn.com/audio/abc?token=1"],
            "fileid": "abc",
            "ttl": 86400
        }"#;
        let resolve: StorageResolve = json(body, "storage-resolve").unwrap();

        assert_eq!(resolve.result, "CDN");
        assert_eq!(resolve.cdnurl.len(), 1);
        assert_eq!(resolve.cdnurl[0].host_str(), Some("audio4-ak.spotifycdn.com"));
        assert_eq!(resolve.ttl, 86_400);
    }
}
