//! Wire types of the streaming service.
//!
//! # Submodules
//!
//! * [`packet`] - Type tags of the encrypted access point channel
//! * [`protos`] - Protocol Buffer messages of the handshake, login and
//!   license requests
//! * [`resolve`] - JSON responses of the endpoint and storage resolvers
//!
//! JSON responses are parsed with [`json`], which logs the parsed structure
//! at `trace` and the raw body when parsing fails.

pub mod packet;
pub mod protos;
pub mod resolve;

use crate::error::Result;
use serde::Deserialize;
use std::fmt::Debug;

/// Parses and logs a JSON response.
///
/// # Arguments
///
/// * `body` - Response body text to parse
/// * `origin` - Description of the endpoint for logging
///
/// # Errors
///
/// Returns error if the body is not valid JSON or does not match `T`.
pub fn json<T>(body: &str, origin: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Debug,
{
    match serde_json::from_str(body) {
        Ok(result) => {
            trace!("{}: {result:#?}", origin);
            Ok(result)
        }
        Err(e) => {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
                trace!("{}: {json:#?}", origin);
            } else {
                error!("{}: failed parsing response ({e:?})", origin);
                trace!("{body}");
            }
            Err(e.into())
        }
    }
}
