//! Headless access point client and media downloader.
//!
//! # Connection
//!
//! * [`handshake`] - Diffie-Hellman key exchange with signature check and
//!   session key derivation
//! * [`shannon`] - Stream cipher keyed per direction
//! * [`channel`] - Encrypted, authenticated packet framing
//! * [`session`] - Login and the shared, serialized connection
//!
//! # Keys
//!
//! * [`audio_key`] - Key requests over the packet channel
//! * [`key_provider`] - Interchangeable key sources and the shared key cache
//!
//! # Media
//!
//! * [`resolve`] - Access point, API host and CDN resolution
//! * [`stream`] - Chunked, cached range reads with counter mode decryption
//! * [`downloader`] - Bitrate-paced draining of a stream into a file
//! * [`coordinator`] - Worker pool and progress observation
//! * [`postprocess`] - External decryption of DRM protected files
//!
//! # Support
//!
//! * [`config`], [`secrets`] and [`credentials`] - Settings, tokens and
//!   reusable login credentials
//! * [`http`] - Rate-limited HTTP client with retries
//! * [`error`] - Error type used throughout the crate
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

#[macro_use]
extern crate log;

pub mod audio_key;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod decrypt;
pub mod dh;
pub mod downloader;
pub mod error;
pub mod handshake;
pub mod http;
pub mod key_provider;
pub mod metadata;
pub mod postprocess;
pub mod protocol;
pub mod resolve;
pub mod secrets;
pub mod session;
pub mod shannon;
pub mod stream;
pub mod track;
pub mod transport;
pub mod uuid;
