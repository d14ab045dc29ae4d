//! Protocol Buffer definitions for the access point and license server.
//!
//! The Rust code is generated during build by `protobuf-codegen` from the
//! `.proto` files in this directory (see `build.rs`):
//!
//! * `keyexchange` - handshake hello, challenge and response
//! * `authentication` - login credentials and the welcome message
//! * `playplay` - license-server key requests
//!
//! Messages are framed by the caller: handshake messages carry a 4-byte
//! big-endian length prefix, everything after the handshake travels in
//! encrypted packets.

// Allow pedantic lints in generated code
#![allow(clippy::pedantic)]

// Include the generated Rust code from Protocol Buffers
include!(concat!(env!("OUT_DIR"), "/protos/mod.rs"));
