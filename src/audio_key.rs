//! Audio key exchange over the packet channel.
//!
//! A key request carries `file_id ‖ gid ‖ sequence (u32 BE) ‖ 00 00`. The
//! access point answers with either:
//!
//! * `AesKey`: `sequence ‖ 16-byte key`
//! * `AesKeyError`: `sequence ‖ u16 BE error code`, usually meaning that the
//!   requested format needs a premium account
//!
//! Responses are matched to requests by sequence number only. A response
//! with another sequence is skipped and the client keeps waiting. Pings
//! that arrive in between are answered with a pong.
//!
//! Requests on one connection must not overlap; [`Session`] serializes them
//! with a lock around the channel.
//!
//! [`Session`]: crate::session::Session

use std::fmt;

use crate::{
    channel::Channel,
    decrypt::{Key, KEY_LENGTH},
    error::{Error, Result},
    protocol::packet::PacketType,
    track::{FileId, Gid},
    transport::Socket,
};

/// Payload of the pong sent in reply to a ping.
const PONG_PAYLOAD: [u8; 4] = [0; 4];

/// Outcome of a key request that reached the access point.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyResolution {
    Key(Key),

    /// The access point refused the key.
    Unavailable { code: u16 },
}

impl KeyResolution {
    #[must_use]
    pub fn key(self) -> Option<Key> {
        match self {
            Self::Key(key) => Some(key),
            Self::Unavailable { .. } => None,
        }
    }
}

impl fmt::Display for KeyResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(_) => write!(f, "key"),
            Self::Unavailable { code } => write!(
                f,
                "key unavailable (code {code}), format possibly requires premium"
            ),
        }
    }
}

/// Builds the payload of a key request.
#[must_use]
pub fn request_payload(gid: &Gid, file_id: &FileId, sequence: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(file_id.len() + gid.len() + 6);
    payload.extend_from_slice(file_id);
    payload.extend_from_slice(gid);
    payload.extend_from_slice(&sequence.to_be_bytes());
    payload.extend_from_slice(&[0, 0]);
    payload
}

/// Requests the key of `file_id` and waits for the matching response.
///
/// # Errors
///
/// Returns an error if the channel fails or a response is malformed. A
/// refused key is not an error but [`KeyResolution::Unavailable`].
pub fn request_key<S: Socket>(
    channel: &mut Channel<S>,
    sequence: u32,
    gid: &Gid,
    file_id: &FileId,
) -> Result<KeyResolution> {
    channel.send(
        PacketType::RequestKey,
        &request_payload(gid, file_id, sequence),
    )?;

    loop {
        let packet = channel.receive()?;
        match packet.kind {
            PacketType::Ping => {
                channel.send(PacketType::Pong, &PONG_PAYLOAD)?;
            }

            PacketType::AesKey | PacketType::AesKeyError => {
                let (seq, body) = split_sequence(&packet.payload)?;
                if seq != sequence {
                    debug!("skipping {} for sequence {seq}, waiting for {sequence}", packet.kind);
                    continue;
                }

                return if packet.kind == PacketType::AesKey {
                    let key = body.get(..KEY_LENGTH).ok_or_else(|| {
                        Error::data_loss(format!("key response of {} bytes", body.len()))
                    })?;
                    Ok(KeyResolution::Key(Key::from_slice(key)?))
                } else {
                    let code = body
                        .get(..2)
                        .map(|code| u16::from_be_bytes([code[0], code[1]]))
                        .ok_or_else(|| Error::data_loss("key error without code"))?;
                    let resolution = KeyResolution::Unavailable { code };
                    warn!("{file_id}: {resolution}");
                    Ok(resolution)
                };
            }

            other => trace!("ignoring {other} packet while waiting for key"),
        }
    }
}

fn split_sequence(payload: &[u8]) -> Result<(u32, &[u8])> {
    if payload.len() < 4 {
        return Err(Error::data_loss(format!(
            "key response of {} bytes has no sequence",
            payload.len()
        )));
    }
    let (seq, body) = payload.split_at(4);
    Ok((u32::from_be_bytes([seq[0], seq[1], seq[2], seq[3]]), body))
}
