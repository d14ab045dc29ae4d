//! Packet types of the encrypted access point channel.
//!
//! Every frame after the handshake carries a one-byte type tag. The set of
//! tags is not documented by the service; the known ones are listed here and
//! anything else is preserved as [`PacketType::Unknown`] so it can be logged
//! and skipped.

use std::fmt;

/// Type tag of a packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum PacketType {
    SecretBlock,
    Ping,
    StreamChunk,
    StreamChunkRes,
    ChannelError,
    ChannelAbort,
    RequestKey,
    AesKey,
    AesKeyError,
    Image,
    CountryCode,
    Pong,
    PongAck,
    Pause,
    ProductInfo,
    LegacyWelcome,
    LicenseVersion,
    Login,
    ApWelcome,
    AuthFailure,
    MercuryReq,
    MercurySub,
    MercuryUnsub,
    MercuryEvent,
    TrackEndedTime,
    /// Payload is all zeros; meaning unknown.
    UnknownZeros,
    PreferredLocale,
    Unknown0x4f,
    /// Sent by the client right after login with 20 random bytes.
    Unknown0x0f,
    Unknown0x10,
    /// Tag not recognized by this client.
    Unknown(u8),
}

impl From<u8> for PacketType {
    fn from(tag: u8) -> Self {
        match tag {
            0x02 => Self::SecretBlock,
            0x04 => Self::Ping,
            0x08 => Self::StreamChunk,
            0x09 => Self::StreamChunkRes,
            0x0a => Self::ChannelError,
            0x0b => Self::ChannelAbort,
            0x0c => Self::RequestKey,
            0x0d => Self::AesKey,
            0x0e => Self::AesKeyError,
            0x19 => Self::Image,
            0x1b => Self::CountryCode,
            0x49 => Self::Pong,
            0x4a => Self::PongAck,
            0x4b => Self::Pause,
            0x50 => Self::ProductInfo,
            0x69 => Self::LegacyWelcome,
            0x76 => Self::LicenseVersion,
            0xab => Self::Login,
            0xac => Self::ApWelcome,
            0xad => Self::AuthFailure,
            0xb2 => Self::MercuryReq,
            0xb3 => Self::MercurySub,
            0xb4 => Self::MercuryUnsub,
            0xb5 => Self::MercuryEvent,
            0x82 => Self::TrackEndedTime,
            0x1f => Self::UnknownZeros,
            0x74 => Self::PreferredLocale,
            0x4f => Self::Unknown0x4f,
            0x0f => Self::Unknown0x0f,
            0x10 => Self::Unknown0x10,
            other => Self::Unknown(other),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(kind: PacketType) -> Self {
        match kind {
            PacketType::SecretBlock => 0x02,
            PacketType::Ping => 0x04,
            PacketType::StreamChunk => 0x08,
            PacketType::StreamChunkRes => 0x09,
            PacketType::ChannelError => 0x0a,
            PacketType::ChannelAbort => 0x0b,
            PacketType::RequestKey => 0x0c,
            PacketType::AesKey => 0x0d,
            PacketType::AesKeyError => 0x0e,
            PacketType::Image => 0x19,
            PacketType::CountryCode => 0x1b,
            PacketType::Pong => 0x49,
            PacketType::PongAck => 0x4a,
            PacketType::Pause => 0x4b,
            PacketType::ProductInfo => 0x50,
            PacketType::LegacyWelcome => 0x69,
            PacketType::LicenseVersion => 0x76,
            PacketType::Login => 0xab,
            PacketType::ApWelcome => 0xac,
            PacketType::AuthFailure => 0xad,
            PacketType::MercuryReq => 0xb2,
            PacketType::MercurySub => 0xb3,
            PacketType::MercuryUnsub => 0xb4,
            PacketType::MercuryEvent => 0xb5,
            PacketType::TrackEndedTime => 0x82,
            PacketType::UnknownZeros => 0x1f,
            PacketType::PreferredLocale => 0x74,
            PacketType::Unknown0x4f => 0x4f,
            PacketType::Unknown0x0f => 0x0f,
            PacketType::Unknown0x10 => 0x10,
            PacketType::Unknown(tag) => tag,
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SecretBlock => "secret_block",
            Self::Ping => "ping",
            Self::StreamChunk => "stream_chunk",
            Self::StreamChunkRes => "stream_chunk_res",
            Self::ChannelError => "channel_error",
            Self::ChannelAbort => "channel_abort",
            Self::RequestKey => "request_key",
            Self::AesKey => "aes_key",
            Self::AesKeyError => "aes_key_error",
            Self::Image => "image",
            Self::CountryCode => "country_code",
            Self::Pong => "pong",
            Self::PongAck => "pong_ack",
            Self::Pause => "pause",
            Self::ProductInfo => "product_info",
            Self::LegacyWelcome => "legacy_welcome",
            Self::LicenseVersion => "license_version",
            Self::Login => "login",
            Self::ApWelcome => "ap_welcome",
            Self::AuthFailure => "auth_failure",
            Self::MercuryReq => "mercury_req",
            Self::MercurySub => "mercury_sub",
            Self::MercuryUnsub => "mercury_unsub",
            Self::MercuryEvent => "mercury_event",
            Self::TrackEndedTime => "track_ended_time",
            Self::UnknownZeros => "unknown_data_all_zeros",
            Self::PreferredLocale => "preferred_locale",
            Self::Unknown0x4f => "unknown_0x4f",
            Self::Unknown0x0f => "unknown_0x0f",
            Self::Unknown0x10 => "unknown_0x10",
            Self::Unknown(tag) => return write!(f, "unknown ({tag:#04x})"),
        };
        write!(f, "{name}")
    }
}

/// A decrypted and authenticated packet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    pub kind: PacketType,
    pub payload: Vec<u8>,
}

impl Packet {
    #[must_use]
    pub fn new(kind: PacketType, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_tags_round_trip() {
        for tag in [0x04, 0x0c, 0x0d, 0x0e, 0x49, 0xab, 0xac, 0xad, 0x74, 0x0f] {
            let kind = PacketType::from(tag);
            assert!(!matches!(kind, PacketType::Unknown(_)), "{tag:#04x}");
            assert_eq!(u8::from(kind), tag);
        }
    }

    #[test]
    fn unknown_tag_is_preserved() {
        let kind = PacketType::from(0xee);
        assert_eq!(kind, PacketType::Unknown(0xee));
        assert_eq!(u8::from(kind), 0xee);
        assert_eq!(kind.to_string(), "unknown (0xee)");
    }
}
