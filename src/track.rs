//! Tracks, identifiers and audio formats.
//!
//! A track is addressed by two opaque identifiers: the group id (`gid`)
//! names the logical track, the file id names one encoded variant of it.
//! Both are handled as raw bytes and written as lowercase hex.

use std::{fmt, ops::Deref, str::FromStr, time::Duration};

use serde_with::{DeserializeFromStr, SerializeDisplay};

use crate::error::{Error, Result};

/// Parses a non-empty hex string into bytes.
fn parse_hex(s: &str, what: &str) -> Result<Vec<u8>> {
    let bytes = hex::decode(s.trim())?;
    if bytes.is_empty() {
        return Err(Error::invalid_argument(format!("{what} is empty")));
    }
    Ok(bytes)
}

/// Group id of a track.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, SerializeDisplay, DeserializeFromStr)]
pub struct Gid(Vec<u8>);

impl Gid {
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl Deref for Gid {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromStr for Gid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_hex(s, "group id").map(Self)
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// File id of one encoded variant of a track.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, SerializeDisplay, DeserializeFromStr)]
pub struct FileId(Vec<u8>);

impl FileId {
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl Deref for FileId {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromStr for FileId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_hex(s, "file id").map(Self)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Audio codecs the service delivers.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, SerializeDisplay)]
pub enum AudioCodec {
    #[default]
    Unknown,
    OggVorbis,
    Mp3,
    Aac,
    Flac,
    Mp4,
}

impl AudioCodec {
    /// Ogg Vorbis files carry a service-specific header of this many bytes
    /// before the first Ogg page.
    pub const OGG_HEADER_SKIP: u64 = 167;

    /// Number of leading bytes [`sniff`](Self::sniff) looks at.
    pub const SNIFF_LENGTH: usize = 64 * 1024;

    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::OggVorbis => "ogg",
            Self::Mp3 => "mp3",
            Self::Aac => "aac",
            Self::Flac => "flac",
            Self::Mp4 => "mp4",
            Self::Unknown => "bin",
        }
    }

    #[must_use]
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::OggVorbis => "audio/ogg",
            Self::Mp3 => "audio/mpeg",
            Self::Aac => "audio/aac",
            Self::Flac => "audio/flac",
            Self::Mp4 => "audio/mp4",
            Self::Unknown => "application/octet-stream",
        }
    }

    /// Detects the codec from the leading bytes of a file.
    ///
    /// Containers that the service does not use (Opus, WAV, Matroska, FLV)
    /// are reported as `Unknown`.
    #[must_use]
    pub fn sniff(bytes: &[u8]) -> Self {
        fn contains(haystack: &[u8], needle: &[u8]) -> bool {
            haystack.windows(needle.len()).any(|window| window == needle)
        }

        if bytes.starts_with(b"fLaC") {
            return Self::Flac;
        }

        if bytes.starts_with(b"OggS") {
            if contains(bytes, b"\x01vorbis") {
                return Self::OggVorbis;
            }
            return Self::Unknown;
        }

        if bytes.starts_with(b"ID3") {
            return Self::Mp3;
        }

        if bytes.len() >= 2 && bytes[0] == 0xff && (bytes[1] & 0xe0) == 0xe0 {
            // ADTS shares the frame sync with MPEG audio; layer bits are zero.
            if (bytes[1] & 0xf6) == 0xf0 {
                return Self::Aac;
            }
            return Self::Mp3;
        }

        if contains(bytes, b"ftyp") {
            return Self::Mp4;
        }

        Self::Unknown
    }
}

impl fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OggVorbis => "Ogg Vorbis",
            Self::Mp3 => "MP3",
            Self::Aac => "AAC",
            Self::Flac => "FLAC",
            Self::Mp4 => "MP4",
            Self::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// File formats as named by the service.
#[expect(non_camel_case_types)]
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, Hash, SerializeDisplay, DeserializeFromStr,
)]
pub enum AudioFormat {
    OGG_VORBIS_96,
    #[default]
    OGG_VORBIS_160,
    OGG_VORBIS_320,
    MP3_96,
    MP3_160,
    MP3_160_ENC,
    MP3_256,
    MP3_320,
    AAC_24,
    AAC_48,
    AAC_160,
    AAC_320,
    XHE_AAC_12,
    XHE_AAC_16,
    XHE_AAC_24,
    FLAC_FLAC,
    FLAC_FLAC_24BIT,
    MP4_128,
    MP4_256,
    MP4_128_DUAL,
    MP4_256_DUAL,
}

impl AudioFormat {
    pub const ALL: [Self; 21] = [
        Self::OGG_VORBIS_96,
        Self::OGG_VORBIS_160,
        Self::OGG_VORBIS_320,
        Self::MP3_96,
        Self::MP3_160,
        Self::MP3_160_ENC,
        Self::MP3_256,
        Self::MP3_320,
        Self::AAC_24,
        Self::AAC_48,
        Self::AAC_160,
        Self::AAC_320,
        Self::XHE_AAC_12,
        Self::XHE_AAC_16,
        Self::XHE_AAC_24,
        Self::FLAC_FLAC,
        Self::FLAC_FLAC_24BIT,
        Self::MP4_128,
        Self::MP4_256,
        Self::MP4_128_DUAL,
        Self::MP4_256_DUAL,
    ];

    #[must_use]
    pub fn codec(self) -> AudioCodec {
        match self {
            Self::OGG_VORBIS_96 | Self::OGG_VORBIS_160 | Self::OGG_VORBIS_320 => {
                AudioCodec::OggVorbis
            }
            Self::MP3_96 | Self::MP3_160 | Self::MP3_160_ENC | Self::MP3_256 | Self::MP3_320 => {
                AudioCodec::Mp3
            }
            Self::AAC_24
            | Self::AAC_48
            | Self::AAC_160
            | Self::AAC_320
            | Self::XHE_AAC_12
            | Self::XHE_AAC_16
            | Self::XHE_AAC_24 => AudioCodec::Aac,
            Self::FLAC_FLAC | Self::FLAC_FLAC_24BIT => AudioCodec::Flac,
            Self::MP4_128 | Self::MP4_256 | Self::MP4_128_DUAL | Self::MP4_256_DUAL => {
                AudioCodec::Mp4
            }
        }
    }

    #[must_use]
    pub fn extension(self) -> &'static str {
        self.codec().extension()
    }

    #[must_use]
    pub fn mime_type(self) -> &'static str {
        self.codec().mime_type()
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The variant names are the wire names.
        fmt::Debug::fmt(self, f)
    }
}

impl FromStr for AudioFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|format| format.to_string() == wanted)
            .ok_or_else(|| Error::invalid_argument(format!("unknown audio format: {s}")))
    }
}

/// Loudness normalization values from the head of an Ogg Vorbis file.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct ReplayGain {
    pub track_gain: f32,
    pub track_peak: f32,
    pub album_gain: f32,
    pub album_peak: f32,
}

impl ReplayGain {
    /// Byte offset of the values in the file.
    pub const OFFSET: u64 = 144;

    /// Length of the four little-endian floats.
    pub const LENGTH: usize = 16;

    /// Decodes four little-endian `f32` values.
    #[must_use]
    pub fn from_le_bytes(bytes: [u8; Self::LENGTH]) -> Self {
        let value = |i: usize| {
            f32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]])
        };

        Self {
            track_gain: value(0),
            track_peak: value(4),
            album_gain: value(8),
            album_peak: value(12),
        }
    }
}

/// A track to download.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Track {
    gid: Gid,
    file_id: FileId,
    duration: Duration,
    format: AudioFormat,
    title: Option<String>,
}

impl Track {
    #[must_use]
    pub fn new(gid: Gid, file_id: FileId, duration: Duration, format: AudioFormat) -> Self {
        Self {
            gid,
            file_id,
            duration,
            format,
            title: None,
        }
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: AudioFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn gid(&self) -> &Gid {
        &self.gid
    }

    #[must_use]
    pub fn file_id(&self) -> &FileId {
        &self.file_id
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    #[must_use]
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    #[must_use]
    pub fn codec(&self) -> AudioCodec {
        self.format.codec()
    }

    /// Title if known, otherwise the group id.
    #[must_use]
    pub fn title(&self) -> String {
        self.title.clone().unwrap_or_else(|| self.gid.to_hex())
    }

    /// File name for the download, without directory.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.gid.to_hex(), self.format.extension())
    }
}

impl FromStr for Track {
    type Err = Error;

    /// Parses `GID:FILE_ID:DURATION_MS`, with hex ids and the duration in
    /// milliseconds. The format defaults to Ogg Vorbis 160.
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(':');
        let (Some(gid), Some(file_id), Some(duration), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::invalid_argument(format!(
                "track reference should be GID:FILE_ID:DURATION_MS but is {s}"
            )));
        };

        let duration = Duration::from_millis(duration.trim().parse()?);
        if duration.is_zero() {
            return Err(Error::invalid_argument("track duration is zero"));
        }

        Ok(Self::new(
            gid.parse()?,
            file_id.parse()?,
            duration,
            AudioFormat::default(),
        ))
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.title(), self.format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn parses_track_reference() {
        let track: Track = "00112233445566778899aabbccddeeff:0a0b0c:215000"
            .parse()
            .unwrap();
        assert_eq!(track.gid().to_hex(), "00112233445566778899aabbccddeeff");
        assert_eq!(&**track.file_id(), &[0x0a, 0x0b, 0x0c]);
        assert_eq!(track.duration(), Duration::from_millis(215_000));
        assert_eq!(track.codec(), AudioCodec::OggVorbis);
        assert_eq!(
            track.file_name(),
            "00112233445566778899aabbccddeeff.ogg"
        );
    }

    #[test]
    fn rejects_malformed_references() {
        for input in ["abcd", "abcd:ef", "abcd:ef:0", "zz:ef:10", "abcd:ef:10:x", ":ef:10"] {
            let err = input.parse::<Track>().unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidArgument, "{input}");
        }
    }

    #[test]
    fn formats_round_trip_through_names() {
        for format in AudioFormat::ALL {
            assert_eq!(format.to_string().parse::<AudioFormat>().unwrap(), format);
        }
        assert_eq!(
            "mp4_256_dual".parse::<AudioFormat>().unwrap().codec(),
            AudioCodec::Mp4
        );
        assert!("WAV".parse::<AudioFormat>().is_err());
    }

    #[test]
    fn sniffs_common_containers() {
        assert_eq!(AudioCodec::sniff(b"fLaC\0\0\0\x22"), AudioCodec::Flac);
        assert_eq!(
            AudioCodec::sniff(b"OggS\0\x02\0\0\0\0\0\0\0\0\x01vorbis"),
            AudioCodec::OggVorbis
        );
        assert_eq!(AudioCodec::sniff(b"OggS\0\x02OpusHead"), AudioCodec::Unknown);
        assert_eq!(AudioCodec::sniff(b"ID3\x04"), AudioCodec::Mp3);
        assert_eq!(AudioCodec::sniff(&[0xff, 0xfb, 0x90]), AudioCodec::Mp3);
        assert_eq!(AudioCodec::sniff(&[0xff, 0xf1, 0x50]), AudioCodec::Aac);
        assert_eq!(
            AudioCodec::sniff(b"\0\0\0\x20ftypisom"),
            AudioCodec::Mp4
        );
        assert_eq!(AudioCodec::sniff(b""), AudioCodec::Unknown);
    }

    #[test]
    fn decodes_replay_gain() {
        let mut bytes = [0; ReplayGain::LENGTH];
        bytes[..4].copy_from_slice(&(-6.5_f32).to_le_bytes());
        bytes[4..8].copy_from_slice(&0.98_f32.to_le_bytes());
        bytes[8..12].copy_from_slice(&(-7.0_f32).to_le_bytes());
        bytes[12..].copy_from_slice(&1.0_f32.to_le_bytes());

        let gain = ReplayGain::from_le_bytes(bytes);
        assert_eq!(gain.track_gain, -6.5);
        assert_eq!(gain.track_peak, 0.98);
        assert_eq!(gain.album_gain, -7.0);
        assert_eq!(gain.album_peak, 1.0);
    }
}
