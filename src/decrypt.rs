//! AES-128-CTR decryption of protected media.
//!
//! Encrypted files use a single counter sequence over the whole file,
//! starting at a fixed IV. Any byte range can therefore be decrypted on its
//! own: the counter for absolute offset `o` is `IV + o / 16`, and decryption
//! starts `o % 16` bytes into that keystream block.
//!
//! # Security
//!
//! No keys are embedded. Keys are resolved per track at runtime and never
//! appear in `Debug` output.
//!
//! # Example
//!
//! ```rust
//! use sptape::decrypt::Key;
//!
//! let key: Key = "000102030405060708090a0b0c0d0e0f".parse()?;
//!
//! let mut chunk = vec![0; 32];
//! key.apply_keystream(64, &mut chunk);
//! ```

use std::{ops::Deref, str::FromStr};

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use veil::Redact;

use crate::error::{Error, Result};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Length of decryption keys in bytes.
pub const KEY_LENGTH: usize = 16;

/// AES block size in bytes.
pub const BLOCK_SIZE: u64 = 16;

/// Initial counter value of every encrypted file.
pub const AUDIO_IV: u128 = 0x72e0_67fb_ddcb_cf77_ebe8_bc64_3f63_0d93;

/// Raw key bytes.
pub type RawKey = [u8; KEY_LENGTH];

/// Validated content key.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash, Redact)]
#[redact(all)]
pub struct Key(RawKey);

impl Key {
    #[must_use]
    pub fn new(key: RawKey) -> Self {
        Self(key)
    }

    /// Builds a key from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` if the slice is not exactly 16 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key = RawKey::try_from(bytes).map_err(|_| {
            Error::out_of_range(format!(
                "key length is {} but should be {KEY_LENGTH}",
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    /// Decrypts (or encrypts) `buf` in place as the bytes at absolute
    /// `offset` in the file.
    pub fn apply_keystream(&self, offset: u64, buf: &mut [u8]) {
        let counter = AUDIO_IV.wrapping_add(u128::from(offset / BLOCK_SIZE));
        let mut cipher = Aes128Ctr::new(&self.0.into(), &counter.to_be_bytes().into());

        // Offsets inside the first block skip the start of its keystream.
        cipher.seek(offset % BLOCK_SIZE);
        cipher.apply_keystream(buf);
    }
}

impl FromStr for Key {
    type Err = Error;

    /// Parses a key from 32 hex characters.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_slice(&hex::decode(s.trim())?)
    }
}

impl Deref for Key {
    type Target = RawKey;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
