//! Diffie-Hellman key agreement over the fixed 768-bit access point group.

use rand::RngCore;
use rsa::BigUint;

/// Group generator.
const GENERATOR: u32 = 2;

/// Group modulus, big-endian.
const PRIME: [u8; 96] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2, 0x21, 0x68, 0xc2, 0x34,
    0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1, 0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67, 0xcc, 0x74,
    0x02, 0x0b, 0xbe, 0xa6, 0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e, 0x34, 0x04, 0xdd,
    0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d, 0xf2, 0x5f, 0x14, 0x37,
    0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45, 0xe4, 0x85, 0xb5, 0x76, 0x62, 0x5e, 0x7e, 0xc6,
    0xf4, 0x4c, 0x42, 0xe9, 0xa6, 0x3a, 0x36, 0x20, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

/// Length of the random private exponent in bytes.
const PRIVATE_KEY_LENGTH: usize = 95;

/// Ephemeral key pair for one connection attempt.
///
/// The private exponent is never exposed; `Debug` only shows the public
/// value.
pub struct DhLocalKeys {
    private_key: BigUint,
    public_key: BigUint,
}

impl DhLocalKeys {
    /// Generates a fresh key pair from the thread-local CSPRNG.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0; PRIVATE_KEY_LENGTH];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_private_bytes(&bytes)
    }

    /// Builds a key pair from a big-endian private exponent.
    #[must_use]
    pub fn from_private_bytes(bytes: &[u8]) -> Self {
        let private_key = BigUint::from_bytes_be(bytes);
        let public_key = BigUint::from(GENERATOR).modpow(&private_key, &prime());

        Self {
            private_key,
            public_key,
        }
    }

    /// Public value `g^x mod p` as minimal big-endian bytes.
    #[must_use]
    pub fn public_key(&self) -> Vec<u8> {
        self.public_key.to_bytes_be()
    }

    /// Shared secret `remote^x mod p` as minimal big-endian bytes.
    #[must_use]
    pub fn shared_secret(&self, remote_key: &[u8]) -> Vec<u8> {
        BigUint::from_bytes_be(remote_key)
            .modpow(&self.private_key, &prime())
            .to_bytes_be()
    }
}

impl std::fmt::Debug for DhLocalKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhLocalKeys")
            .field("public_key", &hex::encode(self.public_key()))
            .finish_non_exhaustive()
    }
}

fn prime() -> BigUint {
    BigUint::from_bytes_be(&PRIME)
}
