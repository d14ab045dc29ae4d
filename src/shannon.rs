//! Shannon authenticated stream cipher.
//!
//! Every packet exchanged with an access point after the handshake is
//! encrypted and authenticated with Shannon. Each direction owns one
//! instance keyed with its own session key, and re-nonces it once per
//! packet with a strictly increasing counter.
//!
//! # Layout
//!
//! The cipher keeps sixteen 32-bit registers that are shifted by the
//! `cycle` function, plus a parallel CRC register array that accumulates the
//! plaintext for the MAC. Data is processed as little-endian words; trailing
//! bytes that do not fill a word are buffered and carried over to the next
//! call on the same nonce.
//!
//! # Example
//!
//! ```rust
//! use sptape::shannon::Shannon;
//!
//! let mut tx = Shannon::new(&[0x42; 32]);
//! let mut rx = Shannon::new(&[0x42; 32]);
//!
//! tx.nonce(0);
//! rx.nonce(0);
//!
//! let mut frame = *b"hello";
//! tx.encrypt(&mut frame);
//! let mut tag = [0; 4];
//! tx.finish(&mut tag);
//!
//! rx.decrypt(&mut frame);
//! assert_eq!(&frame, b"hello");
//! assert!(rx.check_mac(&tag));
//! ```

/// Number of 32-bit words in the register array.
const N: usize = 16;

/// Number of cycles used to diffuse state after loading key material.
const FOLD: usize = N;

/// Initial constant mixed into the register cycle.
const INITKONST: u32 = 0x6996_c53a;

/// Register that receives key and MAC input.
const KEYP: usize = 13;

/// Shannon cipher state for one direction of a connection.
///
/// Instances are not `Clone`: reusing a nonce on two copies of the same
/// keyed state would break authentication.
#[derive(Debug)]
pub struct Shannon {
    /// Working registers.
    r: [u32; N],

    /// MAC accumulator.
    crc: [u32; N],

    /// Registers after keying, restored on every nonce.
    init_r: [u32; N],

    /// Non-linear constant.
    konst: u32,

    /// Current keystream word.
    sbuf: u32,

    /// Partially filled MAC word.
    mbuf: u32,

    /// Bits still missing from `mbuf`, zero when word-aligned.
    nbuf: u32,
}

impl Shannon {
    /// Creates a cipher keyed with `key`.
    ///
    /// The instance still needs a [`nonce`](Self::nonce) before processing
    /// data.
    #[must_use]
    pub fn new(key: &[u8]) -> Self {
        let mut cipher = Self {
            r: [0; N],
            crc: [0; N],
            init_r: [0; N],
            konst: INITKONST,
            sbuf: 0,
            mbuf: 0,
            nbuf: 0,
        };

        cipher.init_state();
        cipher.load_key(key);
        cipher.konst = cipher.r[0];
        cipher.init_r = cipher.r;
        cipher.nbuf = 0;

        cipher
    }

    /// Re-initializes the cipher for a new frame.
    ///
    /// Restores the keyed register snapshot and absorbs the nonce as four
    /// big-endian bytes.
    pub fn nonce(&mut self, nonce: u32) {
        self.nonce_bytes(&nonce.to_be_bytes());
    }

    /// Re-initializes the cipher with an arbitrary byte nonce.
    pub fn nonce_bytes(&mut self, nonce: &[u8]) {
        self.r = self.init_r;
        self.konst = INITKONST;
        self.load_key(nonce);
        self.konst = self.r[0];
        self.nbuf = 0;
    }

    /// Encrypts `buf` in place and folds the plaintext into the MAC.
    pub fn encrypt(&mut self, buf: &mut [u8]) {
        self.process(buf, Direction::Encrypt);
    }

    /// Decrypts `buf` in place and folds the recovered plaintext into the
    /// MAC.
    pub fn decrypt(&mut self, buf: &mut [u8]) {
        self.process(buf, Direction::Decrypt);
    }

    /// Finalizes the MAC for the current frame and writes it to `out`.
    ///
    /// Any number of tag bytes may be requested, though the access point
    /// protocol always uses four.
    pub fn finish(&mut self, out: &mut [u8]) {
        if self.nbuf != 0 {
            self.mac_func(self.mbuf);
        }

        self.cycle();
        self.r[KEYP] ^= INITKONST ^ (self.nbuf << 3);
        self.nbuf = 0;

        for (r, crc) in self.r.iter_mut().zip(self.crc) {
            *r ^= crc;
        }
        self.diffuse();

        for word in out.chunks_mut(4) {
            self.cycle();
            let bytes = self.sbuf.to_le_bytes();
            word.copy_from_slice(&bytes[..word.len()]);
        }
    }

    /// Finalizes the MAC and compares it against `mac`.
    ///
    /// Returns `true` when the received tag matches.
    #[must_use]
    pub fn check_mac(&mut self, mac: &[u8]) -> bool {
        let mut expected = vec![0; mac.len()];
        self.finish(&mut expected);

        // Constant time with respect to where the first mismatch is.
        expected
            .iter()
            .zip(mac)
            .fold(0, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    fn process(&mut self, buf: &mut [u8], direction: Direction) {
        let mut i = 0;

        if self.nbuf != 0 {
            while self.nbuf != 0 && i < buf.len() {
                self.apply_byte(&mut buf[i], direction);
                i += 1;
            }

            if self.nbuf != 0 {
                return;
            }

            self.mac_func(self.mbuf);
        }

        let aligned = i + ((buf.len() - i) & !0x03);
        while i < aligned {
            self.cycle();

            let word = &mut buf[i..i + 4];
            let mut t = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            match direction {
                Direction::Encrypt => {
                    self.mac_func(t);
                    t ^= self.sbuf;
                }
                Direction::Decrypt => {
                    t ^= self.sbuf;
                    self.mac_func(t);
                }
            }
            word.copy_from_slice(&t.to_le_bytes());

            i += 4;
        }

        if i < buf.len() {
            self.cycle();
            self.mbuf = 0;
            self.nbuf = 32;

            while self.nbuf != 0 && i < buf.len() {
                self.apply_byte(&mut buf[i], direction);
                i += 1;
            }
        }
    }

    /// Handles one byte of a partial word.
    fn apply_byte(&mut self, byte: &mut u8, direction: Direction) {
        let shift = 32 - self.nbuf;

        #[expect(clippy::cast_possible_truncation)]
        let keystream = (self.sbuf >> shift) as u8;

        match direction {
            Direction::Encrypt => {
                self.mbuf ^= u32::from(*byte) << shift;
                *byte ^= keystream;
            }
            Direction::Decrypt => {
                *byte ^= keystream;
                self.mbuf ^= u32::from(*byte) << shift;
            }
        }

        self.nbuf -= 8;
    }

    fn init_state(&mut self) {
        self.r[0] = 1;
        self.r[1] = 1;
        for i in 2..N {
            self.r[i] = self.r[i - 1].wrapping_add(self.r[i - 2]);
        }
        self.konst = INITKONST;
    }

    fn load_key(&mut self, key: &[u8]) {
        let padded_len = key.len().div_ceil(4) * 4;

        let mut material = Vec::with_capacity(padded_len + 4);
        material.extend_from_slice(key);
        material.resize(padded_len, 0);

        // The key length is absorbed as a final word.
        #[expect(clippy::cast_possible_truncation)]
        material.extend_from_slice(&(key.len() as u32).to_le_bytes());

        for word in material.chunks_exact(4) {
            self.r[KEYP] ^= u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            self.cycle();
        }

        self.crc = self.r;
        self.diffuse();

        for (r, crc) in self.r.iter_mut().zip(self.crc) {
            *r ^= crc;
        }
    }

    fn cycle(&mut self) {
        let mut t = self.r[12] ^ self.r[13] ^ self.konst;
        t = sbox(t) ^ self.r[0].rotate_left(1);

        self.r.copy_within(1.., 0);
        self.r[N - 1] = t;

        let t = sbox2(self.r[2] ^ self.r[15]);
        self.r[0] ^= t;
        self.sbuf = t ^ self.r[8] ^ self.r[12];
    }

    fn crc_func(&mut self, i: u32) {
        let t = self.crc[0] ^ self.crc[2] ^ self.crc[15] ^ i;
        self.crc.copy_within(1.., 0);
        self.crc[N - 1] = t;
    }

    fn mac_func(&mut self, i: u32) {
        self.crc_func(i);
        self.r[KEYP] ^= i;
    }

    fn diffuse(&mut self) {
        for _ in 0..FOLD {
            self.cycle();
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Encrypt,
    Decrypt,
}

#[inline]
fn sbox(mut i: u32) -> u32 {
    i ^= i.rotate_left(5) | i.rotate_left(7);
    i ^= i.rotate_left(19) | i.rotate_left(22);
    i
}

#[inline]
fn sbox2(mut i: u32) -> u32 {
    i ^= i.rotate_left(7) | i.rotate_left(22);
    i ^= i.rotate_left(5) | i.rotate_left(19);
    i
}
