//! Encrypted packet channel over an access point transport.
//!
//! Frames are laid out as `type ‖ u16 BE length ‖ payload ‖ 4-byte MAC`.
//! Header and payload are encrypted with the direction's Shannon cipher;
//! the MAC is sent in the clear. Each frame uses the next nonce of its
//! direction.
//!
//! The channel does not answer keep-alive pings itself: whoever drives the
//! channel is expected to reply with a pong and keep waiting.

use std::fmt;

use crate::{
    error::{Error, Result},
    protocol::packet::{Packet, PacketType},
    shannon::Shannon,
    transport::{Socket, Transport},
};

/// Length of the packet MAC in bytes.
pub const MAC_LENGTH: usize = 4;

/// Length of the encrypted packet header in bytes.
const HEADER_LENGTH: usize = 3;

/// Authenticated, encrypted packet channel.
pub struct Channel<S> {
    transport: Transport<S>,
    send_cipher: Shannon,
    recv_cipher: Shannon,
    send_nonce: u32,
    recv_nonce: u32,
}

impl<S> fmt::Debug for Channel<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("send_nonce", &self.send_nonce)
            .field("recv_nonce", &self.recv_nonce)
            .finish_non_exhaustive()
    }
}

impl<S: Socket> Channel<S> {
    /// Creates a channel from the keys derived during the handshake.
    #[must_use]
    pub fn new(transport: Transport<S>, send_key: &[u8], recv_key: &[u8]) -> Self {
        Self {
            transport,
            send_cipher: Shannon::new(send_key),
            recv_cipher: Shannon::new(recv_key),
            send_nonce: 0,
            recv_nonce: 0,
        }
    }

    /// Encrypts and sends one packet.
    ///
    /// # Errors
    ///
    /// * `InvalidArgument` if the payload does not fit a 16-bit length
    /// * `Internal` if the nonce counter is exhausted
    /// * I/O errors from the transport
    pub fn send(&mut self, kind: PacketType, payload: &[u8]) -> Result<()> {
        let len = u16::try_from(payload.len()).map_err(|_| {
            Error::invalid_argument(format!("payload of {} bytes too large", payload.len()))
        })?;

        let nonce = Self::next_nonce(&mut self.send_nonce)?;
        self.send_cipher.nonce(nonce);

        self.transport.write_u8(kind.into());
        self.transport.write_u16(len);
        self.transport.write(payload);

        let mut frame = self.transport.take_staged();
        self.send_cipher.encrypt(&mut frame);

        let mut mac = [0; MAC_LENGTH];
        self.send_cipher.finish(&mut mac);

        self.transport.write(&frame);
        self.transport.write(&mac);

        debug!("sending {kind} packet ({len} bytes)");
        self.transport.flush()
    }

    /// Receives, decrypts and authenticates one packet.
    ///
    /// # Errors
    ///
    /// * `DataLoss` on a MAC mismatch or a truncated frame
    /// * `Internal` if the nonce counter is exhausted
    /// * I/O errors from the transport
    pub fn receive(&mut self) -> Result<Packet> {
        let nonce = Self::next_nonce(&mut self.recv_nonce)?;
        self.recv_cipher.nonce(nonce);

        let mut header = self.transport.read_exact(HEADER_LENGTH)?;
        self.recv_cipher.decrypt(&mut header);

        let kind = PacketType::from(header[0]);
        let len = usize::from(u16::from_be_bytes([header[1], header[2]]));

        let mut payload = self.transport.read_exact(len)?;
        self.recv_cipher.decrypt(&mut payload);

        let mac = self.transport.read_exact(MAC_LENGTH)?;
        if !self.recv_cipher.check_mac(&mac) {
            return Err(Error::data_loss(format!(
                "mac mismatch on {kind} packet with nonce {nonce}"
            )));
        }

        debug!("received {kind} packet ({len} bytes)");
        Ok(Packet::new(kind, payload))
    }

    /// Returns the current nonce and advances the counter.
    fn next_nonce(counter: &mut u32) -> Result<u32> {
        let nonce = *counter;
        *counter = nonce
            .checked_add(1)
            .ok_or_else(|| Error::internal("nonce counter exhausted"))?;
        Ok(nonce)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::{protocol::packet::PacketType, shannon::Shannon};

    use super::MAC_LENGTH;

    /// Encodes frames the way the access point does, for scripting input.
    pub struct FrameEncoder {
        cipher: Shannon,
        nonce: u32,
    }

    impl FrameEncoder {
        pub fn new(key: &[u8]) -> Self {
            Self {
                cipher: Shannon::new(key),
                nonce: 0,
            }
        }

        pub fn encode(&mut self, kind: PacketType, payload: &[u8]) -> Vec<u8> {
            self.cipher.nonce(self.nonce);
            self.nonce += 1;

            let mut frame = vec![u8::from(kind)];
            frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            frame.extend_from_slice(payload);
            self.cipher.encrypt(&mut frame);

            let mut mac = [0; MAC_LENGTH];
            self.cipher.finish(&mut mac);
            frame.extend_from_slice(&mac);
            frame
        }
    }

    /// Decodes frames written by a channel.
    pub struct FrameDecoder {
        cipher: Shannon,
        nonce: u32,
    }

    impl FrameDecoder {
        pub fn new(key: &[u8]) -> Self {
            Self {
                cipher: Shannon::new(key),
                nonce: 0,
            }
        }

        /// Decodes all frames in `data`, panicking on a bad MAC.
        pub fn decode_all(&mut self, mut data: &[u8]) -> Vec<(PacketType, Vec<u8>)> {
            let mut frames = Vec::new();
            while !data.is_empty() {
                self.cipher.nonce(self.nonce);
                self.nonce += 1;

                let mut header = data[..3].to_vec();
                self.cipher.decrypt(&mut header);
                let len = usize::from(u16::from_be_bytes([header[1], header[2]]));

                let mut payload = data[3..3 + len].to_vec();
                self.cipher.decrypt(&mut payload);

                let mac = &data[3 + len..3 + len + MAC_LENGTH];
                assert!(self.cipher.check_mac(mac), "bad mac in client frame");

                frames.push((PacketType::from(header[0]), payload));
                data = &data[3 + len + MAC_LENGTH..];
            }
            frames
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        testing::{FrameDecoder, FrameEncoder},
        *,
    };
    use crate::{error::ErrorKind, transport::testing::MemorySocket};

    const SEND_KEY: [u8; 32] = [0x11; 32];
    const RECV_KEY: [u8; 32] = [0x22; 32];

    fn channel(socket: &MemorySocket) -> Channel<MemorySocket> {
        Channel::new(Transport::new(socket.clone()), &SEND_KEY, &RECV_KEY)
    }

    #[test]
    fn sent_frames_decode_in_order() {
        let socket = MemorySocket::default();
        let mut channel = channel(&socket);

        channel.send(PacketType::Login, b"first").unwrap();
        channel.send(PacketType::Pong, &[0; 4]).unwrap();
        channel.send(PacketType::RequestKey, &[]).unwrap();

        let frames = FrameDecoder::new(&SEND_KEY).decode_all(&socket.output());
        assert_eq!(
            frames,
            vec![
                (PacketType::Login, b"first".to_vec()),
                (PacketType::Pong, vec![0; 4]),
                (PacketType::RequestKey, vec![]),
            ]
        );
    }

    #[test]
    fn received_frames_are_authenticated() {
        let mut server = FrameEncoder::new(&RECV_KEY);
        let socket = MemorySocket::default();
        socket.push_input(&server.encode(PacketType::Ping, &[1, 2, 3, 4]));
        socket.push_input(&server.encode(PacketType::CountryCode, b"NL"));

        let mut channel = channel(&socket);
        assert_eq!(
            channel.receive().unwrap(),
            Packet::new(PacketType::Ping, vec![1, 2, 3, 4])
        );
        assert_eq!(
            channel.receive().unwrap(),
            Packet::new(PacketType::CountryCode, b"NL".to_vec())
        );
    }

    #[test]
    fn corrupted_frame_is_rejected() {
        let mut server = FrameEncoder::new(&RECV_KEY);
        let mut frame = server.encode(PacketType::AesKey, &[7; 20]);
        frame[5] ^= 0x40;

        let socket = MemorySocket::with_input(&frame);
        let err = channel(&socket).receive().unwrap_err();
        assert_eq!(err.kind, ErrorKind::DataLoss);
    }

    #[test]
    fn oversized_payload_is_refused() {
        let socket = MemorySocket::default();
        let err = channel(&socket)
            .send(PacketType::Login, &vec![0; 70_000])
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        assert!(socket.output().is_empty());
    }

    #[test]
    fn truncated_frame_is_data_loss() {
        let mut server = FrameEncoder::new(&RECV_KEY);
        let frame = server.encode(PacketType::AesKey, &[7; 20]);

        let socket = MemorySocket::with_input(&frame[..10]);
        let err = channel(&socket).receive().unwrap_err();
        assert_eq!(err.kind, ErrorKind::DataLoss);
    }
}
