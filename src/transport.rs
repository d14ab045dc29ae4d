//! Buffered blocking transport to an access point.
//!
//! Outgoing data is first accumulated in a staging buffer so that callers
//! can inspect it (the handshake keeps a transcript of everything sent) or
//! encrypt it as a whole before it hits the wire. Reads are always exact:
//! a short read is an error.

use std::{
    io::{self, Read, Write},
    net::TcpStream,
    time::Duration,
};

use crate::error::{Error, Result};

/// A bidirectional byte stream with a configurable read timeout.
pub trait Socket: Read + Write + Send {
    /// Sets the read timeout; `None` blocks indefinitely.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying socket rejects the timeout.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl Socket for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }
}

/// Socket wrapper with a staging buffer for outgoing data.
#[derive(Debug)]
pub struct Transport<S> {
    socket: S,
    staging: Vec<u8>,
}

impl<S: Socket> Transport<S> {
    /// Wraps a connected socket.
    #[must_use]
    pub fn new(socket: S) -> Self {
        Self {
            socket,
            staging: Vec::new(),
        }
    }

    /// Appends raw bytes to the staging buffer.
    pub fn write(&mut self, data: &[u8]) {
        self.staging.extend_from_slice(data);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.staging.push(value);
    }

    /// Appends a big-endian `u16`.
    pub fn write_u16(&mut self, value: u16) {
        self.write(&value.to_be_bytes());
    }

    /// Appends a big-endian `u32`.
    pub fn write_u32(&mut self, value: u32) {
        self.write(&value.to_be_bytes());
    }

    /// Appends a big-endian `i32`.
    pub fn write_i32(&mut self, value: i32) {
        self.write(&value.to_be_bytes());
    }

    /// Bytes staged since the last flush.
    #[must_use]
    pub fn staged(&self) -> &[u8] {
        &self.staging
    }

    /// Removes and returns the staged bytes without sending them.
    pub fn take_staged(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.staging)
    }

    /// Sends the staged bytes and clears the staging buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to the socket fails. The staging buffer
    /// is cleared either way.
    pub fn flush(&mut self) -> Result<()> {
        let staging = self.take_staged();
        trace!("send [{:>5}]: {}", staging.len(), hex::encode(&staging));

        self.socket.write_all(&staging)?;
        self.socket.flush()?;
        Ok(())
    }

    /// Reads exactly `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns `DataLoss` if the peer closes the connection early, or the
    /// mapped I/O error otherwise (including timeouts).
    pub fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.socket.read_exact(&mut buf)?;
        trace!("recv [{len:>5}]: {}", hex::encode(&buf));
        Ok(buf)
    }

    /// Reads a big-endian `u32`.
    ///
    /// # Errors
    ///
    /// See [`read_exact`](Self::read_exact).
    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0; 4];
        self.socket.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    /// Sets the read timeout of the underlying socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket rejects the timeout.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.socket
            .set_read_timeout(timeout)
            .map_err(Error::from)
    }

    /// Returns the underlying socket.
    pub fn into_inner(self) -> S {
        self.socket
    }
}


#[cfg(test)]
mod tests {
    use super::{testing::MemorySocket, *};
    use crate::error::ErrorKind;

    #[test]
    fn staged_writes_are_sent_on_flush() {
        let socket = MemorySocket::default();
        let mut transport = Transport::new(socket.clone());

        transport.write(&[0x00, 0x04]);
        transport.write_u16(0x0102);
        transport.write_i32(-2);
        assert!(socket.output().is_empty());
        assert_eq!(transport.staged().len(), 8);

        transport.flush().unwrap();
        assert_eq!(
            socket.output(),
            vec![0x00, 0x04, 0x01, 0x02, 0xff, 0xff, 0xff, 0xfe]
        );
        assert!(transport.staged().is_empty());
    }

    #[test]
    fn short_read_is_data_loss() {
        let socket = MemorySocket::with_input(&[0, 0, 0, 9, 1, 2]);
        let mut transport = Transport::new(socket);

        assert_eq!(transport.read_u32().unwrap(), 9);
        let err = transport.read_exact(9).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DataLoss);
    }
}
