//! Transport abstraction: the core never touches `std::net` or an async
//! runtime's socket types directly, only these two traits.

use crate::error::*;

/// A byte-stream connection to a single peer. Read/write are expected to
/// be non-blocking (returning `Ok(0)` or an `ErrorKind::Io`-wrapped
/// `WouldBlock` when no data is available), matching the event-loop's
/// cooperative scheduling model: a handler must never block waiting on
/// bytes that have not arrived yet.
pub trait ByteStream {
    /// Reads as many bytes as are currently available into `buf`,
    /// returning the number read (which may be zero).
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Writes `buf` in full, or fails with `ErrorKind::Io`.
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;
}

/// Blanket impl so any `std::io::Read + std::io::Write` (e.g. a
/// `TcpStream` put into non-blocking mode by the embedder) satisfies
/// `ByteStream` without extra glue code.
impl<T: std::io::Read + std::io::Write> ByteStream for T {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match std::io::Read::read(self, buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf).wrapped(ErrorKind::Io)
    }
}

/// A fire-and-forget UDP-style datagram sender, used for LAN beacon
/// broadcasts. `addr` is an opaque string (`"ip:port"`); the embedder's
/// concrete implementation is responsible for actually parsing/binding.
pub trait DatagramSender {
    fn send_to(&mut self, buf: &[u8], addr: &str) -> Result<()>;
}

/// A decoded LAN beacon, as received by whatever `DatagramSender`-paired
/// receive loop the embedder runs; fed into `discovery::DiscoveryTable`.
#[derive(Clone, Debug)]
pub struct Beacon {
    pub alias: String,
    pub ruid: [u8; 32],
    pub rhid: [u8; 32],
    pub pubkey: [u8; 32],
    pub transport_addr: String,
    pub transport_port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn cursor_satisfies_bytestream_blanket_impl() {
        let mut stream = Cursor::new(Vec::<u8>::new());
        ByteStream::write_all(&mut stream, b"hi").unwrap();
        stream.set_position(0);
        let mut buf = [0u8; 2];
        let n = ByteStream::read(&mut stream, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi");
    }
}
