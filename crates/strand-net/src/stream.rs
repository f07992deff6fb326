//! Fixed-size read/write helpers over a socket
//!
//! Protocol code usually wants "exactly n bytes or fail"; these loops
//! provide that over the hooked socket calls, plus vectored variants that
//! stage through a `ByteArray`.

use crate::bytearray::ByteArray;
use crate::socket::Socket;
use std::io;

pub struct SocketStream {
    sock: Socket,
}

impl SocketStream {
    pub fn new(sock: Socket) -> SocketStream {
        SocketStream { sock }
    }

    pub fn socket(&self) -> &Socket {
        &self.sock
    }

    pub fn is_connected(&self) -> bool {
        self.sock.is_connected()
    }

    /// One read; Ok(0) is peer close.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.sock.recv(buf, 0)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.sock.send(buf, 0)
    }

    /// Fill `buf` completely or fail with UnexpectedEof.
    pub fn read_exact(&self, buf: &mut [u8]) -> io::Result<()> {
        let mut off = 0;
        while off < buf.len() {
            let n = self.sock.recv(&mut buf[off..], 0)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed mid-read",
                ));
            }
            off += n;
        }
        Ok(())
    }

    /// Send all of `buf`, retrying partial writes.
    pub fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut off = 0;
        while off < buf.len() {
            let n = self.sock.send(&buf[off..], 0)?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "send returned 0"));
            }
            off += n;
        }
        Ok(())
    }

    /// Scatter-read up to `len` bytes into the byte array at its current
    /// position, advancing position and size past what arrived.
    pub fn read_to_bytearray(&self, ba: &mut ByteArray, len: usize) -> io::Result<usize> {
        let mut iovs = ba.write_buffers(len);
        let n = self.sock.recvv(&mut iovs)?;
        ba.set_position(ba.position() + n);
        Ok(n)
    }

    /// Gather-write up to `len` readable bytes from the byte array,
    /// advancing its position past what was sent.
    pub fn write_from_bytearray(&self, ba: &mut ByteArray, len: usize) -> io::Result<usize> {
        let iovs = ba.read_buffers(len);
        if iovs.is_empty() {
            return Ok(0);
        }
        let n = self.sock.sendv(&iovs)?;
        ba.set_position(ba.position() + n);
        Ok(n)
    }

    pub fn close(&self) {
        self.sock.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;

    fn blocking_pair() -> (SocketStream, SocketStream) {
        let listener = Socket::tcp(&Address::loopback(0));
        listener.bind(&Address::loopback(0)).unwrap();
        listener.listen(4).unwrap();
        let addr = listener.local_addr().unwrap();

        let t = std::thread::spawn(move || {
            let c = Socket::tcp(&addr);
            c.connect(&addr, None).unwrap();
            c
        });
        let server_side = listener.accept().unwrap();
        let client_side = t.join().unwrap();
        (SocketStream::new(server_side), SocketStream::new(client_side))
    }

    #[test]
    fn test_exact_roundtrip() {
        let (a, b) = blocking_pair();
        a.write_all(b"0123456789").unwrap();
        let mut buf = [0u8; 10];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"0123456789");
    }

    #[test]
    fn test_read_exact_hits_eof() {
        let (a, b) = blocking_pair();
        a.write_all(b"abc").unwrap();
        a.close();
        let mut buf = [0u8; 8];
        let err = b.read_exact(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_bytearray_vectored_roundtrip() {
        let (a, b) = blocking_pair();

        // Tiny blocks force multi-iovec paths
        let mut out = ByteArray::with_block_size(4);
        out.write(b"vectored payload");
        out.set_position(0);
        let total = out.readable();
        let mut sent = 0;
        while sent < total {
            sent += a.write_from_bytearray(&mut out, total - sent).unwrap();
        }

        let mut inb = ByteArray::with_block_size(4);
        let mut got = 0;
        while got < total {
            got += b.read_to_bytearray(&mut inb, total - got).unwrap();
        }
        inb.set_position(0);
        let mut buf = vec![0u8; total];
        inb.read(&mut buf).unwrap();
        assert_eq!(&buf, b"vectored payload");
    }
}
