//! # Control channel
//! Out-of-band TCP connection used to swap [`ConnectionInfo`](crate::exchange::ConnectionInfo)
//! and to rendezvous. Every transfer moves exactly the requested number of bytes or fails.
use crate::error::{Error, Result};
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
use tracing::{debug, info};

/// Largest framed payload accepted from a peer
pub const MAX_FRAME_LEN: u64 = 16 << 20;
pub const DEFAULT_PORT: u16 = 12345;
const BARRIER_BYTE: u8 = b'a';

pub fn send_all<W: Write>(stream: &mut W, buf: &[u8]) -> Result<()> {
    let mut sent = 0;
    while sent < buf.len() {
        match stream.write(&buf[sent..]) {
            Ok(0) => return Err(Error::channel("send", ErrorKind::WriteZero.into())),
            Ok(n) => sent += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::channel("send", e)),
        }
    }
    stream.flush().map_err(|e| Error::channel("send", e))
}

pub fn recv_all<R: Read>(stream: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut received = 0;
    while received < buf.len() {
        match stream.read(&mut buf[received..]) {
            Ok(0) => return Err(Error::channel("recv", ErrorKind::UnexpectedEof.into())),
            Ok(n) => received += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::channel("recv", e)),
        }
    }
    Ok(())
}

/// Writes an 8-byte little-endian length followed by the payload.
pub fn send_framed<W: Write>(stream: &mut W, payload: &[u8]) -> Result<()> {
    send_all(stream, &(payload.len() as u64).to_le_bytes())?;
    send_all(stream, payload)
}

pub fn recv_framed<R: Read>(stream: &mut R) -> Result<Vec<u8>> {
    let mut prefix = [0u8; 8];
    recv_all(stream, &mut prefix)?;
    let len = u64::from_le_bytes(prefix);
    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!(
            "frame of {} bytes exceeds the {} byte limit",
            len, MAX_FRAME_LEN
        )));
    }

    let mut payload = vec![0u8; len as usize];
    recv_all(stream, &mut payload)?;
    Ok(payload)
}

/// One byte each way. Returns once the peer has reached its own barrier.
pub fn barrier_ping<S: Read + Write>(stream: &mut S) -> Result<()> {
    send_all(stream, &[BARRIER_BYTE])?;
    let mut ack = [0u8; 1];
    recv_all(stream, &mut ack)?;
    debug!("barrier passed");
    Ok(())
}

pub fn bind(port: u16) -> Result<TcpListener> {
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
        .map_err(|e| Error::channel("bind", e))
}

/// Waits for a single peer on `listener`.
pub fn accept(listener: &TcpListener) -> Result<TcpStream> {
    let (stream, peer) = listener.accept().map_err(|e| Error::channel("accept", e))?;
    stream.set_nodelay(true).map_err(|e| Error::channel("setsockopt", e))?;
    info!("accepted control connection from {}", peer);
    Ok(stream)
}

pub fn listen_and_accept(port: u16) -> Result<TcpStream> {
    let listener = bind(port)?;
    info!("waiting for a client on port {}", port);
    accept(&listener)
}

pub fn connect(ip: Ipv4Addr, port: u16) -> Result<TcpStream> {
    let stream = TcpStream::connect(SocketAddrV4::new(ip, port))
        .map_err(|e| Error::channel("connect", e))?;
    stream.set_nodelay(true).map_err(|e| Error::channel("setsockopt", e))?;
    info!("connected to {}:{}", ip, port);
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::tests::Duplex;
    use std::io;
    use std::thread;

    /// Hands out at most one byte per read and fails every other call with `Interrupted`.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        interrupt: bool,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.interrupt = !self.interrupt;
            if self.interrupt {
                return Err(ErrorKind::Interrupted.into());
            }
            if self.pos == self.data.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.data[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    #[test]
    fn framed_payload_survives_short_reads() {
        let mut wire = Vec::new();
        send_framed(&mut wire, b"translation").unwrap();
        assert_eq!(&wire[..8], &11u64.to_le_bytes());

        let mut r = Trickle {
            data: wire,
            pos: 0,
            interrupt: false,
        };
        assert_eq!(recv_framed(&mut r).unwrap(), b"translation".to_vec());
    }

    #[test]
    fn oversized_frame_is_rejected_before_allocation() {
        let mut wire = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        wire.extend_from_slice(&[0; 16]);

        let res = recv_framed(&mut io::Cursor::new(wire));
        assert!(matches!(res, Err(Error::Protocol(_))));
    }

    #[test]
    fn closed_peer_is_a_channel_error() {
        let mut buf = [0u8; 4];
        let res = recv_all(&mut io::Cursor::new(vec![1, 2]), &mut buf);
        assert!(matches!(res, Err(Error::ControlChannel { op: "recv", .. })));
    }

    #[test]
    fn barrier_moves_exactly_one_byte() {
        let mut stream = Duplex::new(vec![b'z', b'q']);
        barrier_ping(&mut stream).unwrap();

        assert_eq!(stream.output, vec![BARRIER_BYTE]);
        assert_eq!(stream.input.position(), 1);
    }

    #[test]
    fn barrier_over_loopback() {
        let listener = bind(0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let mut s = accept(&listener).unwrap();
            barrier_ping(&mut s).unwrap();
            let mut rest = Vec::new();
            s.read_to_end(&mut rest).unwrap();
            rest
        });

        let mut c = connect(Ipv4Addr::LOCALHOST, port).unwrap();
        barrier_ping(&mut c).unwrap();
        drop(c);

        assert!(server.join().unwrap().is_empty());
    }
}
