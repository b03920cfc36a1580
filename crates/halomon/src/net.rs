//! Framed TCP client for the optimization server.
//!
//! The socket is non-blocking and owned by the monitor thread. Receives
//! are pure polls: bytes accumulate in a buffer until a complete frame is
//! present. Sends are bounded waits: a full socket buffer is waited on
//! with `poll(2)` up to a hard cap, after which the connection is
//! considered dead. The agent never blocks indefinitely on the server.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use log::{debug, info};

use halo_wire::{FrameHeader, MessageKind, FRAME_HEADER_LEN};

use crate::error::{HaloError, Result};

/// Cap on the cumulative wait for socket writability in one send.
const SEND_TIMEOUT_MS: u64 = 5_000;

/// Connected, framed channel to the server.
pub struct Client {
    stream: TcpStream,
    recv_buf: Vec<u8>,
}

impl Client {
    /// Connect, retrying `attempts` times with `delay` between tries.
    /// The server may simply not be up yet when the application starts.
    pub fn connect_with_retries(addr: &str, attempts: u32, delay: Duration) -> Result<Self> {
        let mut last_err: Option<std::io::Error> = None;
        for attempt in 0..attempts {
            match Self::connect(addr) {
                Ok(client) => {
                    info!("client: connected to {addr} (attempt {})", attempt + 1);
                    return Ok(client);
                }
                Err(HaloError::Connection(e)) => last_err = Some(e),
                Err(other) => return Err(other),
            }
            std::thread::sleep(delay);
        }
        Err(HaloError::Connection(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("no address for {addr}"))
        })))
    }

    /// Single connection attempt.
    pub fn connect(addr: &str) -> Result<Self> {
        let mut addrs = addr
            .to_socket_addrs()
            .map_err(HaloError::Connection)?;
        let sock_addr = addrs.next().ok_or_else(|| {
            HaloError::Connection(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address for {addr}"),
            ))
        })?;
        let stream = TcpStream::connect(sock_addr).map_err(HaloError::Connection)?;
        stream.set_nodelay(true).map_err(HaloError::Connection)?;
        stream
            .set_nonblocking(true)
            .map_err(HaloError::Connection)?;
        Ok(Client {
            stream,
            recv_buf: Vec::new(),
        })
    }

    /// Send one framed message, waiting (bounded) for writability as
    /// needed.
    pub fn send(&mut self, kind: MessageKind, body: &[u8]) -> Result<()> {
        let header = FrameHeader {
            kind: kind.as_u32(),
            body_len: body.len() as u32,
        };
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(body);

        let mut written = 0;
        let mut waited_ms: u64 = 0;
        while written < frame.len() {
            match self.stream.write(&frame[written..]) {
                Ok(0) => {
                    return Err(HaloError::Connection(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "server closed the stream",
                    )));
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if waited_ms >= SEND_TIMEOUT_MS {
                        return Err(HaloError::Connection(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "send stalled beyond the write timeout",
                        )));
                    }
                    self.wait_writable(100)?;
                    waited_ms += 100;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(HaloError::Connection(e)),
            }
        }
        Ok(())
    }

    /// Non-blocking poll for one complete inbound frame.
    ///
    /// Returns `Ok(None)` when no full frame has arrived yet. A closed
    /// stream is a connection error; the server session treats its side
    /// of a close as disconnect, and so do we.
    pub fn poll_message(&mut self) -> Result<Option<(MessageKind, Vec<u8>)>> {
        self.fill_recv_buf()?;

        if self.recv_buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let mut header_bytes = [0u8; FRAME_HEADER_LEN];
        header_bytes.copy_from_slice(&self.recv_buf[..FRAME_HEADER_LEN]);
        let header = FrameHeader::from_bytes(&header_bytes)?;

        let total = FRAME_HEADER_LEN + header.body_len as usize;
        if self.recv_buf.len() < total {
            return Ok(None);
        }

        let body = self.recv_buf[FRAME_HEADER_LEN..total].to_vec();
        self.recv_buf.drain(..total);

        let kind = MessageKind::from_u32(header.kind);
        debug!("client: received {:?} ({} bytes)", kind, body.len());
        Ok(Some((kind, body)))
    }

    fn fill_recv_buf(&mut self) -> Result<()> {
        let mut chunk = [0u8; 16 * 1024];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(HaloError::Connection(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "server closed the stream",
                    )));
                }
                Ok(n) => self.recv_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(HaloError::Connection(e)),
            }
        }
    }

    fn wait_writable(&self, timeout_ms: i32) -> Result<()> {
        let mut pfd = libc::pollfd {
            fd: self.stream.as_raw_fd(),
            events: libc::POLLOUT,
            revents: 0,
        };
        // Safety: pollfd is a local out-param.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(HaloError::Connection(err));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn pair() -> (Client, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = Client::connect(&addr.to_string()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn read_frame(server: &mut TcpStream) -> (u32, Vec<u8>) {
        let mut header = [0u8; FRAME_HEADER_LEN];
        server.read_exact(&mut header).unwrap();
        let parsed = FrameHeader::from_bytes(&header).unwrap();
        let mut body = vec![0u8; parsed.body_len as usize];
        server.read_exact(&mut body).unwrap();
        (parsed.kind, body)
    }

    #[test]
    fn send_produces_a_well_formed_frame() {
        let (mut client, mut server) = pair();
        client
            .send(MessageKind::SetSamplingPeriod, &[1, 2, 3, 4])
            .unwrap();

        let (kind, body) = read_frame(&mut server);
        assert_eq!(kind, MessageKind::SetSamplingPeriod.as_u32());
        assert_eq!(body, vec![1, 2, 3, 4]);
    }

    #[test]
    fn empty_body_frame() {
        let (mut client, mut server) = pair();
        client.send(MessageKind::StartSampling, &[]).unwrap();
        let (kind, body) = read_frame(&mut server);
        assert_eq!(kind, MessageKind::StartSampling.as_u32());
        assert!(body.is_empty());
    }

    #[test]
    fn poll_reassembles_partial_frames() {
        let (mut client, mut server) = pair();

        let header = FrameHeader {
            kind: MessageKind::Shutdown.as_u32(),
            body_len: 4,
        }
        .to_bytes();

        // Nothing yet.
        assert!(client.poll_message().unwrap().is_none());

        // Header split across two writes, then the body.
        server.write_all(&header[..5]).unwrap();
        server.flush().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(client.poll_message().unwrap().is_none());

        server.write_all(&header[5..]).unwrap();
        server.write_all(&[9, 9, 9, 9]).unwrap();
        server.flush().unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let (kind, body) = client.poll_message().unwrap().unwrap();
        assert_eq!(kind, MessageKind::Shutdown);
        assert_eq!(body, vec![9, 9, 9, 9]);
    }

    #[test]
    fn poll_returns_queued_messages_in_order() {
        let (mut client, mut server) = pair();

        for kind in [MessageKind::StartSampling, MessageKind::StopSampling] {
            let header = FrameHeader {
                kind: kind.as_u32(),
                body_len: 0,
            };
            server.write_all(&header.to_bytes()).unwrap();
        }
        server.flush().unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let (first, _) = client.poll_message().unwrap().unwrap();
        let (second, _) = client.poll_message().unwrap().unwrap();
        assert_eq!(first, MessageKind::StartSampling);
        assert_eq!(second, MessageKind::StopSampling);
        assert!(client.poll_message().unwrap().is_none());
    }

    #[test]
    fn closed_stream_is_a_connection_error() {
        let (mut client, server) = pair();
        drop(server);
        std::thread::sleep(Duration::from_millis(20));
        assert!(matches!(
            client.poll_message(),
            Err(HaloError::Connection(_))
        ));
    }

    #[test]
    fn connect_failure_after_retries() {
        // A port from the ephemeral range with no listener.
        let err = Client::connect_with_retries(
            "127.0.0.1:1",
            2,
            Duration::from_millis(10),
        );
        assert!(matches!(err, Err(HaloError::Connection(_))));
    }
}
