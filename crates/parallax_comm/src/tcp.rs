use crate::transport::Transport;
use crossbeam::channel::{self, Receiver, Sender};
use parallax_core::error::{Error, Result};
use std::{
    io::{self, ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    thread,
    time::Duration,
};

const MAX_FRAME: usize = 1 << 30;

/// An io failure and whether part of the frame had already crossed the
/// socket. After a partial frame the byte stream is out of step with the
/// framing and the link cannot be reused.
#[derive(Debug)]
struct FrameError {
    error: io::Error,
    partial: bool,
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        Error::Transport(e.error.to_string())
    }
}

fn write_frame<W: Write>(stream: &mut W, frame: &[u8]) -> std::result::Result<(), FrameError> {
    let len = u32::try_from(frame.len()).map_err(|_| FrameError {
        error: io::Error::new(ErrorKind::InvalidInput, "frame too large"),
        partial: false,
    })?;
    let mut bytes = Vec::with_capacity(4 + frame.len());
    bytes.extend_from_slice(&len.to_le_bytes());
    bytes.extend_from_slice(frame);

    let mut written = 0;
    while written < bytes.len() {
        match stream.write(&bytes[written..]) {
            Ok(0) => {
                return Err(FrameError {
                    error: ErrorKind::WriteZero.into(),
                    partial: written > 0,
                })
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(error) => {
                return Err(FrameError {
                    error,
                    partial: written > 0,
                })
            }
        }
    }
    stream.flush().map_err(|error| FrameError { error, partial: true })
}

fn read_frame<R: Read>(stream: &mut R) -> std::result::Result<Vec<u8>, FrameError> {
    let mut len = [0u8; 4];
    let consumed = fill(stream, &mut len, 0)?;
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_FRAME {
        return Err(FrameError {
            error: io::Error::new(ErrorKind::InvalidData, format!("frame of {} bytes exceeds limit", len)),
            partial: true,
        });
    }
    let mut buf = vec![0u8; len];
    fill(stream, &mut buf, consumed)?;
    Ok(buf)
}

/// Fills `buf`; `before` counts bytes of the current frame already consumed.
fn fill<R: Read>(stream: &mut R, buf: &mut [u8], before: usize) -> std::result::Result<usize, FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(FrameError {
                    error: ErrorKind::UnexpectedEof.into(),
                    partial: before + filled > 0,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(error) => {
                return Err(FrameError {
                    error,
                    partial: before + filled > 0,
                })
            }
        }
    }
    Ok(before + filled)
}

struct Peer {
    writer: Mutex<TcpStream>,
    reader: Mutex<TcpStream>,
    // unlocked handle so shutdown never waits behind a blocked read or write
    control: TcpStream,
    // set once a frame was cut short in either direction
    broken: AtomicBool,
}

/// Length-prefixed frames over one TCP connection per peer pair.
///
/// Rank `r` dials every lower rank and accepts a connection from every higher
/// one; each side introduces itself with its rank as the first frame.
pub struct TcpTransport {
    rank: usize,
    world_size: usize,
    peers: Vec<Option<Peer>>,
    loopback: (Sender<Vec<u8>>, Receiver<Vec<u8>>),
    closed: AtomicBool,
}

impl TcpTransport {
    /// Binds `addrs[rank]` and connects to every other address.
    pub fn connect(rank: usize, addrs: &[SocketAddr], attempts: u32, backoff: Duration) -> Result<Self> {
        let addr = addrs
            .get(rank)
            .ok_or_else(|| Error::Config(format!("no address for rank {} ({} given)", rank, addrs.len())))?;
        let listener = TcpListener::bind(addr).map_err(|e| Error::Transport(format!("bind {}: {}", addr, e)))?;
        Self::from_listener(rank, listener, addrs, attempts, backoff)
    }

    /// Same as [`connect`](Self::connect) with an already bound listener.
    pub fn from_listener(
        rank: usize,
        listener: TcpListener,
        addrs: &[SocketAddr],
        attempts: u32,
        backoff: Duration,
    ) -> Result<Self> {
        let world_size = addrs.len();
        if rank >= world_size {
            return Err(Error::Config(format!("rank {} outside world of {}", rank, world_size)));
        }
        let mut streams: Vec<Option<TcpStream>> = (0..world_size).map(|_| None).collect();

        for (peer, addr) in addrs.iter().enumerate().take(rank) {
            let mut stream = dial(addr, attempts, backoff)?;
            write_frame(&mut stream, &(rank as u32).to_le_bytes())?;
            log::debug!("rank {} connected to rank {} at {}", rank, peer, addr);
            streams[peer] = Some(stream);
        }

        for _ in rank + 1..world_size {
            let (mut stream, from) = listener.accept()?;
            let hello = read_frame(&mut stream)?;
            let peer = <[u8; 4]>::try_from(hello.as_slice())
                .map(|b| u32::from_le_bytes(b) as usize)
                .map_err(|_| Error::Transport(format!("malformed handshake from {}", from)))?;
            if peer <= rank || peer >= world_size || streams[peer].is_some() {
                return Err(Error::Transport(format!("unexpected handshake from rank {} at {}", peer, from)));
            }
            log::debug!("rank {} accepted rank {} from {}", rank, peer, from);
            streams[peer] = Some(stream);
        }

        let peers = streams
            .into_iter()
            .map(|s| {
                s.map(|stream| -> Result<Peer> {
                    stream.set_nodelay(true)?;
                    let reader = stream.try_clone()?;
                    let control = stream.try_clone()?;
                    Ok(Peer {
                        writer: Mutex::new(stream),
                        reader: Mutex::new(reader),
                        control,
                        broken: AtomicBool::new(false),
                    })
                })
                .transpose()
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            rank,
            world_size,
            peers,
            loopback: channel::unbounded(),
            closed: AtomicBool::new(false),
        })
    }

    fn peer(&self, rank: usize) -> Result<&Peer> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Aborted(format!("rank {} transport is shut down", self.rank)));
        }
        let peer = self
            .peers
            .get(rank)
            .and_then(|p| p.as_ref())
            .ok_or_else(|| Error::InvalidArgument(format!("rank {} outside world of {}", rank, self.world_size)))?;
        if peer.broken.load(Ordering::Acquire) {
            return Err(self.broken_link(rank));
        }
        Ok(peer)
    }

    fn broken_link(&self, peer: usize) -> Error {
        Error::Aborted(format!("rank {} <-> rank {}: link lost frame sync", self.rank, peer))
    }

    /// Only failures that left the framing intact may be retried.
    fn frame_error(&self, rank: usize, peer: &Peer, e: FrameError) -> Error {
        if self.closed.load(Ordering::Acquire) {
            Error::Aborted(format!("rank {} transport is shut down", self.rank))
        } else if e.partial {
            log::error!("rank {} <-> rank {}: frame cut short: {}", self.rank, rank, e.error);
            peer.broken.store(true, Ordering::Release);
            let _ = peer.control.shutdown(Shutdown::Both);
            self.broken_link(rank)
        } else {
            Error::Transport(format!("rank {} <-> rank {}: {}", self.rank, rank, e.error))
        }
    }
}

fn dial(addr: &SocketAddr, attempts: u32, backoff: Duration) -> Result<TcpStream> {
    let mut last = None;
    for attempt in 0..attempts.max(1) {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                log::debug!("connect {} failed (attempt {}): {}", addr, attempt + 1, e);
                last = Some(e);
                thread::sleep(backoff);
            }
        }
    }
    Err(Error::Transport(format!(
        "could not reach {}: {}",
        addr,
        last.map(|e| e.to_string()).unwrap_or_default()
    )))
}

impl Transport for TcpTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn send(&self, dst: usize, frame: Vec<u8>) -> Result<()> {
        if dst == self.rank {
            return self
                .loopback
                .0
                .send(frame)
                .map_err(|_| Error::Aborted("loopback closed".into()));
        }
        let peer = self.peer(dst)?;
        let mut stream = peer.writer.lock().map_err(|_| Error::Lock)?;
        write_frame(&mut *stream, &frame).map_err(|e| self.frame_error(dst, peer, e))
    }

    fn recv(&self, src: usize) -> Result<Vec<u8>> {
        if src == self.rank {
            return self
                .loopback
                .1
                .recv()
                .map_err(|_| Error::Aborted("loopback closed".into()));
        }
        let peer = self.peer(src)?;
        let mut stream = peer.reader.lock().map_err(|_| Error::Lock)?;
        read_frame(&mut *stream).map_err(|e| self.frame_error(src, peer, e))
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for peer in self.peers.iter().flatten() {
            let _ = peer.control.shutdown(Shutdown::Both);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Accepts `limit` bytes, then fails.
    struct ShortWriter {
        limit: usize,
        written: Vec<u8>,
    }

    impl Write for ShortWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let room = self.limit - self.written.len();
            if room == 0 {
                return Err(ErrorKind::ConnectionReset.into());
            }
            let n = room.min(buf.len());
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn frames_report_partial_progress() {
        let mut untouched = ShortWriter { limit: 0, written: Vec::new() };
        assert!(!write_frame(&mut untouched, &[1, 2, 3]).unwrap_err().partial);

        let mut cut = ShortWriter { limit: 5, written: Vec::new() };
        assert!(write_frame(&mut cut, &[1, 2, 3]).unwrap_err().partial);

        let mut whole = ShortWriter { limit: 7, written: Vec::new() };
        write_frame(&mut whole, &[1, 2, 3]).unwrap();
        assert_eq!(read_frame(&mut Cursor::new(whole.written.clone())).unwrap(), vec![1, 2, 3]);

        assert!(!read_frame(&mut Cursor::new(Vec::new())).unwrap_err().partial);
        assert!(read_frame(&mut Cursor::new(whole.written[..2].to_vec())).unwrap_err().partial);
        assert!(read_frame(&mut Cursor::new(whole.written[..6].to_vec())).unwrap_err().partial);
    }

    #[test]
    fn truncated_frame_breaks_the_link() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;

        // rank 1 introduces itself, then dies halfway through a frame
        let mut raw = TcpStream::connect(addr)?;
        write_frame(&mut raw, &1u32.to_le_bytes())?;
        raw.write_all(&100u32.to_le_bytes())?;
        raw.write_all(&[0u8; 10])?;
        drop(raw);

        let transport = TcpTransport::from_listener(0, listener, &[addr, addr], 1, Duration::ZERO)?;
        assert!(matches!(transport.recv(1), Err(Error::Aborted(_))));
        assert!(matches!(transport.recv(1), Err(Error::Aborted(_))));
        assert!(matches!(transport.send(1, vec![1]), Err(Error::Aborted(_))));
        Ok(())
    }
}
