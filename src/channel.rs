use std::io::{BufRead, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Mutex;

use crate::error::GatewayError;
use crate::util::spawn_thread;

const LT: &str = "bsg::channel";

/// Inbound line frames are capped at 1 MiB (electrum/stratum).
pub const LINE_LIMIT: usize = 1024 * 1024;

/// Outbound frames queued per channel before overflow.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Channel lifecycle. Transitions are linear and monotonic; the only jump
/// allowed is a failed handshake straight to `Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChannelState {
    Opening,
    Handshaking,
    Ready,
    Draining,
    Closed,
}

enum Frame {
    Data(Vec<u8>),
    Close,
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_channel_id() -> u64 {
    NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)
}

/// Owns one TCP transport. All writes are appended to a bounded queue
/// drained by a dedicated writer thread (the write half of the channel's
/// strand); reads happen on the owning connection thread. A filled queue
/// moves the channel to `Draining` and reports `channel_overflow` instead
/// of blocking the caller.
pub struct Channel {
    id: u64,
    addr: SocketAddr,
    state: Mutex<ChannelState>,
    writer_tx: SyncSender<Frame>,
    stream: TcpStream,
}

impl Channel {
    pub fn new(id: u64, stream: TcpStream, addr: SocketAddr, queue_depth: usize) -> Self {
        let (writer_tx, writer_rx) = sync_channel(queue_depth);
        let write_stream = stream.try_clone().expect("failed to clone TcpStream");
        spawn_thread(&format!("writer-{}", id), move || {
            Channel::write_loop(write_stream, writer_rx)
        });
        Channel {
            id,
            addr,
            state: Mutex::new(ChannelState::Opening),
            writer_tx,
            stream,
        }
    }

    fn write_loop(mut stream: TcpStream, frames: Receiver<Frame>) {
        while let Ok(frame) = frames.recv() {
            match frame {
                Frame::Data(bytes) => {
                    if let Err(e) = stream.write_all(&bytes) {
                        trace!(target: LT, "write failed: {}", e);
                        let _ = stream.shutdown(Shutdown::Both);
                        break;
                    }
                }
                Frame::Close => break,
            }
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock().unwrap()
    }

    /// Forward-only state transition; anything else is refused.
    pub fn transition(&self, next: ChannelState) -> bool {
        let mut state = self.state.lock().unwrap();
        if next > *state {
            trace!(target: LT, "[{}] {:?} -> {:?}", self.id, *state, next);
            *state = next;
            true
        } else {
            false
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() < ChannelState::Draining
    }

    /// Queue one outbound frame.
    pub fn send(&self, bytes: Vec<u8>) -> Result<(), GatewayError> {
        match self.state() {
            ChannelState::Draining | ChannelState::Closed => {
                return Err(GatewayError::ChannelStopped)
            }
            _ => (),
        }
        match self.writer_tx.try_send(Frame::Data(bytes)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.transition(ChannelState::Draining);
                Err(GatewayError::ChannelOverflow)
            }
            Err(TrySendError::Disconnected(_)) => {
                self.transition(ChannelState::Closed);
                Err(GatewayError::ChannelStopped)
            }
        }
    }

    pub fn send_line(&self, mut line: String) -> Result<(), GatewayError> {
        line.push('\n');
        self.send(line.into_bytes())
    }

    /// Idempotent close: drains the writer, shuts the socket down and moves
    /// to `Closed`. Subsequent sends fail with `channel_stopped`.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == ChannelState::Closed {
                return;
            }
            *state = ChannelState::Closed;
        }
        let _ = self.writer_tx.try_send(Frame::Close);
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read one newline-terminated UTF-8 frame, refusing oversized or invalid
/// input with `bad_stream`. `Ok(None)` is a clean EOF.
pub fn read_line_capped(
    reader: &mut impl BufRead,
    limit: usize,
) -> Result<Option<String>, GatewayError> {
    let mut line = Vec::new();
    loop {
        let available = match reader.fill_buf() {
            Ok(buffer) => buffer,
            Err(_) => return Err(GatewayError::ChannelStopped),
        };
        if available.is_empty() {
            return if line.is_empty() {
                Ok(None)
            } else {
                // EOF mid-line
                Err(GatewayError::BadStream)
            };
        }

        let (consumed, done) = match available.iter().position(|b| *b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };
        if line.len() + consumed > limit {
            return Err(GatewayError::BadStream);
        }
        line.extend_from_slice(&available[..consumed]);
        reader.consume(consumed);

        if done {
            line.pop(); // the newline
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return String::from_utf8(line).map(Some).map_err(|_| GatewayError::BadStream);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;
    use std::net::TcpListener;

    fn channel_pair() -> (Channel, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();
        (Channel::new(next_channel_id(), server, peer, 4), client)
    }

    #[test]
    fn states_are_monotonic() {
        let (channel, _peer) = channel_pair();
        assert_eq!(channel.state(), ChannelState::Opening);
        assert!(channel.transition(ChannelState::Handshaking));
        assert!(channel.transition(ChannelState::Ready));
        assert!(!channel.transition(ChannelState::Opening));
        assert!(channel.transition(ChannelState::Closed));
        assert!(!channel.transition(ChannelState::Draining));
    }

    #[test]
    fn failed_handshake_may_jump_to_closed() {
        let (channel, _peer) = channel_pair();
        assert!(channel.transition(ChannelState::Handshaking));
        assert!(channel.transition(ChannelState::Closed));
    }

    #[test]
    fn writes_reach_the_peer() {
        let (channel, peer) = channel_pair();
        channel.transition(ChannelState::Ready);
        channel.send_line("hello".into()).unwrap();

        let mut reader = BufReader::new(peer);
        let line = read_line_capped(&mut reader, LINE_LIMIT).unwrap();
        assert_eq!(line.as_deref(), Some("hello"));
    }

    #[test]
    fn close_is_idempotent_and_rejects_writes() {
        let (channel, _peer) = channel_pair();
        channel.close();
        channel.close();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(
            channel.send(b"data".to_vec()).unwrap_err(),
            GatewayError::ChannelStopped
        );
    }

    #[test]
    fn line_framing_enforces_the_cap() {
        let mut oversized = vec![b'a'; 64];
        oversized.push(b'\n');
        let mut reader = BufReader::new(&oversized[..]);
        assert_eq!(
            read_line_capped(&mut reader, 16).unwrap_err(),
            GatewayError::BadStream
        );

        let mut good = BufReader::new(&b"ok\r\nrest"[..]);
        assert_eq!(read_line_capped(&mut good, 16).unwrap().as_deref(), Some("ok"));

        let mut empty = BufReader::new(&b""[..]);
        assert_eq!(read_line_capped(&mut empty, 16).unwrap(), None);
    }

    #[test]
    fn invalid_utf8_is_bad_stream() {
        let mut reader = BufReader::new(&[0xff, 0xfe, b'\n'][..]);
        assert_eq!(
            read_line_capped(&mut reader, 16).unwrap_err(),
            GatewayError::BadStream
        );
    }
}
