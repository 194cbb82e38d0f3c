use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::channel::{next_channel_id, Channel};
use crate::error::{Context, Result};
use crate::util::{spawn_thread, ShutdownToken};

const LT: &str = "bsg::session";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Starting,
    Accepting,
    Stopping,
}

#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub endpoint: SocketAddr,
    pub connection_limit: usize,
    pub queue_depth: usize,
}

struct Shared {
    state: Mutex<SessionState>,
    channels: Mutex<HashMap<u64, Arc<Channel>>>,
    drained: Condvar,
}

/// Per-endpoint TCP acceptor for the stream protocols (electrum, stratum).
/// Owns the listener and the map of live channels; admission applies the
/// inbound connection limit, everything past that is the attached
/// protocol's business.
pub struct Session {
    name: &'static str,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
}

impl Session {
    /// Bind and start accepting. `serve` runs on a dedicated thread per
    /// connection with the read half of the socket; the session retains the
    /// channel until `serve` returns.
    pub fn start<F>(
        name: &'static str,
        options: SessionOptions,
        shutdown: ShutdownToken,
        serve: F,
    ) -> Result<Session>
    where
        F: Fn(Arc<Channel>, TcpStream) + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState::Starting),
            channels: Mutex::new(HashMap::new()),
            drained: Condvar::new(),
        });

        let listener = TcpListener::bind(options.endpoint)
            .with_context(|| format!("bind({}) failed", options.endpoint))?;
        let local_addr = listener.local_addr()?;
        info!(target: LT, "{} listening on {}", name, local_addr);

        *shared.state.lock().unwrap() = SessionState::Accepting;

        let serve = Arc::new(serve);
        let accept_shared = Arc::clone(&shared);
        spawn_thread(&format!("{}-acceptor", name), move || loop {
            let (stream, peer_addr) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) => {
                    if shutdown.is_signaled() {
                        trace!(target: LT, "{} acceptor shutting down", name);
                    } else {
                        warn!(target: LT, "{} accept failed: {}", name, e);
                    }
                    return;
                }
            };
            if shutdown.is_signaled()
                || *accept_shared.state.lock().unwrap() != SessionState::Accepting
            {
                return;
            }

            let channel_count = accept_shared.channels.lock().unwrap().len();
            if channel_count >= options.connection_limit {
                warn!(
                    target: LT,
                    "{} refusing {}: connection pool filled ({})",
                    name, peer_addr, channel_count
                );
                drop(stream);
                continue;
            }

            let read_stream = match stream.try_clone() {
                Ok(clone) => clone,
                Err(e) => {
                    warn!(target: LT, "{} clone failed for {}: {}", name, peer_addr, e);
                    continue;
                }
            };

            let channel = Arc::new(Channel::new(
                next_channel_id(),
                stream,
                peer_addr,
                options.queue_depth,
            ));
            let channel_id = channel.id();
            accept_shared
                .channels
                .lock()
                .unwrap()
                .insert(channel_id, Arc::clone(&channel));

            let peer_shared = Arc::clone(&accept_shared);
            let peer_serve = Arc::clone(&serve);
            spawn_thread(&format!("{}-peer", name), move || {
                info!(target: LT, "[{}] connected peer", peer_addr);
                (*peer_serve)(Arc::clone(&channel), read_stream);
                channel.close();
                info!(target: LT, "[{}] disconnected peer", peer_addr);
                let mut channels = peer_shared.channels.lock().unwrap();
                channels.remove(&channel_id);
                if channels.is_empty() {
                    peer_shared.drained.notify_all();
                }
            });
        });

        Ok(Session {
            name,
            local_addr,
            shared,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock().unwrap()
    }

    pub fn channel_count(&self) -> usize {
        self.shared.channels.lock().unwrap().len()
    }

    pub fn channel(&self, id: u64) -> Option<Arc<Channel>> {
        self.shared.channels.lock().unwrap().get(&id).cloned()
    }

    /// Stop accepting, close every live channel and wait for the peers to
    /// unwind.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if *state != SessionState::Accepting {
                return;
            }
            *state = SessionState::Stopping;
        }

        // one throwaway connection makes the blocking acceptor notice
        let _ = TcpStream::connect_timeout(&self.local_addr, Duration::from_millis(200));

        let live: Vec<Arc<Channel>> = self.shared.channels.lock().unwrap().values().cloned().collect();
        trace!(target: LT, "{} closing {} channel(s)", self.name, live.len());
        for channel in live {
            channel.close();
        }

        let mut channels = self.shared.channels.lock().unwrap();
        while !channels.is_empty() {
            let (next, timeout) = self
                .shared
                .drained
                .wait_timeout(channels, Duration::from_secs(5))
                .unwrap();
            channels = next;
            if timeout.timed_out() {
                warn!(
                    target: LT,
                    "{} stopped with {} channel(s) still draining",
                    self.name,
                    channels.len()
                );
                break;
            }
        }
        drop(channels);

        *self.shared.state.lock().unwrap() = SessionState::Stopped;
        info!(target: LT, "{} stopped", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};

    fn options() -> SessionOptions {
        SessionOptions {
            endpoint: "127.0.0.1:0".parse().unwrap(),
            connection_limit: 2,
            queue_depth: 8,
        }
    }

    fn echo_session(limit: usize) -> Session {
        let mut options = options();
        options.connection_limit = limit;
        Session::start("echo", options, ShutdownToken::new(), |channel, stream| {
            let mut reader = BufReader::new(stream);
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {
                        if channel.send(line.into_bytes()).is_err() {
                            return;
                        }
                    }
                }
            }
        })
        .unwrap()
    }

    #[test]
    fn serves_connections_and_tracks_channels() {
        let session = echo_session(2);
        assert_eq!(session.state(), SessionState::Accepting);

        let mut client = TcpStream::connect(session.local_addr()).unwrap();
        client.write_all(b"ping\n").unwrap();
        let mut reader = BufReader::new(client.try_clone().unwrap());
        let mut reply = String::new();
        reader.read_line(&mut reply).unwrap();
        assert_eq!(reply, "ping\n");
        assert_eq!(session.channel_count(), 1);

        drop(client);
        drop(reader);
        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.channel_count(), 0);
    }

    #[test]
    fn connection_limit_refuses_extra_peers() {
        let session = echo_session(1);

        let mut first = TcpStream::connect(session.local_addr()).unwrap();
        first.write_all(b"a\n").unwrap();
        let mut reader = BufReader::new(first.try_clone().unwrap());
        let mut reply = String::new();
        reader.read_line(&mut reply).unwrap();
        assert_eq!(session.channel_count(), 1);

        // the second connection is accepted by the OS but dropped by admission
        let second = TcpStream::connect(session.local_addr()).unwrap();
        let mut second_reader = BufReader::new(second);
        let mut buffer = String::new();
        // peer close shows up as EOF
        assert_eq!(second_reader.read_line(&mut buffer).unwrap_or(0), 0);

        session.stop();
    }
}
