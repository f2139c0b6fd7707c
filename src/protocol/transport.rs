// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The local stream transport. One accept loop; per client one read thread
//! that decodes requests into the dispatcher channel and one write thread
//! that drains that client's event queue. Request order within a client is
//! preserved end to end; events for disconnected clients are discarded.

use std::fmt;
use std::io::BufWriter;
use std::io::Read;
use std::io::Write;
use std::net::Shutdown;
use std::net::SocketAddr;
use std::net::TcpListener;
use std::net::TcpStream;
use std::os::fd::AsFd;
use std::os::unix::net::UnixListener;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use calloop::channel;
use crossbeam_channel::Receiver;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::Sender;
use nix::sys::socket;
use nix::sys::socket::sockopt::RcvBuf;
use nix::sys::socket::sockopt::SndBuf;
use sysctl::Ctl;
use sysctl::Sysctl;

use crate::channel_utils::DiscardingSender;
use crate::prelude::*;
use crate::protocol::ClientId;
use crate::protocol::Event;
use crate::protocol::Request;
use crate::protocol::framing::Framed;
use crate::protocol::framing::MessageType;
use crate::utils;

/// What the transport feeds the dispatcher. `Connected` always precedes the
/// client's first `Request`; `Disconnected` is always last.
pub enum ClientMessage {
    Connected {
        client: ClientId,
        events: EventSender,
    },
    Request {
        client: ClientId,
        request: Request,
    },
    Disconnected {
        client: ClientId,
    },
}

pub type EventSender = DiscardingSender<Sender<Event>>;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Endpoint {
    /// Unix domain socket path. Preferred for local connections.
    Unix { path: PathBuf },
    /// TCP address. Non-loopback addresses are unsafe without an
    /// authenticating layer on top.
    Tcp { addr: SocketAddr },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix { path } => write!(f, "unix://{}", path.display()),
            Endpoint::Tcp { addr } => write!(f, "tcp://{addr}"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Check the URI form first, otherwise `strip_prefix("tcp:")` would
        // accept `tcp://...` and leave a leading `//`.
        if let Some(rest) = s.strip_prefix("tcp://").or(s.strip_prefix("tcp:")) {
            let addr: SocketAddr = rest
                .parse()
                .map_err(|e| anyhow!("invalid tcp endpoint {rest:?}: {e}"))?;
            return Ok(Self::Tcp { addr });
        }

        if let Some(rest) = s.strip_prefix("unix://") {
            // Preserve absolute paths for the common `unix:///abs/path` form.
            let path = if rest.starts_with('/') {
                PathBuf::from(rest)
            } else {
                PathBuf::from(format!("/{rest}"))
            };
            return Ok(Self::Unix { path });
        }

        if let Some(rest) = s.strip_prefix("unix:") {
            return Ok(Self::Unix {
                path: PathBuf::from(rest),
            });
        }

        Ok(Self::Unix {
            path: PathBuf::from(s),
        })
    }
}

impl Endpoint {
    pub fn warn_if_non_loopback(&self) {
        if let Endpoint::Tcp { addr } = self {
            if !addr.ip().is_loopback() {
                warn!(
                    "listening on {addr:?} (non-loopback). This is not recommended without authentication/encryption. Prefer localhost (127.0.0.1/::1)."
                );
            }
        }
    }
}

fn socket_buffer_limits() -> (usize, usize) {
    const DEFAULT_SOCKET_BUFFER: usize = 4 * 1024 * 1024;

    let read_limit = |name: &str| -> Option<usize> {
        let value = Ctl::new(name).and_then(|c| c.value_string()).ok()?;
        value.parse().ok()
    };

    (
        read_limit("net.core.rmem_max").unwrap_or(DEFAULT_SOCKET_BUFFER),
        read_limit("net.core.wmem_max").unwrap_or(DEFAULT_SOCKET_BUFFER),
    )
}

fn enlarge_socket_buffer<F: AsFd>(fd: &F) {
    let (rmem_max, wmem_max) = socket_buffer_limits();

    socket::setsockopt(fd, RcvBuf, &rmem_max)
        .warn(loc!())
        .ok();
    socket::setsockopt(fd, SndBuf, &wmem_max)
        .warn(loc!())
        .ok();
}

trait CloneableStream: Read + Write + Send + 'static {
    fn clone_stream(&self) -> std::io::Result<Self>
    where
        Self: Sized;

    fn shutdown_both(&self) -> std::io::Result<()>;
}

impl CloneableStream for UnixStream {
    fn clone_stream(&self) -> std::io::Result<Self> {
        UnixStream::try_clone(self)
    }

    fn shutdown_both(&self) -> std::io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

impl CloneableStream for TcpStream {
    fn clone_stream(&self) -> std::io::Result<Self> {
        TcpStream::try_clone(self)
    }

    fn shutdown_both(&self) -> std::io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
struct Version(String);

impl Version {
    fn new() -> Self {
        Self(env!("CARGO_PKG_VERSION").to_string())
    }

    fn compare_and_warn(&self, other: &Self) {
        if self != other {
            warn!(
                "server version is {:?}, while client version is {:?}. These versions may be incompatible.",
                self, other
            );
        }
    }
}

impl Framed for Version {
    fn framed_write<W: Write>(&self, stream: &mut W) -> Result<()> {
        self.0.framed_write(stream)
    }

    fn framed_read<R: Read>(stream: &mut R) -> Result<Self> {
        Ok(Self(String::framed_read(stream).location(loc!())?))
    }
}

fn read_loop<R: Read>(
    mut stream: R,
    client: ClientId,
    dispatch_tx: channel::Sender<ClientMessage>,
) -> Result<()> {
    Version::new().compare_and_warn(&Version::framed_read(&mut stream).location(loc!())?);

    loop {
        let message_type = MessageType::framed_read(&mut stream).location(loc!())?;
        ensure!(
            message_type == MessageType::Request,
            "client {client} sent a non-request frame {message_type:?}"
        );

        let payload = rkyv::util::AlignedVec::framed_read(&mut stream).location(loc!())?;
        let request: Request =
            rkyv::from_bytes::<_, rkyv::rancor::Error>(&payload).location(loc!())?;
        trace!("client {client} request: {request:?}");

        dispatch_tx
            .send(ClientMessage::Request { client, request })
            // The error type is not Send + Sync, which anyhow requires.
            .map_err(|e| anyhow!("{e}"))
            .location(loc!())?;
    }
}

fn write_loop<W: Write>(
    stream: W,
    events: Receiver<Event>,
    connected: Arc<AtomicBool>,
) -> Result<()> {
    let (_, wmem_max) = socket_buffer_limits();
    // Match the socket's buffer size.
    let mut stream = BufWriter::with_capacity(wmem_max, stream);

    Version::new().framed_write(&mut stream).location(loc!())?;
    stream.flush().location(loc!())?;

    loop {
        let event = match events.recv_timeout(Duration::from_secs(1)) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                if connected.load(Ordering::Acquire) {
                    continue;
                } else {
                    break;
                }
            },
            Err(RecvTimeoutError::Disconnected) => break,
        };
        trace!("sending event: {event:?}");

        let payload = rkyv::to_bytes::<rkyv::rancor::Error>(&event).location(loc!())?;
        MessageType::Event.framed_write(&mut stream).location(loc!())?;
        payload.framed_write(&mut stream).location(loc!())?;
        stream.flush().location(loc!())?;
    }
    Ok(())
}

static NEXT_CLIENT_ID: AtomicU32 = AtomicU32::new(1);

fn serve_connection<S: CloneableStream>(
    stream: S,
    dispatch_tx: channel::Sender<ClientMessage>,
) -> Result<()> {
    let client = ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed));
    info!("client {client} connected");

    let connected = Arc::new(AtomicBool::new(true));
    let (event_tx, event_rx) = crossbeam_channel::unbounded();

    dispatch_tx
        .send(ClientMessage::Connected {
            client,
            events: DiscardingSender {
                sender: event_tx,
                actually_send: connected.clone(),
            },
        })
        .map_err(|e| anyhow!("{e}"))
        .location(loc!())?;

    let read_stream = stream.clone_stream().location(loc!())?;
    let write_stream = stream.clone_stream().location(loc!())?;

    {
        let connected = connected.clone();
        let dispatch_tx = dispatch_tx.clone();
        thread::spawn(move || {
            let result = read_loop(read_stream, client, dispatch_tx.clone());
            debug!("client {client} read loop finished: {result:?}");
            connected.store(false, Ordering::Release);
            // The usual reason for the read loop terminating is the client
            // closing the socket, but it may have sent bad data. In case that
            // was the issue, shut down the stream to disconnect the client.
            stream.shutdown_both().ok();
            dispatch_tx
                .send(ClientMessage::Disconnected { client })
                .map_err(|e| anyhow!("{e}"))
                .log(loc!())
                .ok();
        });
    }

    thread::spawn(move || {
        let result = write_loop(write_stream, event_rx, connected);
        debug!("client {client} write loop finished: {result:?}");
    });

    Ok(())
}

/// Binds `endpoint` and spawns the accept loop. Decoded requests and
/// connection lifecycle messages arrive on `dispatch_tx` in per-client order.
pub fn spawn_listener(
    endpoint: Endpoint,
    dispatch_tx: channel::Sender<ClientMessage>,
) -> Result<()> {
    endpoint.warn_if_non_loopback();
    info!("listening on {endpoint}");

    match endpoint {
        Endpoint::Unix { path } => {
            let listener = utils::bind_user_socket(path).location(loc!())?;
            enlarge_socket_buffer(&listener);
            thread::spawn(move || {
                loop {
                    let (stream, _) = log_and_continue!(listener.accept().location(loc!()));
                    enlarge_socket_buffer(&stream);
                    log_and_continue!(serve_connection(stream, dispatch_tx.clone()));
                }
            });
        },
        Endpoint::Tcp { addr } => {
            let listener = TcpListener::bind(addr).location(loc!())?;
            enlarge_socket_buffer(&listener);
            thread::spawn(move || {
                loop {
                    let (stream, peer) = log_and_continue!(listener.accept().location(loc!()));
                    debug!("tcp connection from {peer:?}");
                    stream.set_nodelay(true).ok();
                    enlarge_socket_buffer(&stream);
                    log_and_continue!(serve_connection(stream, dispatch_tx.clone()));
                }
            });
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tcp_uri_form() {
        let ep = Endpoint::from_str("tcp://127.0.0.1:1234").unwrap();
        assert_eq!(
            ep,
            Endpoint::Tcp {
                addr: SocketAddr::from(([127, 0, 0, 1], 1234))
            }
        );
    }

    #[test]
    fn parse_tcp_short_form() {
        let ep = Endpoint::from_str("tcp:127.0.0.1:1234").unwrap();
        assert_eq!(
            ep,
            Endpoint::Tcp {
                addr: SocketAddr::from(([127, 0, 0, 1], 1234))
            }
        );
    }

    #[test]
    fn parse_unix_uri_form() {
        let ep = Endpoint::from_str("unix:///tmp/prism.sock").unwrap();
        assert_eq!(
            ep,
            Endpoint::Unix {
                path: PathBuf::from("/tmp/prism.sock")
            }
        );
    }

    #[test]
    fn bare_path_is_a_unix_endpoint() {
        let ep = Endpoint::from_str("/run/user/1000/prism.sock").unwrap();
        assert_eq!(
            ep,
            Endpoint::Unix {
                path: PathBuf::from("/run/user/1000/prism.sock")
            }
        );
    }

    #[test]
    fn invalid_tcp_address_is_an_error() {
        assert!(Endpoint::from_str("tcp://not-an-address").is_err());
    }

    #[test]
    fn endpoint_display_roundtrips() {
        let ep = Endpoint::from_str("tcp://127.0.0.1:1234").unwrap();
        assert_eq!(ep.to_string(), "tcp://127.0.0.1:1234");
        let ep = Endpoint::from_str("unix:/tmp/prism.sock").unwrap();
        assert_eq!(ep.to_string(), "unix:///tmp/prism.sock");
    }
}
