//! Transport session
//!
//! This module owns the socket to the server: connecting with an optional
//! timeout, framing messages into blocks and reading responses under the
//! configured read timeout. Authentication lives in [`crate::auth`].

use std::fmt;
use std::io;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use log::{debug, trace, warn};
use mapi_core::error::{timeout_error, MapiError, Result};
use mapi_core::protocol::{decode_response, BlockCodec, ResponseMessage};
use mapi_core::ConnectionParams;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use crate::auth;

/// Byte stream a transport can run over
pub trait MapiStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> MapiStream for T {}

/// Transport state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    /// Socket open, handshake not finished
    Connected,

    /// Logged in and ready for statements
    Ready,

    /// Closed
    Closed,
}

/// Transport statistics
#[derive(Debug, Clone)]
pub struct TransportStats {
    /// Number of messages sent
    pub messages_sent: usize,

    /// Number of messages received
    pub messages_received: usize,

    /// Payload bytes sent
    pub bytes_sent: usize,

    /// Payload bytes received
    pub bytes_received: usize,

    /// Connection start time
    pub start_time: Instant,

    /// Last activity time
    pub last_activity: Instant,
}

impl Default for TransportStats {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            messages_sent: 0,
            messages_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            start_time: now,
            last_activity: now,
        }
    }
}

/// Framed connection to a MAPI server
pub struct Transport {
    framed: Framed<Box<dyn MapiStream>, BlockCodec>,
    peer: String,
    read_timeout: Option<Duration>,
    state: TransportState,
    stats: TransportStats,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish()
    }
}

impl Transport {
    /// Connect and log in
    ///
    /// Follows redirects issued during the handshake; the returned transport
    /// is ready for statements.
    pub async fn connect(params: &ConnectionParams) -> Result<Self> {
        let transport = Self::open(params).await?;
        auth::authenticate(transport, params).await
    }

    /// Open a TCP connection without logging in
    pub async fn open(params: &ConnectionParams) -> Result<Self> {
        let address = params.address();
        debug!("Connecting to {}", address);

        let stream = match params.connect_timeout() {
            Some(limit) => timeout(limit, TcpStream::connect(&address))
                .await
                .map_err(|_| timeout_error("connect"))??,
            None => TcpStream::connect(&address).await?,
        };
        stream.set_nodelay(true)?;

        Ok(Self::from_stream(stream, &address, params.read_timeout()))
    }

    /// Wrap an already connected stream
    pub fn from_stream<S: MapiStream + 'static>(
        stream: S,
        peer: &str,
        read_timeout: Option<Duration>,
    ) -> Self {
        let stream: Box<dyn MapiStream> = Box::new(stream);
        Self {
            framed: Framed::new(stream, BlockCodec::new()),
            peer: peer.to_string(),
            read_timeout,
            state: TransportState::Connected,
            stats: TransportStats::default(),
        }
    }

    /// Send one message
    pub async fn send(&mut self, payload: Bytes) -> Result<()> {
        if self.state == TransportState::Closed {
            return Err(MapiError::ConnectionClosed);
        }

        trace!("-> {} {:?}", self.peer, String::from_utf8_lossy(&payload));
        let len = payload.len();
        self.framed.send(payload).await?;

        self.stats.messages_sent += 1;
        self.stats.bytes_sent += len;
        self.stats.last_activity = Instant::now();
        Ok(())
    }

    /// Receive one complete message
    pub async fn recv(&mut self) -> Result<Bytes> {
        if self.state == TransportState::Closed {
            return Err(MapiError::ConnectionClosed);
        }

        let next = match self.read_timeout {
            Some(limit) => match timeout(limit, self.framed.next()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!("Timed out waiting for {}", self.peer);
                    return Err(timeout_error("read"));
                }
            },
            None => self.framed.next().await,
        };

        let payload = match next {
            Some(payload) => payload?,
            None => {
                return Err(MapiError::Network(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("server {} closed the connection", self.peer),
                )))
            }
        };

        trace!("<- {} {:?}", self.peer, String::from_utf8_lossy(&payload));
        self.stats.messages_received += 1;
        self.stats.bytes_received += payload.len();
        self.stats.last_activity = Instant::now();
        Ok(payload)
    }

    /// Send a message and decode the response to it
    pub async fn request(&mut self, payload: Bytes) -> Result<Vec<ResponseMessage>> {
        self.send(payload).await?;
        let response = self.recv().await?;
        decode_response(&response)
    }

    /// Shut the connection down. Calling this again has no effect.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == TransportState::Closed {
            return Ok(());
        }
        self.state = TransportState::Closed;
        debug!("Closing connection to {}", self.peer);
        self.framed.close().await
    }

    /// Mark the handshake as finished
    pub(crate) fn mark_ready(&mut self) {
        if self.state == TransportState::Connected {
            self.state = TransportState::Ready;
        }
    }

    /// Current state
    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Address of the server
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Traffic statistics
    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }
}
