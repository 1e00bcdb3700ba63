//! Connection shared by a session and its result cursor
//!
//! The transport sits behind an async mutex so a cursor can request further
//! row blocks without borrowing the session. The cursor slot registry uses a
//! plain mutex so a dropped cursor can give its slot back synchronously.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use log::{debug, error, warn};
use mapi_core::error::{MapiError, Result};
use mapi_core::protocol::{Command, ResponseMessage};

use crate::transport::Transport;

#[derive(Debug, Default)]
struct CursorRegistry {
    /// Token of the cursor holding the statement slot
    active: Option<u64>,

    next_token: u64,

    /// Result ids whose server-side buffers must be closed
    pending_close: Vec<i64>,

    closed: bool,
}

/// Handle on the connection, cheap to clone
#[derive(Debug, Clone)]
pub(crate) struct Channel {
    transport: Arc<tokio::sync::Mutex<Option<Transport>>>,
    registry: Arc<Mutex<CursorRegistry>>,
}

impl Channel {
    pub(crate) fn new(transport: Transport) -> Self {
        Self {
            transport: Arc::new(tokio::sync::Mutex::new(Some(transport))),
            registry: Arc::new(Mutex::new(CursorRegistry::default())),
        }
    }

    fn registry(&self) -> MutexGuard<'_, CursorRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the session was closed or invalidated
    pub(crate) fn is_closed(&self) -> bool {
        self.registry().closed
    }

    /// Fail unless a new statement may be sent
    pub(crate) fn ensure_idle(&self) -> Result<()> {
        let registry = self.registry();
        if registry.closed {
            return Err(MapiError::ConnectionClosed);
        }
        if registry.active.is_some() {
            return Err(MapiError::State(
                "a result cursor is still open; free it before running another statement"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Claim the statement slot for a new cursor
    pub(crate) fn acquire_cursor(&self) -> Result<u64> {
        let mut registry = self.registry();
        if let Some(active) = registry.active {
            return Err(MapiError::State(format!("cursor {} is still open", active)));
        }
        let token = registry.next_token;
        registry.next_token += 1;
        registry.active = Some(token);
        Ok(token)
    }

    /// Give the statement slot back, optionally scheduling a server-side close
    pub(crate) fn release_cursor(&self, token: u64, close_result: Option<i64>) {
        let mut registry = self.registry();
        if registry.active == Some(token) {
            registry.active = None;
        }
        if let Some(id) = close_result {
            if !registry.closed {
                debug!("Deferring close of result {}", id);
                registry.pending_close.push(id);
            }
        }
    }

    /// Schedule a server-side close for the next round trip
    pub(crate) fn defer_close(&self, id: i64) {
        let mut registry = self.registry();
        if !registry.closed {
            registry.pending_close.push(id);
        }
    }

    /// Send a message and decode the response.
    ///
    /// Deferred result closes are flushed first. A fatal error tears the
    /// connection down.
    pub(crate) async fn request(&self, payload: Bytes) -> Result<Vec<ResponseMessage>> {
        let mut guard = self.transport.lock().await;
        let transport = guard.as_mut().ok_or(MapiError::ConnectionClosed)?;

        let result = Self::exchange(&self.take_pending(), transport, payload).await;
        if let Err(e) = &result {
            if e.is_fatal() {
                error!("Connection to {} lost: {}", transport.peer(), e);
                let _ = transport.close().await;
                *guard = None;
                self.registry().closed = true;
            }
        }
        result
    }

    async fn exchange(
        pending: &[i64],
        transport: &mut Transport,
        payload: Bytes,
    ) -> Result<Vec<ResponseMessage>> {
        for id in pending {
            for message in transport.request(Command::Close(*id).encode()).await? {
                if let ResponseMessage::Error { message, .. } = message {
                    warn!("Closing result {} failed: {}", id, message);
                }
            }
        }
        transport.request(payload).await
    }

    fn take_pending(&self) -> Vec<i64> {
        std::mem::take(&mut self.registry().pending_close)
    }

    /// Close the connection. Calling this again has no effect.
    pub(crate) async fn close(&self) -> Result<()> {
        {
            let mut registry = self.registry();
            registry.closed = true;
            registry.active = None;
            registry.pending_close.clear();
        }

        let mut guard = self.transport.lock().await;
        match guard.take() {
            Some(mut transport) => transport.close().await,
            None => Ok(()),
        }
    }
}
