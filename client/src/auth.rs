//! Login handshake
//!
//! The server speaks first with a challenge; the client answers with its
//! hashed credentials and the server either accepts, rejects or redirects.
//! A `merovingian` redirect means the daemon proxies the connection and
//! sends a fresh challenge on the same stream; a `monetdb` redirect names
//! another server to connect to.

use std::fmt;

use bytes::Bytes;
use log::{debug, info, warn};
use mapi_core::error::{MapiError, Result};
use mapi_core::protocol::{decode_response, Challenge, ResponseMessage};
use mapi_core::{ConnectionParams, MapiUrl};

use crate::transport::Transport;

/// Result of a single challenge/response round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// Credentials accepted
    Authenticated,

    /// Server asked the client to log in elsewhere
    Redirect(String),
}

impl fmt::Display for LoginOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoginOutcome::Authenticated => write!(f, "authenticated"),
            LoginOutcome::Redirect(url) => write!(f, "redirect to {}", url),
        }
    }
}

/// Log in over `transport`, following redirects
///
/// On success the returned transport may differ from the one passed in
/// when the server redirected to another host.
pub async fn authenticate(mut transport: Transport, params: &ConnectionParams) -> Result<Transport> {
    let mut params = params.clone();
    let mut redirects = 0;

    loop {
        let outcome = match login(&mut transport, &params).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let _ = transport.close().await;
                return Err(e);
            }
        };
        debug!("Login to {}: {}", transport.peer(), outcome);

        let url = match outcome {
            LoginOutcome::Authenticated => {
                transport.mark_ready();
                info!("Logged in to {} as {}", transport.peer(), params.user);
                return Ok(transport);
            }
            LoginOutcome::Redirect(url) => url,
        };

        redirects += 1;
        if redirects > params.max_redirects {
            let _ = transport.close().await;
            return Err(MapiError::Auth(format!(
                "too many redirects ({}), last to {}",
                params.max_redirects, url
            )));
        }

        let target = MapiUrl::parse(&url)
            .map_err(|e| MapiError::Protocol(format!("invalid redirect {}: {}", url, e)))?;
        if target.scheme == "merovingian" {
            // Proxied: the next challenge arrives on the same stream
            debug!("Proxied by merovingian at {}", transport.peer());
            continue;
        }

        info!("Redirected from {} to {}", transport.peer(), url);
        let _ = transport.close().await;
        params.apply_url(&target);
        transport = Transport::open(&params).await?;
    }
}

/// Run one challenge/response round
pub async fn login(transport: &mut Transport, params: &ConnectionParams) -> Result<LoginOutcome> {
    let raw = transport.recv().await?;
    let text = std::str::from_utf8(&raw)
        .map_err(|_| MapiError::Protocol("login challenge is not valid UTF-8".to_string()))?;
    let challenge = Challenge::parse(text)?;
    debug!(
        "Challenge from {} ({}, protocol {}, hashes {})",
        transport.peer(),
        challenge.server_type,
        challenge.protocol,
        challenge.hashes.join(",")
    );

    let response = challenge.respond(params)?;
    transport.send(Bytes::from(response)).await?;

    let reply = transport.recv().await?;
    let mut redirect = None;
    for message in decode_response(&reply)? {
        match message {
            ResponseMessage::Error { message, .. } => {
                warn!("Login to {} rejected: {}", transport.peer(), message);
                return Err(MapiError::Auth(message));
            }
            ResponseMessage::Redirect(url) => {
                // Only the first redirect counts
                if redirect.is_none() {
                    redirect = Some(url);
                }
            }
            ResponseMessage::Info(text) => debug!("Login info: {}", text),
            _ => {}
        }
    }

    Ok(match redirect {
        Some(url) => LoginOutcome::Redirect(url),
        None => LoginOutcome::Authenticated,
    })
}
