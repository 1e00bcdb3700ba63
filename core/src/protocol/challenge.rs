//! Login challenge and response
//!
//! The server opens every connection with a challenge line of the form
//! `salt:server_type:protocol:hashes:endian:password_hash:` and expects
//! `endian:user:{ALGO}hash:language:database:` in return.

use crate::config::ConnectionParams;
use crate::digest::DigestAlgorithm;
use crate::error::{MapiError, Result};

/// Login challenge sent by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Salt mixed into the credential hash
    pub salt: String,

    /// `mserver` or `merovingian`
    pub server_type: String,

    /// Protocol version (8 or 9)
    pub protocol: u32,

    /// Digests the server accepts
    pub hashes: Vec<String>,

    /// Server byte order (`BIG` or `LIT`)
    pub endian: String,

    /// Algorithm the password is pre-hashed with (protocol 9)
    pub password_hash: Option<String>,
}

impl Challenge {
    /// Parse a challenge line
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim_end();
        let fields: Vec<&str> = text.split(':').collect();
        if fields.len() < 5 || fields[0].is_empty() {
            return Err(MapiError::Protocol(format!("malformed login challenge: {}", text)));
        }

        let protocol = fields[2]
            .parse()
            .map_err(|_| MapiError::Protocol(format!("invalid protocol version: {}", fields[2])))?;

        let hashes = fields[3]
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect();

        let password_hash = fields
            .get(5)
            .filter(|h| !h.is_empty())
            .map(|h| h.to_string());

        Ok(Self {
            salt: fields[0].to_string(),
            server_type: fields[1].to_string(),
            protocol,
            hashes,
            endian: fields[4].to_string(),
            password_hash,
        })
    }

    /// Whether the server accepts the given digest
    pub fn supports(&self, digest: DigestAlgorithm) -> bool {
        self.hashes.iter().any(|h| h.eq_ignore_ascii_case(digest.name()))
    }

    /// Whether the challenge comes from the merovingian daemon
    pub fn is_merovingian(&self) -> bool {
        self.server_type == "merovingian"
    }

    /// Compute the hashed credential for the configured digest
    pub fn hashed_password(&self, params: &ConnectionParams) -> Result<String> {
        let digest = params.digest;
        if !self.supports(digest) {
            return Err(MapiError::Auth(format!(
                "unsupported digest {}; server offers {}",
                digest,
                self.hashes.join(",")
            )));
        }

        let hashed = match self.protocol {
            9 => {
                let algorithm: DigestAlgorithm = self
                    .password_hash
                    .as_deref()
                    .ok_or_else(|| {
                        MapiError::Protocol("challenge lacks a password hash algorithm".to_string())
                    })?
                    .parse()?;
                let prehashed = algorithm.hash_hex(params.password.as_bytes());
                digest.salted_hex(&prehashed, &self.salt)
            }
            8 => digest.salted_hex(&params.password, &self.salt),
            other => {
                return Err(MapiError::Protocol(format!(
                    "unsupported protocol version {}",
                    other
                )))
            }
        };

        Ok(format!("{{{}}}{}", digest.name(), hashed))
    }

    /// Build the login response line
    pub fn respond(&self, params: &ConnectionParams) -> Result<String> {
        let hashed = self.hashed_password(params)?;
        Ok(format!(
            "{}:{}:{}:{}:{}:",
            client_endian(),
            params.user,
            hashed,
            params.language.as_str(),
            params.database
        ))
    }
}

/// Byte order marker of this client
pub fn client_endian() -> &'static str {
    if cfg!(target_endian = "big") {
        "BIG"
    } else {
        "LIT"
    }
}
