//! Feeder server address (`host:port`) and the URLs derived from it.

use std::fmt;

use url::Url;

/// Port the feeder server publishes RTMP streams on.
pub const DEFAULT_STREAM_PORT: u16 = 1935;

/// Validated `host[:port]` address of a feeder server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    raw: String,
    base: Url,
}

impl ServerAddress {
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        let raw = address.trim();
        if raw.is_empty() {
            return Err(AddressError::Empty);
        }
        let invalid = |reason: &str| AddressError::Invalid {
            address: raw.to_string(),
            reason: reason.to_string(),
        };
        if raw.chars().any(char::is_whitespace) {
            return Err(invalid("contains whitespace"));
        }
        let base = Url::parse(&format!("http://{}", raw)).map_err(|e| invalid(&e.to_string()))?;
        if base.host_str().map_or(true, str::is_empty) {
            return Err(invalid("missing host"));
        }
        if base.path() != "/" || base.query().is_some() || base.fragment().is_some() {
            return Err(invalid("expected host:port without a path"));
        }
        if !base.username().is_empty() || base.password().is_some() {
            return Err(invalid("credentials are not allowed"));
        }
        Ok(Self {
            raw: raw.to_string(),
            base,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Host part, i.e. the address minus its port.
    pub fn host(&self) -> &str {
        self.base.host_str().unwrap_or_default()
    }

    /// URL the real-time transport connects to.
    pub fn socket_url(&self) -> String {
        format!("http://{}", self.raw)
    }

    /// Base URL of the REST API (`/videos`, `/feeders`).
    pub fn http_base_url(&self) -> Url {
        self.base.clone()
    }

    /// Playback URL for a server-assigned stream path.
    pub fn stream_url(&self, stream_port: u16, stream_path: &str) -> String {
        let path = stream_path.strip_prefix('/').unwrap_or(stream_path);
        format!("rtmp://{}:{}/{}", self.host(), stream_port, path)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("server address is empty")]
    Empty,
    #[error("invalid server address {address:?}: {reason}")]
    Invalid { address: String, reason: String },
}
