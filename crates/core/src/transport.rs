//! Network transport for the network source loader

use crate::error::TransportError;
use std::error::Error as _;
use std::io::{self, Read};
use std::time::Duration;

/// Upper bound on a downloaded image body
pub const DEFAULT_MAX_BODY_BYTES: u64 = 32 * 1024 * 1024;

/// Fetches the raw bytes behind a URL
///
/// Implementations block; they run on worker threads.
pub trait Transport: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, TransportError>;
}

/// Blocking HTTP transport backed by a shared `ureq` agent
pub struct UreqTransport {
    agent: ureq::Agent,
    max_body_bytes: u64,
}

impl UreqTransport {
    pub fn new(connect_timeout: Duration, read_timeout: Duration, user_agent: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(connect_timeout)
            .timeout_read(read_timeout)
            .user_agent(user_agent)
            .build();
        Self {
            agent,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_max_body_bytes(mut self, max: u64) -> Self {
        self.max_body_bytes = max;
        self
    }
}

impl Transport for UreqTransport {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        let response = self.agent.get(url).call().map_err(map_ureq_error)?;

        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(self.max_body_bytes + 1)
            .read_to_end(&mut bytes)
            .map_err(map_io_error)?;

        if bytes.len() as u64 > self.max_body_bytes {
            return Err(TransportError::Io(format!(
                "response body exceeds {} bytes",
                self.max_body_bytes
            )));
        }
        Ok(bytes)
    }
}

fn map_ureq_error(err: ureq::Error) -> TransportError {
    match err {
        ureq::Error::Status(code, _) => TransportError::Status { code },
        ureq::Error::Transport(transport) => match transport.kind() {
            ureq::ErrorKind::InvalidUrl | ureq::ErrorKind::UnknownScheme => {
                TransportError::InvalidUrl(transport.to_string())
            }
            _ => {
                let timed_out = transport
                    .source()
                    .and_then(|source| source.downcast_ref::<io::Error>())
                    .is_some_and(is_timeout);
                if timed_out {
                    TransportError::Timeout
                } else {
                    TransportError::Io(transport.to_string())
                }
            }
        },
    }
}

fn map_io_error(err: io::Error) -> TransportError {
    if is_timeout(&err) {
        TransportError::Timeout
    } else {
        TransportError::Io(err.to_string())
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_timeout_maps_to_timeout() {
        let err = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert_eq!(map_io_error(err), TransportError::Timeout);

        let err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(map_io_error(err), TransportError::Io(_)));
    }

    #[test]
    fn test_invalid_url_is_reported() {
        let transport = UreqTransport::new(
            Duration::from_secs(1),
            Duration::from_secs(1),
            "image-loader-test",
        );
        let result = transport.fetch("not a url");
        assert!(matches!(result, Err(TransportError::InvalidUrl(_))));
    }
}
