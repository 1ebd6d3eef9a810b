//! Network collaborator: fetches remote archive bytes.

use std::fmt;
use std::io::Read;

use log::debug;

use crate::error::{Error, Result};

/// Trait for network access - allows mocking in tests
pub trait Network: Send + Sync + fmt::Debug {
    /// Fetches the body at `url`.
    ///
    /// A missing resource is reported as `Error::NotFound`; everything else
    /// is `Error::Network`.
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;

    /// Whether this collaborator can fetch over `scheme`.
    fn supports(&self, scheme: &str) -> bool;
}

/// The default implementation of `Network`, an HTTP client.
#[derive(Debug, Clone, Default)]
pub struct HttpNetwork;

impl HttpNetwork {
    pub fn new() -> Self {
        Self
    }
}

impl Network for HttpNetwork {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        debug!("GET {}", url);
        let response = ureq::get(url).call().map_err(|error| match error {
            ureq::Error::Status(404, _) | ureq::Error::Status(410, _) => Error::NotFound {
                href: url.to_string(),
                message: "remote resource does not exist".to_string(),
            },
            ureq::Error::Status(code, _) => Error::Network {
                url: url.to_string(),
                message: format!("HTTP status {}", code),
            },
            ureq::Error::Transport(transport) => Error::Network {
                url: url.to_string(),
                message: transport.to_string(),
            },
        })?;
        let mut body = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|error| Error::Network {
                url: url.to_string(),
                message: error.to_string(),
            })?;
        Ok(body)
    }

    fn supports(&self, scheme: &str) -> bool {
        matches!(scheme, "http" | "https")
    }
}

/// A network that refuses every request, for fully offline resolution.
#[derive(Debug, Clone, Default)]
pub struct Offline;

impl Network for Offline {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        Err(Error::Network {
            url: url.to_string(),
            message: "network access is disabled".to_string(),
        })
    }

    fn supports(&self, _scheme: &str) -> bool {
        false
    }
}
