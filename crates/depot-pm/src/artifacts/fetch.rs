//! HTTP transport for artifact downloads

use reqwest::blocking::Client;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Per-request timeout
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("bad response status code {0}")]
    BadResponseStatus(u16),

    #[error("{0}")]
    Network(String),

    #[error("{0}")]
    Io(String),
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => TransportError::BadResponseStatus(status.as_u16()),
            None => TransportError::Network(e.to_string()),
        }
    }
}

/// Fetches documents and downloads archives
pub trait Transport: Send + Sync {
    /// Fetch a small document into memory
    fn get(&self, url: &str) -> Result<Vec<u8>, TransportError>;

    /// Stream `url` into `destination`
    fn download(&self, url: &str, destination: &Path) -> Result<(), TransportError>;
}

/// [`Transport`] over a blocking reqwest client
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("depot-pm/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(HttpTransport { client })
    }

    fn request(&self, url: &str) -> Result<reqwest::blocking::Response, TransportError> {
        let response = self.client.get(url).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::BadResponseStatus(status.as_u16()));
        }
        Ok(response)
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        Ok(self.request(url)?.bytes()?.to_vec())
    }

    fn download(&self, url: &str, destination: &Path) -> Result<(), TransportError> {
        let mut response = self.request(url)?;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(destination)?;
        response.copy_to(&mut file)?;
        file.sync_all()?;
        Ok(())
    }
}
