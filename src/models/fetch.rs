use std::io::{Read, Write};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("server returned HTTP {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("'{0}' is not an http(s) URL; set model_base_url in the settings file")]
    InvalidUrl(String),
    #[error("i/o error during download: {0}")]
    Io(#[from] std::io::Error),
}

/// Pulls a model archive from somewhere into a writer.
pub trait ArchiveFetcher: Send + Sync {
    /// Stream `url` into `dest`, calling `on_progress(bytes_so_far, total)`
    /// as data arrives. Returns the number of bytes written.
    fn fetch(
        &self,
        url: &str,
        dest: &mut dyn Write,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<u64, FetchError>;
}

/// Blocking HTTP(S) fetcher.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(30 * 60))
            .user_agent(concat!("photobridge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| FetchError::Transport {
                url: String::new(),
                source,
            })?;
        Ok(Self { client })
    }
}

impl ArchiveFetcher for HttpFetcher {
    fn fetch(
        &self,
        url: &str,
        dest: &mut dyn Write,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<u64, FetchError> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(FetchError::InvalidUrl(url.to_string()));
        }
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let total = response.content_length();
        let mut buf = vec![0u8; 64 * 1024];
        let mut written = 0u64;
        on_progress(0, total);
        loop {
            let n = response.read(&mut buf)?;
            if n == 0 {
                break;
            }
            dest.write_all(&buf[..n])?;
            written += n as u64;
            on_progress(written, total);
        }
        dest.flush()?;
        Ok(written)
    }
}
