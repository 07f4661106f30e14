//! Byte transport behind the fetcher.
//!
//! The [`Transport`] seam keeps the cache and hash logic testable without
//! network access; [`HttpTransport`] is the production implementation.

use std::io::{self, Write};
use std::sync::OnceLock;
use std::time::Duration;

use super::FetchError;

/// Global timeout for a single transfer, including the body.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Streams the body behind a URL into a sink.
pub trait Transport {
    /// Write the body of `url` into `sink`, returning the byte count.
    ///
    /// # Errors
    ///
    /// [`FetchError::NotFound`] for 404, [`FetchError::Http`] for any
    /// other status or transport failure.
    fn get(&self, url: &str, sink: &mut dyn Write) -> Result<u64, FetchError>;

    /// Fetch a small text document such as an API response.
    fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let mut body = Vec::new();
        self.get(url, &mut body)?;
        String::from_utf8(body).map_err(|e| FetchError::Http {
            url: url.to_owned(),
            reason: format!("response is not UTF-8: {e}"),
        })
    }
}

/// HTTP(S) transport using `ureq`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpTransport;

impl Transport for HttpTransport {
    fn get(&self, url: &str, sink: &mut dyn Write) -> Result<u64, FetchError> {
        let response = http_agent()
            .get(url)
            .header("Accept", "*/*")
            .call()
            .map_err(|e| map_ureq_error(url, &e))?;
        let mut body = response.into_body();
        let mut reader = body.as_reader();
        io::copy(&mut reader, sink).map_err(|e| FetchError::Http {
            url: url.to_owned(),
            reason: format!("transfer interrupted: {e}"),
        })
    }
}

fn http_agent() -> &'static ureq::Agent {
    static AGENT: OnceLock<ureq::Agent> = OnceLock::new();
    AGENT.get_or_init(|| {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(TRANSFER_TIMEOUT))
            .build();
        ureq::Agent::new_with_config(config)
    })
}

fn map_ureq_error(url: &str, err: &ureq::Error) -> FetchError {
    match err {
        ureq::Error::StatusCode(404) => FetchError::NotFound {
            url: url.to_owned(),
        },
        ureq::Error::StatusCode(code) => FetchError::Http {
            url: url.to_owned(),
            reason: format!("HTTP status {code}"),
        },
        other => FetchError::Http {
            url: url.to_owned(),
            reason: other.to_string(),
        },
    }
}
