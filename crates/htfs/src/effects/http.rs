use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;

use crate::core::ByteRange;
use crate::error::Result;

/// A boxed stream type for HTTP response bodies.
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = T> + Send + 'a>>;

/// Body of a range response.
pub type BodyStream = BoxStream<'static, Result<Bytes>>;

/// What the metadata probe learned about the remote object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Probe {
    /// Total length in bytes.
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Probe {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }
}

/// Range-request transport.
///
/// Implementations bound connect time themselves and map their failures onto
/// [`Error`](crate::Error) so the retry driver can classify them: non-success
/// statuses as `Error::Status`, timeouts as `Error::Timeout`, socket failures
/// as `Error::Connect` / `Error::Network`.
///
/// # Implementations
///
/// - [`ReqwestClient`]: production implementation using `reqwest`
/// - [`MemoryClient`](crate::MemoryClient): in-memory object with fault injection
pub trait RangeClient: Send + Sync + 'static {
    /// Learn the object's length and confirm it is reachable.
    fn probe(&self, url: &str) -> impl Future<Output = Result<Probe>> + Send;

    /// Issue a range request and return the response body.
    ///
    /// The body must start exactly at `range.start`.
    fn open_range(
        &self,
        url: &str,
        range: ByteRange,
    ) -> impl Future<Output = Result<BodyStream>> + Send;
}

#[cfg(feature = "reqwest")]
mod reqwest_impl {
    use std::sync::Arc;

    use futures_util::TryStreamExt;
    use reqwest::StatusCode;
    use reqwest::header::{
        CONTENT_LENGTH, CONTENT_RANGE, ETAG, HeaderMap, HeaderName, LAST_MODIFIED, RANGE,
    };

    use super::*;
    use crate::core::parse_content_range;
    use crate::data::HtfsOptions;
    use crate::error::Error;

    /// Production transport implementation using reqwest.
    ///
    /// The client enforces the connect timeout and, as a second line behind
    /// the per-chunk idle timeout of each connection, a read timeout.
    /// Dropping a body mid-transfer closes its socket instead of returning it
    /// to the keep-alive pool.
    #[derive(Clone)]
    pub struct ReqwestClient {
        client: reqwest::Client,
        headers: Arc<[(String, String)]>,
    }

    impl ReqwestClient {
        /// Create a new ReqwestClient with default configuration.
        pub fn new() -> Result<Self> {
            Self::with_options(&HtfsOptions::default())
        }

        /// Create a client honoring the timeouts and headers of `options`.
        pub fn with_options(options: &HtfsOptions) -> Result<Self> {
            let client = reqwest::Client::builder()
                .connect_timeout(options.timeouts.connect)
                .read_timeout(options.timeouts.idle)
                .user_agent(concat!("htfs/", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(|e| Error::InvalidConfig(e.to_string()))?;
            Ok(Self {
                client,
                headers: options.headers.clone(),
            })
        }

        async fn send_range(&self, url: &str, range: ByteRange) -> Result<reqwest::Response> {
            let mut request = self.client.get(url).header(RANGE, range.header_value());
            for (key, value) in self.headers.iter() {
                request = request.header(key, value);
            }
            request.send().await.map_err(map_reqwest_error)
        }
    }

    impl RangeClient for ReqwestClient {
        async fn probe(&self, url: &str) -> Result<Probe> {
            // A one-byte GET rather than HEAD: signed URLs are usually only
            // valid for the method they were signed for.
            let response = self.send_range(url, ByteRange::bounded(0, 1)).await?;
            let status = response.status();
            let headers = response.headers();

            let size = match status {
                StatusCode::PARTIAL_CONTENT | StatusCode::RANGE_NOT_SATISFIABLE => {
                    let value = header_str(headers, CONTENT_RANGE).ok_or_else(|| {
                        Error::Malformed(format!("HTTP {status} without Content-Range"))
                    })?;
                    parse_content_range(value)?.total.ok_or_else(|| {
                        Error::Malformed("Content-Range without a complete length".into())
                    })?
                }
                StatusCode::OK => return Err(Error::RangeNotSupported),
                _ => return Err(status_error(status, url)),
            };

            Ok(Probe {
                size,
                etag: header_str(headers, ETAG).map(str::to_owned),
                last_modified: header_str(headers, LAST_MODIFIED).map(str::to_owned),
            })
        }

        async fn open_range(&self, url: &str, range: ByteRange) -> Result<BodyStream> {
            let response = self.send_range(url, range).await?;
            let status = response.status();

            match status {
                StatusCode::PARTIAL_CONTENT => {
                    let value = header_str(response.headers(), CONTENT_RANGE)
                        .ok_or_else(|| Error::Malformed("206 without Content-Range".into()))?;
                    let served = parse_content_range(value)?;
                    if !served.covers(&range) {
                        return Err(Error::Malformed(format!(
                            "asked for {}, server sent {value}",
                            range.header_value()
                        )));
                    }
                }
                StatusCode::OK if range.start == 0 => {
                    tracing::debug!(
                        url,
                        length = ?header_str(response.headers(), CONTENT_LENGTH),
                        "server answered a range request with the full body"
                    );
                }
                StatusCode::OK => return Err(Error::RangeNotSupported),
                _ => return Err(status_error(status, url)),
            }

            let stream = response.bytes_stream().map_err(map_reqwest_error);
            Ok(Box::pin(stream))
        }
    }

    fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<&str> {
        headers.get(name).and_then(|v| v.to_str().ok())
    }

    fn status_error(status: StatusCode, url: &str) -> Error {
        Error::Status {
            status: status.as_u16(),
            url: url.to_string(),
        }
    }

    fn map_reqwest_error(e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.is_connect() {
            Error::Connect(e.to_string())
        } else if let Some(status) = e.status() {
            Error::Status {
                status: status.as_u16(),
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
            }
        } else if e.is_builder() {
            Error::InvalidUrl(e.to_string())
        } else {
            Error::Network(e.to_string())
        }
    }
}

#[cfg(feature = "reqwest")]
pub use reqwest_impl::ReqwestClient;
