//! The HTTP client for the ledger-entry fetch call.
//!
//! The remote service exposes a single operation this program cares about:
//! fetch the current value of a ledger entry identified by a given key. The
//! call is a POST of a form-encoded body carrying the key in its base64
//! transport form. Response bodies are ignored; callers only learn whether
//! the call succeeded.

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::{Request, Uri, header::CONTENT_LENGTH, header::CONTENT_TYPE};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use serde::Serialize;

use crate::keys::LedgerKey;

#[derive(Debug, Serialize)]
struct EntryQuery<'a> {
    key: &'a str,
}

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`LedgerClient`].
pub enum Error {
    /// Wrapper around [`hyper::http::Error`].
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::http::Error),
    /// The form body could not be encoded.
    #[error("Failed to encode request body: {0}")]
    Encode(#[from] serde_qs::Error),
    /// The request could not be sent.
    #[error("Failed to send request to {uri}: {source}")]
    RequestFailed {
        /// Target URI
        uri: String,
        /// Underlying client error
        #[source]
        source: Box<hyper_util::client::legacy::Error>,
    },
    /// The service answered with a non-success status.
    #[error("Service answered {status} for {uri}")]
    Status {
        /// Target URI
        uri: String,
        /// Status code of the response
        status: hyper::StatusCode,
    },
}

/// Client for a ledger-data service's entry fetch endpoint.
///
/// Each worker owns its own instance; no connection state is shared between
/// workers.
#[derive(Debug)]
pub struct LedgerClient {
    client: Client<HttpConnector, BoxBody<Bytes, hyper::Error>>,
    uri: Uri,
}

impl LedgerClient {
    /// Create a new [`LedgerClient`] aimed at `uri`.
    #[must_use]
    pub fn new(uri: Uri) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .retry_canceled_requests(false)
            .build_http();
        Self { client, uri }
    }

    /// Fetch the current value of the ledger entry identified by `key`.
    ///
    /// # Errors
    ///
    /// Function will return an error if the request cannot be built or sent
    /// or if the service answers with a non-success status.
    pub async fn fetch(&self, key: &LedgerKey) -> Result<(), Error> {
        let encoded = key.to_base64();
        let body = serde_qs::to_string(&EntryQuery { key: &encoded })?;

        let request = Request::builder()
            .method(hyper::Method::POST)
            .uri(&self.uri)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(CONTENT_LENGTH, body.len())
            .body(crate::full(body))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|source| Error::RequestFailed {
                uri: self.uri.to_string(),
                source: Box::new(source),
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::Status {
                uri: self.uri.to_string(),
                status,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use warp::Filter;

    use super::{Error, LedgerClient};
    use crate::keys::LedgerKey;

    async fn spawn_target(status: u16) -> SocketAddr {
        let filter = warp::post().map(move || {
            warp::reply::with_status(
                "",
                warp::http::StatusCode::from_u16(status).expect("invalid status code"),
            )
        });
        let (addr, fut) = warp::serve(filter).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(fut);
        addr
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fetch_success_on_2xx() {
        let addr = spawn_target(200).await;
        let client = LedgerClient::new(
            format!("http://{addr}/getledgerentry")
                .parse()
                .expect("uri did not parse"),
        );

        let key = LedgerKey::from_raw(&b"account-alpha"[..]);
        client.fetch(&key).await.expect("fetch failed");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fetch_failure_on_5xx() {
        let addr = spawn_target(500).await;
        let client = LedgerClient::new(
            format!("http://{addr}/getledgerentry")
                .parse()
                .expect("uri did not parse"),
        );

        let key = LedgerKey::from_raw(&b"account-alpha"[..]);
        let err = client
            .fetch(&key)
            .await
            .expect_err("fetch of a 500 endpoint succeeded");
        assert!(matches!(err, Error::Status { status, .. } if status.as_u16() == 500));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fetch_failure_on_unreachable_endpoint() {
        // Port 1 is all but guaranteed to refuse the connection.
        let client = LedgerClient::new(
            "http://127.0.0.1:1/getledgerentry"
                .parse()
                .expect("uri did not parse"),
        );

        let key = LedgerKey::from_raw(&b"account-alpha"[..]);
        let err = client
            .fetch(&key)
            .await
            .expect_err("fetch of an unreachable endpoint succeeded");
        assert!(matches!(err, Error::RequestFailed { .. }));
    }
}
