use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{Address, Bytes};
use tracing::{debug, instrument};
use url::Url;

use relay_core::{PingResponse, RelayTransactionRequest, RelayTransactionResponse};

use crate::RelayClientError;

/// The HTTP boundary to relay servers.
#[async_trait]
pub trait RelayHttpClient: Send + Sync + Debug {
    /// Ask a relay for its addresses, readiness and minimum gas price
    async fn get_ping_response(
        &self,
        relay_url: &str,
        paymaster: Option<Address>,
    ) -> Result<PingResponse, RelayClientError>;

    /// Submit a signed relay request; returns the raw signed transaction
    async fn relay_transaction(
        &self,
        relay_url: &str,
        request: &RelayTransactionRequest,
    ) -> Result<Bytes, RelayClientError>;
}

/// A `reqwest` backed [`RelayHttpClient`]
#[derive(Debug, Clone)]
pub struct HttpClient {
    http: reqwest::Client,
    ping_timeout: Duration,
    relay_timeout: Duration,
}

impl HttpClient {
    /// Create a client with the given per-call timeouts
    pub fn new(ping_timeout: Duration, relay_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            ping_timeout,
            relay_timeout,
        }
    }
}

fn endpoint(relay_url: &str, path: &str) -> Result<Url, RelayClientError> {
    Url::parse(&format!("{}/{}", relay_url.trim_end_matches('/'), path)).map_err(|err| {
        RelayClientError::Transport {
            url: relay_url.to_owned(),
            message: err.to_string(),
        }
    })
}

fn transport_error(relay_url: &str, err: reqwest::Error) -> RelayClientError {
    if err.is_timeout() {
        RelayClientError::Timeout {
            url: relay_url.to_owned(),
        }
    } else if err.is_decode() {
        RelayClientError::InvalidResponse {
            url: relay_url.to_owned(),
            message: err.to_string(),
        }
    } else {
        RelayClientError::Transport {
            url: relay_url.to_owned(),
            message: err.to_string(),
        }
    }
}

/// Interpret the body of a submit-relay-request answer
pub fn parse_relay_response(
    relay_url: &str,
    response: RelayTransactionResponse,
) -> Result<Bytes, RelayClientError> {
    match response {
        RelayTransactionResponse {
            error: Some(reason),
            ..
        } => Err(RelayClientError::Rejected {
            url: relay_url.to_owned(),
            reason,
        }),
        RelayTransactionResponse {
            signed_tx: Some(raw_tx),
            ..
        } if !raw_tx.is_empty() => Ok(raw_tx),
        _ => Err(RelayClientError::InvalidResponse {
            url: relay_url.to_owned(),
            message: "response holds neither a signed transaction nor an error".into(),
        }),
    }
}

#[async_trait]
impl RelayHttpClient for HttpClient {
    #[instrument(skip(self), err(Debug))]
    async fn get_ping_response(
        &self,
        relay_url: &str,
        paymaster: Option<Address>,
    ) -> Result<PingResponse, RelayClientError> {
        let mut url = endpoint(relay_url, "getaddr")?;
        if let Some(paymaster) = paymaster {
            url.query_pairs_mut()
                .append_pair("paymaster", &format!("{paymaster:?}"));
        }
        let response = self
            .http
            .get(url)
            .timeout(self.ping_timeout)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| transport_error(relay_url, err))?;
        let ping = response
            .json::<PingResponse>()
            .await
            .map_err(|err| transport_error(relay_url, err))?;
        debug!(relay_url, ?ping, "Got ping response");
        Ok(ping)
    }

    #[instrument(skip(self, request), err(Debug))]
    async fn relay_transaction(
        &self,
        relay_url: &str,
        request: &RelayTransactionRequest,
    ) -> Result<Bytes, RelayClientError> {
        let url = endpoint(relay_url, "relay")?;
        // rejections come back as a non-success status with an error body
        let response = self
            .http
            .post(url)
            .json(request)
            .timeout(self.relay_timeout)
            .send()
            .await
            .map_err(|err| transport_error(relay_url, err))?;
        let status = response.status();
        let body = response
            .json::<RelayTransactionResponse>()
            .await
            .map_err(|err| {
                if status.is_success() {
                    transport_error(relay_url, err)
                } else {
                    RelayClientError::Transport {
                        url: relay_url.to_owned(),
                        message: format!("relay answered with status {status}"),
                    }
                }
            })?;
        parse_relay_response(relay_url, body)
    }
}
