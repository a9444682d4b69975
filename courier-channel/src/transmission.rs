use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use courier_statsd::metric;
use reqwest::StatusCode;
use reqwest::header::{self, HeaderMap, HeaderValue};
use url::Url;

use crate::statsd::{ChannelCounters, ChannelHistograms, ChannelTimers};
use crate::{
    CredentialProvider, HttpEncoding, RedirectHandler, SerializeError, Serializer, TelemetryItem,
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// An error returned by [`Transmission::send`] before any request was made.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum TransmissionError {
    /// Another call to `send` on the same transmission has not completed yet.
    #[error("transmission is already in flight")]
    AlreadyInFlight,
    /// A credential provider is configured but has no valid token.
    #[error("no authentication token available")]
    MissingCredentials,
    /// The authentication token cannot be used as a header value.
    #[error("authentication token is not a valid header value")]
    InvalidHeader,
}

/// The outcome of a transmission attempt.
///
/// Every received status is reported as data, including server errors. Network failures and
/// timeouts are reported as `408 Request Timeout`.
#[derive(Clone, Debug, PartialEq)]
pub struct TransmissionResponse {
    /// The HTTP status of the final response.
    pub status: StatusCode,
    /// The response body, if non-empty.
    pub body: Option<String>,
    /// The raw value of the `Retry-After` header.
    pub retry_after: Option<String>,
}

impl TransmissionResponse {
    /// Creates a response with only a status.
    pub fn from_status(status: StatusCode) -> Self {
        Self {
            status,
            body: None,
            retry_after: None,
        }
    }

    fn timeout() -> Self {
        Self::from_status(StatusCode::REQUEST_TIMEOUT)
    }

    async fn read(response: reqwest::Response) -> Result<Self, reqwest::Error> {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        let body = response.text().await?;

        Ok(Self {
            status,
            body: (!body.is_empty()).then_some(body),
            retry_after,
        })
    }
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A serialized batch of telemetry items addressed to an endpoint.
#[derive(Debug)]
pub struct Transmission {
    id: u64,
    endpoint: Url,
    content: Bytes,
    content_type: &'static str,
    encoding: HttpEncoding,
    timeout: Duration,
    items: Option<Vec<TelemetryItem>>,
    in_flight: AtomicBool,
}

impl Transmission {
    /// Creates a transmission from an already serialized payload.
    pub fn new(
        endpoint: Url,
        content: Bytes,
        content_type: &'static str,
        encoding: HttpEncoding,
        timeout: Duration,
    ) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            endpoint,
            content,
            content_type,
            encoding,
            timeout,
            items: None,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Serializes the items into a transmission that retains them for splitting.
    pub fn from_items(
        endpoint: Url,
        items: Vec<TelemetryItem>,
        serializer: &dyn Serializer,
        timeout: Duration,
    ) -> Result<Self, SerializeError> {
        let content = serializer.serialize(&items)?;
        let mut transmission = Self::new(
            endpoint,
            content,
            serializer.content_type(),
            serializer.content_encoding(),
            timeout,
        );
        transmission.items = Some(items);
        Ok(transmission)
    }

    /// Unique identifier of this transmission within the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The endpoint the transmission is addressed to.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// The serialized payload.
    pub fn content(&self) -> &Bytes {
        &self.content
    }

    /// Number of retained items, if the transmission was created from items.
    pub fn item_count(&self) -> Option<usize> {
        self.items.as_ref().map(Vec::len)
    }

    /// Posts the payload to the endpoint.
    ///
    /// A transmission cannot be sent concurrently with itself. Once the previous call completed
    /// it can be sent again.
    pub async fn send(
        &self,
        redirects: &RedirectHandler,
        credential: Option<&dyn CredentialProvider>,
    ) -> Result<TransmissionResponse, TransmissionError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TransmissionError::AlreadyInFlight);
        }
        let _guard = InFlightGuard(&self.in_flight);

        let headers = self.headers(credential)?;

        metric!(counter(ChannelCounters::TransmissionSent) += 1);
        metric!(histogram(ChannelHistograms::TransmissionBytes) = self.content.len() as u64);
        if let Some(count) = self.item_count() {
            metric!(histogram(ChannelHistograms::TransmissionItems) = count as u64);
        }

        let start = Instant::now();
        let request = async {
            let response = redirects
                .send(&self.endpoint, headers, self.content.clone())
                .await?;
            TransmissionResponse::read(response).await
        };

        let response = match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => {
                courier_log::debug!(
                    error = &error as &dyn std::error::Error,
                    transmission = self.id,
                    "transmission failed"
                );
                TransmissionResponse::timeout()
            }
            Err(_) => {
                courier_log::debug!(transmission = self.id, "transmission timed out");
                TransmissionResponse::timeout()
            }
        };

        metric!(timer(ChannelTimers::TransmissionDuration) = start.elapsed());
        metric!(
            counter(ChannelCounters::TransmissionStatus) += 1,
            status = response.status.as_str()
        );

        Ok(response)
    }

    fn headers(
        &self,
        credential: Option<&dyn CredentialProvider>,
    ) -> Result<HeaderMap, TransmissionError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(self.content_type),
        );

        if let Some(encoding) = self.encoding.name() {
            headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static(encoding));
        }

        if let Some(credential) = credential {
            let token = credential
                .get_token()
                .ok_or(TransmissionError::MissingCredentials)?;
            let mut value = HeaderValue::try_from(format!("Bearer {}", token.token))
                .map_err(|_| TransmissionError::InvalidHeader)?;
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }

        Ok(headers)
    }

    /// Splits the items of this transmission at the boundary computed from the item count.
    ///
    /// Items are taken from the retained originals, or parsed from the payload if the
    /// transmission was created from a payload. If the boundary does not fall strictly inside
    /// the items, the transmission is returned unchanged as the first half.
    pub fn split<F>(
        mut self,
        calculate: F,
        serializer: &dyn Serializer,
    ) -> Result<(Transmission, Option<Transmission>), SerializeError>
    where
        F: FnOnce(usize) -> usize,
    {
        let mut items = match self.items.take() {
            Some(items) => items,
            None => serializer.deserialize(&self.content)?,
        };

        let boundary = calculate(items.len());
        if boundary == 0 || boundary >= items.len() {
            self.items = Some(items);
            return Ok((self, None));
        }

        let rest = items.split_off(boundary);
        let first = Self::from_items(self.endpoint.clone(), items, serializer, self.timeout)?;
        let second = Self::from_items(self.endpoint, rest, serializer, self.timeout)?;
        Ok((first, Some(second)))
    }

    /// Returns the items of this transmission, parsing the payload if they were not retained.
    pub fn into_items(
        self,
        serializer: &dyn Serializer,
    ) -> Result<Vec<TelemetryItem>, SerializeError> {
        match self.items {
            Some(items) => Ok(items),
            None => serializer.deserialize(&self.content),
        }
    }
}
