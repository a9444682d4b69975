use std::sync::Arc;
use std::time::Duration;

use courier_common::InterlockedThrottle;
use courier_statsd::metric;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use url::Url;

use crate::statsd::ChannelCounters;
use crate::{
    BackoffLogicManager, ChannelConfig, CredentialProvider, RedirectHandler, Serializer,
    TelemetryBuffer, TelemetryItem, Transmission, TransmissionError, TransmissionResponse,
};

/// Item status codes in a partial response that are worth another attempt.
const RETRIABLE_STATUS: &[u16] = &[408, 429, 439, 500, 502, 503, 504];

/// Number of times an item is sent again after a retriable error in a partial response.
const MAX_PARTIAL_RETRIES: u8 = 1;

fn is_retriable(status: u16) -> bool {
    RETRIABLE_STATUS.contains(&status)
}

/// Body of a `206 Partial Content` response.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PartialResponse {
    items_received: usize,
    items_accepted: usize,
    errors: Vec<ItemError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemError {
    index: usize,
    status_code: u16,
    #[serde(default)]
    message: String,
}

/// How the transmitter reacts to a response status.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ResponseClass {
    Success,
    PartialSuccess,
    Transient,
    TooLarge,
    Rejected,
}

impl ResponseClass {
    fn of(status: StatusCode) -> Self {
        match status {
            StatusCode::PARTIAL_CONTENT => Self::PartialSuccess,
            StatusCode::PAYLOAD_TOO_LARGE => Self::TooLarge,
            status if status.is_success() => Self::Success,
            status if is_retriable(status.as_u16()) => Self::Transient,
            _ => Self::Rejected,
        }
    }
}

/// Drains a [`TelemetryBuffer`] and sends its contents to the endpoint.
///
/// A background loop started with [`run`](Self::run) sends in regular intervals, or earlier when
/// the buffer fills up. Only one drain-and-send runs at a time. Failed transmissions are put back
/// into the buffer and pause the loop for the delay computed by the [`BackoffLogicManager`].
pub struct InMemoryTransmitter {
    endpoint: Url,
    sending_interval: Duration,
    send_timeout: Duration,
    buffer: Arc<TelemetryBuffer>,
    serializer: Arc<dyn Serializer>,
    credential: Option<Arc<dyn CredentialProvider>>,
    redirects: RedirectHandler,
    backoff: BackoffLogicManager,
    send_lock: tokio::sync::Mutex<()>,
    paused_until: Mutex<Option<Instant>>,
    wake: Arc<Notify>,
    warn_throttle: InterlockedThrottle,
}

impl InMemoryTransmitter {
    /// Creates a transmitter for the buffer and registers for its full signal.
    pub fn new(
        endpoint: Url,
        config: &ChannelConfig,
        buffer: Arc<TelemetryBuffer>,
        serializer: Arc<dyn Serializer>,
        credential: Option<Arc<dyn CredentialProvider>>,
    ) -> Result<Self, reqwest::Error> {
        let wake = Arc::new(Notify::new());
        let notify = Arc::clone(&wake);
        buffer.set_full_callback(move || notify.notify_one());

        Ok(Self {
            endpoint,
            sending_interval: config.sending_interval(),
            send_timeout: config.send_timeout(),
            buffer,
            serializer,
            credential,
            redirects: RedirectHandler::new(config)?,
            backoff: BackoffLogicManager::new(&config.backoff),
            send_lock: tokio::sync::Mutex::new(()),
            paused_until: Mutex::new(None),
            wake,
            warn_throttle: InterlockedThrottle::new(config.diagnostics_interval()),
        })
    }

    /// Returns the backoff state of this transmitter.
    pub fn backoff(&self) -> &BackoffLogicManager {
        &self.backoff
    }

    /// Returns the remaining time until sending resumes after a failure.
    pub fn paused_for(&self) -> Option<Duration> {
        let paused_until = (*self.paused_until.lock())?;
        let remaining = paused_until.saturating_duration_since(Instant::now());
        (!remaining.is_zero()).then_some(remaining)
    }

    fn pause(&self, delay: Duration) {
        *self.paused_until.lock() = Some(Instant::now() + delay);
    }

    /// Requests an early send from the background loop.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Runs the send loop until `shutdown` flips to `true` or its sender is dropped.
    ///
    /// The loop never sends after shutdown was signaled. Items still in the buffer are left to a
    /// final [`dequeue_and_send`](Self::dequeue_and_send) by the owner.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        courier_log::debug!(endpoint = %self.endpoint, "transmitter started");

        loop {
            let paused_for = self.paused_for();
            let wait = paused_for.unwrap_or(self.sending_interval);

            tokio::select! {
                biased;

                _ = shutdown.changed() => break,
                _ = self.wake.notified(), if paused_for.is_none() => (),
                _ = tokio::time::sleep(wait) => (),
            }

            if *shutdown.borrow() {
                break;
            }

            self.dequeue_and_send(false).await;
        }

        courier_log::debug!("transmitter stopped");
    }

    /// Sends everything currently buffered on a separate task and waits up to `timeout`.
    ///
    /// The send ignores an active backoff pause. Returns `false` if the timeout elapsed first,
    /// in which case the send keeps running in the background.
    pub async fn flush(self: &Arc<Self>, timeout: Duration) -> bool {
        let transmitter = Arc::clone(self);
        let task = tokio::spawn(async move { transmitter.dequeue_and_send(true).await });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                courier_log::error!(
                    error = &error as &dyn std::error::Error,
                    "flush task failed"
                );
                false
            }
            Err(_) => {
                courier_log::debug!(?timeout, "flush timed out");
                false
            }
        }
    }

    /// Drains the buffer and sends the items as one transmission.
    ///
    /// Concurrent calls are serialized. Unless `ignore_backoff` is set, nothing is sent while
    /// the transmitter is paused after a failure.
    pub async fn dequeue_and_send(&self, ignore_backoff: bool) {
        let _guard = self.send_lock.lock().await;

        if !ignore_backoff && self.paused_for().is_some() {
            return;
        }

        let items = self.buffer.dequeue();
        if items.is_empty() {
            return;
        }

        let count = items.len();
        let transmission = match Transmission::from_items(
            self.endpoint.clone(),
            items,
            self.serializer.as_ref(),
            self.send_timeout,
        ) {
            Ok(transmission) => transmission,
            Err(error) => {
                courier_log::error!(
                    error = &error as &dyn std::error::Error,
                    items = count,
                    "failed to serialize telemetry"
                );
                metric!(
                    counter(ChannelCounters::ItemsDropped) += count as i64,
                    reason = "serialize"
                );
                return;
            }
        };

        let mut pending = vec![transmission];
        while let Some(transmission) = pending.pop() {
            let result = transmission
                .send(&self.redirects, self.credential.as_deref())
                .await;

            match result {
                Ok(response) => {
                    if !self.handle_response(transmission, response, &mut pending) {
                        self.retry_all(pending.drain(..));
                    }
                }
                Err(TransmissionError::MissingCredentials) => {
                    self.warn_throttle.try_run(|| {
                        courier_log::warn!("no authentication token available, holding telemetry");
                    });
                    self.retry(transmission);
                    self.retry_all(pending.drain(..));
                    self.pause(self.backoff.get_backoff_time_interval(None));
                }
                Err(TransmissionError::AlreadyInFlight) => {
                    courier_log::debug!("transmission already in flight, requeueing");
                    self.retry(transmission);
                }
                Err(error @ TransmissionError::InvalidHeader) => {
                    let count = transmission.item_count().unwrap_or_default();
                    self.warn_throttle.try_run(|| {
                        courier_log::warn!(
                            error = &error as &dyn std::error::Error,
                            items = count,
                            "unusable authentication token, dropping telemetry"
                        );
                    });
                    metric!(
                        counter(ChannelCounters::ItemsDropped) += count as i64,
                        reason = "invalid_credentials"
                    );
                }
            }
        }
    }

    /// Applies the response to the transmission.
    ///
    /// Returns `false` if sending should stop for now.
    fn handle_response(
        &self,
        transmission: Transmission,
        response: TransmissionResponse,
        pending: &mut Vec<Transmission>,
    ) -> bool {
        let status = response.status;

        match ResponseClass::of(status) {
            ResponseClass::Success => {
                self.backoff.reset();
                self.backoff.report_backoff_disabled();
            }
            ResponseClass::PartialSuccess => {
                self.backoff.reset();
                self.backoff.report_backoff_disabled();
                self.handle_partial(transmission, response.body.as_deref());
            }
            ResponseClass::Transient => {
                self.retry(transmission);
                self.backoff.report_error();
                let delay = self
                    .backoff
                    .get_backoff_time_interval(response.retry_after.as_deref());
                self.pause(delay);
                self.backoff.report_backoff_enabled(status);
                return false;
            }
            ResponseClass::TooLarge => self.split(transmission, pending),
            ResponseClass::Rejected => {
                let count = transmission.item_count().unwrap_or_default();
                self.warn_throttle.try_run(|| {
                    courier_log::warn!(
                        status = status.as_u16(),
                        body = response.body.as_deref().unwrap_or_default(),
                        items = count,
                        "endpoint rejected telemetry"
                    );
                });
                metric!(
                    counter(ChannelCounters::ItemsDropped) += count as i64,
                    reason = "rejected"
                );
            }
        }

        true
    }

    fn handle_partial(&self, transmission: Transmission, body: Option<&str>) {
        let partial = match body.map(serde_json::from_str::<PartialResponse>) {
            Some(Ok(partial)) => partial,
            Some(Err(error)) => {
                courier_log::warn!(
                    error = &error as &dyn std::error::Error,
                    "invalid partial response"
                );
                return;
            }
            None => return,
        };

        if partial.errors.is_empty() {
            return;
        }

        let items = match transmission.into_items(self.serializer.as_ref()) {
            Ok(items) => items,
            Err(error) => {
                courier_log::error!(
                    error = &error as &dyn std::error::Error,
                    "failed to recover items of partial response"
                );
                return;
            }
        };

        courier_log::debug!(
            received = partial.items_received,
            accepted = partial.items_accepted,
            "partially accepted transmission"
        );

        let mut items: Vec<_> = items.into_iter().map(Some).collect();
        let mut retry = Vec::new();
        let mut rejected = 0;

        for error in &partial.errors {
            let Some(mut item) = items.get_mut(error.index).and_then(Option::take) else {
                continue;
            };

            if is_retriable(error.status_code) && item.partial_retries < MAX_PARTIAL_RETRIES {
                item.partial_retries += 1;
                retry.push(item);
                continue;
            }

            courier_log::debug!(
                index = error.index,
                status = error.status_code,
                retries = item.partial_retries,
                message = %error.message,
                "item rejected"
            );
            rejected += 1;
        }

        metric!(
            counter(ChannelCounters::ItemsDropped) += rejected as i64,
            reason = "rejected"
        );
        self.requeue(retry);
    }

    fn split(&self, transmission: Transmission, pending: &mut Vec<Transmission>) {
        let serializer = self.serializer.as_ref();

        match transmission.split(|count| count / 2, serializer) {
            Ok((first, Some(second))) => {
                courier_log::debug!("splitting transmission that is too large");
                pending.push(second);
                pending.push(first);
            }
            Ok((single, None)) => {
                let count = single.item_count().unwrap_or_default();
                self.warn_throttle.try_run(|| {
                    courier_log::warn!(items = count, "telemetry item too large, dropping");
                });
                metric!(
                    counter(ChannelCounters::ItemsDropped) += count as i64,
                    reason = "too_large"
                );
            }
            Err(error) => {
                courier_log::error!(
                    error = &error as &dyn std::error::Error,
                    "failed to split transmission"
                );
            }
        }
    }

    fn retry_all(&self, transmissions: impl IntoIterator<Item = Transmission>) {
        for transmission in transmissions {
            self.retry(transmission);
        }
    }

    fn retry(&self, transmission: Transmission) {
        match transmission.into_items(self.serializer.as_ref()) {
            Ok(items) => self.requeue(items),
            Err(error) => courier_log::error!(
                error = &error as &dyn std::error::Error,
                "failed to recover items for retry"
            ),
        }
    }

    fn requeue(&self, items: Vec<TelemetryItem>) {
        if items.is_empty() {
            return;
        }

        let count = items.len();
        let dropped = self.buffer.enqueue_all(items);
        metric!(counter(ChannelCounters::ItemsRetried) += (count - dropped) as i64);
    }
}
