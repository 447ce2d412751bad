//! Response correlation: turn intercepted network responses into records.
//!
//! The browser reports responses asynchronously with respect to whatever UI
//! action caused them, so nothing here relies on ordering between a click and
//! its response. Two shapes are provided:
//!
//! - [`Correlator`]: a producer task that decodes every matching response
//!   into records and pushes them into a channel. The consumer waits on some
//!   *other* confirmable signal and only then calls [`Correlator::finish`],
//!   which drains everything the producer has already been handed.
//! - [`ResponseWaiter`]: a one-shot wait for the next matching response,
//!   subscribed before the triggering action so the response cannot be missed.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::browser::{BrowserError, BrowserPage, ResponseEvent};
use crate::types::{HarvestError, HarvestResult};

/// Which responses a waiter or correlator reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseMatcher {
    /// GraphQL operation, matched by `operationName=<name>` in the URL.
    Operation(String),
    /// Any response whose URL contains `fragment`, optionally with a status.
    UrlFragment {
        fragment: String,
        status: Option<u16>,
    },
}

impl ResponseMatcher {
    pub fn operation(name: impl Into<String>) -> Self {
        Self::Operation(name.into())
    }

    pub fn url_fragment(fragment: impl Into<String>, status: Option<u16>) -> Self {
        Self::UrlFragment {
            fragment: fragment.into(),
            status,
        }
    }

    pub fn matches(&self, event: &ResponseEvent) -> bool {
        match self {
            Self::Operation(name) => event.url.contains(&format!("operationName={name}")),
            Self::UrlFragment { fragment, status } => {
                event.url.contains(fragment.as_str())
                    && status.map_or(true, |s| s == event.status)
            }
        }
    }

    /// Human-readable name used in errors and logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Operation(name) => name.clone(),
            Self::UrlFragment { fragment, .. } => format!("response matching '{fragment}'"),
        }
    }
}

/// Background producer of records decoded from one GraphQL operation.
pub struct Correlator<T> {
    operation: String,
    stop: oneshot::Sender<()>,
    task: JoinHandle<HarvestResult<()>>,
    records: mpsc::UnboundedReceiver<T>,
}

impl<T: Send + 'static> Correlator<T> {
    /// Subscribe to `page` and start decoding responses of `operation`.
    ///
    /// `extract` turns a response body into zero or more records; an empty
    /// result is valid. Must be called from within a tokio runtime.
    pub fn spawn<F>(page: Arc<dyn BrowserPage>, operation: &str, extract: F) -> Self
    where
        F: Fn(&str) -> Result<Vec<T>, serde_json::Error> + Send + Sync + 'static,
    {
        let responses = page.subscribe_responses();
        let (tx, records) = mpsc::unbounded_channel();
        let (stop, stop_rx) = oneshot::channel();
        let matcher = ResponseMatcher::operation(operation);
        let task = tokio::spawn(produce(page, responses, matcher, extract, tx, stop_rx));
        Self {
            operation: operation.to_string(),
            stop,
            task,
            records,
        }
    }

    /// Stop the producer and collect every record decoded so far.
    ///
    /// Responses delivered to the subscription before this call are still
    /// processed. A decode failure of any matching response is returned here.
    pub async fn finish(self) -> HarvestResult<Vec<T>> {
        let Self {
            operation,
            stop,
            task,
            mut records,
        } = self;

        let _ = stop.send(());
        task.await.map_err(|e| {
            BrowserError::Protocol(format!("{operation} correlator task failed: {e}"))
        })??;

        let mut out = Vec::new();
        while let Ok(record) = records.try_recv() {
            out.push(record);
        }
        debug!(operation = %operation, records = out.len(), "Correlator finished");
        Ok(out)
    }
}

async fn produce<T, F>(
    page: Arc<dyn BrowserPage>,
    mut responses: broadcast::Receiver<ResponseEvent>,
    matcher: ResponseMatcher,
    extract: F,
    tx: mpsc::UnboundedSender<T>,
    mut stop: oneshot::Receiver<()>,
) -> HarvestResult<()>
where
    F: Fn(&str) -> Result<Vec<T>, serde_json::Error> + Send + Sync,
{
    loop {
        tokio::select! {
            biased;
            received = responses.recv() => match received {
                Ok(event) => correlate(page.as_ref(), &matcher, &extract, &tx, event).await?,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, operation = %matcher.describe(), "Response subscription lagged");
                }
                Err(RecvError::Closed) => return Ok(()),
            },
            _ = &mut stop => break,
        }
    }

    // Drain whatever was delivered before the stop signal.
    loop {
        match responses.try_recv() {
            Ok(event) => correlate(page.as_ref(), &matcher, &extract, &tx, event).await?,
            Err(TryRecvError::Lagged(skipped)) => {
                warn!(skipped, operation = %matcher.describe(), "Response subscription lagged");
            }
            Err(_) => return Ok(()),
        }
    }
}

async fn correlate<T, F>(
    page: &dyn BrowserPage,
    matcher: &ResponseMatcher,
    extract: &F,
    tx: &mpsc::UnboundedSender<T>,
    event: ResponseEvent,
) -> HarvestResult<()>
where
    F: Fn(&str) -> Result<Vec<T>, serde_json::Error>,
{
    if !matcher.matches(&event) {
        return Ok(());
    }
    let body = page.response_body(&event.request_id).await?;
    let records = extract(&body).map_err(|source| HarvestError::Decode {
        operation: matcher.describe(),
        source,
    })?;
    debug!(url = %event.url, records = records.len(), "Correlated response");
    for record in records {
        // The receiver lives in the Correlator; if it is gone nobody wants the records.
        let _ = tx.send(record);
    }
    Ok(())
}

/// One-shot wait for the next response matching a [`ResponseMatcher`].
pub struct ResponseWaiter {
    page: Arc<dyn BrowserPage>,
    responses: broadcast::Receiver<ResponseEvent>,
    matcher: ResponseMatcher,
}

impl ResponseWaiter {
    /// Subscribe now; call before the action that triggers the response.
    pub fn arm(page: &Arc<dyn BrowserPage>, matcher: ResponseMatcher) -> Self {
        Self {
            page: Arc::clone(page),
            responses: page.subscribe_responses(),
            matcher,
        }
    }

    /// Wait for the first matching response seen since arming.
    pub async fn wait(self, timeout: Duration) -> HarvestResult<ResponseEvent> {
        let Self {
            mut responses,
            matcher,
            ..
        } = self;
        let what = matcher.describe();

        let next_match = async {
            loop {
                match responses.recv().await {
                    Ok(event) if matcher.matches(&event) => return Ok(event),
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, waiting_for = %what, "Response subscription lagged");
                    }
                    Err(RecvError::Closed) => {
                        return Err(HarvestError::Browser(BrowserError::Protocol(
                            "response stream closed".to_string(),
                        )))
                    }
                }
            }
        };

        tokio::time::timeout(timeout, next_match)
            .await
            .map_err(|_| HarvestError::Timeout {
                what: what.clone(),
                after_ms: timeout.as_millis() as u64,
            })?
    }

    /// Wait for the next matching response and decode its JSON body.
    pub async fn wait_json<T: DeserializeOwned>(self, timeout: Duration) -> HarvestResult<T> {
        let page = Arc::clone(&self.page);
        let operation = self.matcher.describe();
        let event = self.wait(timeout).await?;
        let body = page.response_body(&event.request_id).await?;
        serde_json::from_str(&body).map_err(|source| HarvestError::Decode { operation, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(url: &str, status: u16) -> ResponseEvent {
        ResponseEvent {
            request_id: "1".to_string(),
            url: url.to_string(),
            status,
        }
    }

    #[test]
    fn test_operation_matches_by_url_substring() {
        let matcher = ResponseMatcher::operation("BookShelfQuery");
        assert!(matcher.matches(&event(
            "https://shop.example/api/graphql?operationName=BookShelfQuery&variables=%7B%7D",
            200
        )));
        assert!(!matcher.matches(&event(
            "https://shop.example/api/graphql?operationName=GetMeViewerQuery",
            200
        )));
    }

    #[test]
    fn test_operation_prefix_collision_is_a_known_limit() {
        // Loose substring matching: a longer name sharing the prefix also matches.
        let matcher = ResponseMatcher::operation("BookShelf");
        assert!(matcher.matches(&event("/graphql?operationName=BookShelfQuery", 200)));
    }

    #[test]
    fn test_fragment_respects_status() {
        let matcher = ResponseMatcher::url_fragment("/api/image/", Some(200));
        assert!(matcher.matches(&event("https://shop.example/api/image/abc.png", 200)));
        assert!(!matcher.matches(&event("https://shop.example/api/image/abc.png", 404)));
        assert!(!matcher.matches(&event("https://shop.example/api/graphql", 200)));

        let any_status = ResponseMatcher::url_fragment("/api/image/", None);
        assert!(any_status.matches(&event("https://shop.example/api/image/abc.png", 304)));
    }
}
