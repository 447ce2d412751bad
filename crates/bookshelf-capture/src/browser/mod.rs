//! Browser capability interface.
//!
//! Defines the `BrowserPage` and `PageElement` traits that abstract over the
//! automation transport (currently Chromium via chromiumoxide). Network
//! responses and download progress are delivered as broadcast events so that
//! any number of waiters can subscribe before the action that triggers them.

pub mod chromium;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Capacity of the response and download broadcast channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A network response whose body is ready to be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEvent {
    /// Transport-specific request handle, passed back to `response_body`.
    pub request_id: String,
    /// Full request URL.
    pub url: String,
    /// HTTP status code.
    pub status: u16,
}

/// Progress of a browser-initiated download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DownloadEvent {
    Started {
        guid: String,
        suggested_filename: String,
    },
    Completed {
        guid: String,
    },
    Canceled {
        guid: String,
    },
}

/// Errors raised by the automation transport.
#[derive(thiserror::Error, Debug)]
pub enum BrowserError {
    #[error("Failed to launch browser: {0}")]
    Launch(String),

    #[error("Failed to connect to browser at {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("Navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Download not found: {0}")]
    DownloadMissing(String),

    #[error("Download {0} was canceled")]
    DownloadCanceled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type for transport operations.
pub type BrowserResult<T> = Result<T, BrowserError>;

/// A single browser tab driven by the pipeline.
#[async_trait]
pub trait BrowserPage: Send + Sync {
    /// Navigate to a URL and wait for the load to settle.
    async fn goto(&self, url: &str) -> BrowserResult<()>;
    /// Get the current URL.
    async fn current_url(&self) -> BrowserResult<String>;
    /// Type a value into the input matching a CSS selector.
    async fn fill(&self, selector: &str, value: &str) -> BrowserResult<()>;
    /// Click the element matching a CSS selector.
    async fn click(&self, selector: &str) -> BrowserResult<()>;
    /// Click the first element whose text contains `label`.
    async fn click_text(&self, label: &str) -> BrowserResult<()>;
    /// Evaluate a script in the page, awaiting a returned promise.
    async fn evaluate(&self, script: &str) -> BrowserResult<serde_json::Value>;
    /// All elements currently mounted that match an XPath, in document order.
    async fn find_all(&self, xpath: &str) -> BrowserResult<Vec<Box<dyn PageElement>>>;
    /// Subscribe to completed network responses.
    fn subscribe_responses(&self) -> broadcast::Receiver<ResponseEvent>;
    /// Fetch the body of a response previously announced by a `ResponseEvent`.
    async fn response_body(&self, request_id: &str) -> BrowserResult<String>;
    /// Subscribe to download progress.
    fn subscribe_downloads(&self) -> broadcast::Receiver<DownloadEvent>;
    /// Move a completed download to its final location.
    async fn save_download(&self, guid: &str, destination: &Path) -> BrowserResult<()>;
    /// Close this page.
    async fn close(&self) -> BrowserResult<()>;
}

/// A DOM element handle returned by [`BrowserPage::find_all`].
#[async_trait]
pub trait PageElement: Send + Sync {
    async fn click(&self) -> BrowserResult<()>;
    /// Dispatch a key press (e.g. `"Escape"`) to this element.
    async fn press_key(&self, key: &str) -> BrowserResult<()>;
}
