//! Chromium-backed browser pages using chromiumoxide.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::{
    DownloadProgressState, EventDownloadProgress, EventDownloadWillBegin,
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventLoadingFailed, EventLoadingFinished, EventResponseReceived,
    GetResponseBodyParams, RequestId,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::element::Element;
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{
    BrowserError, BrowserPage, BrowserResult, DownloadEvent, PageElement, ResponseEvent,
    EVENT_CHANNEL_CAPACITY,
};
use crate::config::BrowserMode;

/// Find the Chrome/Chromium binary path.
pub fn find_chromium() -> Option<PathBuf> {
    // 1. BOOKSHELF_CHROME_PATH env
    if let Ok(p) = std::env::var("BOOKSHELF_CHROME_PATH") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    // 2. System PATH
    for name in ["google-chrome", "google-chrome-stable", "chromium", "chromium-browser"] {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }

    // 3. Common macOS location
    if cfg!(target_os = "macos") {
        let common = PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
        if common.exists() {
            return Some(common);
        }
    }

    None
}

/// Where a remote browser writes downloads on its own filesystem. Files
/// there are never read by us; the bytes are fetched again through the page.
pub const REMOTE_DOWNLOAD_DIR: &str = "/tmp/bookshelf-capture-downloads";

/// How a finished download reaches the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadTransfer {
    /// The browser shares our filesystem and names each file by its GUID
    /// inside this directory.
    Staged(PathBuf),
    /// The browser runs elsewhere. Its copy is unreachable, so the download
    /// URL is fetched inside the page and the bytes come back over CDP.
    Refetch,
}

impl DownloadTransfer {
    /// The `Browser.setDownloadBehavior` request for this transfer.
    pub fn behavior(&self) -> BrowserResult<SetDownloadBehaviorParams> {
        let download_path = match self {
            Self::Staged(dir) => dir.to_string_lossy().into_owned(),
            Self::Refetch => REMOTE_DOWNLOAD_DIR.to_string(),
        };
        SetDownloadBehaviorParams::builder()
            .behavior(SetDownloadBehaviorBehavior::AllowAndName)
            .download_path(download_path)
            .events_enabled(true)
            .build()
            .map_err(BrowserError::Protocol)
    }
}

/// A connected or launched Chromium instance.
pub struct ChromiumBrowser {
    browser: Browser,
    handler_task: JoinHandle<()>,
    remote: bool,
}

impl ChromiumBrowser {
    /// Open the browser described by `mode`.
    pub async fn open(mode: &BrowserMode) -> BrowserResult<Self> {
        match mode {
            BrowserMode::Remote { endpoint } => Self::connect(endpoint).await,
            BrowserMode::Local { headless } => Self::launch(*headless).await,
        }
    }

    /// Attach to a running browser through its DevTools WebSocket endpoint.
    pub async fn connect(endpoint: &str) -> BrowserResult<Self> {
        info!(endpoint, "Connecting to remote browser");
        let (browser, handler) =
            Browser::connect(endpoint)
                .await
                .map_err(|e| BrowserError::Connect {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                })?;
        Ok(Self::with_handler(browser, handler, true))
    }

    /// Launch a local Chrome/Chromium.
    pub async fn launch(headless: bool) -> BrowserResult<Self> {
        let chrome_path = find_chromium().ok_or_else(|| {
            BrowserError::Launch(
                "Chrome not found. Install Chrome/Chromium or set BOOKSHELF_CHROME_PATH."
                    .to_string(),
            )
        })?;
        info!(path = %chrome_path.display(), headless, "Launching local browser");

        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu-sandbox");
        if !headless {
            builder = builder.with_head();
        }
        let config = builder
            .build()
            .map_err(|e| BrowserError::Launch(format!("failed to build browser config: {e}")))?;

        let (browser, handler) = Browser::launch(config)
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;
        Ok(Self::with_handler(browser, handler, false))
    }

    fn with_handler(browser: Browser, mut handler: chromiumoxide::Handler, remote: bool) -> Self {
        // The CDP connection only makes progress while the handler is polled.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "CDP handler error");
                }
            }
        });
        Self {
            browser,
            handler_task,
            remote,
        }
    }

    /// Open a new tab whose downloads land in `staging_dir`.
    ///
    /// A remote browser cannot write into `staging_dir`, so its downloads are
    /// fetched again through the page instead.
    pub async fn new_page(&self, staging_dir: &Path) -> BrowserResult<Arc<ChromiumPage>> {
        let transfer = if self.remote {
            DownloadTransfer::Refetch
        } else {
            std::fs::create_dir_all(staging_dir)?;
            DownloadTransfer::Staged(staging_dir.canonicalize()?)
        };
        debug!(?transfer, "Download transfer selected");

        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(protocol)?;

        page.execute(EnableParams::default())
            .await
            .map_err(protocol)?;
        page.execute(transfer.behavior()?)
            .await
            .map_err(protocol)?;

        let (responses, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (downloads, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let download_urls = Arc::new(Mutex::new(HashMap::new()));
        let pumps = vec![
            spawn_response_pump(&page, responses.clone()).await?,
            spawn_download_pump(&page, downloads.clone(), Arc::clone(&download_urls)).await?,
        ];

        Ok(Arc::new(ChromiumPage {
            page,
            responses,
            downloads,
            transfer,
            download_urls,
            pumps,
        }))
    }

    /// Close the browser and stop driving its connection.
    pub async fn close(mut self) -> BrowserResult<()> {
        let result = self.browser.close().await;
        self.handler_task.abort();
        result.map(|_| ()).map_err(protocol)
    }
}

/// Publish a `ResponseEvent` once a response body has finished loading.
async fn spawn_response_pump(
    page: &Page,
    tx: broadcast::Sender<ResponseEvent>,
) -> BrowserResult<JoinHandle<()>> {
    let mut received = page
        .event_listener::<EventResponseReceived>()
        .await
        .map_err(protocol)?;
    let mut finished = page
        .event_listener::<EventLoadingFinished>()
        .await
        .map_err(protocol)?;
    let mut failed = page
        .event_listener::<EventLoadingFailed>()
        .await
        .map_err(protocol)?;

    Ok(tokio::spawn(async move {
        let mut pending: HashMap<String, (String, u16)> = HashMap::new();
        loop {
            tokio::select! {
                Some(ev) = received.next() => {
                    let status = u16::try_from(ev.response.status).unwrap_or_default();
                    pending.insert(ev.request_id.inner().clone(), (ev.response.url.clone(), status));
                }
                Some(ev) = finished.next() => {
                    if let Some((url, status)) = pending.remove(ev.request_id.inner()) {
                        // No subscribers is fine; the event is simply dropped.
                        let _ = tx.send(ResponseEvent {
                            request_id: ev.request_id.inner().clone(),
                            url,
                            status,
                        });
                    }
                }
                Some(ev) = failed.next() => {
                    pending.remove(ev.request_id.inner());
                }
                else => break,
            }
        }
    }))
}

/// Publish download lifecycle events and remember each download's URL by GUID.
async fn spawn_download_pump(
    page: &Page,
    tx: broadcast::Sender<DownloadEvent>,
    urls: Arc<Mutex<HashMap<String, String>>>,
) -> BrowserResult<JoinHandle<()>> {
    let mut begins = page
        .event_listener::<EventDownloadWillBegin>()
        .await
        .map_err(protocol)?;
    let mut progress = page
        .event_listener::<EventDownloadProgress>()
        .await
        .map_err(protocol)?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(ev) = begins.next() => {
                    urls.lock().await.insert(ev.guid.clone(), ev.url.clone());
                    let _ = tx.send(DownloadEvent::Started {
                        guid: ev.guid.clone(),
                        suggested_filename: ev.suggested_filename.clone(),
                    });
                }
                Some(ev) = progress.next() => {
                    let event = match ev.state {
                        DownloadProgressState::Completed => DownloadEvent::Completed { guid: ev.guid.clone() },
                        DownloadProgressState::Canceled => DownloadEvent::Canceled { guid: ev.guid.clone() },
                        DownloadProgressState::InProgress => continue,
                    };
                    let _ = tx.send(event);
                }
                else => break,
            }
        }
    }))
}

/// A single Chromium tab.
pub struct ChromiumPage {
    page: Page,
    responses: broadcast::Sender<ResponseEvent>,
    downloads: broadcast::Sender<DownloadEvent>,
    transfer: DownloadTransfer,
    download_urls: Arc<Mutex<HashMap<String, String>>>,
    pumps: Vec<JoinHandle<()>>,
}

impl ChromiumPage {
    async fn refetch(&self, guid: &str, destination: &Path) -> BrowserResult<()> {
        let url = self
            .download_urls
            .lock()
            .await
            .remove(guid)
            .ok_or_else(|| BrowserError::DownloadMissing(guid.to_string()))?;
        debug!(guid, url = %url, "Fetching download through the page");
        let encoded = self.evaluate(&fetch_script(&url)).await?;
        let bytes = decode_fetched(&encoded)?;
        tokio::fs::write(destination, bytes).await?;
        Ok(())
    }
}

impl Drop for ChromiumPage {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

#[async_trait]
impl BrowserPage for ChromiumPage {
    async fn goto(&self, url: &str) -> BrowserResult<()> {
        let navigation = |e: chromiumoxide::error::CdpError| BrowserError::Navigation {
            url: url.to_string(),
            reason: e.to_string(),
        };
        self.page.goto(url).await.map_err(navigation)?;
        self.page.wait_for_navigation().await.map_err(navigation)?;
        Ok(())
    }

    async fn current_url(&self) -> BrowserResult<String> {
        let url = self
            .page
            .url()
            .await
            .map_err(protocol)?
            .map(|u| u.to_string())
            .unwrap_or_default();
        Ok(url)
    }

    async fn fill(&self, selector: &str, value: &str) -> BrowserResult<()> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|_| BrowserError::ElementNotFound(selector.to_string()))?;
        element.click().await.map_err(protocol)?;
        element.type_str(value).await.map_err(protocol)?;
        Ok(())
    }

    async fn click(&self, selector: &str) -> BrowserResult<()> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|_| BrowserError::ElementNotFound(selector.to_string()))?;
        element.click().await.map_err(protocol)?;
        Ok(())
    }

    async fn click_text(&self, label: &str) -> BrowserResult<()> {
        let xpath = format!("//*[contains(text(), {})]", xpath_literal(label));
        let element = self
            .page
            .find_xpath(xpath.as_str())
            .await
            .map_err(|_| BrowserError::ElementNotFound(xpath.clone()))?;
        element.click().await.map_err(protocol)?;
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> BrowserResult<serde_json::Value> {
        let params = EvaluateParams::builder()
            .expression(script)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(BrowserError::Protocol)?;
        let result = self
            .page
            .evaluate_expression(params)
            .await
            .map_err(protocol)?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn find_all(&self, xpath: &str) -> BrowserResult<Vec<Box<dyn PageElement>>> {
        let elements = self
            .page
            .find_xpaths(xpath)
            .await
            .map_err(|_| BrowserError::ElementNotFound(xpath.to_string()))?;
        Ok(elements
            .into_iter()
            .map(|e| Box::new(ChromiumElement(e)) as Box<dyn PageElement>)
            .collect())
    }

    fn subscribe_responses(&self) -> broadcast::Receiver<ResponseEvent> {
        self.responses.subscribe()
    }

    async fn response_body(&self, request_id: &str) -> BrowserResult<String> {
        let response = self
            .page
            .execute(GetResponseBodyParams::new(RequestId::new(request_id)))
            .await
            .map_err(protocol)?;
        if response.result.base64_encoded {
            let bytes = B64
                .decode(&response.result.body)
                .map_err(|e| BrowserError::Protocol(format!("invalid base64 body: {e}")))?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        } else {
            Ok(response.result.body.clone())
        }
    }

    fn subscribe_downloads(&self) -> broadcast::Receiver<DownloadEvent> {
        self.downloads.subscribe()
    }

    async fn save_download(&self, guid: &str, destination: &Path) -> BrowserResult<()> {
        match &self.transfer {
            DownloadTransfer::Staged(dir) => {
                self.download_urls.lock().await.remove(guid);
                move_staged(dir, guid, destination).await
            }
            DownloadTransfer::Refetch => self.refetch(guid, destination).await,
        }
    }

    async fn close(&self) -> BrowserResult<()> {
        self.page.clone().close().await.map_err(protocol)
    }
}

struct ChromiumElement(Element);

#[async_trait]
impl PageElement for ChromiumElement {
    async fn click(&self) -> BrowserResult<()> {
        self.0.click().await.map_err(protocol)?;
        Ok(())
    }

    async fn press_key(&self, key: &str) -> BrowserResult<()> {
        self.0.press_key(key).await.map_err(protocol)?;
        Ok(())
    }
}

fn protocol(e: chromiumoxide::error::CdpError) -> BrowserError {
    BrowserError::Protocol(e.to_string())
}

/// Move a download the browser stored under its GUID into place.
async fn move_staged(staging_dir: &Path, guid: &str, destination: &Path) -> BrowserResult<()> {
    let source = staging_dir.join(guid);
    if !tokio::fs::try_exists(&source).await? {
        return Err(BrowserError::DownloadMissing(guid.to_string()));
    }
    tokio::fs::rename(&source, destination).await?;
    Ok(())
}

/// Quote `value` as an XPath 1.0 string literal.
///
/// XPath has no escapes, so a value holding both quote kinds is split on `"`
/// and rebuilt with `concat()`.
fn xpath_literal(value: &str) -> String {
    if !value.contains('"') {
        format!("\"{value}\"")
    } else if !value.contains('\'') {
        format!("'{value}'")
    } else {
        let parts: Vec<String> = value.split('"').map(|part| format!("\"{part}\"")).collect();
        format!("concat({})", parts.join(", '\"', "))
    }
}

/// Script that fetches `url` with the page's cookies and resolves to the
/// body as base64.
fn fetch_script(url: &str) -> String {
    // A JSON string is a valid JavaScript string literal.
    let url = serde_json::Value::String(url.to_string());
    format!(
        r#"(async () => {{
  const response = await fetch({url}, {{ credentials: "include" }});
  if (!response.ok) throw new Error(`download failed with HTTP ${{response.status}}`);
  const bytes = new Uint8Array(await response.arrayBuffer());
  let binary = "";
  for (let i = 0; i < bytes.length; i += 0x8000) {{
    binary += String.fromCharCode.apply(null, bytes.subarray(i, i + 0x8000));
  }}
  return btoa(binary);
}})()"#
    )
}

fn decode_fetched(value: &serde_json::Value) -> BrowserResult<Vec<u8>> {
    let encoded = value
        .as_str()
        .ok_or_else(|| BrowserError::Protocol(format!("expected base64 download body, got {value}")))?;
    B64.decode(encoded)
        .map_err(|e| BrowserError::Protocol(format!("invalid base64 download body: {e}")))
}
