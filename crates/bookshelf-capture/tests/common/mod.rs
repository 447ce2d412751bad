//! Scripted in-memory browser page for integration tests.
//!
//! The page plays back a fixed storefront: visiting the bookshelf emits the
//! configured list-response bursts followed by an image response, clicking
//! item affordance `i` emits detail response `i`, and clicking the download
//! label emits a started/completed download pair for the open item.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use bookshelf_capture::browser::{BrowserResult, EVENT_CHANNEL_CAPACITY};
use bookshelf_capture::enumerate::SCROLL_HEIGHT_SCRIPT;
use bookshelf_capture::{
    BrowserError, BrowserMode, BrowserPage, Credentials, DownloadEvent, HarvestConfig,
    PageElement, ResponseEvent, SiteProfile, Timing,
};

pub const EMAIL: &str = "reader@example.com";
pub const PASSWORD: &str = "hunter2";
pub const BASE_URL: &str = "https://shop.test";
pub const DOCUMENT_HEIGHT: u64 = 250;

// ─────────────────────── response bodies ───────────────────────

/// A list response carrying `ids` as edges.
pub fn list_body(ids: &[&str], has_next_page: bool) -> Value {
    let edges: Vec<Value> = ids
        .iter()
        .map(|id| {
            json!({
                "node": {
                    "id": format!("BookShelfItem:{id}"),
                    "product": { "databaseID": id, "name": format!("Book {id}") }
                },
                "cursor": format!("cursor-{id}")
            })
        })
        .collect();
    json!({
        "data": { "viewer": { "id": "User:1", "bookShelfItems": {
            "pageInfo": { "hasNextPage": has_next_page, "endCursor": "" },
            "edges": edges
        } } }
    })
}

/// A detail response; `file` is the suggested download name, `None` when the
/// item has no downloadable content.
pub fn detail_body(id: &str, file: Option<&str>) -> Value {
    let mut product = json!({
        "databaseID": id,
        "name": format!("Book {id}"),
        "organization": { "name": format!("Circle {id}") }
    });
    if let Some(file) = file {
        product["downloadContent"] = json!({
            "fileName": file,
            "downloadURL": format!("/api/product-dlc/{id}/download")
        });
    }
    json!({
        "data": { "node": {
            "id": format!("BookShelfItem:{id}"),
            "causedAt": "2025-06-01T12:34:56+09:00",
            "product": product
        } }
    })
}

// ─────────────────────── configuration ───────────────────────

pub fn site() -> SiteProfile {
    SiteProfile {
        base_url: BASE_URL.to_string(),
        ..SiteProfile::default()
    }
}

/// Fast timings so that waits which are expected to expire do so quickly.
pub fn timing() -> Timing {
    Timing {
        wait_timeout: Duration::from_millis(300),
        poll_interval: Duration::from_millis(10),
        scroll_step_px: 100,
        scroll_delay: Duration::ZERO,
    }
}

pub fn config(output_dir: &Path) -> HarvestConfig {
    let mut config = HarvestConfig::new(
        Credentials::new(EMAIL, PASSWORD),
        BrowserMode::Local { headless: true },
    );
    config.site = site();
    config.timing = timing();
    config.output_dir = output_dir.to_path_buf();
    config
}

// ─────────────────────── scripted page ───────────────────────

/// What the storefront serves.
#[derive(Default, Clone)]
pub struct Script {
    /// One list-response body per burst, emitted on each bookshelf visit.
    pub list_bursts: Vec<Value>,
    /// Detail body per item affordance, in document order.
    pub details: Vec<Value>,
}

impl Script {
    /// Bursts of identifiers; every item is downloadable unless listed in
    /// `without_download`.
    pub fn library(bursts: &[&[&str]], without_download: &[&str]) -> Self {
        let list_bursts = bursts.iter().map(|ids| list_body(ids, false)).collect();
        let details = bursts
            .iter()
            .flat_map(|ids| ids.iter())
            .map(|id| {
                if without_download.contains(id) {
                    detail_body(id, None)
                } else {
                    detail_body(id, Some(format!("{id}.pdf").as_str()))
                }
            })
            .collect();
        Self {
            list_bursts,
            details,
        }
    }
}

#[derive(Default)]
struct State {
    url: String,
    fields: HashMap<String, String>,
    bodies: HashMap<String, String>,
    next_request: u64,
    next_download: u64,
    open_item: Option<usize>,
    clicked: Vec<usize>,
    keys: Vec<String>,
    scrolls: Vec<u64>,
    saved: Vec<PathBuf>,
}

struct Inner {
    site: SiteProfile,
    script: Script,
    state: Mutex<State>,
    responses: broadcast::Sender<ResponseEvent>,
    downloads: broadcast::Sender<DownloadEvent>,
}

impl Inner {
    fn emit_response(&self, url: String, status: u16, body: String) {
        let request_id = {
            let mut state = self.state.lock().unwrap();
            state.next_request += 1;
            let id = format!("req-{}", state.next_request);
            state.bodies.insert(id.clone(), body);
            id
        };
        let _ = self.responses.send(ResponseEvent {
            request_id,
            url,
            status,
        });
    }

    fn graphql_url(&self, operation: &str) -> String {
        format!(
            "{}/api/graphql?operationName={operation}&variables=%7B%7D",
            self.site.base_url
        )
    }

    fn open_item(&self, index: usize) {
        {
            let mut state = self.state.lock().unwrap();
            state.open_item = Some(index);
            state.clicked.push(index);
        }
        if let Some(detail) = self.script.details.get(index) {
            let url = self.graphql_url(&self.site.detail_operation);
            self.emit_response(url, 200, detail.to_string());
        }
    }

    fn on_bookshelf(&self) -> bool {
        self.state.lock().unwrap().url == self.site.url(&self.site.bookshelf_path)
    }
}

/// An in-memory [`BrowserPage`] playing back a [`Script`].
#[derive(Clone)]
pub struct ScriptedPage {
    inner: Arc<Inner>,
}

impl ScriptedPage {
    pub fn new(script: Script) -> Self {
        let (responses, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (downloads, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                site: site(),
                script,
                state: Mutex::new(State {
                    url: "about:blank".to_string(),
                    ..State::default()
                }),
                responses,
                downloads,
            }),
        }
    }

    pub fn shared(&self) -> Arc<dyn BrowserPage> {
        Arc::new(self.clone())
    }

    /// Emit a GraphQL response for `operation` with an arbitrary body.
    pub fn emit_operation(&self, operation: &str, body: &str) {
        let url = self.inner.graphql_url(operation);
        self.inner.emit_response(url, 200, body.to_string());
    }

    /// Affordance indices in the order they were clicked.
    pub fn clicked(&self) -> Vec<usize> {
        self.inner.state.lock().unwrap().clicked.clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.state.lock().unwrap().keys.clone()
    }

    pub fn scrolls(&self) -> Vec<u64> {
        self.inner.state.lock().unwrap().scrolls.clone()
    }

    /// Destinations of every saved download.
    pub fn saved(&self) -> Vec<PathBuf> {
        self.inner.state.lock().unwrap().saved.clone()
    }
}

#[async_trait]
impl BrowserPage for ScriptedPage {
    async fn goto(&self, url: &str) -> BrowserResult<()> {
        self.inner.state.lock().unwrap().url = url.to_string();
        if self.inner.on_bookshelf() {
            for burst in &self.inner.script.list_bursts {
                let url = self.inner.graphql_url(&self.inner.site.list_operation);
                self.inner.emit_response(url, 200, burst.to_string());
            }
            let cover = format!("{}{}cover.png", self.inner.site.base_url, self.inner.site.render_marker);
            self.inner.emit_response(cover, 200, String::new());
        }
        Ok(())
    }

    async fn current_url(&self) -> BrowserResult<String> {
        Ok(self.inner.state.lock().unwrap().url.clone())
    }

    async fn fill(&self, selector: &str, value: &str) -> BrowserResult<()> {
        self.inner
            .state
            .lock()
            .unwrap()
            .fields
            .insert(selector.to_string(), value.to_string());
        Ok(())
    }

    async fn click(&self, selector: &str) -> BrowserResult<()> {
        let site = &self.inner.site;
        if selector != site.submit_selector {
            return Err(BrowserError::ElementNotFound(selector.to_string()));
        }
        let mut state = self.inner.state.lock().unwrap();
        let accepted = state.fields.get(&site.email_selector).map(String::as_str) == Some(EMAIL)
            && state.fields.get(&site.password_selector).map(String::as_str) == Some(PASSWORD);
        if accepted {
            state.url = site.url(&site.post_login_path);
        }
        Ok(())
    }

    async fn click_text(&self, label: &str) -> BrowserResult<()> {
        if label != self.inner.site.download_label {
            return Err(BrowserError::ElementNotFound(label.to_string()));
        }
        let open = self.inner.state.lock().unwrap().open_item;
        let file_name = open
            .and_then(|i| self.inner.script.details.get(i))
            .and_then(|d| d["data"]["node"]["product"]["downloadContent"]["fileName"].as_str())
            .map(str::to_string)
            .ok_or_else(|| BrowserError::ElementNotFound(label.to_string()))?;

        let guid = {
            let mut state = self.inner.state.lock().unwrap();
            state.next_download += 1;
            format!("guid-{}", state.next_download)
        };
        let _ = self.inner.downloads.send(DownloadEvent::Started {
            guid: guid.clone(),
            suggested_filename: file_name,
        });
        let _ = self.inner.downloads.send(DownloadEvent::Completed { guid });
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> BrowserResult<Value> {
        if script == SCROLL_HEIGHT_SCRIPT {
            return Ok(json!(DOCUMENT_HEIGHT));
        }
        if let Some(y) = script
            .strip_prefix("window.scrollTo(0, ")
            .and_then(|rest| rest.strip_suffix(')'))
            .and_then(|y| y.parse().ok())
        {
            self.inner.state.lock().unwrap().scrolls.push(y);
        }
        Ok(Value::Null)
    }

    async fn find_all(&self, xpath: &str) -> BrowserResult<Vec<Box<dyn PageElement>>> {
        if xpath != self.inner.site.item_xpath || !self.inner.on_bookshelf() {
            return Ok(Vec::new());
        }
        Ok((0..self.inner.script.details.len())
            .map(|index| {
                Box::new(ScriptedElement {
                    inner: Arc::clone(&self.inner),
                    index,
                }) as Box<dyn PageElement>
            })
            .collect())
    }

    fn subscribe_responses(&self) -> broadcast::Receiver<ResponseEvent> {
        self.inner.responses.subscribe()
    }

    async fn response_body(&self, request_id: &str) -> BrowserResult<String> {
        self.inner
            .state
            .lock()
            .unwrap()
            .bodies
            .get(request_id)
            .cloned()
            .ok_or_else(|| BrowserError::Protocol(format!("no body for {request_id}")))
    }

    fn subscribe_downloads(&self) -> broadcast::Receiver<DownloadEvent> {
        self.inner.downloads.subscribe()
    }

    async fn save_download(&self, guid: &str, destination: &Path) -> BrowserResult<()> {
        std::fs::write(destination, format!("%PDF {guid}"))?;
        self.inner
            .state
            .lock()
            .unwrap()
            .saved
            .push(destination.to_path_buf());
        Ok(())
    }

    async fn close(&self) -> BrowserResult<()> {
        Ok(())
    }
}

struct ScriptedElement {
    inner: Arc<Inner>,
    index: usize,
}

#[async_trait]
impl PageElement for ScriptedElement {
    async fn click(&self) -> BrowserResult<()> {
        self.inner.open_item(self.index);
        Ok(())
    }

    async fn press_key(&self, key: &str) -> BrowserResult<()> {
        let mut state = self.inner.state.lock().unwrap();
        state.keys.push(key.to_string());
        if key == self.inner.site.dismiss_key {
            state.open_item = None;
        }
        Ok(())
    }
}
