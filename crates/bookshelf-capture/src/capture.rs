//! Capture phase: open every item, intercept its detail and save its file.
//!
//! Items are processed strictly one at a time. Detail responses are matched
//! by operation name only, so two detail requests must never be in flight at
//! once; keep this loop sequential unless correlation learns to match on the
//! item identifier.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::browser::{BrowserError, BrowserPage, DownloadEvent, PageElement};
use crate::config::HarvestConfig;
use crate::correlator::{ResponseMatcher, ResponseWaiter};
use crate::enumerate::lazy_load;
use crate::schema::DetailResponse;
use crate::session::{Authenticated, Completed, Continuing, Session};
use crate::types::{CaptureMap, CapturedItem, HarvestError, HarvestResult};

/// Name a downloaded file is stored under: the item identifier, an
/// underscore, then the name the storefront suggested.
///
/// The result is always a single path component. Separators, reserved
/// characters and control characters in either part become `_`.
pub fn stored_file_name(id: &str, suggested: &str) -> String {
    format!("{id}_{suggested}")
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// Visit every item on the bookshelf and download what can be downloaded.
pub async fn capture(
    session: Session<Authenticated, Continuing>,
    config: &HarvestConfig,
) -> HarvestResult<(Session<Authenticated, Completed>, CaptureMap)> {
    let site = &config.site;
    let page = Arc::clone(session.page());
    tokio::fs::create_dir_all(&config.output_dir).await?;

    page.goto(&site.url(&site.bookshelf_path)).await?;
    lazy_load(page.as_ref(), &config.timing).await?;

    let affordances = mounted_affordances(page.as_ref(), &site.item_xpath, config).await?;
    info!(items = affordances.len(), "Capturing items");

    let mut items = CaptureMap::new();
    // Later items first: opening one may shift the layout after it, never before it.
    for (index, affordance) in affordances.iter().enumerate().rev() {
        debug!(index, "Opening item");
        capture_item(&page, affordance.as_ref(), config, &mut items).await?;
        affordance.press_key(&site.dismiss_key).await?;
    }

    info!(captured = items.len(), "Capture finished");
    Ok((session.advance(), items))
}

/// Wait until at least one item affordance is mounted.
///
/// An empty bookshelf is not an error: once the wait times out the empty
/// list is returned and verification decides.
async fn mounted_affordances(
    page: &dyn BrowserPage,
    xpath: &str,
    config: &HarvestConfig,
) -> HarvestResult<Vec<Box<dyn PageElement>>> {
    let deadline = Instant::now() + config.timing.wait_timeout;
    loop {
        match page.find_all(xpath).await {
            Ok(found) if !found.is_empty() => return Ok(found),
            Ok(_) | Err(BrowserError::ElementNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        if Instant::now() >= deadline {
            warn!(xpath, "No items mounted on the bookshelf");
            return Ok(Vec::new());
        }
        tokio::time::sleep(config.timing.poll_interval).await;
    }
}

async fn capture_item(
    page: &Arc<dyn BrowserPage>,
    affordance: &dyn PageElement,
    config: &HarvestConfig,
    items: &mut CaptureMap,
) -> HarvestResult<()> {
    let site = &config.site;
    let detail_waiter = ResponseWaiter::arm(
        page,
        ResponseMatcher::operation(site.detail_operation.as_str()),
    );
    affordance.click().await?;
    let detail: DetailResponse = detail_waiter.wait_json(config.timing.wait_timeout).await?;

    let Some(item) = detail.downloadable() else {
        warn!(
            title = detail.product_name().unwrap_or("<unknown>"),
            "Skipping item without download content"
        );
        return Ok(());
    };
    info!(
        id = %item.id,
        title = %item.title,
        organization = %item.organization_name,
        "Item detail loaded"
    );

    let reusable = existing_download(
        &config.output_dir,
        &item.id,
        item.file_name.as_deref(),
        config.force_download,
    )
    .await?;
    let file_name = match reusable {
        Some(existing) => {
            info!(file = %existing, "Already downloaded");
            existing
        }
        None => download(page.as_ref(), config, &item.id).await?,
    };

    items.insert(CapturedItem {
        id: item.id,
        title: item.title,
        organization_name: item.organization_name,
        caused_at: item.caused_at,
        file_name,
    });
    Ok(())
}

/// Click the download control and store the file under its prefixed name.
async fn download(page: &dyn BrowserPage, config: &HarvestConfig, id: &str) -> HarvestResult<String> {
    let timeout = config.timing.wait_timeout;
    let mut downloads = page.subscribe_downloads();
    page.click_text(&config.site.download_label).await?;

    let (guid, suggested) = tokio::time::timeout(timeout, next_completed_download(&mut downloads))
        .await
        .map_err(|_| HarvestError::Timeout {
            what: format!("download of {id}"),
            after_ms: timeout.as_millis() as u64,
        })??;

    let file_name = stored_file_name(id, &suggested);
    let destination = config.output_dir.join(&file_name);
    page.save_download(&guid, &destination).await?;
    info!(path = %destination.display(), "Downloaded");
    Ok(file_name)
}

async fn next_completed_download(
    downloads: &mut broadcast::Receiver<DownloadEvent>,
) -> HarvestResult<(String, String)> {
    let mut started: HashMap<String, String> = HashMap::new();
    loop {
        match downloads.recv().await {
            Ok(DownloadEvent::Started {
                guid,
                suggested_filename,
            }) => {
                started.insert(guid, suggested_filename);
            }
            Ok(DownloadEvent::Completed { guid }) => {
                if let Some(suggested) = started.remove(&guid) {
                    return Ok((guid, suggested));
                }
            }
            Ok(DownloadEvent::Canceled { guid }) => {
                if started.contains_key(&guid) {
                    return Err(BrowserError::DownloadCanceled(guid).into());
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Download subscription lagged");
            }
            Err(RecvError::Closed) => {
                return Err(BrowserError::Protocol("download stream closed".to_string()).into());
            }
        }
    }
}

/// The file stored for `id` on an earlier run, unless downloads are forced.
///
/// Only the exact name this item would be stored under counts. Without a
/// declared file name there is nothing to compare against, so the item is
/// downloaded again.
async fn existing_download(
    dir: &Path,
    id: &str,
    declared: Option<&str>,
    force: bool,
) -> HarvestResult<Option<String>> {
    let Some(declared) = declared.filter(|_| !force) else {
        return Ok(None);
    };
    let name = stored_file_name(id, declared);
    match tokio::fs::metadata(dir.join(&name)).await {
        Ok(meta) if meta.is_file() => Ok(Some(name)),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
