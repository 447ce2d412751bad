//! Enumeration phase: count the library from intercepted list responses.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::browser::BrowserPage;
use crate::config::{HarvestConfig, Timing};
use crate::correlator::{Correlator, ResponseMatcher, ResponseWaiter};
use crate::schema::ListResponse;
use crate::session::{Authenticated, Continuing, Preparing, Session};
use crate::types::{HarvestResult, ItemId};

/// Script returning the current document height in pixels.
pub const SCROLL_HEIGHT_SCRIPT: &str = "document.body.scrollHeight";

/// Script scrolling the window to a vertical offset.
pub fn scroll_script(y: u64) -> String {
    format!("window.scrollTo(0, {y})")
}

/// Open the bookshelf and count the distinct items the storefront lists.
///
/// The count comes from every list response observed while the page renders
/// and lazy-loads; it is the ground truth the capture phase is verified
/// against, not a pagination driver.
pub async fn enumerate(
    session: Session<Authenticated, Preparing>,
    config: &HarvestConfig,
) -> HarvestResult<(Session<Authenticated, Continuing>, usize)> {
    let site = &config.site;
    let page = Arc::clone(session.page());

    let correlator = Correlator::spawn(Arc::clone(&page), &site.list_operation, list_item_ids);
    let rendered = ResponseWaiter::arm(
        &page,
        ResponseMatcher::url_fragment(site.render_marker.as_str(), Some(200)),
    );

    page.goto(&site.url(&site.bookshelf_path)).await?;
    rendered.wait(config.timing.wait_timeout).await?;
    lazy_load(page.as_ref(), &config.timing).await?;

    let ids: HashSet<ItemId> = correlator.finish().await?.into_iter().collect();
    info!(expected = ids.len(), "Library enumerated");

    Ok((session.advance(), ids.len()))
}

fn list_item_ids(body: &str) -> Result<Vec<ItemId>, serde_json::Error> {
    let response: ListResponse = serde_json::from_str(body)?;
    if let Some(info) = response.page_info() {
        debug!(
            has_next_page = info.has_next_page,
            end_cursor = %info.end_cursor,
            "List page received"
        );
    }
    Ok(response.item_ids())
}

/// Scroll to the bottom and back to the top so lazily mounted items render.
///
/// The height is re-read on the way down because mounting items grows the
/// document.
pub async fn lazy_load(page: &dyn BrowserPage, timing: &Timing) -> HarvestResult<()> {
    let step = u64::from(timing.scroll_step_px.max(1));

    let mut y = 0;
    while y < document_height(page).await? {
        page.evaluate(&scroll_script(y)).await?;
        tokio::time::sleep(timing.scroll_delay).await;
        y += step;
    }

    let mut y = document_height(page).await?;
    while y > 0 {
        page.evaluate(&scroll_script(y)).await?;
        tokio::time::sleep(timing.scroll_delay).await;
        y = y.saturating_sub(step);
    }
    Ok(())
}

async fn document_height(page: &dyn BrowserPage) -> HarvestResult<u64> {
    let height = page.evaluate(SCROLL_HEIGHT_SCRIPT).await?;
    Ok(height.as_f64().map_or(0, |h| h.max(0.0) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_body_decodes_to_ids() {
        let body = r#"{"data":{"viewer":{"bookShelfItems":{
            "pageInfo":{"hasNextPage":false,"endCursor":""},
            "edges":[{"node":{"product":{"databaseID":"z9"}}}]}}}}"#;
        assert_eq!(list_item_ids(body).unwrap(), vec!["z9".to_string()]);
    }

    #[test]
    fn test_malformed_list_body_is_an_error() {
        assert!(list_item_ids("<html>").is_err());
    }

    #[test]
    fn test_scroll_script() {
        assert_eq!(scroll_script(300), "window.scrollTo(0, 300)");
    }
}
