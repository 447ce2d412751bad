//! End-to-end run: sign in, count, capture, verify, export.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::browser::BrowserPage;
use crate::capture::capture;
use crate::config::HarvestConfig;
use crate::enumerate::enumerate;
use crate::manifest::{write_manifest, ITEM_COLUMNS};
use crate::session::{login, Preparing, Session, Unauthenticated};
use crate::types::HarvestResult;
use crate::verify::verify_counts;

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HarvestReport {
    /// Distinct items the library lists.
    pub expected: usize,
    /// Items downloaded (or already present) and exported.
    pub captured: usize,
    pub manifest_path: PathBuf,
}

/// Run the whole pipeline on a fresh page.
///
/// The manifest is written only after the counts match, so any failure
/// leaves no manifest behind.
pub async fn run(config: &HarvestConfig, page: Arc<dyn BrowserPage>) -> HarvestResult<HarvestReport> {
    tokio::fs::create_dir_all(&config.output_dir).await?;

    let session = Session::<Unauthenticated, Preparing>::assume(page);
    let session = login(session, config).await?;
    let (session, expected) = enumerate(session, config).await?;
    let (_session, items) = capture(session, config).await?;

    verify_counts(expected, items.len())?;

    let manifest_path = config.manifest_path();
    write_manifest(&manifest_path, items.sorted(), ITEM_COLUMNS).await?;
    info!(
        expected,
        captured = items.len(),
        manifest = %manifest_path.display(),
        "Run complete"
    );

    Ok(HarvestReport {
        expected,
        captured: items.len(),
        manifest_path,
    })
}
