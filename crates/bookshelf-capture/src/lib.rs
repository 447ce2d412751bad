//! Bookshelf Capture: retrieve every purchased item from a web storefront.
//!
//! The pipeline logs a browser session in, counts the library through the
//! storefront's own list API responses, opens every item to intercept its
//! detail response and download its file, verifies that nothing was lost and
//! exports a manifest.
//!
//! ```text
//! Session<Unauthenticated, Preparing>
//!     └─ login ──────► Session<Authenticated, Preparing>
//!         └─ enumerate ─► Session<Authenticated, Continuing> + expected count
//!             └─ capture ─► Session<Authenticated, Completed> + CaptureMap
//!                 └─ verify_counts ─► write_manifest
//! ```

pub mod browser;
pub mod capture;
pub mod config;
pub mod correlator;
pub mod enumerate;
pub mod manifest;
pub mod pipeline;
pub mod schema;
pub mod session;
pub mod types;
pub mod verify;

pub use browser::{BrowserError, BrowserPage, DownloadEvent, PageElement, ResponseEvent};
pub use capture::{capture, stored_file_name};
pub use config::{BrowserMode, ConfigError, Credentials, HarvestConfig, SiteProfile, Timing};
pub use correlator::{Correlator, ResponseMatcher, ResponseWaiter};
pub use enumerate::enumerate;
pub use manifest::{
    encode_manifest, write_manifest, FieldValue, ManifestColumn, ManifestError, ITEM_COLUMNS,
};
pub use pipeline::{run, HarvestReport};
pub use session::{
    login, Authenticated, Completed, Continuing, Preparing, Session, Unauthenticated,
};
pub use types::*;
pub use verify::{verify_counts, CountMismatchError};
