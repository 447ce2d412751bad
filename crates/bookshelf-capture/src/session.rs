//! Phase-tagged browser sessions.
//!
//! A [`Session`] wraps the single browser page the pipeline drives and tags
//! it, at the type level only, with an authentication phase and a pagination
//! phase. Each pipeline step consumes a session in the phase it requires and
//! returns one in the successor phase:
//!
//! ```text
//! (Unauthenticated, Preparing) ─login─► (Authenticated, Preparing)
//!   ─enumerate─► (Authenticated, Continuing) ─capture─► (Authenticated, Completed)
//! ```
//!
//! ```no_run
//! use std::sync::Arc;
//! use bookshelf_capture::*;
//!
//! async fn harvest(page: Arc<dyn BrowserPage>, config: &HarvestConfig) -> HarvestResult<CaptureMap> {
//!     let session = Session::<Unauthenticated, Preparing>::assume(page);
//!     let session = login(session, config).await?;
//!     let (session, _expected) = enumerate(session, config).await?;
//!     let (_session, items) = capture(session, config).await?;
//!     Ok(items)
//! }
//! ```
//!
//! Calling a step out of order does not compile:
//!
//! ```compile_fail
//! use std::sync::Arc;
//! use bookshelf_capture::*;
//!
//! async fn skip_login(page: Arc<dyn BrowserPage>, config: &HarvestConfig) {
//!     let fresh = Session::<Unauthenticated, Preparing>::assume(page);
//!     let _ = capture(fresh, config).await;
//! }
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::browser::BrowserPage;
use crate::config::{HarvestConfig, Timing};
use crate::types::{HarvestError, HarvestResult};

mod sealed {
    pub trait Sealed {}
}

/// Authentication dimension of a session tag.
pub trait AuthPhase: sealed::Sealed {}

/// Pagination dimension of a session tag.
pub trait PagePhase: sealed::Sealed {}

/// No credentials have been submitted yet.
pub enum Unauthenticated {}
/// The storefront accepted the credentials.
pub enum Authenticated {}
/// The library has not been walked yet.
pub enum Preparing {}
/// The library has been counted and is ready to be captured.
pub enum Continuing {}
/// Every item has been visited.
pub enum Completed {}

impl sealed::Sealed for Unauthenticated {}
impl sealed::Sealed for Authenticated {}
impl sealed::Sealed for Preparing {}
impl sealed::Sealed for Continuing {}
impl sealed::Sealed for Completed {}

impl AuthPhase for Unauthenticated {}
impl AuthPhase for Authenticated {}
impl PagePhase for Preparing {}
impl PagePhase for Continuing {}
impl PagePhase for Completed {}

/// A browser page tagged with its protocol phase.
pub struct Session<A: AuthPhase, P: PagePhase> {
    page: Arc<dyn BrowserPage>,
    _phase: PhantomData<fn() -> (A, P)>,
}

impl<A: AuthPhase, P: PagePhase> Session<A, P> {
    /// Tag a page with an explicit phase.
    ///
    /// This is an assertion, not a check: call it only once the page really
    /// is in that phase (e.g. a fresh tab sharing an authenticated browser).
    pub fn assume(page: Arc<dyn BrowserPage>) -> Self {
        Self {
            page,
            _phase: PhantomData,
        }
    }

    /// The underlying page.
    pub fn page(&self) -> &Arc<dyn BrowserPage> {
        &self.page
    }

    /// Release the page, dropping the tag.
    pub fn into_page(self) -> Arc<dyn BrowserPage> {
        self.page
    }

    /// Re-tag after the corresponding real-world transition has happened.
    pub(crate) fn advance<A2: AuthPhase, P2: PagePhase>(self) -> Session<A2, P2> {
        Session::assume(self.page)
    }
}

impl<A: AuthPhase, P: PagePhase> fmt::Debug for Session<A, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("auth", &std::any::type_name::<A>())
            .field("page", &std::any::type_name::<P>())
            .finish_non_exhaustive()
    }
}

/// Sign in with the configured credentials.
///
/// Navigates to the sign-in page, submits the form and waits until the
/// storefront redirects to the post-login page.
pub async fn login(
    session: Session<Unauthenticated, Preparing>,
    config: &HarvestConfig,
) -> HarvestResult<Session<Authenticated, Preparing>> {
    let site = &config.site;
    let page = session.page();
    info!(email = %config.credentials.email, "Signing in");

    page.goto(&site.url(&site.signin_path)).await?;
    page.fill(&site.email_selector, &config.credentials.email)
        .await?;
    page.fill(&site.password_selector, config.credentials.password())
        .await?;
    page.click(&site.submit_selector).await?;

    wait_for_url(page.as_ref(), &site.url(&site.post_login_path), &config.timing).await?;
    info!("Signed in");

    Ok(session.advance())
}

/// Poll the page URL until it equals `target` (ignoring a trailing slash).
async fn wait_for_url(page: &dyn BrowserPage, target: &str, timing: &Timing) -> HarvestResult<()> {
    let deadline = Instant::now() + timing.wait_timeout;
    let target = target.trim_end_matches('/');
    loop {
        let current = page.current_url().await?;
        if current.trim_end_matches('/') == target {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(HarvestError::Timeout {
                what: format!("navigation to {target} (still at {current})"),
                after_ms: timing.wait_timeout.as_millis() as u64,
            });
        }
        debug!(current = %current, target, "Waiting for URL");
        tokio::time::sleep(timing.poll_interval).await;
    }
}
