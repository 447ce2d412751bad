//! Configuration loading and resolution.
//!
//! A [`HarvestConfig`] is built once at startup and passed by reference into
//! every phase. Values come from the process environment (the binary may seed
//! it from a `.env` file first); the binary applies its own flag overrides on
//! the resulting struct.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_EMAIL: &str = "EMAIL";
pub const ENV_PASSWORD: &str = "PASSWORD";
pub const ENV_USE_DOCKER_BROWSER: &str = "USE_DOCKER_BROWSER";
pub const ENV_FORCE_DOWNLOAD: &str = "FORCE_DOWNLOAD_BOOKS";
pub const ENV_WS_ENDPOINT: &str = "BROWSER_WS_ENDPOINT";
pub const ENV_OUTPUT_DIR: &str = "BOOKSHELF_OUTPUT_DIR";

pub const DEFAULT_WS_ENDPOINT: &str = "ws://127.0.0.1:3000/";
pub const DEFAULT_OUTPUT_DIR: &str = "./downloads/";
pub const DEFAULT_MANIFEST_NAME: &str = "book_list.csv";

/// Errors raised while resolving configuration.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Environment variable {0} must be set")]
    Missing(&'static str),

    #[error("Environment variable {0} must not be empty")]
    Empty(&'static str),

    #[error("Environment variable {name} must be '0 (false)' or '1 (true)', got '{value}'")]
    InvalidFlag { name: &'static str, value: String },
}

/// Storefront login credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Which browser the pipeline drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserMode {
    /// Attach to an already running browser over its DevTools WebSocket.
    Remote { endpoint: String },
    /// Launch a local Chrome/Chromium.
    Local { headless: bool },
}

/// Everything that is specific to the target storefront.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteProfile {
    pub base_url: String,
    pub signin_path: String,
    /// Page the storefront redirects to after a successful login.
    pub post_login_path: String,
    pub bookshelf_path: String,
    pub email_selector: String,
    pub password_selector: String,
    pub submit_selector: String,
    /// XPath of the per-item buttons on the bookshelf page.
    pub item_xpath: String,
    /// Visible label of the download control inside the detail view.
    pub download_label: String,
    /// Key that dismisses the detail view.
    pub dismiss_key: String,
    /// GraphQL operation returning bookshelf pages.
    pub list_operation: String,
    /// GraphQL operation returning a single item's detail.
    pub detail_operation: String,
    /// URL fragment of responses that only arrive once the list has rendered.
    pub render_marker: String,
}

impl Default for SiteProfile {
    fn default() -> Self {
        Self {
            base_url: "https://techbookfest.org".to_string(),
            signin_path: "/user/signin".to_string(),
            post_login_path: "/mypage".to_string(),
            bookshelf_path: "/mypage/bookshelf".to_string(),
            email_selector: "#email".to_string(),
            password_selector: "#password".to_string(),
            submit_selector: "button[type='submit']".to_string(),
            item_xpath: "//div/div/div/div/div/div/div[2]/div/div[1]/div[2]/div/div[*]/div/div/button"
                .to_string(),
            download_label: "ダウンロード".to_string(),
            dismiss_key: "Escape".to_string(),
            list_operation: "BookShelfQuery".to_string(),
            detail_operation: "BookShelfItemDetailQuery".to_string(),
            render_marker: "/api/image/".to_string(),
        }
    }
}

impl SiteProfile {
    /// Absolute URL for a storefront path.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Waits and lazy-load pacing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timing {
    /// Upper bound for every wait on the browser (responses, downloads, URLs).
    pub wait_timeout: Duration,
    /// How often polled conditions are re-checked.
    pub poll_interval: Duration,
    /// Pixels scrolled per lazy-load step.
    pub scroll_step_px: u32,
    /// Pause after each lazy-load step.
    pub scroll_delay: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            scroll_step_px: 100,
            scroll_delay: Duration::from_millis(50),
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub credentials: Credentials,
    pub browser: BrowserMode,
    pub site: SiteProfile,
    pub timing: Timing,
    pub output_dir: PathBuf,
    pub manifest_name: String,
    /// Re-download items whose file already exists in `output_dir`.
    pub force_download: bool,
}

impl HarvestConfig {
    /// Configuration with defaults for everything but the credentials.
    pub fn new(credentials: Credentials, browser: BrowserMode) -> Self {
        Self {
            credentials,
            browser,
            site: SiteProfile::default(),
            timing: Timing::default(),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            manifest_name: DEFAULT_MANIFEST_NAME.to_string(),
            force_download: false,
        }
    }

    /// Resolve the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolve the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let email = required(&lookup, ENV_EMAIL)?;
        let password = required(&lookup, ENV_PASSWORD)?;
        let use_remote = flag(&lookup, ENV_USE_DOCKER_BROWSER)?;
        let force_download = flag(&lookup, ENV_FORCE_DOWNLOAD)?;

        let browser = if use_remote {
            BrowserMode::Remote {
                endpoint: lookup(ENV_WS_ENDPOINT)
                    .filter(|v| !v.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_WS_ENDPOINT.to_string()),
            }
        } else {
            BrowserMode::Local { headless: false }
        };

        let mut config = Self::new(Credentials::new(email, password), browser);
        config.force_download = force_download;
        if let Some(dir) = lookup(ENV_OUTPUT_DIR).filter(|v| !v.trim().is_empty()) {
            config.output_dir = PathBuf::from(dir);
        }
        Ok(config)
    }

    /// Where the manifest is written.
    pub fn manifest_path(&self) -> PathBuf {
        self.output_dir.join(&self.manifest_name)
    }

    /// Directory the browser writes in-flight downloads to.
    pub fn staging_dir(&self) -> PathBuf {
        self.output_dir.join(".incoming")
    }
}

fn required<F>(lookup: &F, name: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Err(ConfigError::Missing(name)),
        Some(v) if v.is_empty() => Err(ConfigError::Empty(name)),
        Some(v) => Ok(v),
    }
}

fn flag<F>(lookup: &F, name: &'static str) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name).ok_or(ConfigError::Missing(name))?.trim() {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(ConfigError::InvalidFlag {
            name,
            value: other.to_string(),
        }),
    }
}
