//! bookshelf-capture: entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use bookshelf_capture::browser::chromium::{find_chromium, ChromiumBrowser};
use bookshelf_capture::{BrowserMode, BrowserPage, HarvestConfig, HarvestError};

#[derive(Parser)]
#[command(
    name = "bookshelf-capture",
    about = "Download every purchased item from your bookshelf and export a manifest",
    version
)]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Read environment variables from this file instead of ./.env.
    #[arg(long)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in, download the library and write the manifest (default).
    Run(RunArgs),

    /// Resolve the configuration and report what a run would use.
    Check,

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   bookshelf-capture completions bash > ~/.local/share/bash-completion/completions/bookshelf-capture
    ///   bookshelf-capture completions zsh > ~/.zfunc/_bookshelf-capture
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

#[derive(clap::Args, Default)]
struct RunArgs {
    /// Directory downloads and the manifest are written to.
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// File name of the manifest inside the output directory.
    #[arg(long)]
    manifest_name: Option<String>,

    /// Re-download items that already exist in the output directory.
    #[arg(long)]
    force_download: bool,

    /// Attach to a running browser at this DevTools WebSocket endpoint.
    #[arg(long, conflicts_with = "headless")]
    endpoint: Option<String>,

    /// Launch the local browser without a window. Ignored when attaching
    /// to a remote browser.
    #[arg(long)]
    headless: bool,
}

impl RunArgs {
    fn apply(self, config: &mut HarvestConfig) {
        if let Some(dir) = self.output_dir {
            config.output_dir = dir;
        }
        if let Some(name) = self.manifest_name {
            config.manifest_name = name;
        }
        if self.force_download {
            config.force_download = true;
        }
        if let Some(endpoint) = self.endpoint {
            config.browser = BrowserMode::Remote { endpoint };
        }
        if self.headless {
            match &mut config.browser {
                BrowserMode::Local { headless } => *headless = true,
                BrowserMode::Remote { endpoint } => {
                    tracing::warn!(%endpoint, "--headless has no effect on a remote browser");
                }
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = dispatch(cli).await {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            let mut config = load_config(cli.env_file.as_deref())?;
            args.apply(&mut config);
            run(config).await?;
        }

        Commands::Check => {
            let config = load_config(cli.env_file.as_deref())?;
            println!("Account: {}", config.credentials.email);
            match &config.browser {
                BrowserMode::Remote { endpoint } => println!("Browser: remote at {endpoint}"),
                BrowserMode::Local { .. } => match find_chromium() {
                    Some(path) => println!("Browser: local {}", path.display()),
                    None => anyhow::bail!("no local Chrome/Chromium found"),
                },
            }
            println!("Output: {}", config.output_dir.display());
            println!("Manifest: {}", config.manifest_path().display());
            println!("Force download: {}", config.force_download);
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "bookshelf-capture", &mut std::io::stdout());
        }
    }

    Ok(())
}

fn load_config(env_file: Option<&std::path::Path>) -> anyhow::Result<HarvestConfig> {
    match env_file {
        Some(path) => {
            dotenv::from_path(path)
                .with_context(|| format!("failed to read env file {}", path.display()))?;
        }
        None => {
            // A missing ./.env is fine; variables may come from the shell.
            let _ = dotenv::dotenv();
        }
    }
    Ok(HarvestConfig::from_env()?)
}

async fn run(config: HarvestConfig) -> anyhow::Result<()> {
    let browser = ChromiumBrowser::open(&config.browser).await?;
    let page = browser.new_page(&config.staging_dir()).await?;
    let page: Arc<dyn BrowserPage> = page;

    let result = bookshelf_capture::run(&config, Arc::clone(&page)).await;

    if let Err(e) = page.close().await {
        tracing::debug!(error = %e, "Failed to close page");
    }
    drop(page);
    if let Err(e) = browser.close().await {
        tracing::warn!(error = %e, "Failed to close browser");
    }

    match result {
        Ok(report) => {
            println!(
                "Captured {}/{} items. Manifest: {}",
                report.captured,
                report.expected,
                report.manifest_path.display()
            );
            Ok(())
        }
        Err(HarvestError::CountMismatch(mismatch)) => Err(anyhow::Error::new(mismatch)
            .context("download incomplete, no manifest was written")),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bookshelf_capture::Credentials;

    fn config(browser: BrowserMode) -> HarvestConfig {
        HarvestConfig::new(Credentials::new("reader@example.com", "secret"), browser)
    }

    fn args(argv: &[&str]) -> RunArgs {
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Some(Commands::Run(args)) => args,
            _ => panic!("expected the run command"),
        }
    }

    #[test]
    fn test_headless_keeps_remote_browser() {
        let endpoint = "ws://127.0.0.1:3000/".to_string();
        let mut config = config(BrowserMode::Remote {
            endpoint: endpoint.clone(),
        });

        args(&["bookshelf-capture", "run", "--headless"]).apply(&mut config);

        assert_eq!(config.browser, BrowserMode::Remote { endpoint });
    }

    #[test]
    fn test_headless_applies_to_local_browser() {
        let mut config = config(BrowserMode::Local { headless: false });

        args(&["bookshelf-capture", "run", "--headless"]).apply(&mut config);

        assert_eq!(config.browser, BrowserMode::Local { headless: true });
    }

    #[test]
    fn test_endpoint_switches_to_remote() {
        let mut config = config(BrowserMode::Local { headless: false });

        args(&["bookshelf-capture", "run", "--endpoint", "ws://browser:9222/"]).apply(&mut config);

        assert_eq!(
            config.browser,
            BrowserMode::Remote {
                endpoint: "ws://browser:9222/".to_string()
            }
        );
    }

    #[test]
    fn test_endpoint_and_headless_conflict() {
        let parsed = Cli::try_parse_from([
            "bookshelf-capture",
            "run",
            "--endpoint",
            "ws://browser:9222/",
            "--headless",
        ]);
        assert!(parsed.is_err());
    }
}
