use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use tower_lsp::lsp_types::Url;
use tracing::info;

use codeowners_client::config::{self, ExtensionConfig};
use codeowners_client::log;
use codeowners_client::lsp::Session;
use codeowners_client::provision::Provisioner;
use codeowners_client::release::GitHubReleaseFeed;

#[derive(Parser)]
#[command(name = "codeowners-client", version, about)]
struct Cli {
    /// JSON settings file (defaults to settings.json in the data directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Directory holding the downloaded server binary
    #[arg(long, global = true)]
    storage: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve the codeowners-lsp executable, downloading it if needed
    Provision,
    /// Show who owns a file
    Ownership { file: PathBuf },
    /// Show the CODEOWNERS rule matching a file
    Rule { file: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    log::init(&config::log_path(), "info")?;
    run(cli).await
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings_path = cli
        .settings
        .unwrap_or_else(|| config::data_dir().join("settings.json"));
    let extension_config = ExtensionConfig::load(&settings_path)
        .with_context(|| format!("Failed to load settings from {:?}", settings_path))?;

    let storage = cli.storage.unwrap_or_else(config::storage_dir);
    let feed = GitHubReleaseFeed::official().context("Failed to create release feed client")?;
    let provisioner = Arc::new(Provisioner::new(Arc::new(feed), storage));

    match cli.command {
        Command::Provision => {
            let binary = provisioner.ensure_binary(&extension_config).await?;
            info!("Resolved {:?} from {:?}", binary.path, binary.source);
            match binary.version {
                Some(version) => println!("{} ({})", binary.path.display(), version),
                None => println!("{}", binary.path.display()),
            }
        }
        Command::Ownership { file } => {
            let document = document_url(&file)?;
            let session = start_session(provisioner, &extension_config).await?;
            let ownership = session.show_ownership(&document).await;
            session.stop().await;

            match ownership? {
                Some(text) => println!("{}", text),
                None => println!("No ownership information for {}", file.display()),
            }
        }
        Command::Rule { file } => {
            let document = document_url(&file)?;
            let session = start_session(provisioner, &extension_config).await?;
            let rule = session.go_to_rule(&document).await;
            session.stop().await;

            match rule? {
                Some(location) => {
                    let path = location
                        .uri
                        .to_file_path()
                        .map(|path| path.display().to_string())
                        .unwrap_or_else(|_| location.uri.to_string());
                    println!("{}:{}", path, location.range.start.line + 1);
                }
                None => println!("No CODEOWNERS rule matches {}", file.display()),
            }
        }
    }

    Ok(())
}

async fn start_session(
    provisioner: Arc<Provisioner>,
    extension_config: &ExtensionConfig,
) -> anyhow::Result<Session> {
    let workspace = std::env::current_dir()
        .ok()
        .and_then(|dir| Url::from_directory_path(dir).ok());

    let session = Session::new(provisioner, workspace);
    session
        .start(extension_config)
        .await
        .context("Failed to start codeowners-lsp")?;
    Ok(session)
}

fn document_url(file: &Path) -> anyhow::Result<Url> {
    let absolute = std::path::absolute(file)
        .with_context(|| format!("Failed to resolve {:?}", file))?;
    Url::from_file_path(&absolute).map_err(|_| anyhow!("Not a valid file path: {:?}", absolute))
}
