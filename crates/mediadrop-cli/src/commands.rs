//! CLI command implementations.

use std::io::Write;
use std::path::PathBuf;

use clap::Subcommand;
use mediadrop_core::{
    DownloadEvent, DownloadOrchestrator, DownloadRequest, LogLevel, ProgressState, SettingsStore,
};
use tracing::debug;

/// Errors surfaced by the CLI.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Core library failure.
    #[error(transparent)]
    Core(#[from] mediadrop_core::Error),
    /// The user cancelled the download.
    #[error("Download cancelled")]
    Canceled,
    /// Settings could not be printed.
    #[error("Failed to encode settings: {0}")]
    Json(#[from] serde_json::Error),
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Download one URL
    Download {
        /// Source page URL
        url: String,
        /// Output directory (defaults to the configured downloads directory)
        #[arg(short, long)]
        dir: Option<PathBuf>,
        /// Preferred format, passed along as a hint
        #[arg(short, long)]
        format: Option<String>,
    },
    /// Manage the SoundCloud authentication token
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
    /// Print the effective settings as JSON
    Settings {
        /// Change the downloads directory first
        #[arg(long)]
        downloads_dir: Option<PathBuf>,
    },
}

/// Token subcommands.
#[derive(Debug, Subcommand)]
pub enum TokenAction {
    /// Store a token
    Set {
        /// Token value
        token: String,
    },
    /// Remove the stored token
    Clear,
}

/// Run a command.
pub async fn handle_command(command: Commands, settings: Option<PathBuf>) -> Result<(), CliError> {
    let mut store = match settings {
        Some(path) => SettingsStore::open_at(path)?,
        None => SettingsStore::open()?,
    };

    match command {
        Commands::Download { url, dir, format } => download(&store, url, dir, format).await,
        Commands::Token { action } => {
            match action {
                TokenAction::Set { token } => {
                    store.set_auth_token(&token)?;
                    if store.auth_token().is_some() {
                        println!("Token saved to {}", store.path().display());
                    } else {
                        println!("Empty token, stored token cleared");
                    }
                }
                TokenAction::Clear => {
                    store.clear_auth_token()?;
                    println!("Token cleared");
                }
            }
            Ok(())
        }
        Commands::Settings { downloads_dir } => {
            if let Some(dir) = downloads_dir {
                store.set_downloads_directory(dir)?;
            }
            println!("{}", serde_json::to_string_pretty(&store.settings().redacted())?);
            Ok(())
        }
    }
}

async fn download(
    store: &SettingsStore,
    url: String,
    dir: Option<PathBuf>,
    format: Option<String>,
) -> Result<(), CliError> {
    let mut orchestrator = DownloadOrchestrator::with_process_engines(store.settings().clone());
    let renderer = orchestrator.take_events().map(|mut events| {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                render(&event);
            }
        })
    });

    let handle = orchestrator.cancel_handle();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!();
            handle.cancel();
        }
    });

    let mut request = DownloadRequest::new(url);
    if let Some(dir) = dir {
        request = request.with_destination_dir(dir);
    }
    if let Some(format) = format {
        request = request.with_format_hint(format);
    }

    let result = orchestrator.start_download(request).await;
    ctrl_c.abort();
    // Dropping the orchestrator closes the event stream.
    drop(orchestrator);
    if let Some(renderer) = renderer {
        let _ = renderer.await;
    }

    match result {
        Ok(path) => {
            println!("{}", path.display());
            Ok(())
        }
        Err(e) if e.is_canceled() => Err(CliError::Canceled),
        Err(e) => Err(e.into()),
    }
}

fn render(event: &DownloadEvent) {
    match event {
        DownloadEvent::Progress(progress) => {
            let mut stderr = std::io::stderr();
            let _ = write!(stderr, "\r\x1b[2K{}", progress_line(progress));
            let _ = stderr.flush();
        }
        DownloadEvent::Log(message) => match message.level {
            LogLevel::Debug | LogLevel::Progress => {}
            level => eprintln!("\r\x1b[2K[{level}] {}", message.text),
        },
        DownloadEvent::AlternateRetrievalSuggested { url } => {
            eprintln!("\r\x1b[2KExtraction failed for {url}; try again with another retrieval method.");
        }
        DownloadEvent::StateChanged(state) => debug!(%state, "State"),
        DownloadEvent::Completed { .. } | DownloadEvent::Failed { .. } | DownloadEvent::Canceled => {
            eprintln!();
        }
    }
}

fn progress_line(progress: &ProgressState) -> String {
    let mut line = match progress.percent() {
        Some(pct) => format!("{pct:5.1}% {}", progress.description),
        None => progress.description.clone(),
    };
    if let Some(speed) = progress.formatted_speed() {
        line.push_str(&format!("  {speed}"));
    }
    if let Some(eta) = progress.formatted_eta() {
        line.push_str(&format!("  ETA {eta}"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediadrop_core::Phase;

    #[test]
    fn test_progress_line_with_known_total() {
        let mut progress = ProgressState::default();
        progress.set_units(50, 100);
        progress.enter(Phase::Downloading, "Downloading...");
        let line = progress_line(&progress);
        assert!(line.starts_with(" 50.0% Downloading..."));
    }

    #[test]
    fn test_progress_line_unknown_total() {
        let mut progress = ProgressState::default();
        progress.enter(Phase::Merging, "Merging formats...");
        assert_eq!(progress_line(&progress), "Merging formats...");
    }
}
