//! Mediadrop - download media from a URL into a single finished file.
//!
//! Headless front end over `mediadrop-core`.

mod commands;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{debug, warn};

use commands::CliError;
use logging::{LoggingConfig, Verbosity};

/// Exit status used when the user cancels a download.
const EXIT_CANCELED: u8 = 130;

#[derive(Debug, Parser)]
#[command(name = "mediadrop")]
#[command(about = "Download audio and video from a URL into one finished file", version)]
struct Cli {
    /// Verbose console logging
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Settings file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let (_guard, file_logging_disabled) =
        logging::init(&LoggingConfig::new(Verbosity::from_flag(cli.verbose)));
    if let Some(reason) = file_logging_disabled {
        warn!(%reason, "File logging disabled");
    }
    debug!(verbose = cli.verbose, "Starting mediadrop");

    match commands::handle_command(cli.command, cli.config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError::Canceled) => {
            eprintln!("Download cancelled");
            ExitCode::from(EXIT_CANCELED)
        }
        Err(e) => {
            warn!(error = %e, "Command failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use commands::{Commands, TokenAction};

    #[test]
    fn test_parse_download() {
        let cli = Cli::try_parse_from([
            "mediadrop",
            "download",
            "https://example.com/v",
            "--dir",
            "/tmp/out",
            "--format",
            "mp4",
        ])
        .unwrap();
        match cli.command {
            Commands::Download { url, dir, format } => {
                assert_eq!(url, "https://example.com/v");
                assert_eq!(dir, Some(PathBuf::from("/tmp/out")));
                assert_eq!(format.as_deref(), Some("mp4"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_token_and_global_flags() {
        let cli =
            Cli::try_parse_from(["mediadrop", "token", "set", "abc", "--verbose", "--config", "s.json"])
                .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("s.json")));
        assert!(matches!(
            cli.command,
            Commands::Token {
                action: TokenAction::Set { ref token }
            } if token == "abc"
        ));
    }

    #[test]
    fn test_download_requires_url() {
        assert!(Cli::try_parse_from(["mediadrop", "download"]).is_err());
    }
}
