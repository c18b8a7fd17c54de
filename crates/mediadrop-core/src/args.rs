//! Extraction engine argument building.
//!
//! Two branches: SoundCloud-class sources get an audio-only, optionally
//! authenticated argument list; everything else lets the engine pick the best
//! video and audio formats and merge them into one container.

use std::path::Path;

use tracing::debug;
use url::Url;

use crate::error::{DownloadError, Error, Result};

/// Title length cap (bytes) in the output template.
pub const TITLE_MAX_BYTES: usize = 150;

/// Extensions a generic download may end with, most likely first.
pub const GENERIC_EXTENSIONS: [&str; 7] = ["mp4", "mkv", "webm", "mov", "m4a", "mp3", "opus"];

/// Extensions an audio-only download may end with, most likely first.
pub const AUDIO_EXTENSIONS: [&str; 7] = ["mp3", "m4a", "opus", "ogg", "aac", "flac", "wav"];

/// Source classes with distinct argument branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceClass {
    /// soundcloud.com and its short links.
    SoundCloud,
    /// Anything else.
    Generic,
}

impl std::fmt::Display for SourceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SoundCloud => write!(f, "soundcloud"),
            Self::Generic => write!(f, "generic"),
        }
    }
}

/// Parse and check a source URL.
///
/// # Errors
///
/// Returns [`DownloadError::InvalidUrl`] for unparseable input, non-HTTP
/// schemes or a missing host.
pub fn parse_source_url(raw: &str) -> Result<Url> {
    let invalid = |reason: String| {
        Error::Download(DownloadError::InvalidUrl {
            url: raw.to_string(),
            reason,
        })
    };

    let url = Url::parse(raw.trim()).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}

/// Decide the argument branch for a URL.
#[must_use]
pub fn classify_source(url: &Url) -> SourceClass {
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    if host == "soundcloud.com" || host.ends_with(".soundcloud.com") || host == "snd.sc" {
        SourceClass::SoundCloud
    } else {
        SourceClass::Generic
    }
}

/// Settings that shape the argument list.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArgsOptions<'a> {
    /// Token for the authenticated branch.
    pub auth_token: Option<&'a str>,
    /// Pass the certificate-check bypass flag.
    pub skip_certificate_check: bool,
    /// Requested format, informational only.
    pub format_hint: Option<&'a str>,
}

/// Built argument list plus what the resolver should look for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgsPlan {
    /// Chosen branch.
    pub source: SourceClass,
    /// Engine arguments (the URL is passed separately).
    pub args: Vec<String>,
    /// Extensions the output may have.
    pub expected_extensions: Vec<&'static str>,
}

/// Output template placing a length-capped title in `directory`.
#[must_use]
pub fn output_template(directory: &Path) -> String {
    directory
        .join(format!("%(title).{TITLE_MAX_BYTES}B.%(ext)s"))
        .to_string_lossy()
        .into_owned()
}

/// Build the engine argument list for `url`.
#[must_use]
pub fn build_args(url: &Url, destination: &Path, options: &ArgsOptions<'_>) -> ArgsPlan {
    let source = classify_source(url);
    if let Some(hint) = options.format_hint {
        debug!(hint, "Format hint noted; the engine selects formats itself");
    }

    let mut args: Vec<String> = vec![
        "-o".into(),
        output_template(destination),
        "--no-playlist".into(),
        "--no-mtime".into(),
        "--windows-filenames".into(),
        "--write-thumbnail".into(),
        "--convert-thumbnails".into(),
        "jpg".into(),
        "--embed-thumbnail".into(),
        "--embed-metadata".into(),
    ];

    let expected_extensions = match source {
        SourceClass::SoundCloud => {
            args.extend(["-f".to_string(), "bestaudio/best".to_string()]);
            match options.auth_token.map(str::trim).filter(|t| !t.is_empty()) {
                Some(token) => {
                    args.extend([
                        "--add-header".to_string(),
                        format!("Authorization: OAuth {token}"),
                    ]);
                }
                None => debug!("No token set, using anonymous SoundCloud access"),
            }
            AUDIO_EXTENSIONS.to_vec()
        }
        SourceClass::Generic => {
            args.extend([
                "-f".to_string(),
                "bv*+ba/b".to_string(),
                "--merge-output-format".to_string(),
                "mp4".to_string(),
                "--ignore-errors".to_string(),
            ]);
            GENERIC_EXTENSIONS.to_vec()
        }
    };

    if options.skip_certificate_check {
        args.push("--no-check-certificates".into());
    }

    debug!(%source, arg_count = args.len(), "Built engine arguments");
    ArgsPlan {
        source,
        args,
        expected_extensions,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn test_parse_source_url() {
        assert!(parse_source_url("https://www.youtube.com/watch?v=abc").is_ok());
        assert!(parse_source_url("  https://soundcloud.com/a/b ").is_ok());
        assert!(matches!(
            parse_source_url("not a url"),
            Err(Error::Download(DownloadError::InvalidUrl { .. }))
        ));
        assert!(parse_source_url("ftp://example.com/file").is_err());
        assert!(parse_source_url("file:///etc/passwd").is_err());
    }

    #[test]
    fn test_classify_source() {
        let sc = |s: &str| classify_source(&Url::parse(s).unwrap());
        assert_eq!(sc("https://soundcloud.com/artist/track"), SourceClass::SoundCloud);
        assert_eq!(sc("https://m.soundcloud.com/artist/track"), SourceClass::SoundCloud);
        assert_eq!(sc("https://snd.sc/abc"), SourceClass::SoundCloud);
        assert_eq!(sc("https://notsoundcloud.com/x"), SourceClass::Generic);
        assert_eq!(sc("https://youtu.be/abc"), SourceClass::Generic);
    }

    #[test]
    fn test_generic_branch() {
        let url = Url::parse("https://www.youtube.com/watch?v=abc").unwrap();
        let plan = build_args(&url, Path::new("/downloads"), &ArgsOptions::default());
        assert_eq!(plan.source, SourceClass::Generic);
        assert!(has_pair(&plan.args, "-f", "bv*+ba/b"));
        assert!(has_pair(&plan.args, "--merge-output-format", "mp4"));
        assert!(has_pair(&plan.args, "-o", "/downloads/%(title).150B.%(ext)s"));
        assert!(plan.args.contains(&"--ignore-errors".to_string()));
        assert!(plan.args.contains(&"--embed-thumbnail".to_string()));
        assert!(!plan.args.contains(&"--no-check-certificates".to_string()));
        assert_eq!(plan.expected_extensions[0], "mp4");
    }

    #[test]
    fn test_soundcloud_branch_with_token() {
        let url = Url::parse("https://soundcloud.com/artist/track").unwrap();
        let options = ArgsOptions {
            auth_token: Some("tok123"),
            ..ArgsOptions::default()
        };
        let plan = build_args(&url, Path::new("/downloads"), &options);
        assert_eq!(plan.source, SourceClass::SoundCloud);
        assert!(has_pair(&plan.args, "--add-header", "Authorization: OAuth tok123"));
        assert!(has_pair(&plan.args, "-f", "bestaudio/best"));
        assert!(!plan.args.contains(&"--merge-output-format".to_string()));
        assert_eq!(plan.expected_extensions[0], "mp3");
    }

    #[test]
    fn test_soundcloud_branch_without_token() {
        let url = Url::parse("https://soundcloud.com/artist/track").unwrap();
        let options = ArgsOptions {
            auth_token: Some("   "),
            ..ArgsOptions::default()
        };
        let plan = build_args(&url, Path::new("/downloads"), &options);
        assert!(!plan.args.iter().any(|a| a.starts_with("Authorization")));
    }

    #[test]
    fn test_certificate_bypass_only_when_enabled() {
        let url = Url::parse("https://example.com/v").unwrap();
        let options = ArgsOptions {
            skip_certificate_check: true,
            ..ArgsOptions::default()
        };
        let plan = build_args(&url, Path::new("/downloads"), &options);
        assert!(plan.args.contains(&"--no-check-certificates".to_string()));
    }

    #[test]
    fn test_format_hint_does_not_change_args() {
        let url = Url::parse("https://example.com/v").unwrap();
        let with_hint = ArgsOptions {
            format_hint: Some("1080p"),
            ..ArgsOptions::default()
        };
        assert_eq!(
            build_args(&url, Path::new("/d"), &with_hint),
            build_args(&url, Path::new("/d"), &ArgsOptions::default())
        );
    }
}
