//! Proxy configuration: CLI-derived settings, relay URL normalization, and
//! the persisted relays file.
//!
//! # Relays file
//! Whitespace-separated URLs; blank entries ignored. If the file exists and
//! is non-empty it overrides `--relays`; otherwise it is created from
//! `--relays` (one URL per line).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use np_codec::Profile;
use url::Url;

/// Runtime configuration assembled from the CLI in `main`.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    /// Accepted for CLI compatibility; logged, not applied.
    pub backlog: Option<u32>,
    /// Accepted for CLI compatibility; logged, not applied.
    pub exclusive: bool,
    /// Opaque listener options blob; validated as JSON, otherwise ignored.
    pub http_options: serde_json::Value,
    /// Normalized, deduplicated initial relay URLs.
    pub relays: Vec<String>,
    pub keep_host: bool,
    pub nsec_file: Option<PathBuf>,
    pub save_nsec: bool,
    pub timeout_ms: u64,
    /// Fixed destination; requests then ignore `X-Nostr-Destination`.
    pub destination: Option<Profile>,
    pub max_cached_relays: usize,
    pub exit_on_file_change: bool,
    pub relays_file: Option<PathBuf>,
    pub verbose: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid relay URL '{url}': {reason}")]
    BadRelayUrl { url: String, reason: String },
    #[error("reading relays file '{path}': {source}")]
    RelaysFileRead { path: String, source: std::io::Error },
    #[error("writing relays file '{path}': {source}")]
    RelaysFileWrite { path: String, source: std::io::Error },
    #[error("--nodejs-http-options is not valid JSON: {0}")]
    BadHttpOptions(serde_json::Error),
    #[error("invalid --destination: {0}")]
    BadDestination(np_codec::KeyError),
}

/// Normalize one relay URL: lowercase scheme and host, strip a default port,
/// strip the trailing slash of an empty path.
pub fn normalize_relay_url(raw: &str) -> Result<String, ConfigError> {
    let url = Url::parse(raw.trim()).map_err(|e| ConfigError::BadRelayUrl {
        url: raw.to_owned(),
        reason: e.to_string(),
    })?;
    if url.scheme() != "ws" && url.scheme() != "wss" {
        return Err(ConfigError::BadRelayUrl {
            url: raw.to_owned(),
            reason: format!("scheme must be ws or wss, got {}", url.scheme()),
        });
    }
    if url.host_str().is_none() {
        return Err(ConfigError::BadRelayUrl {
            url: raw.to_owned(),
            reason: "missing host".to_owned(),
        });
    }

    // The url crate already lowercases scheme/host and drops known default
    // ports; what remains is trimming the "/" it adds to an empty path.
    let mut normalized = url.to_string();
    if url.path() == "/" && url.query().is_none() && url.fragment().is_none() {
        normalized.truncate(normalized.len() - 1);
    }
    Ok(normalized)
}

/// Normalize a list of relay URLs, dropping duplicates while keeping order.
pub fn normalize_relay_list<I, S>(raw: I) -> Result<Vec<String>, ConfigError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for entry in raw {
        // A single CLI element may itself contain several URLs.
        for token in entry.as_ref().split_whitespace() {
            let normalized = normalize_relay_url(token)?;
            if seen.insert(normalized.clone()) {
                out.push(normalized);
            }
        }
    }
    Ok(out)
}

/// Resolve the effective initial relay list from `--relays` and
/// `--relays-file`, creating the file when it does not hold anything yet.
pub fn resolve_relays(
    cli_relays: &[String],
    relays_file: Option<&Path>,
) -> Result<Vec<String>, ConfigError> {
    let from_cli = normalize_relay_list(cli_relays)?;

    let Some(path) = relays_file else {
        return Ok(from_cli);
    };

    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let from_file = normalize_relay_list(contents.split_whitespace())?;
            if from_file.is_empty() {
                write_relays_file(path, &from_cli)?;
                Ok(from_cli)
            } else {
                Ok(from_file)
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            write_relays_file(path, &from_cli)?;
            Ok(from_cli)
        }
        Err(source) => Err(ConfigError::RelaysFileRead {
            path: path.display().to_string(),
            source,
        }),
    }
}

fn write_relays_file(path: &Path, relays: &[String]) -> Result<(), ConfigError> {
    let to_io_err = |source| ConfigError::RelaysFileWrite {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(to_io_err)?;
        }
    }
    let mut contents = relays.join("\n");
    if !contents.is_empty() {
        contents.push('\n');
    }
    std::fs::write(path, contents).map_err(to_io_err)
}
