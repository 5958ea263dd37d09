//! Secret-key lifecycle: load from the nsec file, or generate, and
//! optionally persist.

use std::path::Path;

use np_codec::Keys;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("reading nsec file '{path}': {source}")]
    Read { path: String, source: std::io::Error },
    #[error("writing nsec file '{path}': {source}")]
    Write { path: String, source: std::io::Error },
    #[error("nsec file '{path}': {source}")]
    Decode { path: String, source: np_codec::KeyError },
}

/// Load the proxy identity.
///
/// With a configured file: an existing file must hold a bech32 `nsec` string
/// (whitespace trimmed) or startup fails; a missing file yields a fresh key,
/// persisted (parent directories included) when `save_nsec` is set. Without
/// a file, a fresh key is generated each start.
pub fn load_identity(nsec_file: Option<&Path>, save_nsec: bool) -> Result<Keys, IdentityError> {
    let Some(path) = nsec_file else {
        let keys = Keys::generate();
        info!(npub = %keys.npub(), "generated ephemeral identity");
        return Ok(keys);
    };

    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let keys = Keys::from_nsec(contents.trim()).map_err(|source| {
                IdentityError::Decode { path: path.display().to_string(), source }
            })?;
            info!(npub = %keys.npub(), "loaded identity");
            Ok(keys)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let keys = Keys::generate();
            if save_nsec {
                save(path, &keys)?;
                info!(npub = %keys.npub(), path = %path.display(), "generated and saved identity");
            } else {
                info!(npub = %keys.npub(), "generated identity (not saved)");
            }
            Ok(keys)
        }
        Err(source) => Err(IdentityError::Read { path: path.display().to_string(), source }),
    }
}

fn save(path: &Path, keys: &Keys) -> Result<(), IdentityError> {
    let to_err = |source| IdentityError::Write { path: path.display().to_string(), source };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(to_err)?;
        }
    }
    std::fs::write(path, format!("{}\n", keys.to_nsec())).map_err(to_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_existing_nsec_with_surrounding_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.nsec");
        let keys = Keys::generate();
        std::fs::write(&path, format!("  {}\n", keys.to_nsec())).unwrap();

        let loaded = load_identity(Some(&path), false).unwrap();
        assert_eq!(loaded.public_key_hex(), keys.public_key_hex());
    }

    #[test]
    fn missing_file_with_save_creates_it_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deep").join("key.nsec");

        let generated = load_identity(Some(&path), true).unwrap();
        let reloaded = load_identity(Some(&path), true).unwrap();
        assert_eq!(reloaded.public_key_hex(), generated.public_key_hex());
    }

    #[test]
    fn missing_file_without_save_stays_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.nsec");

        let _keys = load_identity(Some(&path), false).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn wrong_key_type_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.nsec");
        std::fs::write(&path, Keys::generate().npub()).unwrap();

        assert!(matches!(
            load_identity(Some(&path), false),
            Err(IdentityError::Decode { .. })
        ));
    }
}
