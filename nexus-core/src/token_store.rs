//! Bearer token lifecycle: generation, secure storage, discovery.
//!
//! Token format: `nxk_` + 32 bytes of URL-safe base64 (~47 chars total).
//! Storage: `<config_dir>/rpc.token` for the conventional default port,
//! otherwise `<config_dir>/rpc-<port>.token`.

use std::path::Path;
use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use subtle::ConstantTimeEq;
use thiserror::Error;

pub const API_KEY_PREFIX: &str = "nxk_";
pub const DEFAULT_PORT: u16 = 8765;

#[derive(Debug, Error)]
pub enum TokenStoreError {
    #[error(
        "Token file {path} has insecure permissions ({mode_octal}). \
         Expected 0600 (owner read/write only). Fix with: chmod 600 {path}"
    )]
    InsecureTokenFile { path: PathBuf, mode_octal: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    format!("{API_KEY_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes))
}

/// Constant-time equality check; never short-circuits on the first mismatch.
pub fn validate_api_key(provided: &str, expected: &str) -> bool {
    if provided.is_empty() || expected.is_empty() {
        return false;
    }
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[cfg(unix)]
fn file_mode(path: &Path) -> std::io::Result<u32> {
    use std::os::unix::fs::PermissionsExt;
    Ok(std::fs::metadata(path)?.permissions().mode())
}

#[cfg(unix)]
fn is_secure_mode(mode: u32) -> bool {
    // S_IRWXG | S_IRWXO
    mode & 0o077 == 0
}

/// Verify a token file's POSIX permissions. On non-Unix platforms this is a
/// no-op that always reports secure.
pub fn check_token_file_permissions(
    path: &Path,
    strict: bool,
) -> Result<bool, TokenStoreError> {
    #[cfg(unix)]
    {
        let mode = file_mode(path)?;
        if !is_secure_mode(mode) {
            let mode_octal = format!("{:o}", mode & 0o777);
            if strict {
                return Err(TokenStoreError::InsecureTokenFile {
                    path: path.to_path_buf(),
                    mode_octal,
                });
            }
            tracing::warn!(
                path = %path.display(),
                mode = %mode_octal,
                "token file has insecure permissions; should be 0600"
            );
            return Ok(false);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (path, strict);
    }
    Ok(true)
}

/// Create the config directory (owner-only, 0o700) if it doesn't exist.
fn secure_mkdir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Create `path` with mode 0600 set atomically at creation, never via a
/// post-hoc chmod, then write `contents`.
fn write_secure_file(path: &Path, contents: &str) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::OpenOptions;
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(contents.as_bytes())?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, contents)
    }
}

pub struct ServerTokenManager {
    port: u16,
    config_dir: PathBuf,
    strict_permissions: bool,
}

impl ServerTokenManager {
    pub fn new(port: u16, config_dir: PathBuf, strict_permissions: bool) -> Self {
        Self {
            port,
            config_dir,
            strict_permissions,
        }
    }

    pub fn token_path(&self) -> PathBuf {
        token_path_for(&self.config_dir, self.port)
    }

    /// Delete any stale token and generate a fresh one.
    pub fn generate_fresh(&self) -> Result<String, TokenStoreError> {
        self.delete();
        let token = generate_api_key();
        secure_mkdir(&self.config_dir)?;
        write_secure_file(&self.token_path(), &token)?;
        Ok(token)
    }

    pub fn load(&self) -> Result<Option<String>, TokenStoreError> {
        let path = self.token_path();
        if !path.exists() {
            return Ok(None);
        }
        check_token_file_permissions(&path, self.strict_permissions)?;
        Ok(Some(std::fs::read_to_string(&path)?.trim().to_string()))
    }

    pub fn delete(&self) {
        let _ = std::fs::remove_file(self.token_path());
    }
}

fn token_path_for(config_dir: &Path, port: u16) -> PathBuf {
    if port == DEFAULT_PORT {
        config_dir.join("rpc.token")
    } else {
        config_dir.join(format!("rpc-{port}.token"))
    }
}

/// Client-side token discovery: environment variable, then port-specific
/// file, then default file.
pub fn discover_rpc_token(
    port: u16,
    config_dir: &Path,
    strict_permissions: bool,
) -> Option<String> {
    if let Ok(env_token) = std::env::var("NEXUS3_API_KEY") {
        let trimmed = env_token.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }

    let try_load = |path: &Path| -> Option<String> {
        if !path.exists() {
            return None;
        }
        let is_secure = check_token_file_permissions(path, false).ok()?;
        if strict_permissions && !is_secure {
            tracing::debug!(path = %path.display(), "skipping insecure token file (strict mode)");
            return None;
        }
        let token = std::fs::read_to_string(path).ok()?.trim().to_string();
        if token.is_empty() { None } else { Some(token) }
    };

    if port != DEFAULT_PORT
        && let Some(token) = try_load(&token_path_for(config_dir, port))
    {
        return Some(token);
    }

    try_load(&token_path_for(config_dir, DEFAULT_PORT))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_has_expected_shape() {
        let key = generate_api_key();
        assert!(key.starts_with(API_KEY_PREFIX));
        assert!(key.len() > 40);
    }

    #[test]
    fn validate_rejects_empty() {
        assert!(!validate_api_key("", "nxk_x"));
        assert!(!validate_api_key("nxk_x", ""));
    }

    #[test]
    fn validate_accepts_matching_keys() {
        let key = generate_api_key();
        assert!(validate_api_key(&key, &key));
    }

    #[cfg(unix)]
    #[test]
    fn generate_fresh_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ServerTokenManager::new(8765, dir.path().to_path_buf(), true);
        let token = manager.generate_fresh().unwrap();
        let loaded = manager.load().unwrap().unwrap();
        assert_eq!(token, loaded);

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(manager.token_path())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn strict_load_rejects_insecure_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let manager = ServerTokenManager::new(8765, dir.path().to_path_buf(), true);
        manager.generate_fresh().unwrap();
        std::fs::set_permissions(
            manager.token_path(),
            std::fs::Permissions::from_mode(0o644),
        )
        .unwrap();

        let err = manager.load().unwrap_err();
        assert!(matches!(err, TokenStoreError::InsecureTokenFile { .. }));
    }

    #[test]
    fn default_port_uses_plain_filename() {
        let dir = PathBuf::from("/tmp/nexus-test");
        assert_eq!(
            token_path_for(&dir, DEFAULT_PORT),
            dir.join("rpc.token")
        );
        assert_eq!(
            token_path_for(&dir, 9000),
            dir.join("rpc-9000.token")
        );
    }
}
