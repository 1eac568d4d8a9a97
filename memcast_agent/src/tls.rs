//! Self-signed certificate for `--enableSSL`, generated once and reused.

use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::info;

use crate::error::StartupError;

fn config_dir() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| Path::new(&h).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("memcast_agent")
        .join("tls")
}

pub fn cert_paths() -> (PathBuf, PathBuf) {
    let dir = config_dir();
    (dir.join("cert.pem"), dir.join("key.pem"))
}

pub fn ensure_self_signed_cert() -> Result<(PathBuf, PathBuf), StartupError> {
    let (cert_path, key_path) = cert_paths();
    if cert_path.exists() && key_path.exists() {
        return Ok((cert_path, key_path));
    }
    if let Some(dir) = cert_path.parent() {
        fs::create_dir_all(dir).map_err(|e| tls_error(dir, e))?;
    }

    let host = hostname::get().ok().and_then(|s| s.into_string().ok());
    let certified = rcgen::generate_simple_self_signed(subject_alt_names(host))
        .map_err(|e| tls_error(&cert_path, e))?;
    fs::write(&cert_path, certified.cert.pem()).map_err(|e| tls_error(&cert_path, e))?;
    fs::write(&key_path, certified.key_pair.serialize_pem()).map_err(|e| tls_error(&key_path, e))?;

    info!(cert = %cert_path.display(), key = %key_path.display(), "generated self-signed TLS certificate");
    Ok((cert_path, key_path))
}

/// Machine hostname first (when known and not `localhost`), then the loopbacks.
fn subject_alt_names(host: Option<String>) -> Vec<String> {
    let mut names: Vec<String> = host
        .filter(|h| !h.is_empty() && h != "localhost")
        .into_iter()
        .collect();
    names.extend(["localhost", "127.0.0.1", "::1"].map(String::from));
    names
}

fn tls_error(path: &Path, e: impl std::fmt::Display) -> StartupError {
    StartupError::Tls {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}
