// 主机密钥校验策略
use crate::utils::error::ConnectionError;
use log::{debug, warn};
use ssh2::{CheckResult, HashType, KnownHostFileKind, Session};
use std::path::{Path, PathBuf};

/// Decides whether the key a server presented during the handshake is
/// trusted. Runs before any credentials are sent.
pub trait HostKeyVerifier: Send + Sync {
    fn verify(&self, host: &str, port: u16, session: &Session) -> Result<(), ConnectionError>;

    /// Short label for logs.
    fn describe(&self) -> String;
}

/// Strict policy: the key must match an entry of an OpenSSH `known_hosts`
/// file. Unknown hosts are rejected, not added.
#[derive(Debug, Clone)]
pub struct KnownHostsVerifier {
    path: PathBuf,
}

impl KnownHostsVerifier {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// `~/.ssh/known_hosts` of the current user.
    pub fn user_default() -> Self {
        let home = home::home_dir().unwrap_or_default();
        Self::new(home.join(".ssh").join("known_hosts"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HostKeyVerifier for KnownHostsVerifier {
    fn verify(&self, host: &str, port: u16, session: &Session) -> Result<(), ConnectionError> {
        let rejected = |reason: String| ConnectionError::HostKeyRejected {
            host: host.to_string(),
            reason,
        };

        let (key, _) = session
            .host_key()
            .ok_or_else(|| rejected("server presented no host key".to_string()))?;

        let mut known_hosts = session.known_hosts().map_err(ConnectionError::Handshake)?;
        known_hosts
            .read_file(&self.path, KnownHostFileKind::OpenSSH)
            .map_err(|e| rejected(format!("cannot read {}: {}", self.path.display(), e)))?;

        match known_hosts.check_port(host, port, key) {
            CheckResult::Match => {
                debug!("Host key for {}:{} matches {}", host, port, self.path.display());
                Ok(())
            }
            CheckResult::NotFound => Err(rejected(format!(
                "host is not listed in {} (fingerprint {})",
                self.path.display(),
                fingerprint(session)
            ))),
            CheckResult::Mismatch => Err(rejected(format!(
                "HOST KEY MISMATCH against {} (fingerprint {})",
                self.path.display(),
                fingerprint(session)
            ))),
            CheckResult::Failure => Err(rejected("known_hosts lookup failed".to_string())),
        }
    }

    fn describe(&self) -> String {
        format!("known_hosts ({})", self.path.display())
    }
}

/// Trusts every host key. Only for explicit opt-out; logs the fingerprint so
/// the decision stays visible.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAnyHostKey;

impl HostKeyVerifier for AcceptAnyHostKey {
    fn verify(&self, host: &str, port: u16, session: &Session) -> Result<(), ConnectionError> {
        warn!(
            "Host key verification disabled; accepting {}:{} with fingerprint {}",
            host,
            port,
            fingerprint(session)
        );
        Ok(())
    }

    fn describe(&self) -> String {
        "accept any host key".to_string()
    }
}

/// SHA-256 host key fingerprint as colon separated hex.
pub fn fingerprint(session: &Session) -> String {
    match session.host_key_hash(HashType::Sha256) {
        Some(hash) => format_fingerprint(hash),
        None => "unknown".to_string(),
    }
}

fn format_fingerprint(hash: &[u8]) -> String {
    hash.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}
