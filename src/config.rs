// 配置管理
use crate::cli::{Cli, Commands};
use crate::ssh::hostkey::{AcceptAnyHostKey, HostKeyVerifier, KnownHostsVerifier};
use crate::ssh::{Credentials, SessionOptions};
use anyhow::{bail, Result};
use dialoguer::Password;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub credentials: Credentials,
    pub connect_timeout: Duration,
    pub threads: usize,
    pub host_keys: HostKeyPolicy,
    pub operation_timeout: Option<Duration>,
    pub max_read_bytes: Option<u64>,
    pub verbose: bool,
    pub operation: Operation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    KnownHosts(Option<PathBuf>),
    AcceptAny,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Shell,
    List { path: String },
    Stat { path: String },
    Upload { local_path: PathBuf, remote_dir: String },
    Download { remote_path: String, local_dir: PathBuf },
    MakeDirectory { parent: String, name: String },
    Delete { path: String },
    Rename { path: String, new_name: String },
    Read { path: String },
    Write { path: String, from: Option<PathBuf> },
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let password = match &cli.password {
            Some(password) => password.clone(),
            None => Password::new()
                .with_prompt(format!("Enter password for {}@{}", cli.username, cli.host))
                .interact()?,
        };
        Self::build(cli, password)
    }

    fn build(cli: &Cli, password: String) -> Result<Self> {
        if cli.threads == 0 {
            bail!("--threads must be at least 1");
        }
        if cli.timeout_ms == 0 {
            bail!("--timeout-ms must be greater than 0");
        }
        if cli.accept_any_host_key && cli.known_hosts.is_some() {
            bail!("--accept-any-host-key and --known-hosts are mutually exclusive");
        }

        let host_keys = if cli.accept_any_host_key {
            HostKeyPolicy::AcceptAny
        } else {
            HostKeyPolicy::KnownHosts(cli.known_hosts.clone())
        };

        let operation = match &cli.command {
            Commands::Shell => Operation::Shell,
            Commands::Ls { path } => Operation::List { path: path.clone() },
            Commands::Stat { path } => Operation::Stat { path: path.clone() },
            Commands::Upload { local_path, remote_dir } => Operation::Upload {
                local_path: local_path.clone(),
                remote_dir: remote_dir.clone(),
            },
            Commands::Download { remote_path, local_dir } => Operation::Download {
                remote_path: remote_path.clone(),
                local_dir: local_dir.clone(),
            },
            Commands::Mkdir { parent, name } => Operation::MakeDirectory {
                parent: parent.clone(),
                name: name.clone(),
            },
            Commands::Rm { path } => Operation::Delete { path: path.clone() },
            Commands::Mv { path, new_name } => Operation::Rename {
                path: path.clone(),
                new_name: new_name.clone(),
            },
            Commands::Cat { path } => Operation::Read { path: path.clone() },
            Commands::Write { path, from } => Operation::Write {
                path: path.clone(),
                from: from.clone(),
            },
        };

        Ok(Config {
            credentials: Credentials::new(cli.host.clone(), cli.port, cli.username.clone(), password),
            connect_timeout: Duration::from_millis(cli.timeout_ms),
            threads: cli.threads,
            host_keys,
            operation_timeout: cli.op_timeout_ms.map(Duration::from_millis),
            max_read_bytes: cli.max_read_bytes,
            verbose: cli.verbose,
            operation,
        })
    }

    /// Default `RUST_LOG` filter: `--verbose` turns on debug output.
    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else {
            "warn"
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        let host_key_verifier: Arc<dyn HostKeyVerifier> = match &self.host_keys {
            HostKeyPolicy::AcceptAny => Arc::new(AcceptAnyHostKey),
            HostKeyPolicy::KnownHosts(Some(path)) => Arc::new(KnownHostsVerifier::new(path.clone())),
            HostKeyPolicy::KnownHosts(None) => Arc::new(KnownHostsVerifier::user_default()),
        };

        SessionOptions {
            workers: self.threads,
            host_key_verifier,
            operation_timeout: self.operation_timeout,
            max_read_bytes: self.max_read_bytes,
        }
    }
}
