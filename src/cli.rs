// 命令行参数解析
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ssh-remote")]
#[command(about = "Interactive SSH shell and SFTP file manager over one connection")]
#[command(version = "0.1.0")]
pub struct Cli {
    /// SSH server hostname or IP address
    #[arg(short = 'H', long)]
    pub host: String,

    /// SSH server port
    #[arg(short, long, default_value = "22")]
    pub port: u16,

    /// SSH username
    #[arg(short, long)]
    pub username: String,

    /// SSH password (if not provided, will prompt for input)
    #[arg(short = 'P', long)]
    pub password: Option<String>,

    /// Connection handshake timeout in milliseconds
    #[arg(long, default_value = "30000")]
    pub timeout_ms: u64,

    /// Number of worker threads for network operations
    #[arg(short, long, default_value = "4")]
    pub threads: usize,

    /// known_hosts file used to verify the server (default: ~/.ssh/known_hosts)
    #[arg(long)]
    pub known_hosts: Option<PathBuf>,

    /// Accept any host key without verification (insecure)
    #[arg(long)]
    pub accept_any_host_key: bool,

    /// Deadline for each file operation in milliseconds
    #[arg(long)]
    pub op_timeout_ms: Option<u64>,

    /// Refuse to read remote files larger than this many bytes
    #[arg(long)]
    pub max_read_bytes: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Open an interactive shell; stdin lines are sent as commands
    Shell,
    /// List a remote directory
    Ls {
        /// Remote directory
        #[arg(default_value = ".")]
        path: String,
    },
    /// Show one remote entry
    Stat {
        /// Remote path
        path: String,
    },
    /// Upload a local file into a remote directory
    Upload {
        /// Local file path
        local_path: PathBuf,
        /// Remote destination directory
        #[arg(default_value = ".")]
        remote_dir: String,
    },
    /// Download a remote file into a local directory
    Download {
        /// Remote file path
        remote_path: String,
        /// Local destination directory
        #[arg(default_value = ".")]
        local_dir: PathBuf,
    },
    /// Create a remote directory
    Mkdir {
        /// Parent directory
        parent: String,
        /// Name of the new directory
        name: String,
    },
    /// Delete a remote file or empty directory
    Rm {
        /// Remote path
        path: String,
    },
    /// Rename a remote entry inside its directory
    Mv {
        /// Remote path
        path: String,
        /// New name (without directory)
        new_name: String,
    },
    /// Print a remote text file
    Cat {
        /// Remote path
        path: String,
    },
    /// Replace a remote text file with local content
    Write {
        /// Remote path
        path: String,
        /// Read content from this file instead of stdin
        #[arg(short, long)]
        from: Option<PathBuf>,
    },
}
