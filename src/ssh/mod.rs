// SSH模块入口
pub mod client;
pub mod hostkey;
pub mod session;
pub mod shell;

pub use client::{ConnectionState, Credentials, SshClient};
pub use hostkey::{AcceptAnyHostKey, HostKeyVerifier, KnownHostsVerifier};
pub use session::{SessionOptions, SshSession};
pub use shell::{ShellOutput, ShellState};
