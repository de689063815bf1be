// 会话门面：串行化连接/断开/Shell 的状态转换，文件操作共享同一个传输会话
use crate::ssh::client::{ConnectionState, Credentials, SshClient};
use crate::ssh::hostkey::{HostKeyVerifier, KnownHostsVerifier};
use crate::ssh::shell::{ShellChannel, ShellInput, ShellOutput, ShellState};
use crate::threadpool::ThreadPool;
use crate::transfer::download::{self, ByteSink};
use crate::transfer::entry::RemoteFileEntry;
use crate::transfer::sftp::FileTransferChannel;
use crate::transfer::upload::{self, ByteSource};
use crate::utils::error::{ConnectionError, Result, SessionError};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_WORKERS: usize = 4;

#[derive(Clone)]
pub struct SessionOptions {
    /// Size of the worker pool running network operations.
    pub workers: usize,
    pub host_key_verifier: Arc<dyn HostKeyVerifier>,
    /// Deadline for each shell open or file operation. `None` keeps
    /// operations unbounded.
    pub operation_timeout: Option<Duration>,
    /// Cap for whole-file reads. `None` loads files of any size.
    pub max_read_bytes: Option<u64>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            host_key_verifier: Arc::new(KnownHostsVerifier::user_default()),
            operation_timeout: None,
            max_read_bytes: None,
        }
    }
}

struct Transport {
    state: ConnectionState,
    client: Option<Arc<SshClient>>,
}

/// Holds the transport in `Connecting`. Whatever ends the attempt, including
/// the connect future being dropped, leaves a settled state behind.
struct ConnectAttempt<'a> {
    transport: &'a Mutex<Transport>,
    settled: bool,
}

impl<'a> ConnectAttempt<'a> {
    fn begin(transport: &'a Mutex<Transport>) -> Self {
        lock_transport(transport).state = ConnectionState::Connecting;
        Self {
            transport,
            settled: false,
        }
    }

    fn succeed(mut self, client: Arc<SshClient>) {
        let mut transport = lock_transport(self.transport);
        transport.client = Some(client);
        transport.state = ConnectionState::Connected;
        self.settled = true;
    }
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut transport = lock_transport(self.transport);
        transport.client = None;
        transport.state = ConnectionState::Failed;
    }
}

fn lock_transport(transport: &Mutex<Transport>) -> MutexGuard<'_, Transport> {
    transport.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Single entry point to one remote host.
///
/// Owns at most one transport session at a time. `connect`, `disconnect`
/// and the shell transitions are serialized; file operations run
/// concurrently, each on its own short-lived SFTP channel.
pub struct SshSession {
    options: SessionOptions,
    pool: ThreadPool,
    lifecycle: tokio::sync::Mutex<()>,
    transport: Mutex<Transport>,
    shell: Mutex<Option<ShellChannel>>,
}

impl SshSession {
    pub fn new(options: SessionOptions) -> Self {
        let workers = options.workers.max(1);
        Self {
            pool: ThreadPool::new(workers),
            options,
            lifecycle: tokio::sync::Mutex::new(()),
            transport: Mutex::new(Transport {
                state: ConnectionState::Disconnected,
                client: None,
            }),
            shell: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.transport().state
    }

    pub fn is_connected(&self) -> bool {
        self.connected_client().is_ok()
    }

    /// Connects to the host, replacing any existing session. The previous
    /// shell and transport are torn down completely first. `timeout` bounds
    /// the whole connect, including time spent waiting for a worker.
    pub async fn connect(&self, credentials: Credentials, timeout: Duration) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.teardown().await;

        let attempt = ConnectAttempt::begin(&self.transport);
        info!(
            "Connecting to {} as {} (host keys: {})",
            credentials.address(),
            credentials.username,
            self.options.host_key_verifier.describe()
        );

        let verifier = Arc::clone(&self.options.host_key_verifier);
        let job = self.pool.spawn(move || {
            SshClient::connect(&credentials, timeout, verifier.as_ref()).map_err(SessionError::from)
        });
        // 超时后任务仍在后台结束，其结果（包括建立的连接）被丢弃
        let result = match tokio::time::timeout(timeout, job).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(timeout).into()),
        };

        match result {
            Ok(client) => {
                attempt.succeed(Arc::new(client));
                Ok(())
            }
            Err(e) => {
                warn!("Connection failed: {}", e);
                drop(attempt);
                Err(e)
            }
        }
    }

    /// Closes the shell, then the transport. A no-op when nothing is open.
    pub async fn disconnect(&self) {
        let _guard = self.lifecycle.lock().await;
        self.teardown().await;
    }

    async fn teardown(&self) {
        let shell = self.shell_slot().take();
        if let Some(shell) = shell {
            shell.close().await;
        }

        let client = {
            let mut transport = self.transport();
            transport.state = ConnectionState::Disconnected;
            transport.client.take()
        };

        if let Some(client) = client {
            // 先取消令牌，让排队中的操作立即失败，再在线程池里关闭连接
            client.cancel();
            let closing = Arc::clone(&client);
            if let Err(e) = self
                .pool
                .spawn(move || {
                    closing.disconnect();
                    Ok(())
                })
                .await
            {
                debug!("Disconnect ran inline: {}", e);
                client.disconnect();
            }
        }
    }

    /// Opens the interactive shell and returns its output stream.
    pub async fn open_shell(&self) -> Result<ShellOutput> {
        let _guard = self.lifecycle.lock().await;
        let client = self.connected_client()?;

        if let Some(existing) = self.shell_slot().as_ref() {
            if !existing.is_closed() {
                return Err(SessionError::ShellAlreadyOpen);
            }
        }
        // 上一个已结束的 Shell 在这里被替换
        let stale = self.shell_slot().take();
        if let Some(stale) = stale {
            stale.close().await;
        }

        let token = client.token().child_token();
        let (shell, output) = self
            .with_deadline(token.clone(), move || ShellChannel::open(client, token))
            .await?;

        *self.shell_slot() = Some(shell);
        Ok(output)
    }

    /// Sends one command line to the open shell.
    pub async fn send_line(&self, line: &str) -> Result<()> {
        let input = self.shell_input()?;
        input.send_line(line).await
    }

    pub async fn close_shell(&self) {
        let _guard = self.lifecycle.lock().await;
        let shell = self.shell_slot().take();
        if let Some(shell) = shell {
            shell.close().await;
        }
    }

    pub fn shell_state(&self) -> ShellState {
        self.shell_slot()
            .as_ref()
            .map(ShellChannel::state)
            .unwrap_or(ShellState::Idle)
    }

    pub async fn list_directory(&self, path: &str) -> Result<Vec<RemoteFileEntry>> {
        let path = path.to_string();
        self.file_operation(move |channel| channel.list(&path)).await
    }

    pub async fn stat(&self, path: &str) -> Result<RemoteFileEntry> {
        let path = path.to_string();
        self.file_operation(move |channel| channel.stat(&path)).await
    }

    /// Uploads `source` into `destination_dir`; returns the remote path.
    pub async fn upload<S>(&self, mut source: S, destination_dir: &str) -> Result<String>
    where
        S: ByteSource + 'static,
    {
        let destination_dir = destination_dir.to_string();
        self.file_operation(move |channel| upload::upload(channel, &mut source, &destination_dir))
            .await
    }

    /// Streams `remote_path` into `sink`; returns the byte count.
    pub async fn download<K>(&self, remote_path: &str, display_name: &str, mut sink: K) -> Result<u64>
    where
        K: ByteSink + 'static,
    {
        let remote_path = remote_path.to_string();
        let display_name = display_name.to_string();
        self.file_operation(move |channel| {
            download::download(channel, &remote_path, &display_name, &mut sink)
        })
        .await
    }

    /// Creates `name` under `parent_path`; returns the new directory's path.
    pub async fn make_directory(&self, parent_path: &str, name: &str) -> Result<String> {
        let parent_path = parent_path.to_string();
        let name = name.to_string();
        self.file_operation(move |channel| channel.create_directory(&parent_path, &name))
            .await
    }

    pub async fn delete(&self, entry: &RemoteFileEntry) -> Result<()> {
        let entry = entry.clone();
        self.file_operation(move |channel| channel.delete(&entry)).await
    }

    /// Renames within the same parent directory; returns the new path.
    pub async fn rename(&self, entry: &RemoteFileEntry, new_name: &str) -> Result<String> {
        let entry = entry.clone();
        let new_name = new_name.to_string();
        self.file_operation(move |channel| channel.rename(&entry, &new_name))
            .await
    }

    pub async fn read_file(&self, remote_path: &str) -> Result<String> {
        let remote_path = remote_path.to_string();
        let limit = self.options.max_read_bytes;
        self.file_operation(move |channel| channel.read_whole_file(&remote_path, limit))
            .await
    }

    pub async fn write_file(&self, remote_path: &str, content: &str) -> Result<()> {
        let remote_path = remote_path.to_string();
        let content = content.to_string();
        self.file_operation(move |channel| channel.write_whole_file(&remote_path, &content))
            .await
    }

    /// Runs `op` on a fresh SFTP channel on the worker pool. The channel is
    /// dropped, and thereby closed, on the worker whatever `op` returns.
    async fn file_operation<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&FileTransferChannel) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let client = self.connected_client()?;
        let token = client.token().child_token();
        let op_token = token.clone();

        self.with_deadline(token, move || {
            let channel = FileTransferChannel::open(&client, op_token)?;
            op(&channel)
        })
        .await
    }

    async fn with_deadline<T, F>(&self, token: CancellationToken, job: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let task = self.pool.spawn(job);
        match self.options.operation_timeout {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(result) => result,
                Err(_) => {
                    token.cancel();
                    Err(SessionError::Timeout(limit))
                }
            },
            None => task.await,
        }
    }

    fn connected_client(&self) -> Result<Arc<SshClient>> {
        let transport = self.transport();
        match (&transport.state, &transport.client) {
            (ConnectionState::Connected, Some(client)) if !client.is_closed() => {
                Ok(Arc::clone(client))
            }
            _ => Err(SessionError::NotConnected),
        }
    }

    fn shell_input(&self) -> Result<ShellInput> {
        self.connected_client()?;
        match self.shell_slot().as_ref() {
            Some(shell) if !shell.is_closed() => Ok(shell.input()),
            _ => Err(SessionError::channel("shell is not open")),
        }
    }

    fn transport(&self) -> MutexGuard<'_, Transport> {
        lock_transport(&self.transport)
    }

    fn shell_slot(&self) -> MutexGuard<'_, Option<ShellChannel>> {
        self.shell.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SshSession {
    fn default() -> Self {
        Self::new(SessionOptions::default())
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        // 无法在 Drop 中等待：先取消 Shell，再关闭传输
        if let Some(client) = self.transport().client.take() {
            client.cancel();
            client.disconnect();
        }
    }
}
