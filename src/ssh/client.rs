// SSH传输会话：一个已认证的连接，所有通道都从这里打开
use crate::ssh::hostkey::HostKeyVerifier;
use crate::utils::error::{ConnectionError, Result, SessionError};
use log::{debug, info};
use ssh2::{Channel, ErrorCode, Session, Sftp};
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

// libssh2 错误码
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_FILE: i32 = -16;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_EAGAIN: i32 = -37;

const DISCONNECT_TIMEOUT_MS: u32 = 2_000;
/// Upper bound for closing a handle or channel once its operation is over.
/// Also the session timeout for the blocking releases ssh2 performs on drop.
pub(crate) const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);
const TERMINAL_TYPE: &str = "xterm";

pub const DEFAULT_PORT: u16 = 22;

#[derive(Clone)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

pub struct SshClient {
    session: Session,
    address: String,
    token: CancellationToken,
}

impl SshClient {
    /// Opens the TCP connection, runs the handshake, verifies the host key
    /// and authenticates with a password, all within `timeout`.
    ///
    /// On success the session is switched to non-blocking mode so that the
    /// shell pump and any number of SFTP channels can share it.
    pub fn connect(
        credentials: &Credentials,
        timeout: Duration,
        verifier: &dyn HostKeyVerifier,
    ) -> std::result::Result<Self, ConnectionError> {
        let deadline = Deadline::after(timeout);
        let address = credentials.address();
        debug!("Connecting to {}...", address);

        let tcp = open_tcp(&address, &deadline)?;

        let mut session = Session::new().map_err(ConnectionError::Handshake)?;
        session.set_tcp_stream(tcp);
        session.set_timeout(deadline.remaining_millis()?);
        session
            .handshake()
            .map_err(|e| classify_handshake_error(e, timeout))?;

        verifier.verify(&credentials.host, credentials.port, &session)?;

        debug!("SSH handshake completed. Authenticating...");
        session.set_timeout(deadline.remaining_millis()?);
        session
            .userauth_password(&credentials.username, &credentials.password)
            .map_err(|e| match e.code() {
                ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED) => {
                    ConnectionError::AuthenticationFailed {
                        username: credentials.username.clone(),
                    }
                }
                _ => classify_handshake_error(e, timeout),
            })?;

        if !session.authenticated() {
            return Err(ConnectionError::AuthenticationFailed {
                username: credentials.username.clone(),
            });
        }

        // 非阻塞模式下超时不生效，只约束 ssh2 在 drop 时执行的阻塞释放
        session.set_timeout(timeout_millis(RELEASE_TIMEOUT));
        session.set_blocking(false);

        info!("Authenticated to {} as {}", address, credentials.username);
        Ok(SshClient {
            session,
            address,
            token: CancellationToken::new(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Session-wide token; every channel works on a child of it.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Signals every channel of this session to stop. Non-blocking.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancels all channels and closes the transport. Safe to call twice.
    pub fn disconnect(&self) {
        self.cancel();

        self.session.set_blocking(true);
        self.session.set_timeout(DISCONNECT_TIMEOUT_MS);
        match self.session.disconnect(None, "closed by client", None) {
            Ok(()) => info!("Disconnected from {}", self.address),
            Err(e) => debug!("Disconnect from {} not clean: {}", self.address, e),
        }
    }

    pub fn open_sftp(&self, token: &CancellationToken) -> Result<Sftp> {
        if self.is_closed() {
            return Err(SessionError::NotConnected);
        }
        retry(token, || self.session.sftp(), SessionError::channel_open)
    }

    /// Opens a session channel with a PTY and starts the login shell on it.
    pub fn open_shell(&self, token: &CancellationToken) -> Result<Channel> {
        if self.is_closed() {
            return Err(SessionError::NotConnected);
        }
        let mut channel = retry(
            token,
            || self.session.channel_session(),
            SessionError::channel_open,
        )?;
        retry(
            token,
            || channel.request_pty(TERMINAL_TYPE, None, None),
            |e| SessionError::channel(format!("failed to request PTY: {}", e)),
        )?;
        retry(
            token,
            || channel.shell(),
            |e| SessionError::channel(format!("failed to start shell: {}", e)),
        )?;
        Ok(channel)
    }
}

impl Drop for SshClient {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn open_tcp(address: &str, deadline: &Deadline) -> std::result::Result<TcpStream, ConnectionError> {
    let unreachable = |source: io::Error| ConnectionError::Unreachable {
        address: address.to_string(),
        source,
    };

    let addrs: Vec<SocketAddr> = address.to_socket_addrs().map_err(unreachable)?.collect();
    let mut last_error = io::Error::new(io::ErrorKind::NotFound, "no addresses resolved");

    for addr in addrs {
        // 所有地址共用同一个截止时间
        let remaining = deadline.remaining()?;
        match TcpStream::connect_timeout(&addr, remaining) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("Connect to {} failed: {}", addr, e);
                last_error = e;
            }
        }
    }

    if last_error.kind() == io::ErrorKind::TimedOut {
        Err(ConnectionError::Timeout(deadline.budget))
    } else {
        Err(unreachable(last_error))
    }
}

/// One budget shared by every stage of a connect.
struct Deadline {
    budget: Duration,
    at: Instant,
}

impl Deadline {
    fn after(budget: Duration) -> Self {
        Self {
            budget,
            at: Instant::now() + budget,
        }
    }

    fn remaining(&self) -> std::result::Result<Duration, ConnectionError> {
        let left = self.at.saturating_duration_since(Instant::now());
        if left < Duration::from_millis(1) {
            Err(ConnectionError::Timeout(self.budget))
        } else {
            Ok(left)
        }
    }

    /// Remaining budget as a libssh2 timeout, where 0 would mean "forever".
    fn remaining_millis(&self) -> std::result::Result<u32, ConnectionError> {
        self.remaining().map(|left| timeout_millis(left).max(1))
    }
}

fn classify_handshake_error(err: ssh2::Error, timeout: Duration) -> ConnectionError {
    match err.code() {
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => ConnectionError::Timeout(timeout),
        _ => ConnectionError::Handshake(err),
    }
}

fn timeout_millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

pub(crate) fn would_block(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::Session(LIBSSH2_ERROR_EAGAIN))
}

/// libssh2 reports the end of a directory listing as an error.
pub(crate) fn is_end_of_listing(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::Session(LIBSSH2_ERROR_FILE))
}

/// Idle backoff for the non-blocking session: short sleeps while traffic is
/// flowing, longer ones once the peer has gone quiet.
pub(crate) struct Backoff {
    idle: u32,
}

impl Backoff {
    const MIN_SLEEP: Duration = Duration::from_millis(1);
    const MAX_SLEEP: Duration = Duration::from_millis(10);
    const IDLE_THRESHOLD: u32 = 10;

    pub(crate) fn new() -> Self {
        Self { idle: 0 }
    }

    pub(crate) fn reset(&mut self) {
        self.idle = 0;
    }

    pub(crate) fn wait(&mut self) {
        self.idle = self.idle.saturating_add(1);
        let sleep = if self.idle > Self::IDLE_THRESHOLD {
            Self::MAX_SLEEP
        } else {
            Self::MIN_SLEEP
        };
        thread::sleep(sleep);
    }
}

/// Repeats a libssh2 call until it stops returning EAGAIN, the token is
/// cancelled, or it fails for real.
pub(crate) fn retry<T, F, E>(token: &CancellationToken, mut op: F, on_error: E) -> Result<T>
where
    F: FnMut() -> std::result::Result<T, ssh2::Error>,
    E: FnOnce(ssh2::Error) -> SessionError,
{
    let mut backoff = Backoff::new();
    loop {
        if token.is_cancelled() {
            return Err(SessionError::ConnectionClosed);
        }
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if would_block(&e) => backoff.wait(),
            Err(e) => return Err(on_error(e)),
        }
    }
}

/// Same as [`retry`] for `std::io` calls on channels and remote files.
pub(crate) fn retry_io<T, F>(token: &CancellationToken, mut op: F) -> Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    let mut backoff = Backoff::new();
    loop {
        if token.is_cancelled() {
            return Err(SessionError::ConnectionClosed);
        }
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => backoff.wait(),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(SessionError::Stream(e)),
        }
    }
}

/// Drives a repeatable libssh2 close until it stops returning EAGAIN.
/// Ignores cancellation, since it runs after the operation has ended, but
/// gives up once `limit` has passed.
pub(crate) fn settle<F>(limit: Duration, mut op: F) -> std::result::Result<(), ssh2::Error>
where
    F: FnMut() -> std::result::Result<(), ssh2::Error>,
{
    let until = Instant::now() + limit;
    let mut backoff = Backoff::new();
    loop {
        match op() {
            Err(e) if would_block(&e) && Instant::now() < until => backoff.wait(),
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eagain() -> ssh2::Error {
        ssh2::Error::new(ErrorCode::Session(LIBSSH2_ERROR_EAGAIN), "would block")
    }

    #[test]
    fn credentials_debug_hides_password() {
        let creds = Credentials::new("example.com", 22, "snow", "hunter2");
        let printed = format!("{:?}", creds);
        assert!(printed.contains("example.com"));
        assert!(!printed.contains("hunter2"));
        assert_eq!(creds.address(), "example.com:22");
    }

    #[test]
    fn retry_spins_through_eagain() {
        let token = CancellationToken::new();
        let mut attempts = 0;
        let value = retry(
            &token,
            || {
                attempts += 1;
                if attempts < 3 {
                    Err(eagain())
                } else {
                    Ok(attempts)
                }
            },
            SessionError::channel_open,
        )
        .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn retry_maps_real_errors() {
        let token = CancellationToken::new();
        let err = retry(
            &token,
            || -> std::result::Result<(), _> {
                Err(ssh2::Error::new(ErrorCode::SFTP(2), "no such file"))
            },
            |e| SessionError::operation("/missing", e),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "/missing: no such file");
    }

    #[test]
    fn retry_stops_when_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let err = retry(&token, || Ok::<_, ssh2::Error>(1), SessionError::channel_open)
            .unwrap_err();
        assert!(matches!(err, SessionError::ConnectionClosed));
    }

    #[test]
    fn retry_io_maps_stream_errors() {
        let token = CancellationToken::new();
        let mut calls = 0;
        let err = retry_io(&token, || -> io::Result<usize> {
            calls += 1;
            if calls == 1 {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "again"))
            } else {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"))
            }
        })
        .unwrap_err();
        assert_eq!(calls, 2);
        assert!(matches!(err, SessionError::Stream(ref e) if e.kind() == io::ErrorKind::BrokenPipe));
    }

    #[test]
    fn end_of_listing_is_recognised() {
        let end = ssh2::Error::new(ErrorCode::Session(LIBSSH2_ERROR_FILE), "no more files");
        assert!(is_end_of_listing(&end));
        assert!(!would_block(&end));
        assert!(would_block(&eagain()));
    }

    #[test]
    fn settle_repeats_close_until_done() {
        let mut calls = 0;
        let result = settle(Duration::from_secs(1), || {
            calls += 1;
            if calls < 4 {
                Err(eagain())
            } else {
                Ok(())
            }
        });
        assert!(result.is_ok());
        assert_eq!(calls, 4);
    }

    #[test]
    fn settle_gives_up_after_limit() {
        let started = Instant::now();
        let result = settle(Duration::from_millis(50), || Err(eagain()));
        assert!(matches!(result, Err(ref e) if would_block(e)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn settle_stops_on_real_error() {
        let mut calls = 0;
        let result = settle(Duration::from_secs(1), || {
            calls += 1;
            Err(ssh2::Error::new(ErrorCode::Session(-7), "socket send"))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn deadline_budget_is_shared() {
        let deadline = Deadline::after(Duration::from_millis(200));
        assert!(deadline.remaining().unwrap() <= Duration::from_millis(200));

        thread::sleep(Duration::from_millis(250));
        let err = deadline.remaining().unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout(t) if t == Duration::from_millis(200)));
        assert!(deadline.remaining_millis().is_err());
    }

    #[test]
    fn connect_to_closed_port_is_unreachable() {

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let creds = Credentials::new("127.0.0.1", port, "nobody", "nothing");
        let verifier = crate::ssh::hostkey::AcceptAnyHostKey;
        let err = SshClient::connect(&creds, Duration::from_secs(2), &verifier).err();
        assert!(matches!(err, Some(ConnectionError::Unreachable { .. })));
    }
}
