//! End-to-end tests against a real SSH server.
//!
//! All tests are `#[ignore]` because they need a reachable server with
//! password authentication and SFTP enabled:
//!
//! ```bash
//! export SSH_TEST_HOST=127.0.0.1 SSH_TEST_PORT=2222
//! export SSH_TEST_USER=testuser SSH_TEST_PASS=testpass
//! cargo test --test ssh_integration -- --ignored --nocapture
//! ```

use ssh_remote::ssh::{AcceptAnyHostKey, ConnectionState, Credentials, SessionOptions, SshSession};
use ssh_remote::transfer::{ByteSource, BytesSource, LocalDirSink, MemorySink};
use ssh_remote::SessionError;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn credentials() -> Option<Credentials> {
    let host = std::env::var("SSH_TEST_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = std::env::var("SSH_TEST_PORT")
        .ok()
        .and_then(|port| port.parse().ok())
        .unwrap_or(22);
    let username = std::env::var("SSH_TEST_USER").ok()?;
    let password = std::env::var("SSH_TEST_PASS").ok()?;
    Some(Credentials::new(host, port, username, password))
}

fn session() -> SshSession {
    SshSession::new(SessionOptions {
        workers: 4,
        host_key_verifier: Arc::new(AcceptAnyHostKey),
        operation_timeout: Some(Duration::from_secs(30)),
        max_read_bytes: None,
    })
}

async fn connected() -> Option<SshSession> {
    let Some(credentials) = credentials() else {
        println!("Skipping test: SSH_TEST_USER / SSH_TEST_PASS not set");
        return None;
    };
    let session = session();
    session.connect(credentials, CONNECT_TIMEOUT).await.unwrap();
    Some(session)
}

/// Unique scratch directory under the remote home directory.
async fn scratch_dir(session: &SshSession) -> String {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    session
        .make_directory(".", &format!("ssh-remote-test-{}", stamp))
        .await
        .unwrap()
}

#[tokio::test]
#[ignore]
async fn test_connect_and_disconnect() {
    let Some(session) = connected().await else { return };
    assert_eq!(session.state(), ConnectionState::Connected);

    session.disconnect().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(matches!(session.list_directory(".").await, Err(SessionError::NotConnected)));
}

#[tokio::test]
#[ignore]
async fn test_wrong_password_fails() {
    let Some(mut credentials) = credentials() else { return };
    credentials.password.push_str("-wrong");

    let session = session();
    let err = session.connect(credentials, CONNECT_TIMEOUT).await.unwrap_err();
    println!("Rejected as expected: {}", err);
    assert_eq!(session.state(), ConnectionState::Failed);
}

#[tokio::test]
#[ignore]
async fn test_listing_hides_pseudo_entries() {
    let Some(session) = connected().await else { return };

    let entries = session.list_directory("/").await.unwrap();
    assert!(!entries.is_empty());
    assert!(entries.iter().all(|e| e.name != "." && e.name != ".."));
    assert!(entries.iter().all(|e| e.path == format!("/{}", e.name)));

    session.disconnect().await;
}

#[tokio::test]
#[ignore]
async fn test_upload_then_download() {
    let Some(session) = connected().await else { return };
    let dir = scratch_dir(&session).await;

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let remote_path = session
        .upload(BytesSource::new(Some("blob.bin".to_string()), payload.clone()), &dir)
        .await
        .unwrap();
    assert_eq!(remote_path, format!("{}/blob.bin", dir));

    let sink = MemorySink::new();
    let written = session
        .download(&remote_path, "blob.bin", sink.clone())
        .await
        .unwrap();
    assert_eq!(written, payload.len() as u64);
    assert_eq!(sink.contents(), payload);

    let entry = session.stat(&remote_path).await.unwrap();
    session.delete(&entry).await.unwrap();
    let dir_entry = session.stat(&dir).await.unwrap();
    session.delete(&dir_entry).await.unwrap();
    session.disconnect().await;
}

#[tokio::test]
#[ignore]
async fn test_read_write_text_file() {
    let Some(session) = connected().await else { return };
    let dir = scratch_dir(&session).await;
    let path = format!("{}/notes.txt", dir);

    session.write_file(&path, "first\nsecond — ünïcode\n").await.unwrap();
    let content = session.read_file(&path).await.unwrap();
    assert_eq!(content, "first\nsecond — ünïcode\n");

    // 重复写入同样内容，结果不变
    session.write_file(&path, &content).await.unwrap();
    assert_eq!(session.read_file(&path).await.unwrap(), content);

    session.write_file(&path, "short").await.unwrap();
    assert_eq!(session.read_file(&path).await.unwrap(), "short");

    let entry = session.stat(&path).await.unwrap();
    session.delete(&entry).await.unwrap();
    let dir_entry = session.stat(&dir).await.unwrap();
    session.delete(&dir_entry).await.unwrap();
    session.disconnect().await;
}

#[tokio::test]
#[ignore]
async fn test_mkdir_rename_delete() {
    let Some(session) = connected().await else { return };
    let dir = scratch_dir(&session).await;

    let sub = session.make_directory(&dir, "sub").await.unwrap();
    assert_eq!(sub, format!("{}/sub", dir));

    let entry = session.stat(&sub).await.unwrap();
    assert!(entry.is_directory);
    let renamed = session.rename(&entry, "renamed").await.unwrap();
    assert_eq!(renamed, format!("{}/renamed", dir));

    let names: Vec<String> = session
        .list_directory(&dir)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["renamed".to_string()]);

    let renamed_entry = session.stat(&renamed).await.unwrap();
    session.delete(&renamed_entry).await.unwrap();
    let err = session.stat(&renamed).await.unwrap_err();
    assert!(matches!(err, SessionError::Operation { .. }));

    let dir_entry = session.stat(&dir).await.unwrap();
    session.delete(&dir_entry).await.unwrap();
    session.disconnect().await;
}

#[tokio::test]
#[ignore]
async fn test_shell_echo() {
    let Some(session) = connected().await else { return };
    let mut output = session.open_shell().await.unwrap();
    assert!(matches!(session.open_shell().await, Err(SessionError::ShellAlreadyOpen)));

    session.send_line("echo ssh-remote-marker").await.unwrap();

    let mut seen = String::new();
    let found = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(chunk) = output.next_chunk().await {
            seen.push_str(&chunk.unwrap());
            if seen.matches("ssh-remote-marker").count() >= 2 {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(found, "shell output was: {:?}", seen);

    session.disconnect().await;
}

#[tokio::test]
#[ignore]
async fn test_disconnect_ends_shell_stream() {
    let Some(session) = connected().await else { return };
    let mut output = session.open_shell().await.unwrap();

    session.disconnect().await;

    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        while output.next_chunk().await.is_some() {}
    })
    .await;
    assert!(ended.is_ok(), "shell stream kept running after disconnect");
    assert!(matches!(session.send_line("ls").await, Err(SessionError::NotConnected)));
}

#[tokio::test]
#[ignore]
async fn test_concurrent_file_operations() {
    let Some(session) = connected().await else { return };

    let (a, b, c) = tokio::join!(
        session.list_directory("/"),
        session.stat("/"),
        session.list_directory("."),
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert!(b.unwrap().is_directory);

    session.disconnect().await;
}

/// Upload source that trickles out bytes, keeping the operation in flight.
struct SlowSource {
    remaining: usize,
}

impl Read for SlowSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        std::thread::sleep(Duration::from_millis(20));
        let n = buf.len().min(1024).min(self.remaining);
        buf[..n].fill(b'x');
        self.remaining -= n;
        Ok(n)
    }
}

impl ByteSource for SlowSource {
    fn display_name(&self) -> Option<String> {
        Some("slow.bin".to_string())
    }

    fn open(&mut self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(SlowSource {
            remaining: self.remaining,
        }))
    }
}

#[tokio::test]
#[ignore]
async fn test_disconnect_fails_in_flight_upload() {
    let Some(session) = connected().await else { return };
    let session = Arc::new(session);

    let uploading = Arc::clone(&session);
    let upload = tokio::spawn(async move {
        uploading
            .upload(SlowSource { remaining: 1024 * 1024 }, "/tmp")
            .await
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    session.disconnect().await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), upload)
        .await
        .expect("upload kept running after disconnect")
        .unwrap();
    assert!(matches!(outcome, Err(SessionError::ConnectionClosed)));
}

#[tokio::test]
#[ignore]
async fn test_disconnect_while_consuming_shell() {
    let Some(session) = connected().await else { return };
    let mut output = session.open_shell().await.unwrap();
    session
        .send_line("while true; do echo tick; sleep 0.05; done")
        .await
        .unwrap();

    let consumer = tokio::spawn(async move {
        let mut chunks = 0usize;
        while let Some(chunk) = output.next_chunk().await {
            if chunk.is_ok() {
                chunks += 1;
            }
        }
        chunks
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    session.disconnect().await;

    let chunks = tokio::time::timeout(Duration::from_secs(5), consumer)
        .await
        .expect("shell consumer never finished")
        .unwrap();
    assert!(chunks > 0);
}

#[tokio::test]
#[ignore]
async fn test_reconnect_tears_down_previous_shell() {
    let Some(session) = connected().await else { return };
    let Some(credentials) = credentials() else { return };
    let mut old_output = session.open_shell().await.unwrap();

    session.connect(credentials, CONNECT_TIMEOUT).await.unwrap();
    assert_eq!(session.state(), ConnectionState::Connected);

    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        while old_output.next_chunk().await.is_some() {}
    })
    .await;
    assert!(ended.is_ok(), "old shell survived the reconnect");

    // 新会话可以再次打开 Shell
    let _new_output = session.open_shell().await.unwrap();
    session.disconnect().await;
}

#[tokio::test]
#[ignore]
async fn test_failed_download_keeps_local_file() {
    let Some(session) = connected().await else { return };
    let local = tempfile::tempdir().unwrap();
    let existing = local.path().join("keep.txt");
    std::fs::write(&existing, "local content").unwrap();

    let err = session
        .download("/definitely/not/here/keep.txt", "keep.txt", LocalDirSink::new(local.path()))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Operation { .. }));
    assert_eq!(std::fs::read_to_string(&existing).unwrap(), "local content");

    session.disconnect().await;
}

#[tokio::test]
#[ignore]
async fn test_many_operations_release_their_channels() {
    let Some(session) = connected().await else { return };

    // 远端通常限制每个连接的通道数（MaxSessions），泄漏的通道会很快耗尽配额
    for _ in 0..40 {
        session.stat("/").await.unwrap();
        session.list_directory("/").await.unwrap();
        assert!(session.read_file("/definitely/not/here").await.is_err());
    }
    assert!(session.list_directory("/").await.is_ok());

    session.disconnect().await;
}
