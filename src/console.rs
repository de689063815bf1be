// 终端交互：Shell 输入输出与目录列表显示
use crate::ssh::SshSession;
use crate::transfer::RemoteFileEntry;
use anyhow::{Context, Result};
use log::warn;
use std::io::{self, BufRead, BufReader};
use std::thread;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

const PENDING_LINES: usize = 16;

/// Pipes stdin lines into the remote shell and remote output to stdout
/// until the shell ends. Stream errors are shown inline, not fatal.
pub async fn run_shell(session: &SshSession) -> Result<()> {
    let mut output = session.open_shell().await.context("Failed to open shell")?;
    let mut lines = spawn_line_reader(BufReader::new(io::stdin()));
    let mut stdout = tokio::io::stdout();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            chunk = output.next_chunk() => match chunk {
                Some(Ok(text)) => {
                    stdout.write_all(text.as_bytes()).await?;
                    stdout.flush().await?;
                }
                Some(Err(e)) => {
                    stdout.write_all(format!("\nError: {}\n", e).as_bytes()).await?;
                    stdout.flush().await?;
                }
                None => break,
            },
            line = lines.recv(), if stdin_open => match line {
                Some(Err(e)) => return Err(e).context("Failed to read stdin"),
                Some(Ok(line)) => {
                    if let Err(e) = session.send_line(&line).await {
                        eprintln!("\nError: {}", e);
                        if e.is_disconnect() {
                            break;
                        }
                    }
                }
                None => {
                    // 标准输入结束时关闭 Shell，输出流随之结束
                    stdin_open = false;
                    session.close_shell().await;
                }
            },
        }
    }

    Ok(())
}

/// Reads lines on a dedicated thread; the channel closes at end of input.
/// The thread is never joined, so a read still blocked on the terminal does
/// not hold up process exit once the shell has ended.
pub fn spawn_line_reader<R>(reader: R) -> mpsc::Receiver<io::Result<String>>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel(PENDING_LINES);
    let spawned = thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            for line in reader.lines() {
                let failed = line.is_err();
                if tx.blocking_send(line).is_err() || failed {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        warn!("Failed to start stdin reader: {}", e);
    }
    rx
}

pub fn format_entry(entry: &RemoteFileEntry) -> String {
    let kind = if entry.is_directory { 'd' } else { '-' };
    let name = if entry.is_directory {
        format!("{}/", entry.name)
    } else {
        entry.name.clone()
    };
    format!(
        "{} {:>12} {:>12} {}",
        kind, entry.size_bytes, entry.modified_time_raw, name
    )
}

pub fn print_listing(path: &str, entries: &[RemoteFileEntry]) {
    println!("{} ({} entries)", path, entries.len());
    for entry in entries {
        println!("{}", format_entry(entry));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "terminal gone"))
        }
    }

    #[tokio::test]
    async fn line_reader_forwards_lines_then_closes() {
        let mut lines = spawn_line_reader(Cursor::new("ls -la\necho hi\n"));
        assert_eq!(lines.recv().await.unwrap().unwrap(), "ls -la");
        assert_eq!(lines.recv().await.unwrap().unwrap(), "echo hi");
        assert!(lines.recv().await.is_none());
    }

    #[tokio::test]
    async fn line_reader_reports_read_error_once() {
        let mut lines = spawn_line_reader(BufReader::new(FailingReader));
        assert!(lines.recv().await.unwrap().is_err());
        assert!(lines.recv().await.is_none());
    }

    #[test]
    fn directory_rows_are_marked() {
        let entry = RemoteFileEntry {
            name: "sub".to_string(),
            path: "/home/u/sub".to_string(),
            is_directory: true,
            size_bytes: 4096,
            modified_time_raw: "1700000000".to_string(),
        };
        let row = format_entry(&entry);
        assert!(row.starts_with('d'));
        assert!(row.ends_with("sub/"));
        assert!(row.contains("1700000000"));
    }

    #[test]
    fn file_rows_show_size() {
        let entry = RemoteFileEntry {
            name: "a.txt".to_string(),
            path: "/home/u/a.txt".to_string(),
            is_directory: false,
            size_bytes: 12,
            modified_time_raw: String::new(),
        };
        let row = format_entry(&entry);
        assert!(row.starts_with('-'));
        assert!(row.contains(" 12 "));
        assert!(row.ends_with("a.txt"));
    }
}
