// 库文件，导出模块
pub mod cli;
pub mod config;
pub mod console;
pub mod ssh;
pub mod threadpool;
pub mod transfer;
pub mod utils;

use anyhow::{bail, Context, Result};
use config::{Config, Operation};
use ssh::SshSession;
use tokio::io::AsyncReadExt;
use transfer::progress::{ProgressTracker, TrackedSink, TrackedSource};
use transfer::{sort_for_display, ByteSource, LocalDirSink, LocalFileSource};

pub use ssh::{ConnectionState, Credentials, SessionOptions};
pub use utils::error::{ConnectionError, SessionError};

/// Connects, runs the configured operation and always disconnects.
pub async fn run(config: Config) -> Result<()> {
    let session = SshSession::new(config.session_options());

    session
        .connect(config.credentials.clone(), config.connect_timeout)
        .await
        .context("Failed to connect to SSH server")?;

    let outcome = run_operation(&session, &config.operation).await;
    session.disconnect().await;
    outcome
}

async fn run_operation(session: &SshSession, operation: &Operation) -> Result<()> {
    match operation {
        Operation::Shell => console::run_shell(session).await,
        Operation::List { path } => {
            let mut entries = session
                .list_directory(path)
                .await
                .with_context(|| format!("Failed to list {}", path))?;
            sort_for_display(&mut entries);
            console::print_listing(path, &entries);
            Ok(())
        }
        Operation::Stat { path } => {
            let entry = session.stat(path).await?;
            println!("{}", console::format_entry(&entry));
            Ok(())
        }
        Operation::Upload { local_path, remote_dir } => {
            if !local_path.is_file() {
                bail!("Local file does not exist: {}", local_path.display());
            }
            let source = LocalFileSource::new(local_path);
            let tracker = ProgressTracker::new(
                source.size_hint().unwrap_or(0),
                &format!("Uploading {}", local_path.display()),
            );

            match session
                .upload(TrackedSource::new(source, tracker.clone()), remote_dir)
                .await
            {
                Ok(remote_path) => {
                    tracker.finish();
                    println!("✅ Uploaded to {}", remote_path);
                    Ok(())
                }
                Err(e) => {
                    tracker.finish_with_error(&e.to_string());
                    Err(e).context("Upload failed")
                }
            }
        }
        Operation::Download { remote_path, local_dir } => {
            let entry = session.stat(remote_path).await?;
            if entry.is_directory {
                bail!("{} is a directory", remote_path);
            }
            let tracker =
                ProgressTracker::new(entry.size_bytes, &format!("Downloading {}", entry.path));
            let sink = LocalDirSink::new(local_dir);
            let target = sink.target_for(&entry.name)?;

            match session
                .download(&entry.path, &entry.name, TrackedSink::new(sink, tracker.clone()))
                .await
            {
                Ok(_) => {
                    tracker.finish();
                    println!("✅ Downloaded to {}", target.display());
                    Ok(())
                }
                Err(e) => {
                    tracker.finish_with_error(&e.to_string());
                    Err(e).context("Download failed")
                }
            }
        }
        Operation::MakeDirectory { parent, name } => {
            let created = session.make_directory(parent, name).await?;
            println!("Directory '{}' created", created);
            Ok(())
        }
        Operation::Delete { path } => {
            let entry = session.stat(path).await?;
            session.delete(&entry).await?;
            println!("Deleted: {}", entry.path);
            Ok(())
        }
        Operation::Rename { path, new_name } => {
            let entry = session.stat(path).await?;
            let renamed = session.rename(&entry, new_name).await?;
            println!("Renamed to '{}'", renamed);
            Ok(())
        }
        Operation::Read { path } => {
            let content = session.read_file(path).await?;
            print!("{}", content);
            Ok(())
        }
        Operation::Write { path, from } => {
            let content = match from {
                Some(file) => std::fs::read_to_string(file)
                    .with_context(|| format!("Failed to read {}", file.display()))?,
                None => {
                    let mut content = String::new();
                    tokio::io::stdin()
                        .read_to_string(&mut content)
                        .await
                        .context("Failed to read stdin")?;
                    content
                }
            };
            session.write_file(path, &content).await?;
            println!("File saved successfully");
            Ok(())
        }
    }
}
