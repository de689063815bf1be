// 下载功能
use crate::transfer::sftp::FileTransferChannel;
use crate::utils::error::{Result, SessionError};
use crate::utils::file::{ensure_parent_dir, sanitize_file_name};
use log::info;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Where downloaded bytes go. The caller decides the storage location; the
/// core hands over the display name and writes the stream.
pub trait ByteSink: Send {
    fn create(&mut self, display_name: &str) -> io::Result<Box<dyn Write + Send>>;
}

/// Writes downloads into a local directory, one file per display name.
#[derive(Debug, Clone)]
pub struct LocalDirSink {
    dir: PathBuf,
    last_written: Option<PathBuf>,
}

impl LocalDirSink {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            last_written: None,
        }
    }

    pub fn target_for(&self, display_name: &str) -> io::Result<PathBuf> {
        let file_name = sanitize_file_name(display_name).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unusable file name: {:?}", display_name),
            )
        })?;
        Ok(self.dir.join(file_name))
    }

    pub fn last_written(&self) -> Option<&Path> {
        self.last_written.as_deref()
    }
}

impl ByteSink for LocalDirSink {
    fn create(&mut self, display_name: &str) -> io::Result<Box<dyn Write + Send>> {
        let target = self.target_for(display_name)?;
        ensure_parent_dir(&target)?;
        let file = File::create(&target)?;
        self.last_written = Some(target);
        Ok(Box::new(file))
    }
}

/// Collects downloads in memory; the buffer stays readable after the sink
/// has been moved into an operation.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct MemoryWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ByteSink for MemorySink {
    fn create(&mut self, _display_name: &str) -> io::Result<Box<dyn Write + Send>> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(Box::new(MemoryWriter {
            buffer: Arc::clone(&self.buffer),
        }))
    }
}

/// Streams `remote_path` into the sink under `display_name`; returns the
/// number of bytes written.
pub fn download<K: ByteSink + ?Sized>(
    channel: &FileTransferChannel,
    remote_path: &str,
    display_name: &str,
    sink: &mut K,
) -> Result<u64> {
    // 远程文件打开成功后才创建本地目标
    let written = channel.read_into(remote_path, || {
        sink.create(display_name).map_err(SessionError::Stream)
    })?;

    info!("Downloaded {} ({} bytes)", remote_path, written);
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn local_sink_writes_into_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = LocalDirSink::new(dir.path().join("downloads"));

        let mut writer = sink.create("notes.txt").unwrap();
        writer.write_all(b"remote bytes").unwrap();
        writer.flush().unwrap();
        drop(writer);

        let target = dir.path().join("downloads").join("notes.txt");
        assert_eq!(sink.last_written(), Some(target.as_path()));
        assert_eq!(fs::read(&target).unwrap(), b"remote bytes");
    }

    #[test]
    fn local_sink_refuses_escaping_names() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LocalDirSink::new(dir.path());
        assert_eq!(
            sink.target_for("../secret").unwrap(),
            dir.path().join("secret")
        );
        assert!(sink.target_for("..").is_err());
    }

    #[test]
    fn memory_sink_keeps_contents_after_move() {
        let sink = MemorySink::new();
        let mut moved = sink.clone();
        let mut writer = moved.create("ignored").unwrap();
        writer.write_all(b"abc").unwrap();
        writer.write_all(b"def").unwrap();
        assert_eq!(sink.contents(), b"abcdef");
    }
}
