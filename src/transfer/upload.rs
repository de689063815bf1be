// 上传功能
use crate::transfer::path::{child_path, upload_file_name};
use crate::transfer::sftp::FileTransferChannel;
use crate::utils::error::{Result, SessionError};
use crate::utils::file::display_name;
use log::info;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;

/// Where upload bytes come from. Picking the source is the caller's
/// business; the core only asks for a name and a stream.
pub trait ByteSource: Send {
    /// Name the caller chose for this source, if any.
    fn display_name(&self) -> Option<String>;

    fn open(&mut self) -> io::Result<Box<dyn Read + Send>>;

    /// Total size, when known up front.
    fn size_hint(&self) -> Option<u64> {
        None
    }
}

/// A local file as upload source.
#[derive(Debug, Clone)]
pub struct LocalFileSource {
    path: PathBuf,
}

impl LocalFileSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl ByteSource for LocalFileSource {
    fn display_name(&self) -> Option<String> {
        display_name(&self.path)
    }

    fn open(&mut self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(&self.path)?))
    }

    fn size_hint(&self) -> Option<u64> {
        std::fs::metadata(&self.path).ok().map(|m| m.len())
    }
}

/// In-memory source, mostly for text payloads and tests.
#[derive(Debug, Clone)]
pub struct BytesSource {
    name: Option<String>,
    bytes: Vec<u8>,
}

impl BytesSource {
    pub fn new(name: Option<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name,
            bytes: bytes.into(),
        }
    }
}

impl ByteSource for BytesSource {
    fn display_name(&self) -> Option<String> {
        self.name.clone()
    }

    fn open(&mut self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(io::Cursor::new(self.bytes.clone())))
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.bytes.len() as u64)
    }
}

/// Uploads `source` into `destination_dir` under the source's display name
/// and returns the remote path written.
pub fn upload<S: ByteSource + ?Sized>(
    channel: &FileTransferChannel,
    source: &mut S,
    destination_dir: &str,
) -> Result<String> {
    let file_name = upload_file_name(source.display_name());
    let remote_path = child_path(destination_dir, &file_name);

    let mut reader = source.open().map_err(SessionError::Stream)?;
    let written = channel.write_from(&remote_path, &mut reader)?;

    info!("Uploaded {} bytes to {}", written, remote_path);
    Ok(remote_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn local_source_reports_name_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.csv");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"a,b\n1,2\n")
            .unwrap();

        let mut source = LocalFileSource::new(&path);
        assert_eq!(source.display_name(), Some("report.csv".to_string()));
        assert_eq!(source.size_hint(), Some(8));

        let mut content = String::new();
        source.open().unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "a,b\n1,2\n");
    }

    #[test]
    fn missing_local_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = LocalFileSource::new(dir.path().join("absent.bin"));
        assert!(source.open().is_err());
        assert_eq!(source.size_hint(), None);
    }

    #[test]
    fn bytes_source_can_be_reopened() {
        let mut source = BytesSource::new(None, "hello");
        assert_eq!(source.display_name(), None);
        for _ in 0..2 {
            let mut buf = Vec::new();
            source.open().unwrap().read_to_end(&mut buf).unwrap();
            assert_eq!(buf, b"hello");
        }
    }
}
