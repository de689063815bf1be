// SFTP 文件传输通道：每个操作单独打开，结束（包括出错）时必定释放
use crate::ssh::client::{
    is_end_of_listing, retry, retry_io, settle, would_block, Backoff, SshClient, RELEASE_TIMEOUT,
};
use crate::transfer::entry::RemoteFileEntry;
use crate::transfer::path::{child_path, renamed_path};
use crate::utils::error::{Result, SessionError};
use log::debug;
use ssh2::{File, OpenFlags, OpenType, Sftp};
use std::io::{self, Read, Write};
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub(crate) const CHUNK_SIZE: usize = 32 * 1024;
const FILE_MODE: i32 = 0o644;
const DIR_MODE: i32 = 0o755;

pub struct FileTransferChannel {
    sftp: Sftp,
    token: CancellationToken,
}

impl FileTransferChannel {
    /// Opens a fresh SFTP subsystem channel. Fails without touching the
    /// transport when the session is already closed.
    pub fn open(client: &SshClient, token: CancellationToken) -> Result<Self> {
        let sftp = client.open_sftp(&token)?;
        debug!("SFTP channel opened on {}", client.address());
        Ok(Self { sftp, token })
    }

    pub fn list(&self, path: &str) -> Result<Vec<RemoteFileEntry>> {
        let dir = retry(
            &self.token,
            || self.sftp.opendir(Path::new(path)),
            |e| SessionError::operation(path, e),
        )?;
        let mut dir = RemoteHandle::new(dir, path);

        let mut entries = Vec::new();
        let mut backoff = Backoff::new();
        loop {
            if self.token.is_cancelled() {
                return Err(SessionError::ConnectionClosed);
            }
            match dir.file.readdir() {
                Ok((name, stat)) => {
                    backoff.reset();
                    let name = name.to_string_lossy().to_string();
                    if RemoteFileEntry::is_pseudo_entry(&name) {
                        continue;
                    }
                    let entry_path = child_path(path, &name);
                    entries.push(RemoteFileEntry::from_stat(name, entry_path, &stat));
                }
                Err(e) if is_end_of_listing(&e) => break,
                Err(e) if would_block(&e) => backoff.wait(),
                Err(e) => return Err(SessionError::operation(path, e)),
            }
        }

        drop(dir);
        debug!("Listed {} entries in {}", entries.len(), path);
        Ok(entries)
    }

    pub fn stat(&self, path: &str) -> Result<RemoteFileEntry> {
        let stat = retry(
            &self.token,
            || self.sftp.stat(Path::new(path)),
            |e| SessionError::operation(path, e),
        )?;
        let name = match path.trim_end_matches('/').rsplit('/').next() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => path.to_string(),
        };
        Ok(RemoteFileEntry::from_stat(name, path.to_string(), &stat))
    }

    pub fn create_directory(&self, parent: &str, name: &str) -> Result<String> {
        let path = child_path(parent, name);
        retry(
            &self.token,
            || self.sftp.mkdir(Path::new(&path), DIR_MODE),
            |e| SessionError::operation(&path, e),
        )?;
        Ok(path)
    }

    pub fn delete(&self, entry: &RemoteFileEntry) -> Result<()> {
        let path = Path::new(&entry.path);
        if entry.is_directory {
            retry(
                &self.token,
                || self.sftp.rmdir(path),
                |e| SessionError::operation(&entry.path, e),
            )
        } else {
            retry(
                &self.token,
                || self.sftp.unlink(path),
                |e| SessionError::operation(&entry.path, e),
            )
        }
    }

    pub fn rename(&self, entry: &RemoteFileEntry, new_name: &str) -> Result<String> {
        let target = renamed_path(&entry.path, new_name);
        retry(
            &self.token,
            || {
                self.sftp
                    .rename(Path::new(&entry.path), Path::new(&target), None)
            },
            |e| SessionError::operation(&entry.path, e),
        )?;
        Ok(target)
    }

    /// Loads the whole remote file and decodes it as UTF-8. Unbounded unless
    /// `limit` is set.
    pub fn read_whole_file(&self, path: &str, limit: Option<u64>) -> Result<String> {
        let mut handle = self.open_for_read(path)?;
        let mut content = Vec::new();
        let mut buffer = vec![0u8; CHUNK_SIZE];

        loop {
            let n = self.read_chunk(&mut handle, &mut buffer)?;
            if n == 0 {
                break;
            }
            content.extend_from_slice(&buffer[..n]);
            if let Some(limit) = limit {
                if content.len() as u64 > limit {
                    return Err(SessionError::TooLarge {
                        path: path.to_string(),
                        limit,
                    });
                }
            }
        }

        Ok(String::from_utf8_lossy(&content).into_owned())
    }

    /// Encodes `content` as UTF-8 and replaces the remote file with it.
    pub fn write_whole_file(&self, path: &str, content: &str) -> Result<()> {
        let mut handle = self.open_for_write(path)?;
        self.write_all(&mut handle, content.as_bytes())?;
        handle.finish(&self.token)
    }

    /// Streams `reader` into a new (or truncated) remote file.
    pub fn write_from<R: Read>(&self, path: &str, reader: &mut R) -> Result<u64> {
        let mut handle = self.open_for_write(path)?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;

        loop {
            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(SessionError::Stream(e)),
            };
            self.write_all(&mut handle, &buffer[..n])?;
            total += n as u64;
        }

        handle.finish(&self.token)?;
        Ok(total)
    }

    /// Streams a remote file chunk by chunk into the writer `create` returns.
    /// `create` runs only after the remote file has been opened, so a failed
    /// open leaves the destination untouched.
    pub fn read_into<W, F>(&self, path: &str, create: F) -> Result<u64>
    where
        W: Write,
        F: FnOnce() -> Result<W>,
    {
        let mut handle = self.open_for_read(path)?;
        let mut writer = create()?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;

        loop {
            let n = self.read_chunk(&mut handle, &mut buffer)?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buffer[..n])
                .map_err(SessionError::Stream)?;
            total += n as u64;
        }

        writer.flush().map_err(SessionError::Stream)?;
        Ok(total)
    }

    fn open_for_read<'a>(&self, path: &'a str) -> Result<RemoteHandle<'a>> {
        let file = retry(
            &self.token,
            || self.sftp.open(Path::new(path)),
            |e| SessionError::operation(path, e),
        )?;
        Ok(RemoteHandle::new(file, path))
    }

    fn open_for_write<'a>(&self, path: &'a str) -> Result<RemoteHandle<'a>> {
        let file = retry(
            &self.token,
            || {
                self.sftp.open_mode(
                    Path::new(path),
                    OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                    FILE_MODE,
                    OpenType::File,
                )
            },
            |e| SessionError::operation(path, e),
        )?;
        Ok(RemoteHandle::new(file, path))
    }

    fn read_chunk(&self, handle: &mut RemoteHandle<'_>, buffer: &mut [u8]) -> Result<usize> {
        retry_io(&self.token, || handle.file.read(buffer))
    }

    fn write_all(&self, handle: &mut RemoteHandle<'_>, bytes: &[u8]) -> Result<()> {
        let mut rest = bytes;
        while !rest.is_empty() {
            let written = retry_io(&self.token, || handle.file.write(rest))?;
            if written == 0 {
                return Err(SessionError::Stream(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "remote file accepted no bytes",
                )));
            }
            rest = &rest[written..];
        }
        Ok(())
    }
}

impl Drop for FileTransferChannel {
    fn drop(&mut self) {
        // ssh2 在释放 Sftp 时切换到阻塞模式完成关闭，超时由会话的释放超时约束
        debug!("Releasing SFTP channel");
    }
}

/// An open remote file or directory handle, closed on every exit path.
/// `finish` reports the server's verdict; dropping an unfinished handle
/// closes it best-effort.
struct RemoteHandle<'a> {
    file: File,
    path: &'a str,
    open: bool,
}

impl<'a> RemoteHandle<'a> {
    fn new(file: File, path: &'a str) -> Self {
        Self {
            file,
            path,
            open: true,
        }
    }

    fn finish(mut self, token: &CancellationToken) -> Result<()> {
        let path = self.path;
        let result = retry(token, || self.file.close(), |e| SessionError::operation(path, e));
        // 被取消时关闭尚未完成，交给 Drop 继续
        if !matches!(result, Err(SessionError::ConnectionClosed)) {
            self.open = false;
        }
        result
    }
}

impl Drop for RemoteHandle<'_> {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        if let Err(e) = settle(RELEASE_TIMEOUT, || self.file.close()) {
            debug!("Closing {} failed: {}", self.path, e);
        }
    }
}
