// 文件传输模块入口
pub mod download;
pub mod entry;
pub mod path;
pub mod progress;
pub mod sftp;
pub mod upload;

pub use download::{ByteSink, LocalDirSink, MemorySink};
pub use entry::{sort_for_display, RemoteFileEntry};
pub use sftp::FileTransferChannel;
pub use upload::{ByteSource, BytesSource, LocalFileSource};
