// 远程文件条目
use ssh2::FileStat;
use std::cmp::Ordering;

/// Snapshot of one remote file or directory, as reported by one listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileEntry {
    pub name: String,
    pub path: String,
    pub is_directory: bool,
    pub size_bytes: u64,
    /// Modification time exactly as the server reported it (seconds since
    /// the epoch), empty when the server sent none.
    pub modified_time_raw: String,
}

impl RemoteFileEntry {
    pub fn from_stat(name: String, path: String, stat: &FileStat) -> Self {
        Self {
            name,
            path,
            is_directory: stat.is_dir(),
            size_bytes: stat.size.unwrap_or(0),
            modified_time_raw: stat.mtime.map(|t| t.to_string()).unwrap_or_default(),
        }
    }

    pub fn is_pseudo_entry(name: &str) -> bool {
        name == "." || name == ".."
    }
}

/// Presentation order: directories first, then by name.
pub fn display_order(a: &RemoteFileEntry, b: &RemoteFileEntry) -> Ordering {
    b.is_directory
        .cmp(&a.is_directory)
        .then_with(|| a.name.cmp(&b.name))
}

pub fn sort_for_display(entries: &mut [RemoteFileEntry]) {
    entries.sort_by(display_order);
}
