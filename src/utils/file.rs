use std::io;
use std::path::Path;

pub fn ensure_parent_dir<P: AsRef<Path>>(file_path: P) -> io::Result<()> {
    if let Some(parent) = file_path.as_ref().parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Final component of a local path, if it has a printable one.
pub fn display_name<P: AsRef<Path>>(file_path: P) -> Option<String> {
    file_path
        .as_ref()
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .filter(|name| !name.is_empty())
}

/// Strips any directory components a remote display name may carry so a
/// download can never escape its destination directory.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let candidate = name.rsplit(['/', '\\']).next().unwrap_or(name);
    match candidate {
        "" | "." | ".." => None,
        other => Some(other.to_string()),
    }
}
