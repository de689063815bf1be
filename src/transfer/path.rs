// 远程路径拼接：不做规范化，只处理结尾斜杠

/// Remote name used when an upload source cannot tell its own name.
pub const FALLBACK_UPLOAD_NAME: &str = "upload.tmp";

/// `parent` + `name`, inserting a `/` unless `parent` already ends with one.
pub fn child_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Replaces the last segment of `path` with `new_name`, keeping the parent
/// exactly as written.
pub fn renamed_path(path: &str, new_name: &str) -> String {
    match path.rfind('/') {
        Some(index) => format!("{}{}", &path[..=index], new_name),
        None => new_name.to_string(),
    }
}

/// Remote file name for an upload: the source's display name, or the
/// fallback when it has none.
pub fn upload_file_name(display_name: Option<String>) -> String {
    display_name
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_UPLOAD_NAME.to_string())
}
