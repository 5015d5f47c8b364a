//! POSIX path helpers for device-side paths.
//!
//! Device paths are always `/`-separated regardless of the host OS, so these
//! work on strings rather than `std::path::Path`.

/// Normalize a user- or device-supplied path to POSIX form.
///
/// Backslashes become slashes, repeated separators and `.` segments collapse,
/// and any trailing separator is removed (the root stays `/`).
pub fn to_posix(path: &str) -> String {
    let replaced = path.replace('\\', "/");
    let absolute = replaced.starts_with('/');

    let segments: Vec<&str> = replaced
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();

    let joined = segments.join("/");
    if absolute {
        format!("/{joined}")
    } else {
        joined
    }
}

/// Join a directory and an entry name.
pub fn join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Final component of a path.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// True when `path` equals or is nested under any of the ignored directories.
///
/// Both sides must already be normalized. Matching is case-sensitive.
pub fn is_ignored(path: &str, ignored_dirs: &[String]) -> bool {
    ignored_dirs.iter().any(|dir| {
        if dir == "/" {
            return true;
        }
        path == dir
            || path
                .strip_prefix(dir.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

/// True when any component of the path starts with a dot.
pub fn has_dot_component(path: &str) -> bool {
    path.split('/').any(|segment| segment.starts_with('.'))
}

/// Lower-cased extension including the leading dot, if the name has one.
///
/// A leading dot alone (`.nomedia`) is a hidden file name, not an extension.
pub fn extension(path: &str) -> Option<String> {
    let name = file_name(path);
    match name.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < name.len() => Some(name[idx..].to_lowercase()),
        _ => None,
    }
}

/// True when the file's extension is one of the (normalized) wanted types.
pub fn matches_file_type(path: &str, file_types: &[String]) -> bool {
    match extension(path) {
        Some(ext) => file_types.iter().any(|t| *t == ext),
        None => false,
    }
}

/// Path of `path` relative to `root`, without a leading slash.
///
/// Returns `None` when `path` is not under `root`.
pub fn relative_to<'a>(path: &'a str, root: &str) -> Option<&'a str> {
    if root == "/" {
        return path.strip_prefix('/');
    }
    let rest = path.strip_prefix(root)?;
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_posix_windows_style() {
        assert_eq!(to_posix("\\sdcard\\DCIM\\"), "/sdcard/DCIM");
    }

    #[test]
    fn test_to_posix_idempotent() {
        for input in ["/sdcard/DCIM", "\\sdcard\\DCIM\\", "//a//b/./c/", "/", "rel/x/"] {
            let once = to_posix(input);
            assert_eq!(to_posix(&once), once, "not idempotent for {input}");
        }
    }

    #[test]
    fn test_to_posix_root() {
        assert_eq!(to_posix("/"), "/");
        assert_eq!(to_posix("\\"), "/");
    }

    #[test]
    fn test_is_ignored_exact_and_nested() {
        let ignored = vec!["/sdcard/Android".to_string()];
        assert!(is_ignored("/sdcard/Android", &ignored));
        assert!(is_ignored("/sdcard/Android/data/x.jpg", &ignored));
        assert!(!is_ignored("/sdcard/AndroidBackup/x.jpg", &ignored));
        assert!(!is_ignored("/sdcard/android/x.jpg", &ignored));
    }

    #[test]
    fn test_dot_components() {
        assert!(has_dot_component("/sdcard/.trash/c.jpg"));
        assert!(has_dot_component("/sdcard/DCIM/.hidden.jpg"));
        assert!(!has_dot_component("/sdcard/DCIM/a.jpg"));
    }

    #[test]
    fn test_extension() {
        assert_eq!(extension("/a/B.JPG").as_deref(), Some(".jpg"));
        assert_eq!(extension("/a/archive.tar.gz").as_deref(), Some(".gz"));
        assert_eq!(extension("/a/.nomedia"), None);
        assert_eq!(extension("/a/README"), None);
        assert_eq!(extension("/a/trailing."), None);
    }

    #[test]
    fn test_relative_to() {
        assert_eq!(relative_to("/sdcard/DCIM/a.jpg", "/sdcard"), Some("DCIM/a.jpg"));
        assert_eq!(relative_to("/sdcardx/a.jpg", "/sdcard"), None);
        assert_eq!(relative_to("/x/a.jpg", "/"), Some("x/a.jpg"));
    }
}
