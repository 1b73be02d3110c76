//! Remote path helpers
//!
//! Remote SFTP paths always use `/`, whatever the local or remote OS.

use std::path::Path;

pub fn is_absolute_remote_path(path: &str) -> bool {
    path.starts_with('/')
}

/// Join remote path components with `/`.
pub fn join_remote_path(base: &str, component: &str) -> String {
    let component = component.trim_start_matches('/');
    if base.ends_with('/') {
        format!("{}{}", base, component)
    } else {
        format!("{}/{}", base, component)
    }
}

/// Resolve `path` against the login directory.
///
/// Handles `~`, `~/rest`, absolute paths (returned as is) and relative
/// paths. No round trip is made, so the target need not exist yet.
pub fn resolve_remote_path(home: &str, path: &str) -> String {
    let path = path.trim();
    if path.is_empty() || path == "." || path == "~" {
        home.to_string()
    } else if let Some(rest) = path.strip_prefix("~/") {
        join_remote_path(home, rest)
    } else if is_absolute_remote_path(path) {
        path.to_string()
    } else {
        join_remote_path(home, path.strip_prefix("./").unwrap_or(path))
    }
}

/// Last component of a remote path.
pub fn remote_file_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or(path)
}

/// Last component of a local path, for progress labels.
pub fn local_file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_remote_path() {
        assert_eq!(join_remote_path("/home/user", "file.txt"), "/home/user/file.txt");
        assert_eq!(join_remote_path("/home/user/", "file.txt"), "/home/user/file.txt");
        assert_eq!(join_remote_path("/", "etc"), "/etc");
    }

    #[test]
    fn test_resolve_remote_path() {
        let home = "/home/alice";
        assert_eq!(resolve_remote_path(home, "~"), "/home/alice");
        assert_eq!(resolve_remote_path(home, ""), "/home/alice");
        assert_eq!(resolve_remote_path(home, "~/logs"), "/home/alice/logs");
        assert_eq!(resolve_remote_path(home, "/var/log"), "/var/log");
        assert_eq!(resolve_remote_path(home, "docs/a.md"), "/home/alice/docs/a.md");
        assert_eq!(resolve_remote_path(home, "./docs"), "/home/alice/docs");
    }

    #[test]
    fn test_file_names() {
        assert_eq!(remote_file_name("/srv/data/report.csv"), "report.csv");
        assert_eq!(remote_file_name("/srv/data/"), "data");
        assert_eq!(remote_file_name("plain"), "plain");
        assert_eq!(local_file_name("/tmp/upload.bin"), "upload.bin");
    }
}
