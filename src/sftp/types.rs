//! SFTP data types

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// File type bits of `st_mode`
pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

/// Raw attributes as reported by the server
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteAttrs {
    pub permissions: Option<u32>,
    pub size: Option<u64>,
    pub mtime: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// Entry name plus attributes, before normalization
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntry {
    pub name: String,
    pub attrs: RemoteAttrs,
}

/// Entry kind, decided from the mode bits only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Dir,
    Symlink,
    /// Sockets, fifos and device nodes
    Other,
}

impl FileKind {
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFDIR => FileKind::Dir,
            S_IFREG => FileKind::File,
            S_IFLNK => FileKind::Symlink,
            _ => FileKind::Other,
        }
    }

    fn type_char(self) -> char {
        match self {
            FileKind::File => '-',
            FileKind::Dir => 'd',
            FileKind::Symlink => 'l',
            FileKind::Other => '?',
        }
    }
}

/// Normalized directory entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    /// `ls -l` style line
    pub longname: String,
    pub size: u64,
    /// Unix seconds
    pub mtime: u64,
    pub kind: FileKind,
    /// Permission bits as octal, e.g. "755"
    pub permissions: String,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl FileEntry {
    pub fn from_remote(entry: RemoteEntry) -> Self {
        let attrs = &entry.attrs;
        let mode = attrs.permissions.unwrap_or(0);
        let kind = FileKind::from_mode(mode);
        let size = attrs.size.unwrap_or(0);
        let mtime = attrs.mtime.map(u64::from).unwrap_or(0);
        let longname = format_longname(kind, mode, attrs.uid, attrs.gid, size, mtime, &entry.name);

        Self {
            longname,
            size,
            mtime,
            kind,
            permissions: format!("{:o}", mode & 0o7777),
            uid: attrs.uid,
            gid: attrs.gid,
            name: entry.name,
        }
    }
}

fn format_longname(
    kind: FileKind,
    mode: u32,
    uid: Option<u32>,
    gid: Option<u32>,
    size: u64,
    mtime: u64,
    name: &str,
) -> String {
    let mut perms = String::with_capacity(10);
    perms.push(kind.type_char());
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        perms.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        perms.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        perms.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }

    let date = Utc
        .timestamp_opt(mtime as i64, 0)
        .single()
        .map(|t: DateTime<Utc>| t.format("%b %d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());

    let owner = uid.map(|u| u.to_string()).unwrap_or_else(|| "-".into());
    let group = gid.map(|g| g.to_string()).unwrap_or_else(|| "-".into());

    format!("{} 1 {} {} {:>8} {} {}", perms, owner, group, size, date, name)
}

/// Result of listing one directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryListing {
    pub path: String,
    pub files: Vec<FileEntry>,
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Transfer state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Starting,
    Active,
    Complete,
    Error,
}

/// Live record of one in-flight transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub id: String,
    pub direction: TransferDirection,
    pub local_path: String,
    pub remote_path: String,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub started_at: DateTime<Utc>,
    pub state: TransferState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

/// Progress notification emitted at every chunk boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub transfer_id: String,
    pub filename: String,
    pub transferred: u64,
    pub total: u64,
    /// 0-100, rounded
    pub percentage: u32,
    /// Bytes per second over the last chunk
    pub speed: u64,
    pub speed_text: String,
}

/// Completion result of a transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSummary {
    pub success: bool,
    pub transfer_id: String,
    pub direction: TransferDirection,
    pub local_path: String,
    pub remote_path: String,
    pub file_size: u64,
    pub transferred: u64,
    pub duration_ms: u64,
}

/// Transfer error notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferFailure {
    pub transfer_id: String,
    pub filename: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, mode: u32) -> RemoteEntry {
        RemoteEntry {
            name: name.to_string(),
            attrs: RemoteAttrs {
                permissions: Some(mode),
                size: Some(4096),
                mtime: Some(0),
                uid: Some(1000),
                gid: Some(1000),
            },
        }
    }

    #[test]
    fn test_kind_comes_from_mode_bits() {
        assert_eq!(FileKind::from_mode(0o040755), FileKind::Dir);
        assert_eq!(FileKind::from_mode(0o100644), FileKind::File);
        assert_eq!(FileKind::from_mode(0o120777), FileKind::Symlink);
        assert_eq!(FileKind::from_mode(0o010644), FileKind::Other);
    }

    #[test]
    fn test_name_does_not_influence_kind() {
        let looks_like_dir = FileEntry::from_remote(entry("folder/", 0o100644));
        assert_eq!(looks_like_dir.kind, FileKind::File);

        let looks_like_file = FileEntry::from_remote(entry("notes.txt", 0o040700));
        assert_eq!(looks_like_file.kind, FileKind::Dir);
    }

    #[test]
    fn test_longname_layout() {
        let e = FileEntry::from_remote(entry("src", 0o040755));
        assert!(e.longname.starts_with("drwxr-xr-x 1 1000 1000"));
        assert!(e.longname.ends_with(" src"));
        assert_eq!(e.permissions, "755");
    }

    #[test]
    fn test_missing_attrs_default_to_zero() {
        let e = FileEntry::from_remote(RemoteEntry {
            name: "x".into(),
            attrs: RemoteAttrs::default(),
        });
        assert_eq!(e.size, 0);
        assert_eq!(e.kind, FileKind::Other);
    }
}
