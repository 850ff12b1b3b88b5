use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Failed to decrypt keys: incorrect passphrase?")]
    BadPassphrase,

    #[error("Could not load Manifest database: {0}")]
    ManifestInvalid(String),

    #[error("No such file or directory")]
    PathNotFound,

    #[error("Backup filesystem is read-only")]
    ReadOnly,

    #[error("Not a symlink")]
    NotASymlink,

    #[error("Protection class {0} requires unsupported key unwrapping")]
    UnsupportedClass(u32),

    #[error("Keybag is locked")]
    KeybagLocked,

    #[error("Corrupt backup data: {0}")]
    Corruption(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Manifest query error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Property list error: {0}")]
    Plist(#[from] plist::Error),
}

impl BackupError {
    /// POSIX errno surfaced through the filesystem host.
    pub fn errno(&self) -> i32 {
        match self {
            BackupError::PathNotFound => libc::ENOENT,
            BackupError::ReadOnly => libc::EROFS,
            BackupError::NotASymlink => libc::EINVAL,
            BackupError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            _ => libc::EIO,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(BackupError::PathNotFound.errno(), libc::ENOENT);
        assert_eq!(BackupError::ReadOnly.errno(), libc::EROFS);
        assert_eq!(BackupError::NotASymlink.errno(), libc::EINVAL);
        assert_eq!(BackupError::KeybagLocked.errno(), libc::EIO);
        assert_eq!(
            BackupError::Corruption("bad padding".into()).errno(),
            libc::EIO
        );
    }

    #[test]
    fn io_errors_keep_their_os_code() {
        let not_found = std::io::Error::from_raw_os_error(libc::ENOENT);
        assert_eq!(BackupError::Io(not_found).errno(), libc::ENOENT);
    }
}
