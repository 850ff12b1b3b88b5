//! Resolved namespace entries: either a synthesized directory (the mount
//! root or a domain folder) or a concrete manifest row.

use std::path::{Path, PathBuf};

use crate::archive::FileMetadata;
use crate::error::{BackupError, Result};

pub const FLAG_FILE: i64 = 1;
pub const FLAG_DIRECTORY: i64 = 2;
pub const FLAG_SYMLINK: i64 = 4;

/// A concrete manifest row with its decoded metadata.
#[derive(Debug)]
pub struct FileRecord {
    pub file_id: String,
    pub domain: String,
    pub relative_path: String,
    pub flags: i64,
    pub metadata: FileMetadata,
}

impl FileRecord {
    pub fn new(
        file_id: String,
        domain: String,
        relative_path: String,
        flags: i64,
        metadata: FileMetadata,
    ) -> Result<Self> {
        if file_id.len() != 40 || !file_id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(BackupError::Corruption(format!(
                "malformed content hash {file_id:?}"
            )));
        }
        Ok(Self {
            file_id,
            domain,
            relative_path,
            flags,
            metadata,
        })
    }

    /// Content blobs live at `<root>/<first two hash chars>/<hash>`.
    pub fn blob_path(&self, root: &Path) -> PathBuf {
        root.join(&self.file_id[..2]).join(&self.file_id)
    }

    pub fn is_directory(&self) -> bool {
        self.flags == FLAG_DIRECTORY
    }

    pub fn is_symlink(&self) -> bool {
        self.flags == FLAG_SYMLINK
    }
}

#[derive(Debug)]
pub enum Entry {
    /// Synthesized directory: the mount root (empty domain) or a domain
    /// folder. Never has a content blob.
    Virtual { domain: String },
    File(FileRecord),
}

impl Entry {
    pub fn is_directory(&self) -> bool {
        match self {
            Entry::Virtual { .. } => true,
            Entry::File(record) => record.is_directory(),
        }
    }
}
