//! The mount context: owns the manifest handle, the domain tree and the
//! unlocked keybag, resolves incoming paths to entries, and exposes the
//! read-only operation set the filesystem host dispatches into.
//!
//! The service loop is single threaded by contract (the host driver is
//! told not to dispatch concurrently), so the handle map needs no lock.

use std::collections::HashMap;
use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::archive;
use crate::crypto;
use crate::domains::{DomainNode, DomainTree};
use crate::entry::{Entry, FileRecord, FLAG_DIRECTORY, FLAG_FILE};
use crate::error::{BackupError, Result};
use crate::keybag::Keybag;
use crate::manifest::{Manifest, ManifestInfo};
use crate::reader::OpenFile;

/// Attributes of a namespace entry, in stat(2) terms.
#[derive(Debug, Clone)]
pub struct Attributes {
    pub size: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

/// statvfs(3) of the filesystem backing the backup directory.
#[derive(Debug, Clone, Copy)]
pub struct FsStats {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u64,
    pub frsize: u64,
    pub namemax: u64,
}

/// An encrypted manifest entry whose on-disk blob size disagrees with the
/// size recorded for its plaintext.
#[derive(Debug)]
pub struct SizeAnomaly {
    pub domain: String,
    pub relative_path: String,
    pub expected: u64,
    pub actual: u64,
}

/// Open-flag bits that imply write intent (or side effects a read-only
/// filesystem cannot honor); any of them fails the open with EROFS.
const WRITE_INTENT_FLAGS: i32 = libc::O_WRONLY
    | libc::O_RDWR
    | libc::O_CREAT
    | libc::O_EXCL
    | libc::O_TRUNC
    | libc::O_APPEND
    | libc::O_TMPFILE
    | libc::O_CLOEXEC
    | libc::O_NOCTTY
    | libc::O_NOFOLLOW;

pub struct BackupFs {
    root: PathBuf,
    manifest: Manifest,
    domains: DomainTree,
    keybag: Option<Keybag>,
    handles: HashMap<u64, OpenFile>,
    next_handle: u64,
}

impl std::fmt::Debug for BackupFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupFs")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl BackupFs {
    /// Open an unencrypted backup rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        info!(root = %root.display(), "opening unencrypted backup");
        let manifest = Manifest::open_plain(&root)?;
        Self::finish(root, manifest, None)
    }

    /// Unlock the keybag with `passphrase`, decrypt the manifest, and open
    /// an encrypted backup rooted at `root`.
    pub fn open_encrypted(root: impl Into<PathBuf>, passphrase: &str) -> Result<Self> {
        let root = root.into();
        info!(root = %root.display(), "opening encrypted backup");
        let info = ManifestInfo::read(&root)?;
        let bag_bytes = info
            .backup_key_bag
            .ok_or_else(|| BackupError::Corruption("Manifest.plist has no BackupKeyBag".into()))?;
        let manifest_key = info
            .manifest_key
            .ok_or_else(|| BackupError::Corruption("Manifest.plist has no ManifestKey".into()))?;
        let mut keybag = Keybag::parse(&bag_bytes)?;
        keybag.unlock(passphrase)?;
        let manifest = Manifest::open_encrypted(&root, &keybag, &manifest_key)?;
        Self::finish(root, manifest, Some(keybag))
    }

    fn finish(root: PathBuf, manifest: Manifest, keybag: Option<Keybag>) -> Result<Self> {
        let domains = DomainTree::build(&manifest)?;
        Ok(Self {
            root,
            manifest,
            domains,
            keybag,
            handles: HashMap::new(),
            next_handle: 1,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Translate a POSIX path into a manifest record or a virtual
    /// directory. Intermediate segments are never synthesized: anything
    /// below a domain must match a manifest row exactly.
    pub fn resolve(&self, path: &str) -> Result<Entry> {
        let trimmed = path.trim_start_matches('/').trim_end_matches('/');
        if trimmed.is_empty() {
            return Ok(Entry::Virtual {
                domain: String::new(),
            });
        }
        let mut parts = trimmed.split('/');
        let top = parts.next().unwrap_or_default();
        let node = self.domains.get(top).ok_or(BackupError::PathNotFound)?;
        let domain = match node {
            DomainNode::Leaf => top.to_string(),
            DomainNode::Subdomains(subs) => match parts.next() {
                None => {
                    return Ok(Entry::Virtual {
                        domain: top.to_string(),
                    })
                }
                Some(sub) => {
                    if !subs.contains(sub) {
                        return Err(BackupError::PathNotFound);
                    }
                    format!("{top}-{sub}")
                }
            },
        };

        let relative_path = parts.collect::<Vec<_>>().join("/");
        if relative_path.is_empty() {
            return Ok(Entry::Virtual { domain });
        }

        let row = self
            .manifest
            .lookup(&domain, &relative_path)?
            .ok_or(BackupError::PathNotFound)?;
        let metadata = archive::decode_file_metadata(&row.file)?;
        Ok(Entry::File(FileRecord::new(
            row.file_id,
            domain,
            relative_path,
            row.flags,
            metadata,
        )?))
    }

    pub fn getattr(&self, path: &str) -> Result<Attributes> {
        match self.resolve(path)? {
            Entry::Virtual { .. } => self.root_attributes(),
            Entry::File(record) => Ok(Attributes {
                size: record.metadata.size,
                mode: record.metadata.mode,
                nlink: 1,
                uid: record.metadata.user_id,
                gid: record.metadata.group_id,
                atime: record.metadata.last_status_change,
                mtime: record.metadata.last_modified,
                ctime: record.metadata.birth,
            }),
        }
    }

    /// Virtual directories inherit the backup root's stat, with size 0.
    fn root_attributes(&self) -> Result<Attributes> {
        let meta = fs::metadata(&self.root)?;
        Ok(Attributes {
            size: 0,
            mode: meta.mode(),
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            atime: meta.atime(),
            mtime: meta.mtime(),
            ctime: meta.ctime(),
        })
    }

    /// Directory listing as `(name, flags)` pairs, without `.`/`..` (the
    /// host adds those). Non-directory entries list as empty.
    pub fn readdir(&self, path: &str) -> Result<Vec<(String, i64)>> {
        match self.resolve(path)? {
            Entry::Virtual { domain } if domain.is_empty() => Ok(self
                .domains
                .top_level()
                .map(|top| (top.to_string(), FLAG_DIRECTORY))
                .collect()),
            Entry::Virtual { domain } => match self.domains.get(&domain) {
                Some(DomainNode::Subdomains(_)) => Ok(self
                    .manifest
                    .subdomains(&domain)?
                    .into_iter()
                    .map(|sub| (sub, FLAG_DIRECTORY))
                    .collect()),
                // Leaf domain or composed domain: list the domain root.
                _ => self.manifest.children(&domain, ""),
            },
            Entry::File(record) => {
                if !record.is_directory() {
                    return Ok(Vec::new());
                }
                let prefix = format!("{}/", record.relative_path);
                self.manifest.children(&record.domain, &prefix)
            }
        }
    }

    /// Open `path` for reading. Directory entries open as handle 0;
    /// concrete files get a fresh handle with their per-file key unwrapped
    /// and cached. Any write-intent flag fails with EROFS.
    pub fn open_file(&mut self, path: &str, flags: i32) -> Result<u64> {
        if flags & WRITE_INTENT_FLAGS != 0 {
            return Err(BackupError::ReadOnly);
        }
        match self.resolve(path)? {
            Entry::Virtual { .. } => Ok(0),
            Entry::File(record) if record.is_directory() => Ok(0),
            Entry::File(record) => {
                let file = OpenFile::open(&record, &self.root, self.keybag.as_ref())?;
                let handle = self.next_handle;
                self.next_handle += 1;
                self.handles.insert(handle, file);
                debug!(handle, path, "opened");
                Ok(handle)
            }
        }
    }

    pub fn read(&self, handle: u64, offset: u64, length: usize) -> Result<Vec<u8>> {
        let file = self
            .handles
            .get(&handle)
            .ok_or_else(|| BackupError::Corruption(format!("unknown file handle {handle}")))?;
        file.read(offset, length)
    }

    pub fn readlink(&self, path: &str) -> Result<String> {
        match self.resolve(path)? {
            Entry::File(record) => record
                .metadata
                .symlink_target
                .clone()
                .ok_or(BackupError::NotASymlink),
            Entry::Virtual { .. } => Err(BackupError::NotASymlink),
        }
    }

    pub fn release(&mut self, handle: u64) {
        self.handles.remove(&handle);
    }

    /// Timestamps can never change on a read-only filesystem.
    pub fn utimens(&self) -> Result<()> {
        Err(BackupError::ReadOnly)
    }

    pub fn statfs(&self) -> Result<FsStats> {
        let path = CString::new(self.root.as_os_str().as_bytes())
            .map_err(|_| BackupError::Corruption("backup root path contains NUL".into()))?;
        let mut vfs: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(path.as_ptr(), &mut vfs) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(FsStats {
            blocks: vfs.f_blocks as u64,
            bfree: vfs.f_bfree as u64,
            bavail: vfs.f_bavail as u64,
            files: vfs.f_files as u64,
            ffree: vfs.f_ffree as u64,
            bsize: vfs.f_bsize as u64,
            frsize: vfs.f_frsize as u64,
            namemax: vfs.f_namemax as u64,
        })
    }

    /// Scan every encrypted file and report entries whose blob size does
    /// not match the padded size implied by the recorded plaintext size.
    /// A mismatch does not abort reads; it only feeds this diagnostic.
    pub fn size_anomalies(&self) -> Result<Vec<SizeAnomaly>> {
        let mut anomalies = Vec::new();
        for row in self.manifest.files_with_flags(FLAG_FILE)? {
            let metadata = archive::decode_file_metadata(&row.file)?;
            if metadata.wrapped_key.is_none() {
                continue;
            }
            let record = FileRecord::new(
                row.file_id,
                row.domain,
                row.relative_path,
                FLAG_FILE,
                metadata,
            )?;
            let expected = crypto::padded_ciphertext_len(record.metadata.size);
            // An orphaned row (blob missing on disk) counts as size 0.
            let actual = fs::metadata(record.blob_path(&self.root))
                .map(|m| m.len())
                .unwrap_or(0);
            if actual != expected {
                anomalies.push(SizeAnomaly {
                    domain: record.domain,
                    relative_path: record.relative_path,
                    expected,
                    actual,
                });
            }
        }
        Ok(anomalies)
    }
}
