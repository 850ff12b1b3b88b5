//! FUSE host bridge. The core works in paths; FUSE works in inodes, so
//! this layer keeps an inode⇄path table (rooted at ino 1) and delegates
//! every operation to [`BackupFs`], translating errors to errno replies.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use backup_core::{Attributes, BackupFs, FLAG_DIRECTORY, FLAG_SYMLINK};
use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, Request, TimeOrNow,
};
use tracing::debug;

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

/// Mount `fs` at `mountpoint` and run the session loop until unmount.
/// The session is single threaded, matching the core's concurrency
/// contract.
pub fn mount(fs: BackupFs, mountpoint: &Path) -> std::io::Result<()> {
    let options = [
        MountOption::RO,
        MountOption::FSName("ios-backup".to_string()),
    ];
    fuser::mount2(BackupMount::new(fs), mountpoint, &options)
}

struct BackupMount {
    fs: BackupFs,
    inodes: HashMap<u64, String>,
    paths: HashMap<String, u64>,
    next_ino: u64,
}

impl BackupMount {
    fn new(fs: BackupFs) -> Self {
        let mut inodes = HashMap::new();
        let mut paths = HashMap::new();
        inodes.insert(ROOT_INO, "/".to_string());
        paths.insert("/".to_string(), ROOT_INO);
        Self {
            fs,
            inodes,
            paths,
            next_ino: ROOT_INO + 1,
        }
    }

    fn intern(&mut self, path: String) -> u64 {
        if let Some(&ino) = self.paths.get(&path) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.inodes.insert(ino, path.clone());
        self.paths.insert(path, ino);
        ino
    }

    fn path_of(&self, ino: u64) -> Option<&str> {
        self.inodes.get(&ino).map(String::as_str)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<String> {
        let parent = self.path_of(parent)?;
        let name = name.to_str()?;
        Some(if parent == "/" {
            format!("/{name}")
        } else {
            format!("{parent}/{name}")
        })
    }
}

fn timestamp(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

fn kind_of_mode(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        _ => FileType::RegularFile,
    }
}

fn kind_of_flags(flags: i64) -> FileType {
    match flags {
        FLAG_DIRECTORY => FileType::Directory,
        FLAG_SYMLINK => FileType::Symlink,
        _ => FileType::RegularFile,
    }
}

fn file_attr(ino: u64, attrs: &Attributes) -> FileAttr {
    FileAttr {
        ino,
        size: attrs.size,
        blocks: attrs.size.div_ceil(512),
        atime: timestamp(attrs.atime),
        mtime: timestamp(attrs.mtime),
        ctime: timestamp(attrs.ctime),
        crtime: timestamp(attrs.ctime),
        kind: kind_of_mode(attrs.mode),
        perm: (attrs.mode & 0o7777) as u16,
        nlink: attrs.nlink,
        uid: attrs.uid,
        gid: attrs.gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(index) => Some(&path[..index]),
        None => None,
    }
}

impl Filesystem for BackupMount {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.getattr(&path) {
            Ok(attrs) => {
                let ino = self.intern(path);
                reply.entry(&TTL, &file_attr(ino, &attrs), 0);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.path_of(ino) {
            Some(path) => match self.fs.getattr(path) {
                Ok(attrs) => reply.attr(&TTL, &file_attr(ino, &attrs)),
                Err(err) => reply.error(err.errno()),
            },
            None => reply.error(libc::ENOENT),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        // utimens and every other attribute change fail read-only.
        let errno = match self.fs.utimens() {
            Ok(()) => libc::EROFS,
            Err(err) => err.errno(),
        };
        reply.error(errno);
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.readlink(path) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino).map(str::to_owned) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.open_file(&path, flags) {
            Ok(fh) => {
                debug!(path = %path, fh, "open");
                reply.opened(fh, 0);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.fs.read(fh, offset as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.fs.release(fh);
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path_of(ino).map(str::to_owned) else {
            reply.error(libc::ENOENT);
            return;
        };
        let children = match self.fs.readdir(&path) {
            Ok(children) => children,
            Err(err) => {
                reply.error(err.errno());
                return;
            }
        };

        let parent_ino = parent_path(&path)
            .and_then(|parent| self.paths.get(parent).copied())
            .unwrap_or(ROOT_INO);
        let mut entries: Vec<(u64, FileType, String)> = Vec::with_capacity(children.len() + 2);
        entries.push((ino, FileType::Directory, ".".to_string()));
        entries.push((parent_ino, FileType::Directory, "..".to_string()));
        for (name, flags) in children {
            let child = if path == "/" {
                format!("/{name}")
            } else {
                format!("{path}/{name}")
            };
            let child_ino = self.intern(child);
            entries.push((child_ino, kind_of_flags(flags), name));
        }

        for (index, (entry_ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*entry_ino, (index + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.fs.statfs() {
            Ok(stats) => reply.statfs(
                stats.blocks,
                stats.bfree,
                stats.bavail,
                stats.files,
                stats.ffree,
                stats.bsize as u32,
                stats.namemax as u32,
                stats.frsize as u32,
            ),
            Err(err) => reply.error(err.errno()),
        }
    }
}
