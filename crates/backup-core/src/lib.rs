//! backup-core — read-only filesystem core over iOS device backups.
//!
//! A backup is a directory of hash-named content blobs plus a manifest
//! database. This crate turns that flat, content-addressed store into a
//! navigable tree: keybag unlocking (passphrase to class keys), bulk
//! manifest decryption, a two-level virtual domain hierarchy, and a
//! block-aligned random-read engine for per-file CBC ciphertext.
//!
//! # Module layout
//! - `crypto`   — AES-CBC, PKCS#7 unpadding, RFC 3394 key unwrap
//! - `keybag`   — keybag TLV parsing and passphrase unlock
//! - `archive`  — keyed-archive metadata embedded in manifest rows
//! - `manifest` — Manifest.plist / Manifest.db loading and queries
//! - `domains`  — the two-level virtual domain tree
//! - `entry`    — virtual vs concrete namespace entries
//! - `reader`   — per-handle state and the random-read engine
//! - `fs`       — the mount context and filesystem operation set
//! - `error`    — unified error type with errno mapping

pub mod archive;
pub mod crypto;
pub mod domains;
pub mod entry;
pub mod error;
pub mod fs;
pub mod keybag;
pub mod manifest;
pub mod reader;

pub use entry::{Entry, FileRecord, FLAG_DIRECTORY, FLAG_FILE, FLAG_SYMLINK};
pub use error::{BackupError, Result};
pub use fs::{Attributes, BackupFs, FsStats, SizeAnomaly};
pub use keybag::Keybag;
pub use manifest::ManifestInfo;
