//! Manifest loading: `Manifest.plist` header, bulk decryption of the
//! `Manifest.db` index for encrypted backups, and the query surface the
//! resolver and directory listings run against.
//!
//! The database is always copied into an in-memory connection so the
//! backup directory itself is never written to and the on-disk file can
//! go away (the decrypted temporary is deleted as soon as the copy
//! completes).

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use plist::Value;
use rusqlite::{backup::Backup, Connection, OpenFlags, OptionalExtension};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::crypto::{self, AES_BLOCK_SIZE};
use crate::error::{BackupError, Result};
use crate::keybag::Keybag;

/// Decryption chunk size for the manifest database. Any multiple of the
/// AES block size works; CBC chains across chunks through the last
/// ciphertext block of each chunk.
const DECRYPT_CHUNK: usize = 64 * 1024;

/// The interesting keys of `Manifest.plist`.
#[derive(Debug)]
pub struct ManifestInfo {
    pub is_encrypted: bool,
    pub backup_key_bag: Option<Vec<u8>>,
    pub manifest_key: Option<Vec<u8>>,
}

impl ManifestInfo {
    pub fn read(root: &Path) -> Result<Self> {
        let value = Value::from_file(root.join("Manifest.plist"))?;
        let dict = value
            .as_dictionary()
            .ok_or_else(|| BackupError::Corruption("Manifest.plist is not a dictionary".into()))?;
        Ok(Self {
            is_encrypted: dict
                .get("IsEncrypted")
                .and_then(Value::as_boolean)
                .unwrap_or(false),
            backup_key_bag: dict
                .get("BackupKeyBag")
                .and_then(Value::as_data)
                .map(<[u8]>::to_vec),
            manifest_key: dict
                .get("ManifestKey")
                .and_then(Value::as_data)
                .map(<[u8]>::to_vec),
        })
    }
}

/// One row of the `Files` table.
#[derive(Debug)]
pub struct ManifestRow {
    pub file_id: String,
    pub file: Vec<u8>,
    pub flags: i64,
}

/// A full row including its location, used by the diagnostics scan.
#[derive(Debug)]
pub struct FileRow {
    pub file_id: String,
    pub domain: String,
    pub relative_path: String,
    pub file: Vec<u8>,
}

/// Read-only handle over the (decrypted) manifest database.
pub struct Manifest {
    conn: Connection,
}

impl std::fmt::Debug for Manifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manifest").finish_non_exhaustive()
    }
}

impl Manifest {
    /// Open the manifest of an unencrypted backup.
    pub fn open_plain(root: &Path) -> Result<Self> {
        let db = root.join("Manifest.db");
        if !db.exists() {
            return Err(BackupError::ManifestInvalid(
                "Manifest.db does not exist".into(),
            ));
        }
        let source = Connection::open_with_flags(&db, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Self::load_into_memory(source)
    }

    /// Decrypt the manifest of an encrypted backup and open the result.
    /// `manifest_key` is the raw `ManifestKey` value: a 4-byte
    /// little-endian protection class followed by the wrapped database key.
    pub fn open_encrypted(root: &Path, keybag: &Keybag, manifest_key: &[u8]) -> Result<Self> {
        if manifest_key.len() <= 4 {
            return Err(BackupError::Corruption("ManifestKey is too short".into()));
        }
        let class = i32::from_le_bytes([
            manifest_key[0],
            manifest_key[1],
            manifest_key[2],
            manifest_key[3],
        ]) as u32;
        let db_key = keybag.unwrap_key_for_class(class, &manifest_key[4..])?;

        let encrypted = root.join("Manifest.db");
        let mut source = File::open(&encrypted)
            .map_err(|e| BackupError::ManifestInvalid(format!("Manifest.db: {e}")))?;

        info!("decrypting manifest database");
        let mut decrypted = NamedTempFile::new()?;
        let mut iv = [0u8; AES_BLOCK_SIZE];
        let mut chunk = vec![0u8; DECRYPT_CHUNK];
        loop {
            let n = read_chunk(&mut source, &mut chunk)?;
            if n == 0 {
                break;
            }
            if n % AES_BLOCK_SIZE != 0 {
                return Err(BackupError::ManifestInvalid(
                    "encrypted manifest is not block aligned".into(),
                ));
            }
            let ciphertext = &chunk[..n];
            let mut next_iv = [0u8; AES_BLOCK_SIZE];
            next_iv.copy_from_slice(&ciphertext[n - AES_BLOCK_SIZE..]);
            let plaintext = crypto::cbc_decrypt(&db_key, &iv, ciphertext)?;
            decrypted.write_all(&plaintext)?;
            iv = next_iv;
        }
        decrypted.flush()?;

        // SQLite tolerates the trailing CBC padding beyond the declared
        // page-aligned end, so the body is not unpadded.
        let source =
            Connection::open_with_flags(decrypted.path(), OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Self::load_into_memory(source)
    }

    fn load_into_memory(source: Connection) -> Result<Self> {
        info!("loading manifest into memory");
        let mut conn = Connection::open_in_memory()?;
        {
            let backup = Backup::new(&source, &mut conn)
                .map_err(|e| BackupError::ManifestInvalid(e.to_string()))?;
            backup
                .run_to_completion(256, Duration::from_millis(0), None)
                .map_err(|e| BackupError::ManifestInvalid(e.to_string()))?;
        }
        let count: i64 = conn
            .query_row("SELECT count(*) FROM Files", [], |row| row.get(0))
            .map_err(|e| BackupError::ManifestInvalid(format!("Files table: {e}")))?;
        if count == 0 {
            return Err(BackupError::ManifestInvalid(
                "manifest lists no files".into(),
            ));
        }
        debug!(files = count, "manifest loaded");
        Ok(Self { conn })
    }

    /// Every distinct domain string in the manifest.
    pub fn distinct_domains(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT DISTINCT domain FROM Files")?;
        let rows = stmt.query_map([], |row| row.get::<_, Option<String>>(0))?;
        let mut domains = Vec::new();
        for row in rows {
            if let Some(domain) = row? {
                domains.push(domain);
            }
        }
        Ok(domains)
    }

    /// Subdomain names of `top`, with the `top-` prefix chopped.
    pub fn subdomains(&self, top: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT domain FROM Files WHERE domain LIKE ?1 || '-%'")?;
        let rows = stmt.query_map([top], |row| row.get::<_, String>(0))?;
        let mut subdomains = Vec::new();
        for row in rows {
            let domain = row?;
            subdomains.push(domain[top.len() + 1..].to_string());
        }
        Ok(subdomains)
    }

    /// Look up the single row for `(domain, relative_path)`.
    pub fn lookup(&self, domain: &str, relative_path: &str) -> Result<Option<ManifestRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT fileID, file, flags FROM Files WHERE domain = ?1 AND relativePath = ?2",
        )?;
        let row = stmt
            .query_row([domain, relative_path], |row| {
                Ok(ManifestRow {
                    file_id: row.get(0)?,
                    file: row.get(1)?,
                    flags: row.get(2)?,
                })
            })
            .optional()?;
        Ok(row)
    }

    /// Immediate children of `prefix` within `domain`: rows whose
    /// relativePath extends `prefix` without any further slash. At the
    /// domain root `prefix` is empty. Returns `(name, flags)` pairs with
    /// the prefix chopped off.
    pub fn children(&self, domain: &str, prefix: &str) -> Result<Vec<(String, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT relativePath, flags FROM Files \
             WHERE domain = ?1 \
             AND relativePath <> '' \
             AND relativePath LIKE ?2 || '%' \
             AND relativePath NOT LIKE ?2 || '%/%'",
        )?;
        let rows = stmt.query_map([domain, prefix], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut children = Vec::new();
        for row in rows {
            let (path, flags) = row?;
            children.push((path[prefix.len()..].to_string(), flags));
        }
        Ok(children)
    }

    /// All rows with the given flags value, for the diagnostics scan.
    pub fn files_with_flags(&self, flags: i64) -> Result<Vec<FileRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT fileID, domain, relativePath, file FROM Files WHERE flags = ?1",
        )?;
        let rows = stmt.query_map([flags], |row| {
            Ok(FileRow {
                file_id: row.get(0)?,
                domain: row.get(1)?,
                relative_path: row.get(2)?,
                file: row.get(3)?,
            })
        })?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }
}

/// Fill `buf` from `reader`, stopping only at EOF. Returns the number of
/// bytes read, which is less than `buf.len()` only on the final chunk.
fn read_chunk(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
