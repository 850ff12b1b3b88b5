//! Builders for synthetic backup directories, unencrypted and encrypted.
//! The encrypted builder fabricates a real keybag (same PBKDF2 + RFC 3394
//! construction the crate unlocks), wraps per-file keys under a class key,
//! and CBC-encrypts blobs and the manifest database.

use std::fs;
use std::path::Path;

use aes::Aes256;
use aes_kw::KekAes256;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockEncryptMut, KeyIvInit};
use pbkdf2::pbkdf2_hmac;
use plist::{Dictionary, Uid, Value};
use rusqlite::Connection;
use sha1::Sha1;
use sha2::Sha256;

pub const PASSPHRASE: &str = "correct horse battery staple";

pub const FILE_CLASS: u32 = 3;
pub const MANIFEST_CLASS: u32 = 4;
pub const FILE_CLASS_KEY: [u8; 32] = [0x31; 32];
pub const MANIFEST_CLASS_KEY: [u8; 32] = [0x42; 32];
const DB_KEY: [u8; 32] = [0x77; 32];

const SALT: [u8; 20] = [0x5a; 20];
const DOUBLE_SALT: [u8; 20] = [0xd5; 20];
const ITERATIONS: u32 = 100;
const DOUBLE_ITERATIONS: u32 = 1000;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;

pub fn cbc_encrypt(key: &[u8; 32], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    assert_eq!(plaintext.len() % 16, 0, "plaintext must be block aligned");
    let mut buf = plaintext.to_vec();
    let len = buf.len();
    Aes256CbcEnc::new(key.into(), iv.into())
        .encrypt_padded_mut::<NoPadding>(&mut buf, len)
        .unwrap();
    buf
}

pub fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    let pad = 16 - data.len() % 16;
    let mut out = data.to_vec();
    out.extend(std::iter::repeat(pad as u8).take(pad));
    out
}

pub fn wrap_key(kek: &[u8; 32], key: &[u8; 32]) -> Vec<u8> {
    let mut wrapped = [0u8; 40];
    KekAes256::from(*kek).wrap(key, &mut wrapped).unwrap();
    wrapped.to_vec()
}

fn passcode_key() -> [u8; 32] {
    let mut round1 = [0u8; 32];
    pbkdf2_hmac::<Sha256>(
        PASSPHRASE.as_bytes(),
        &DOUBLE_SALT,
        DOUBLE_ITERATIONS,
        &mut round1,
    );
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha1>(&round1, &SALT, ITERATIONS, &mut key);
    key
}

fn tlv(tag: &[u8; 4], value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + value.len());
    out.extend_from_slice(tag);
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value);
    out
}

/// Keybag with the file and manifest class keys wrapped under the
/// passphrase-derived passcode key.
pub fn keybag_blob() -> Vec<u8> {
    let passcode = passcode_key();
    let mut blob = Vec::new();
    blob.extend(tlv(b"VERS", &3u32.to_be_bytes()));
    blob.extend(tlv(b"TYPE", &1u32.to_be_bytes()));
    blob.extend(tlv(b"UUID", &[0xab; 16]));
    blob.extend(tlv(b"HMCK", &[0xcd; 40]));
    blob.extend(tlv(b"WRAP", &1u32.to_be_bytes()));
    blob.extend(tlv(b"SALT", &SALT));
    blob.extend(tlv(b"ITER", &ITERATIONS.to_be_bytes()));
    blob.extend(tlv(b"DPSL", &DOUBLE_SALT));
    blob.extend(tlv(b"DPIC", &DOUBLE_ITERATIONS.to_be_bytes()));
    for (class, key) in [(FILE_CLASS, FILE_CLASS_KEY), (MANIFEST_CLASS, MANIFEST_CLASS_KEY)] {
        blob.extend(tlv(b"UUID", &[class as u8; 16]));
        blob.extend(tlv(b"CLAS", &class.to_be_bytes()));
        blob.extend(tlv(b"WRAP", &2u32.to_be_bytes()));
        blob.extend(tlv(b"KTYP", &0u32.to_be_bytes()));
        blob.extend(tlv(b"WPKY", &wrap_key(&passcode, &key)));
    }
    blob
}

/// `ManifestKey` plist value: little-endian protection class followed by
/// the database key wrapped under that class's key.
pub fn manifest_key_blob() -> Vec<u8> {
    let mut out = (MANIFEST_CLASS as i32).to_le_bytes().to_vec();
    out.extend(wrap_key(&MANIFEST_CLASS_KEY, &DB_KEY));
    out
}

pub fn fake_file_id(n: u32) -> String {
    format!("{n:040x}")
}

/// Keyed archive for one manifest row.
pub fn archive_blob(
    size: u64,
    mode: u64,
    wrapped_key: Option<&[u8]>,
    target: Option<&str>,
) -> Vec<u8> {
    let mut properties = Dictionary::new();
    properties.insert("Size".into(), Value::Integer(size.into()));
    properties.insert("Mode".into(), Value::Integer(mode.into()));
    properties.insert("UserID".into(), Value::Integer(501u64.into()));
    properties.insert("GroupID".into(), Value::Integer(501u64.into()));
    properties.insert("Birth".into(), Value::Integer(1_600_000_000u64.into()));
    properties.insert("LastModified".into(), Value::Integer(1_600_000_100u64.into()));
    properties.insert(
        "LastStatusChange".into(),
        Value::Integer(1_600_000_200u64.into()),
    );
    properties.insert(
        "ProtectionClass".into(),
        Value::Integer(u64::from(FILE_CLASS).into()),
    );

    let mut objects = vec![Value::String("$null".into())];
    if let Some(wrapped) = wrapped_key {
        properties.insert("EncryptionKey".into(), Value::Uid(Uid::new(2)));
        let mut key_object = Dictionary::new();
        let mut data = (FILE_CLASS as i32).to_le_bytes().to_vec();
        data.extend_from_slice(wrapped);
        key_object.insert("NS.data".into(), Value::Data(data));
        objects.push(Value::Dictionary(properties.clone()));
        objects.push(Value::Dictionary(key_object));
    } else if let Some(target) = target {
        properties.insert("Target".into(), Value::Uid(Uid::new(2)));
        objects.push(Value::Dictionary(properties.clone()));
        objects.push(Value::String(target.into()));
    } else {
        objects.push(Value::Dictionary(properties.clone()));
    }

    let mut top = Dictionary::new();
    top.insert("root".into(), Value::Uid(Uid::new(1)));
    let mut outer = Dictionary::new();
    outer.insert("$objects".into(), Value::Array(objects));
    outer.insert("$top".into(), Value::Dictionary(top));
    let mut bytes = Vec::new();
    Value::Dictionary(outer).to_writer_binary(&mut bytes).unwrap();
    bytes
}

pub struct Row {
    pub file_id: String,
    pub domain: String,
    pub relative_path: String,
    pub flags: i64,
    pub archive: Vec<u8>,
}

pub fn dir_row(n: u32, domain: &str, relative_path: &str) -> Row {
    Row {
        file_id: fake_file_id(n),
        domain: domain.into(),
        relative_path: relative_path.into(),
        flags: 2,
        archive: archive_blob(0, 0o040755, None, None),
    }
}

fn write_manifest_db(path: &Path, rows: &[Row]) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE Files (
            fileID TEXT,
            domain TEXT,
            relativePath TEXT,
            flags INTEGER,
            file BLOB
        );",
    )
    .unwrap();
    for row in rows {
        conn.execute(
            "INSERT INTO Files VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                row.file_id,
                row.domain,
                row.relative_path,
                row.flags,
                row.archive
            ],
        )
        .unwrap();
    }
}

fn write_manifest_plist(root: &Path, encrypted: bool) {
    let mut dict = Dictionary::new();
    dict.insert("IsEncrypted".into(), Value::Boolean(encrypted));
    if encrypted {
        dict.insert("BackupKeyBag".into(), Value::Data(keybag_blob()));
        dict.insert("ManifestKey".into(), Value::Data(manifest_key_blob()));
    }
    Value::Dictionary(dict)
        .to_file_binary(root.join("Manifest.plist"))
        .unwrap();
}

pub fn write_blob(root: &Path, file_id: &str, bytes: &[u8]) {
    let dir = root.join(&file_id[..2]);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(file_id), bytes).unwrap();
}

/// Plain backup:
/// HomeDomain/Library/Preferences/com.apple.example.plist (file),
/// HomeDomain/Library/Preferences/old.plist (symlink to the first),
/// plus AppDomain-com.example.app/Documents.
pub fn build_plain_backup(root: &Path) -> Vec<u8> {
    let content = b"example plist content, stored verbatim".to_vec();
    let file_id = fake_file_id(10);
    let rows = vec![
        dir_row(0, "HomeDomain", ""),
        dir_row(1, "HomeDomain", "Library"),
        dir_row(2, "HomeDomain", "Library/Preferences"),
        Row {
            file_id: file_id.clone(),
            domain: "HomeDomain".into(),
            relative_path: "Library/Preferences/com.apple.example.plist".into(),
            flags: 1,
            archive: archive_blob(content.len() as u64, 0o100644, None, None),
        },
        Row {
            file_id: fake_file_id(11),
            domain: "HomeDomain".into(),
            relative_path: "Library/Preferences/old.plist".into(),
            flags: 4,
            archive: archive_blob(
                0,
                0o120755,
                None,
                Some("Library/Preferences/com.apple.example.plist"),
            ),
        },
        dir_row(3, "AppDomain-com.example.app", ""),
        dir_row(4, "AppDomain-com.example.app", "Documents"),
    ];
    write_manifest_db(&root.join("Manifest.db"), &rows);
    write_manifest_plist(root, false);
    write_blob(root, &file_id, &content);
    content
}

pub struct EncryptedFile {
    pub domain: &'static str,
    pub relative_path: &'static str,
    pub plaintext: Vec<u8>,
}

/// Encrypted backup with one-byte, hundred-byte and exact-block files,
/// a symlink, and a subdomain. Returns the plaintexts for assertions.
pub fn build_encrypted_backup(root: &Path) -> Vec<EncryptedFile> {
    let files = vec![
        EncryptedFile {
            domain: "HomeDomain",
            relative_path: "tiny.bin",
            plaintext: vec![0x5e],
        },
        EncryptedFile {
            domain: "HomeDomain",
            relative_path: "hundred.bin",
            plaintext: (0..100u8).collect(),
        },
        EncryptedFile {
            domain: "HomeDomain",
            relative_path: "Library/block.bin",
            plaintext: b"sixteen bytes!!!".to_vec(),
        },
        EncryptedFile {
            domain: "AppDomain-com.example.app",
            relative_path: "Documents/notes.txt",
            plaintext: b"app scoped notes".to_vec(),
        },
    ];

    let mut rows = vec![
        dir_row(0, "HomeDomain", ""),
        dir_row(1, "HomeDomain", "Library"),
        dir_row(2, "AppDomain-com.example.app", ""),
        dir_row(3, "AppDomain-com.example.app", "Documents"),
        Row {
            file_id: fake_file_id(90),
            domain: "HomeDomain".into(),
            relative_path: "tiny-link".into(),
            flags: 4,
            archive: archive_blob(0, 0o120755, None, Some("tiny.bin")),
        },
    ];

    for (index, file) in files.iter().enumerate() {
        let file_id = fake_file_id(100 + index as u32);
        let file_key = [0x80 + index as u8; 32];
        let ciphertext = cbc_encrypt(&file_key, &[0u8; 16], &pkcs7_pad(&file.plaintext));
        write_blob(root, &file_id, &ciphertext);
        rows.push(Row {
            file_id,
            domain: file.domain.into(),
            relative_path: file.relative_path.into(),
            flags: 1,
            archive: archive_blob(
                file.plaintext.len() as u64,
                0o100644,
                Some(&wrap_key(&FILE_CLASS_KEY, &file_key)),
                None,
            ),
        });
    }

    // Write the database in the clear first, then replace it with its
    // CBC encryption under the wrapped database key.
    let db_path = root.join("Manifest.db");
    write_manifest_db(&db_path, &rows);
    let db_bytes = fs::read(&db_path).unwrap();
    assert_eq!(db_bytes.len() % 16, 0, "sqlite files are page aligned");
    fs::write(&db_path, cbc_encrypt(&DB_KEY, &[0u8; 16], &db_bytes)).unwrap();
    write_manifest_plist(root, true);
    files
}
