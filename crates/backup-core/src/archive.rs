//! Decoding of the keyed archive embedded in each manifest row's `file`
//! column. The archive stores one object table (`$objects`) and a top-level
//! reference (`$top.root`); every UID leaf is an index into that table.

use std::io::Cursor;

use plist::{Dictionary, Value};

use crate::error::{BackupError, Result};

/// Metadata for one manifest entry, lifted out of the archive.
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub size: u64,
    pub mode: u32,
    pub user_id: u32,
    pub group_id: u32,
    pub birth: i64,
    pub last_modified: i64,
    pub last_status_change: i64,
    pub protection_class: u32,
    /// Wrapped per-file key: the `EncryptionKey` object's bytes after a
    /// 4-byte class prefix. Absent for unencrypted entries.
    pub wrapped_key: Option<Vec<u8>>,
    /// Symlink target, present when the entry is a symlink.
    pub symlink_target: Option<String>,
}

struct Archive<'a> {
    objects: &'a [Value],
}

impl<'a> Archive<'a> {
    fn new(value: &'a Value) -> Result<Self> {
        let objects = value
            .as_dictionary()
            .and_then(|dict| dict.get("$objects"))
            .and_then(Value::as_array)
            .ok_or_else(|| corrupt("archive has no $objects table"))?;
        Ok(Self { objects })
    }

    /// Follow a UID reference into the object table.
    fn deref(&self, reference: &Value) -> Result<&'a Value> {
        let uid = reference
            .as_uid()
            .ok_or_else(|| corrupt("expected a UID reference"))?;
        let index = uid.get() as usize;
        self.objects
            .get(index)
            .ok_or_else(|| corrupt(&format!("object index {index} out of range")))
    }

    fn root(&self, value: &'a Value) -> Result<&'a Dictionary> {
        let root_ref = value
            .as_dictionary()
            .and_then(|dict| dict.get("$top"))
            .and_then(Value::as_dictionary)
            .and_then(|top| top.get("root"))
            .ok_or_else(|| corrupt("archive has no $top.root"))?;
        self.deref(root_ref)?
            .as_dictionary()
            .ok_or_else(|| corrupt("root object is not a dictionary"))
    }
}

fn corrupt(message: &str) -> BackupError {
    BackupError::Corruption(message.into())
}

fn required_u64(dict: &Dictionary, key: &str) -> Result<u64> {
    dict.get(key)
        .and_then(Value::as_unsigned_integer)
        .ok_or_else(|| corrupt(&format!("file archive is missing {key}")))
}

fn required_i64(dict: &Dictionary, key: &str) -> Result<i64> {
    dict.get(key)
        .and_then(Value::as_signed_integer)
        .ok_or_else(|| corrupt(&format!("file archive is missing {key}")))
}

/// Decode the `file` column of a manifest row.
pub fn decode_file_metadata(blob: &[u8]) -> Result<FileMetadata> {
    let value = Value::from_reader(Cursor::new(blob))?;
    let archive = Archive::new(&value)?;
    let properties = archive.root(&value)?;

    let wrapped_key = match properties.get("EncryptionKey") {
        Some(reference) => {
            let data = archive
                .deref(reference)?
                .as_dictionary()
                .and_then(|obj| obj.get("NS.data"))
                .and_then(Value::as_data)
                .ok_or_else(|| corrupt("EncryptionKey object carries no NS.data"))?;
            if data.len() <= 4 {
                return Err(corrupt("EncryptionKey data is too short"));
            }
            Some(data[4..].to_vec())
        }
        None => None,
    };

    let symlink_target = match properties.get("Target") {
        Some(reference) => Some(
            archive
                .deref(reference)?
                .as_string()
                .ok_or_else(|| corrupt("Target object is not a string"))?
                .to_string(),
        ),
        None => None,
    };

    Ok(FileMetadata {
        size: required_u64(properties, "Size")?,
        mode: required_u64(properties, "Mode")? as u32,
        user_id: required_u64(properties, "UserID")? as u32,
        group_id: required_u64(properties, "GroupID")? as u32,
        birth: required_i64(properties, "Birth")?,
        last_modified: required_i64(properties, "LastModified")?,
        last_status_change: required_i64(properties, "LastStatusChange")?,
        protection_class: required_u64(properties, "ProtectionClass")? as u32,
        wrapped_key,
        symlink_target,
    })
}
