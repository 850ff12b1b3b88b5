//! Backup keybag: a TLV blob carrying the PBKDF2 parameters and the
//! per-class wrapped keys. Unlocking derives the passcode key from the
//! user passphrase and unwraps every passcode-protected class key.

use std::collections::HashMap;

use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;
use sha2::Sha256;
use tracing::debug;
use zeroize::Zeroizing;

use crate::crypto;
use crate::error::{BackupError, Result};

/// WRAP bit marking a class key as wrapped with the passcode key.
const WRAP_PASSCODE: u32 = 2;

/// Wrapped per-file key lengths: 0x28 is a plain RFC 3394 wrap under the
/// class key; 0x30 adds a curve25519 agreement step that never appears in
/// the backup-only flow.
const WRAPPED_KEY_LEN: usize = 0x28;
const WRAPPED_KEY_CURVE_LEN: usize = 0x30;

#[derive(Debug, Default)]
struct ClassKey {
    #[allow(dead_code)]
    uuid: Vec<u8>,
    class: u32,
    wrap: u32,
    #[allow(dead_code)]
    key_type: u32,
    wrapped: Vec<u8>,
    #[allow(dead_code)]
    public_key: Vec<u8>,
    key: Option<Zeroizing<Vec<u8>>>,
}

/// Parsed keybag. Class keys become available after [`Keybag::unlock`]
/// succeeds and are zeroized when the keybag is dropped.
#[derive(Debug, Default)]
pub struct Keybag {
    pub version: u32,
    pub kind: u32,
    pub uuid: Vec<u8>,
    pub hmck: Vec<u8>,
    pub wrap: u32,
    salt: Vec<u8>,
    iterations: u32,
    double_salt: Vec<u8>,
    double_iterations: u32,
    class_keys: HashMap<u32, ClassKey>,
    unlocked: bool,
}

fn int_value(value: &[u8]) -> u32 {
    value.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32)
}

impl Keybag {
    /// Parse the binary TLV stream: 4-byte tag, 4-byte big-endian length,
    /// payload. Values of length <= 4 decode as big-endian integers. A
    /// second `UUID` tag opens a class-key record; every later `UUID`
    /// closes the previous record and opens the next.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut bag = Keybag::default();
        let mut current: Option<ClassKey> = None;
        let mut offset = 0usize;

        while offset < data.len() {
            if offset + 8 > data.len() {
                return Err(BackupError::Corruption("truncated keybag entry".into()));
            }
            let tag = [
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ];
            let len = int_value(&data[offset + 4..offset + 8]) as usize;
            offset += 8;
            if offset + len > data.len() {
                return Err(BackupError::Corruption(format!(
                    "keybag value for {:?} runs past the end",
                    String::from_utf8_lossy(&tag)
                )));
            }
            let value = &data[offset..offset + len];
            offset += len;

            match &tag {
                b"UUID" if bag.uuid.is_empty() => bag.uuid = value.to_vec(),
                b"UUID" => {
                    if let Some(done) = current.take() {
                        bag.class_keys.insert(done.class, done);
                    }
                    current = Some(ClassKey {
                        uuid: value.to_vec(),
                        ..ClassKey::default()
                    });
                }
                b"CLAS" => {
                    if let Some(ck) = current.as_mut() {
                        ck.class = int_value(value);
                    }
                }
                b"WRAP" => match current.as_mut() {
                    Some(ck) => ck.wrap = int_value(value),
                    None => bag.wrap = int_value(value),
                },
                b"WPKY" => {
                    if let Some(ck) = current.as_mut() {
                        ck.wrapped = value.to_vec();
                    }
                }
                b"KTYP" => {
                    if let Some(ck) = current.as_mut() {
                        ck.key_type = int_value(value);
                    }
                }
                b"PBKY" => {
                    if let Some(ck) = current.as_mut() {
                        ck.public_key = value.to_vec();
                    }
                }
                b"VERS" => bag.version = int_value(value),
                b"TYPE" => bag.kind = int_value(value),
                b"HMCK" => bag.hmck = value.to_vec(),
                b"SALT" => bag.salt = value.to_vec(),
                b"ITER" => bag.iterations = int_value(value),
                b"DPSL" => bag.double_salt = value.to_vec(),
                b"DPIC" => bag.double_iterations = int_value(value),
                // Unknown tags are allowed; the format grows over time.
                _ => {}
            }
        }
        if let Some(done) = current.take() {
            bag.class_keys.insert(done.class, done);
        }
        debug!(
            classes = bag.class_keys.len(),
            uuid = %hex::encode(&bag.uuid),
            "keybag parsed"
        );
        Ok(bag)
    }

    /// Derive the passcode key from `passphrase` and unwrap every
    /// passcode-protected class key. All-or-nothing: if any class key
    /// fails its integrity check the keybag stays locked.
    pub fn unlock(&mut self, passphrase: &str) -> Result<()> {
        if self.unlocked {
            return Ok(());
        }
        if self.salt.is_empty() || self.double_salt.is_empty() {
            return Err(BackupError::Corruption(
                "keybag is missing its KDF parameters".into(),
            ));
        }

        let mut round1 = Zeroizing::new([0u8; 32]);
        pbkdf2_hmac::<Sha256>(
            passphrase.as_bytes(),
            &self.double_salt,
            self.double_iterations,
            round1.as_mut_slice(),
        );
        let mut passcode_key = Zeroizing::new([0u8; 32]);
        pbkdf2_hmac::<Sha1>(
            round1.as_slice(),
            &self.salt,
            self.iterations,
            passcode_key.as_mut_slice(),
        );

        let mut unwrapped = Vec::new();
        for ck in self.class_keys.values() {
            if ck.wrapped.is_empty() || ck.wrap & WRAP_PASSCODE == 0 {
                continue;
            }
            let key = crypto::unwrap_key(passcode_key.as_slice(), &ck.wrapped)
                .map_err(|_| BackupError::BadPassphrase)?;
            unwrapped.push((ck.class, key));
        }
        for (class, key) in unwrapped {
            if let Some(ck) = self.class_keys.get_mut(&class) {
                ck.key = Some(key);
            }
        }
        self.unlocked = true;
        debug!(classes = self.class_keys.len(), "keybag unlocked");
        Ok(())
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    /// Unwrap a persistent key under the class key for `class`. Only the
    /// 0x28-byte RFC 3394 form occurs in backups; the 0x30-byte curve form
    /// belongs to device keychains and is rejected.
    pub fn unwrap_key_for_class(&self, class: u32, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let class_key = self
            .class_keys
            .get(&class)
            .and_then(|ck| ck.key.as_ref())
            .ok_or(BackupError::KeybagLocked)?;
        match wrapped.len() {
            WRAPPED_KEY_LEN => crypto::unwrap_key(class_key, wrapped),
            WRAPPED_KEY_CURVE_LEN => Err(BackupError::UnsupportedClass(class)),
            n => Err(BackupError::Corruption(format!(
                "wrapped key has unexpected length {n:#x}"
            ))),
        }
    }
}
