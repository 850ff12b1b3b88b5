//! AES building blocks for the backup format: CBC decryption without
//! padding, strict PKCS#7 unpadding, and RFC 3394 key unwrapping.

use aes::Aes256;
use aes_kw::KekAes256;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::BlockDecryptMut;
use cbc::cipher::KeyIvInit;
use zeroize::Zeroizing;

use crate::error::{BackupError, Result};

/// AES block size in bytes.
pub const AES_BLOCK_SIZE: usize = 16;

type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES-256-CBC decrypt. No padding is removed; the ciphertext length must
/// be a positive multiple of the block size.
pub fn cbc_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_SIZE != 0 {
        return Err(BackupError::Corruption(format!(
            "ciphertext length {} is not a positive multiple of {}",
            ciphertext.len(),
            AES_BLOCK_SIZE
        )));
    }
    let decryptor = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|_| BackupError::Corruption("invalid AES key or IV length".into()))?;
    let mut buf = ciphertext.to_vec();
    decryptor
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|_| BackupError::Corruption("CBC decryption failed".into()))?;
    Ok(buf)
}

/// RFC 3394 AES key unwrap under a 256-bit key-encryption key. Fails when
/// the integrity check value does not match.
pub fn unwrap_key(kek: &[u8], wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let kek: [u8; 32] = kek
        .try_into()
        .map_err(|_| BackupError::Corruption("key-encryption key must be 32 bytes".into()))?;
    if wrapped.len() < 24 || wrapped.len() % 8 != 0 {
        return Err(BackupError::Corruption(format!(
            "wrapped key has invalid length {}",
            wrapped.len()
        )));
    }
    let mut unwrapped = Zeroizing::new(vec![0u8; wrapped.len() - 8]);
    KekAes256::from(kek)
        .unwrap(wrapped, &mut unwrapped)
        .map_err(|_| BackupError::Corruption("key unwrap integrity check failed".into()))?;
    Ok(unwrapped)
}

/// Strip PKCS#7 padding from the final block of `buf`. The last byte names
/// the padding length `p` with `1 <= p <= 16`; all `p` trailing bytes must
/// equal `p`.
pub fn pkcs7_unpad(buf: &[u8]) -> Result<&[u8]> {
    let last = *buf
        .last()
        .ok_or_else(|| BackupError::Corruption("cannot unpad an empty buffer".into()))?;
    let pad = last as usize;
    if pad == 0 || pad > AES_BLOCK_SIZE || pad > buf.len() {
        return Err(BackupError::Corruption(format!(
            "invalid padding byte {last:#04x}"
        )));
    }
    let (data, padding) = buf.split_at(buf.len() - pad);
    if padding.iter().any(|&b| b != last) {
        return Err(BackupError::Corruption("inconsistent padding bytes".into()));
    }
    Ok(data)
}

/// On-disk length of an encrypted blob with plaintext length `plaintext`.
/// Encrypted files are padded out to the block size; files whose size is
/// already a block multiple get one extra full block of padding.
pub fn padded_ciphertext_len(plaintext: u64) -> u64 {
    (plaintext + 1).div_ceil(AES_BLOCK_SIZE as u64) * AES_BLOCK_SIZE as u64
}
