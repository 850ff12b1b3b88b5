//! Random-access reads against content blobs. Unencrypted blobs are read
//! positionally; encrypted blobs are serviced by aligning the request to
//! AES block boundaries, fetching the previous ciphertext block as the IV,
//! decrypting, unpadding at the end of the file, and trimming back down to
//! the requested window.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use tracing::trace;
use zeroize::Zeroizing;

use crate::crypto::{self, AES_BLOCK_SIZE};
use crate::entry::FileRecord;
use crate::error::{BackupError, Result};
use crate::keybag::Keybag;

/// State cached for the lifetime of one open file handle.
pub struct OpenFile {
    blob: File,
    blob_len: u64,
    /// Per-file AES key, unwrapped from the record's `EncryptionKey` under
    /// its protection class once at open.
    file_key: Option<Zeroizing<Vec<u8>>>,
}

/// Block-aligned window covering the request `[offset, offset + length)`.
fn block_span(offset: u64, length: usize) -> (u64, u64, usize) {
    let block = AES_BLOCK_SIZE as u64;
    let start_block = offset / block * block;
    let end_block = (offset + length as u64).div_ceil(block) * block;
    let head_skip = (offset - start_block) as usize;
    (start_block, end_block, head_skip)
}

/// Fill `buf` from `file` starting at `offset`, stopping at EOF. Returns
/// the number of bytes read.
fn read_at_full(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

impl OpenFile {
    pub fn open(record: &FileRecord, root: &Path, keybag: Option<&Keybag>) -> Result<Self> {
        let blob = File::open(record.blob_path(root))?;
        let blob_len = blob.metadata()?.len();
        let file_key = match &record.metadata.wrapped_key {
            Some(wrapped) => {
                let keybag = keybag.ok_or(BackupError::KeybagLocked)?;
                Some(keybag.unwrap_key_for_class(record.metadata.protection_class, wrapped)?)
            }
            None => None,
        };
        Ok(Self {
            blob,
            blob_len,
            file_key,
        })
    }

    pub fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        match &self.file_key {
            None => self.read_plain(offset, length),
            Some(key) => self.read_encrypted(key, offset, length),
        }
    }

    fn read_plain(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; length];
        let filled = read_at_full(&self.blob, &mut buf, offset)?;
        buf.truncate(filled);
        Ok(buf)
    }

    fn read_encrypted(&self, key: &[u8], offset: u64, length: usize) -> Result<Vec<u8>> {
        let (start_block, end_block, head_skip) = block_span(offset, length);
        trace!(offset, length, start_block, end_block, "encrypted read");

        // The IV for the first requested block is the ciphertext block
        // before it, or all zeroes at the start of the file.
        let mut iv = [0u8; AES_BLOCK_SIZE];
        if start_block > 0 {
            let n = read_at_full(&self.blob, &mut iv, start_block - AES_BLOCK_SIZE as u64)?;
            if n == 0 {
                // Reading past the end of the file.
                return Ok(Vec::new());
            }
            if n != AES_BLOCK_SIZE {
                return Err(BackupError::Corruption(
                    "truncated ciphertext before requested block".into(),
                ));
            }
        }

        let mut ciphertext = vec![0u8; (end_block - start_block) as usize];
        let n = read_at_full(&self.blob, &mut ciphertext, start_block)?;
        ciphertext.truncate(n);
        if ciphertext.is_empty() {
            return Ok(Vec::new());
        }
        if ciphertext.len() % AES_BLOCK_SIZE != 0 {
            return Err(BackupError::Corruption(
                "ciphertext blob is not block aligned".into(),
            ));
        }

        let mut plaintext = crypto::cbc_decrypt(key, &iv, &ciphertext)?;

        // Padding sits in the blob's final block only; unpad exactly when
        // this read consumed it.
        if start_block + ciphertext.len() as u64 >= self.blob_len {
            let unpadded_len = crypto::pkcs7_unpad(&plaintext)?.len();
            plaintext.truncate(unpadded_len);
        }

        if head_skip > 0 {
            if head_skip >= plaintext.len() {
                return Ok(Vec::new());
            }
            plaintext.drain(..head_skip);
        }
        plaintext.truncate(length);
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_span_alignment() {
        assert_eq!(block_span(0, 16), (0, 16, 0));
        assert_eq!(block_span(0, 1), (0, 16, 0));
        assert_eq!(block_span(17, 1), (16, 32, 1));
        assert_eq!(block_span(15, 2), (0, 32, 15));
        assert_eq!(block_span(32, 16), (32, 48, 0));
        assert_eq!(block_span(100, 0), (96, 112, 4));
    }
}
