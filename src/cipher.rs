//! AES-CTR keystream over the virtual byte stream.
//!
//! The keystream position of a byte is its absolute offset inside the
//! virtual window, so any page can be encrypted or decrypted independently
//! of every other. The base IV is derived from the key by encrypting a
//! fixed tweak block, which makes two maps with different keys produce
//! unrelated keystreams.

use crate::{Error, Result};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher, StreamCipherSeek};
use aes::{Aes128, Aes256};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Tweak block encrypted under the key to obtain the base IV.
const IV_TWEAK: [u8; 16] = *b"demand-paged-map";

#[derive(Clone)]
enum Key {
  Aes128([u8; 16]),
  Aes256([u8; 32]),
}

/// A stateless page encryptor/decryptor keyed once at construction.
///
/// Bytes below `plain_prefix` are never touched: that range of the
/// underlying mapping stores a verbatim plaintext header.
#[derive(Clone)]
pub struct PageCipher {
  key: Key,
  iv: [u8; 16],
  plain_prefix: usize,
}

impl PageCipher {
  /// Creates a cipher from a 16-byte (AES-128) or 32-byte (AES-256) key.
  pub fn new(key: &[u8], plain_prefix: usize) -> Result<Self> {
    let key = match key.len() {
      16 => {
        let mut bytes = [0; 16];
        bytes.copy_from_slice(key);
        Key::Aes128(bytes)
      }
      32 => {
        let mut bytes = [0; 32];
        bytes.copy_from_slice(key);
        Key::Aes256(bytes)
      }
      _ => return Err(Error::InvalidKeyLength),
    };

    let iv = derive_iv(&key);
    Ok(PageCipher {
      key,
      iv,
      plain_prefix,
    })
  }

  /// Applies the keystream to `buf` in place, where `buf[0]` sits at
  /// virtual offset `offset`. Encryption and decryption are the same
  /// operation in CTR mode.
  ///
  /// Does not allocate; safe to call from the fault path.
  pub fn apply(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
    let skip = self.plain_prefix.saturating_sub(offset).min(buf.len());
    let offset = offset + skip;
    let buf = &mut buf[skip..];
    if buf.is_empty() {
      return Ok(());
    }

    match &self.key {
      Key::Aes128(key) => {
        let mut cipher = Aes128Ctr::new(key.into(), (&self.iv).into());
        xor(&mut cipher, offset, buf)
      }
      Key::Aes256(key) => {
        let mut cipher = Aes256Ctr::new(key.into(), (&self.iv).into());
        xor(&mut cipher, offset, buf)
      }
    }
  }

  /// Copies `src` to `dst` applying the keystream, with `src[0]` at
  /// virtual offset `offset`. Bytes below the plaintext prefix are copied
  /// verbatim. Used by the write-back path, which must leave the source
  /// frame's plaintext intact.
  pub fn apply_b2b(&self, offset: usize, src: &[u8], dst: &mut [u8]) -> Result<()> {
    if src.len() != dst.len() {
      return Err(Error::Cipher);
    }

    let skip = self.plain_prefix.saturating_sub(offset).min(src.len());
    dst[..skip].copy_from_slice(&src[..skip]);

    let offset = offset + skip;
    let (src, dst) = (&src[skip..], &mut dst[skip..]);
    if src.is_empty() {
      return Ok(());
    }

    match &self.key {
      Key::Aes128(key) => {
        let mut cipher = Aes128Ctr::new(key.into(), (&self.iv).into());
        xor_b2b(&mut cipher, offset, src, dst)
      }
      Key::Aes256(key) => {
        let mut cipher = Aes256Ctr::new(key.into(), (&self.iv).into());
        xor_b2b(&mut cipher, offset, src, dst)
      }
    }
  }
}

fn xor<C: StreamCipher + StreamCipherSeek>(
  cipher: &mut C,
  offset: usize,
  buf: &mut [u8],
) -> Result<()> {
  cipher.try_seek(offset as u64).map_err(|_| Error::Cipher)?;
  cipher.try_apply_keystream(buf).map_err(|_| Error::Cipher)
}

fn xor_b2b<C: StreamCipher + StreamCipherSeek>(
  cipher: &mut C,
  offset: usize,
  src: &[u8],
  dst: &mut [u8],
) -> Result<()> {
  cipher.try_seek(offset as u64).map_err(|_| Error::Cipher)?;
  cipher
    .apply_keystream_b2b(src, dst)
    .map_err(|_| Error::Cipher)
}

fn derive_iv(key: &Key) -> [u8; 16] {
  let mut block = GenericArray::from(IV_TWEAK);

  match key {
    Key::Aes128(key) => Aes128::new(key.into()).encrypt_block(&mut block),
    Key::Aes256(key) => Aes256::new(key.into()).encrypt_block(&mut block),
  }

  block.into()
}
