//! Symmetric encryption stage of the codec stack.
//!
//! Entry data may be encrypted with AES-CBC. Every entry carries a random
//! 16-byte crypt salt and a crypt-mode tag in its header; an independent
//! reader reconstructs the key schedule from those and the user-supplied
//! password, so entries are decryptable in isolation (workers never share
//! cipher state).
//!
//! Key and IV are derived from password and salt by iterated SHA-256; the
//! stage consumes and produces whole cipher blocks, zero-padding only the
//! terminal block.

mod password;

pub use password::{Password, PasswordSource, PasswordUse};

use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::{Error, Result};

#[cfg(feature = "aes")]
use aes::{Aes128, Aes192, Aes256};
#[cfg(feature = "aes")]
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::NoPadding};

/// Length of the per-entry crypt salt carried in entry headers.
pub const SALT_LEN: usize = 16;

/// Cipher block size in bytes (AES).
pub const BLOCK_SIZE: usize = 16;

/// Key-derivation rounds (iterated SHA-256).
const KDF_ROUNDS: u32 = 1 << 16;

/// The symmetric cipher applied to entry data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CryptMode {
    /// No encryption.
    #[default]
    None,
    /// AES-128 in CBC mode.
    Aes128,
    /// AES-192 in CBC mode.
    Aes192,
    /// AES-256 in CBC mode.
    Aes256,
}

impl CryptMode {
    /// The wire tag stored in entry headers.
    pub fn to_tag(self) -> u8 {
        match self {
            CryptMode::None => 0,
            CryptMode::Aes128 => 1,
            CryptMode::Aes192 => 2,
            CryptMode::Aes256 => 3,
        }
    }

    /// Decodes a wire tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CryptMode::None),
            1 => Some(CryptMode::Aes128),
            2 => Some(CryptMode::Aes192),
            3 => Some(CryptMode::Aes256),
            _ => None,
        }
    }

    /// Key length in bytes; zero for [`CryptMode::None`].
    pub fn key_len(self) -> usize {
        match self {
            CryptMode::None => 0,
            CryptMode::Aes128 => 16,
            CryptMode::Aes192 => 24,
            CryptMode::Aes256 => 32,
        }
    }

    /// Cipher block size the framing layer must respect; 1 when no cipher
    /// is in effect.
    pub fn block_size(self) -> usize {
        if self == CryptMode::None { 1 } else { BLOCK_SIZE }
    }
}

/// Generates a fresh random salt for a new entry.
#[cfg(feature = "aes")]
pub fn generate_salt() -> Result<[u8; SALT_LEN]> {
    let mut salt = [0u8; SALT_LEN];
    getrandom::getrandom(&mut salt).map_err(|e| Error::Crypto(e.to_string()))?;
    Ok(salt)
}

/// Returns the salt for a new entry: all zeros without encryption, fresh
/// random bytes otherwise.
pub fn salt_for(mode: CryptMode) -> Result<[u8; SALT_LEN]> {
    if mode == CryptMode::None {
        return Ok([0u8; SALT_LEN]);
    }
    #[cfg(feature = "aes")]
    {
        generate_salt()
    }
    #[cfg(not(feature = "aes"))]
    {
        Err(Error::Crypto("encryption support not compiled in".into()))
    }
}

/// Derives the key and IV for one entry from password and salt.
///
/// The derivation is a single SHA-256 over `KDF_ROUNDS` repetitions of
/// `salt ‖ password ‖ round_index`; the IV comes from a second hash over the
/// key block and salt, so key and IV never coincide.
fn derive_key_iv(
    password: &Password,
    salt: &[u8; SALT_LEN],
    key_len: usize,
) -> (Zeroizing<Vec<u8>>, [u8; BLOCK_SIZE]) {
    let mut sha = Sha256::new();
    for i in 0..KDF_ROUNDS {
        sha.update(salt);
        sha.update(password.as_bytes());
        sha.update(i.to_le_bytes());
    }
    let block: [u8; 32] = sha.finalize().into();

    let mut iv_sha = Sha256::new();
    iv_sha.update(block);
    iv_sha.update(salt);
    iv_sha.update([0x01]);
    let iv_block: [u8; 32] = iv_sha.finalize().into();

    let mut iv = [0u8; BLOCK_SIZE];
    iv.copy_from_slice(&iv_block[..BLOCK_SIZE]);
    (Zeroizing::new(block[..key_len].to_vec()), iv)
}

/// Per-entry encryption/decryption state.
///
/// One stream lives for exactly one entry body. Whole cipher blocks are
/// processed as they arrive; a trailing partial block is carried until the
/// next call or zero-padded at finish.
pub struct CryptStream {
    mode: CryptMode,
    key: Zeroizing<Vec<u8>>,
    iv: [u8; BLOCK_SIZE],
    pending: Vec<u8>,
}

impl std::fmt::Debug for CryptStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptStream")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl CryptStream {
    /// Creates a stream for one entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PasswordRequired`] when `mode` needs a key but no
    /// password was supplied, and [`Error::Crypto`] when the cipher is not
    /// compiled into this build.
    pub fn new(
        mode: CryptMode,
        password: Option<&Password>,
        salt: &[u8; SALT_LEN],
    ) -> Result<Self> {
        if mode == CryptMode::None {
            return Ok(Self {
                mode,
                key: Zeroizing::new(Vec::new()),
                iv: [0u8; BLOCK_SIZE],
                pending: Vec::new(),
            });
        }
        if cfg!(not(feature = "aes")) {
            return Err(Error::Crypto("encryption support not compiled in".into()));
        }
        let password = password.ok_or(Error::PasswordRequired)?;
        let (key, iv) = derive_key_iv(password, salt, mode.key_len());
        Ok(Self {
            mode,
            key,
            iv,
            pending: Vec::new(),
        })
    }

    /// The mode this stream was created with.
    pub fn mode(&self) -> CryptMode {
        self.mode
    }

    /// Encrypts `data`, appending ciphertext for every completed block to
    /// `out`. A trailing partial block is held back.
    pub fn encrypt(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        if self.mode == CryptMode::None {
            out.extend_from_slice(data);
            return Ok(());
        }
        self.pending.extend_from_slice(data);
        let complete = (self.pending.len() / BLOCK_SIZE) * BLOCK_SIZE;
        if complete == 0 {
            return Ok(());
        }
        let mut block: Vec<u8> = self.pending.drain(..complete).collect();
        self.encrypt_blocks(&mut block)?;
        out.extend_from_slice(&block);
        Ok(())
    }

    /// Encrypts the final partial block (zero-padded) and drains all state.
    pub fn finish_encrypt(&mut self, out: &mut Vec<u8>) -> Result<()> {
        if self.mode == CryptMode::None || self.pending.is_empty() {
            return Ok(());
        }
        let mut block = std::mem::take(&mut self.pending);
        block.resize(BLOCK_SIZE, 0);
        self.encrypt_blocks(&mut block)?;
        out.extend_from_slice(&block);
        Ok(())
    }

    /// Decrypts `data`, appending plaintext for every completed block to
    /// `out`. Ciphertext arrives block-aligned from the archive, but partial
    /// deliveries are buffered.
    pub fn decrypt(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        if self.mode == CryptMode::None {
            out.extend_from_slice(data);
            return Ok(());
        }
        self.pending.extend_from_slice(data);
        let complete = (self.pending.len() / BLOCK_SIZE) * BLOCK_SIZE;
        if complete == 0 {
            return Ok(());
        }
        let mut block: Vec<u8> = self.pending.drain(..complete).collect();
        self.decrypt_blocks(&mut block)?;
        out.extend_from_slice(&block);
        Ok(())
    }

    /// Checks that no partial cipher block is left over.
    pub fn finish_decrypt(&mut self) -> Result<()> {
        if self.mode != CryptMode::None && !self.pending.is_empty() {
            return Err(Error::Crypto("encrypted data not block-aligned".into()));
        }
        Ok(())
    }

    #[cfg(feature = "aes")]
    fn encrypt_blocks(&mut self, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len() % BLOCK_SIZE, 0);
        let len = buf.len();
        match self.mode {
            CryptMode::None => return Ok(()),
            CryptMode::Aes128 => {
                let enc = cbc::Encryptor::<Aes128>::new_from_slices(&self.key, &self.iv)
                    .map_err(|e| Error::Crypto(e.to_string()))?;
                enc.encrypt_padded_mut::<NoPadding>(buf, len)
                    .map_err(|e| Error::Crypto(e.to_string()))?;
            }
            CryptMode::Aes192 => {
                let enc = cbc::Encryptor::<Aes192>::new_from_slices(&self.key, &self.iv)
                    .map_err(|e| Error::Crypto(e.to_string()))?;
                enc.encrypt_padded_mut::<NoPadding>(buf, len)
                    .map_err(|e| Error::Crypto(e.to_string()))?;
            }
            CryptMode::Aes256 => {
                let enc = cbc::Encryptor::<Aes256>::new_from_slices(&self.key, &self.iv)
                    .map_err(|e| Error::Crypto(e.to_string()))?;
                enc.encrypt_padded_mut::<NoPadding>(buf, len)
                    .map_err(|e| Error::Crypto(e.to_string()))?;
            }
        }
        // CBC chaining across calls: next IV is the last ciphertext block.
        self.iv.copy_from_slice(&buf[len - BLOCK_SIZE..]);
        Ok(())
    }

    #[cfg(feature = "aes")]
    fn decrypt_blocks(&mut self, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len() % BLOCK_SIZE, 0);
        let len = buf.len();
        let mut next_iv = [0u8; BLOCK_SIZE];
        next_iv.copy_from_slice(&buf[len - BLOCK_SIZE..]);
        match self.mode {
            CryptMode::None => return Ok(()),
            CryptMode::Aes128 => {
                let dec = cbc::Decryptor::<Aes128>::new_from_slices(&self.key, &self.iv)
                    .map_err(|e| Error::Crypto(e.to_string()))?;
                dec.decrypt_padded_mut::<NoPadding>(buf)
                    .map_err(|e| Error::Crypto(e.to_string()))?;
            }
            CryptMode::Aes192 => {
                let dec = cbc::Decryptor::<Aes192>::new_from_slices(&self.key, &self.iv)
                    .map_err(|e| Error::Crypto(e.to_string()))?;
                dec.decrypt_padded_mut::<NoPadding>(buf)
                    .map_err(|e| Error::Crypto(e.to_string()))?;
            }
            CryptMode::Aes256 => {
                let dec = cbc::Decryptor::<Aes256>::new_from_slices(&self.key, &self.iv)
                    .map_err(|e| Error::Crypto(e.to_string()))?;
                dec.decrypt_padded_mut::<NoPadding>(buf)
                    .map_err(|e| Error::Crypto(e.to_string()))?;
            }
        }
        self.iv = next_iv;
        Ok(())
    }

    #[cfg(not(feature = "aes"))]
    fn encrypt_blocks(&mut self, _buf: &mut [u8]) -> Result<()> {
        Err(Error::Crypto("encryption support not compiled in".into()))
    }

    #[cfg(not(feature = "aes"))]
    fn decrypt_blocks(&mut self, _buf: &mut [u8]) -> Result<()> {
        Err(Error::Crypto("encryption support not compiled in".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_tags_round_trip() {
        for mode in [
            CryptMode::None,
            CryptMode::Aes128,
            CryptMode::Aes192,
            CryptMode::Aes256,
        ] {
            assert_eq!(CryptMode::from_tag(mode.to_tag()), Some(mode));
        }
        assert_eq!(CryptMode::from_tag(200), None);
    }

    #[test]
    fn none_mode_is_pass_through() {
        let salt = [0u8; SALT_LEN];
        let mut s = CryptStream::new(CryptMode::None, None, &salt).unwrap();
        let mut out = Vec::new();
        s.encrypt(b"plain bytes", &mut out).unwrap();
        s.finish_encrypt(&mut out).unwrap();
        assert_eq!(out, b"plain bytes");
    }

    #[cfg(feature = "aes")]
    #[test]
    fn derivation_is_deterministic_and_salt_sensitive() {
        let pw = Password::new("secret");
        let salt_a = [1u8; SALT_LEN];
        let salt_b = [2u8; SALT_LEN];
        let (k1, iv1) = derive_key_iv(&pw, &salt_a, 32);
        let (k2, iv2) = derive_key_iv(&pw, &salt_a, 32);
        let (k3, iv3) = derive_key_iv(&pw, &salt_b, 32);
        assert_eq!(*k1, *k2);
        assert_eq!(iv1, iv2);
        assert_ne!(*k1, *k3);
        assert_ne!(iv1, iv3);
        assert_ne!(&k1[..16], &iv1[..]);
    }

    #[cfg(feature = "aes")]
    #[test]
    fn encrypt_decrypt_round_trip() {
        let pw = Password::new("secret");
        let salt = generate_salt().unwrap();
        let data = b"The quick brown fox jumps over the lazy dog. 0123456789";

        let mut enc = CryptStream::new(CryptMode::Aes256, Some(&pw), &salt).unwrap();
        let mut ciphertext = Vec::new();
        // Split across calls to exercise the partial-block carry.
        enc.encrypt(&data[..7], &mut ciphertext).unwrap();
        enc.encrypt(&data[7..], &mut ciphertext).unwrap();
        enc.finish_encrypt(&mut ciphertext).unwrap();

        assert_eq!(ciphertext.len() % BLOCK_SIZE, 0);
        assert!(ciphertext.len() >= data.len());
        assert_ne!(&ciphertext[..data.len()], &data[..]);

        let mut dec = CryptStream::new(CryptMode::Aes256, Some(&pw), &salt).unwrap();
        let mut plaintext = Vec::new();
        dec.decrypt(&ciphertext, &mut plaintext).unwrap();
        dec.finish_decrypt().unwrap();

        // Zero padding trails the plaintext; the byte stream itself matches.
        assert_eq!(&plaintext[..data.len()], &data[..]);
        assert!(plaintext[data.len()..].iter().all(|&b| b == 0));
    }

    #[cfg(feature = "aes")]
    #[test]
    fn wrong_salt_scrambles() {
        let pw = Password::new("secret");
        let salt = [7u8; SALT_LEN];
        let other = [8u8; SALT_LEN];
        let data = vec![0x42u8; 64];

        let mut enc = CryptStream::new(CryptMode::Aes128, Some(&pw), &salt).unwrap();
        let mut ciphertext = Vec::new();
        enc.encrypt(&data, &mut ciphertext).unwrap();
        enc.finish_encrypt(&mut ciphertext).unwrap();

        let mut dec = CryptStream::new(CryptMode::Aes128, Some(&pw), &other).unwrap();
        let mut plaintext = Vec::new();
        dec.decrypt(&ciphertext, &mut plaintext).unwrap();
        assert_ne!(&plaintext[..data.len()], &data[..]);
    }

    #[cfg(feature = "aes")]
    #[test]
    fn missing_password_is_reported() {
        let salt = [0u8; SALT_LEN];
        let err = CryptStream::new(CryptMode::Aes256, None, &salt).unwrap_err();
        assert!(err.is_recoverable());
    }
}
