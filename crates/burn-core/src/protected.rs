//! In-memory encrypted strings.
//!
//! A [`ProtectedString`] keeps a variable's text encrypted while it sits in
//! the variable store. Plaintext only exists for the duration of a
//! [`ProtectedString::with_plaintext`] call: the buffer is decrypted in
//! place, handed to the caller and re-encrypted before the call returns,
//! including when the caller's read fails part-way.
//!
//! Buffers are padded to [`PROTECTED_BLOCK_SIZE`] the first time they are
//! encrypted and stay padded afterwards. Every buffer is zeroized when its
//! value is replaced or dropped.

use std::fmt;
use std::sync::OnceLock;

use chacha20poly1305::aead::{AeadCore, AeadInPlace, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};
use zeroize::{Zeroize, Zeroizing};

use crate::security::{KeyBuffer, PROTECTED_BLOCK_SIZE};

/// Errors from protecting or unprotecting a buffer.
#[derive(Debug, thiserror::Error)]
pub enum ProtectError {
    #[error("failed to encrypt protected buffer")]
    Encrypt,

    #[error("failed to decrypt protected buffer")]
    Decrypt,

    #[error("protected buffer does not hold valid UTF-8")]
    Utf8,
}

/// Process-wide cipher. The key never leaves this process.
fn memory_cipher() -> &'static ChaCha20Poly1305 {
    static CIPHER: OnceLock<ChaCha20Poly1305> = OnceLock::new();
    CIPHER.get_or_init(|| {
        let mut generated = ChaCha20Poly1305::generate_key(&mut OsRng);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&generated);
        generated.as_mut_slice().zeroize();
        let key = KeyBuffer::<32>::from_bytes(bytes);
        bytes.zeroize();
        ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()))
    })
}

#[derive(Clone)]
struct Seal {
    nonce: Nonce,
    tag: Tag,
}

/// A string that can be held encrypted in memory.
#[derive(Clone)]
pub struct ProtectedString {
    buffer: Vec<u8>,
    len: usize,
    seal: Option<Seal>,
}

impl ProtectedString {
    /// Wrap plaintext. The value starts unencrypted.
    pub fn new(value: &str) -> Self {
        Self {
            buffer: plain_buffer(value),
            len: value.len(),
            seal: None,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.seal.is_some()
    }

    /// Plaintext length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the buffer has been padded for encryption.
    pub fn is_padded(&self) -> bool {
        !self.buffer.is_empty() && self.buffer.len() % PROTECTED_BLOCK_SIZE == 0
    }

    /// Switch the buffer between encrypted and plaintext form.
    pub fn set_encrypted(&mut self, encrypt: bool) -> Result<(), ProtectError> {
        match (encrypt, self.seal.is_some()) {
            (true, false) => {
                self.pad();
                self.seal()
            }
            (false, true) => self.unseal(),
            _ => Ok(()),
        }
    }

    /// Replace the value, keeping the current encryption state.
    pub fn replace(&mut self, value: &str) -> Result<(), ProtectError> {
        let encrypt = self.seal.is_some();
        let mut old = std::mem::replace(&mut self.buffer, plain_buffer(value));
        old.zeroize();
        self.len = value.len();
        self.seal = None;
        if encrypt {
            self.pad();
            self.seal()?;
        }
        Ok(())
    }

    /// Run `read` against the plaintext.
    ///
    /// An encrypted buffer is decrypted in place and re-encrypted with a
    /// fresh nonce before this returns, on every path.
    pub fn with_plaintext<R>(
        &mut self,
        read: impl FnOnce(&str) -> R,
    ) -> Result<R, ProtectError> {
        if self.seal.is_none() {
            let text = std::str::from_utf8(&self.buffer[..self.len])
                .map_err(|_| ProtectError::Utf8)?;
            return Ok(read(text));
        }

        self.unseal()?;
        let guard = ResealGuard {
            target: self,
            armed: true,
        };
        let result = {
            let text = std::str::from_utf8(&guard.target.buffer[..guard.target.len])
                .map_err(|_| ProtectError::Utf8)?;
            read(text)
        };
        guard.finish()?;
        Ok(result)
    }

    /// Copy the plaintext out into a zeroizing string.
    pub fn reveal(&mut self) -> Result<Zeroizing<String>, ProtectError> {
        self.with_plaintext(|text| Zeroizing::new(text.to_string()))
    }

    /// Pad in place. A buffer without room is copied into a new
    /// allocation first and the old one zeroized, so growing never frees
    /// plaintext.
    fn pad(&mut self) {
        let padded = padded_len(self.len);
        if self.buffer.len() == padded {
            return;
        }
        if self.buffer.capacity() < padded {
            let mut grown = Vec::with_capacity(padded);
            grown.extend_from_slice(&self.buffer);
            let mut old = std::mem::replace(&mut self.buffer, grown);
            old.zeroize();
        }
        self.buffer.resize(padded, 0);
    }

    fn seal(&mut self) -> Result<(), ProtectError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let tag = memory_cipher()
            .encrypt_in_place_detached(&nonce, b"", &mut self.buffer)
            .map_err(|_| ProtectError::Encrypt)?;
        self.seal = Some(Seal { nonce, tag });
        Ok(())
    }

    fn unseal(&mut self) -> Result<(), ProtectError> {
        let Some(seal) = self.seal.take() else {
            return Ok(());
        };
        if memory_cipher()
            .decrypt_in_place_detached(&seal.nonce, b"", &mut self.buffer, &seal.tag)
            .is_err()
        {
            // Leave the ciphertext sealed so a later attempt sees the same state.
            self.seal = Some(seal);
            return Err(ProtectError::Decrypt);
        }
        Ok(())
    }
}

fn padded_len(len: usize) -> usize {
    len.div_ceil(PROTECTED_BLOCK_SIZE).max(1) * PROTECTED_BLOCK_SIZE
}

/// Plaintext copy with room for its padding.
fn plain_buffer(value: &str) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(padded_len(value.len()));
    buffer.extend_from_slice(value.as_bytes());
    buffer
}

/// Re-encrypts the target when dropped unless [`ResealGuard::finish`] ran.
struct ResealGuard<'a> {
    target: &'a mut ProtectedString,
    armed: bool,
}

impl ResealGuard<'_> {
    fn finish(mut self) -> Result<(), ProtectError> {
        self.armed = false;
        self.target.seal()
    }
}

impl Drop for ResealGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.target.seal().is_err() {
            // Plaintext must not outlive a failed reseal.
            self.target.buffer.zeroize();
            self.target.len = 0;
            tracing::error!("Failed to re-encrypt protected buffer; value cleared");
        }
    }
}

impl Drop for ProtectedString {
    fn drop(&mut self) {
        self.buffer.zeroize();
    }
}

impl fmt::Debug for ProtectedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtectedString")
            .field("value", &"[REDACTED]")
            .field("encrypted", &self.seal.is_some())
            .finish()
    }
}
