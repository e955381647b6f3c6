//! Security constants and secret generation.
//!
//! Provides the const-evaluable bounds that guard the pipe handshake and
//! the in-memory variable encryption, plus helpers for minting pipe names
//! and handshake secrets.

use uuid::Uuid;
use zeroize::{Zeroize, Zeroizing};

/// Maximum secret length accepted from a peer, in UTF-16 code units.
pub const MAX_SECRET_UNITS: usize = 255;

/// Maximum secret length in bytes on the wire.
pub const MAX_SECRET_BYTES: usize = MAX_SECRET_UNITS * 2;

/// Block size that protected string buffers are padded to before encryption.
pub const PROTECTED_BLOCK_SIZE: usize = 16;

/// Minimum acceptable symmetric key length in bytes (256 bits).
pub const MIN_KEY_BYTES: usize = 32;

/// Assert at compile time that a key size meets the minimum requirement.
///
/// # Example
///
/// ```
/// use burn_core::security;
/// security::assert_key_size::<32>();
/// ```
pub const fn assert_key_size<const N: usize>() {
    assert!(
        N >= MIN_KEY_BYTES,
        "Key size is below minimum (32 bytes / 256 bits)"
    );
}

/// A fixed-size key buffer, zeroized on drop.
///
/// Uses const generics to reject undersized buffers at compile time.
pub struct KeyBuffer<const N: usize> {
    data: [u8; N],
}

impl<const N: usize> KeyBuffer<N> {
    /// Create a key buffer from raw bytes.
    pub const fn from_bytes(data: [u8; N]) -> Self {
        assert_key_size::<N>();
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8; N] {
        &self.data
    }
}

impl<const N: usize> Drop for KeyBuffer<N> {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

impl<const N: usize> std::fmt::Debug for KeyBuffer<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyBuffer")
            .field("data", &"[REDACTED]")
            .field("len", &N)
            .finish()
    }
}

/// Mint a fresh, unguessable pipe base name.
pub fn generate_pipe_name() -> String {
    format!("BurnPipe.{}", Uuid::new_v4().simple())
}

/// Mint a fresh handshake secret.
pub fn generate_secret() -> Zeroizing<String> {
    Zeroizing::new(Uuid::new_v4().braced().to_string().to_ascii_uppercase())
}

/// Whether a secret fits within the handshake bound.
pub fn secret_within_bounds(secret: &str) -> bool {
    secret.encode_utf16().count() <= MAX_SECRET_UNITS
}
