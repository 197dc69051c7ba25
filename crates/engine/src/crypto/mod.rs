//! AES-256-GCM sealing of stored credential material.

pub mod encryption;

pub use encryption::SecretCipher;
