//! Credential gateway: at-rest decryption, private key decoding and the
//! Kerberos ticket helper.

pub mod kerberos;
pub mod keys;
pub mod secrets;

pub use kerberos::kinit;
pub use keys::{KeyDecoder, KeyMaterial, PemKeyDecoder};
pub use secrets::{Decrypt, SecretStore};
