//! Actor key generation and at-rest wrapping
//!
//! Private keys are stored as PKCS#8 DER wrapped with AES key wrap
//! (RFC 5649, padded) under a 256-bit key derived from the server secret
//! with PBKDF2-HMAC-SHA256 and a per-key random salt.

use aes_kw::KekAes256;
use hmac::Hmac;
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::Deserialize;
use sha2::Sha256;

use crate::error::AppError;

/// Smallest RSA modulus accepted for actor keys
pub const MIN_RSA_BITS: usize = 2048;

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;

/// Server-wide key-encryption secret.
///
/// Passed explicitly to every operation that wraps or unwraps a key.
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct Kek(String);

impl Kek {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Secret length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn expose(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Debug for Kek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Kek([REDACTED])")
    }
}

/// Output of key generation: what gets persisted beside a local actor
#[derive(Clone)]
pub struct WrappedKey {
    pub wrapped_private_key: Vec<u8>,
    pub salt: Vec<u8>,
    pub public_key_pem: String,
}

impl std::fmt::Debug for WrappedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappedKey")
            .field("wrapped_private_key", &format_args!("{} bytes", self.wrapped_private_key.len()))
            .field("salt", &format_args!("{} bytes", self.salt.len()))
            .field("public_key_pem", &self.public_key_pem)
            .finish()
    }
}

/// Generate a 2048-bit actor key and wrap it under `kek`
pub fn generate_key(kek: &Kek) -> Result<WrappedKey, AppError> {
    generate_key_with_bits(kek, MIN_RSA_BITS)
}

/// Generate an actor key of `bits` (at least 2048) and wrap it under `kek`
pub fn generate_key_with_bits(kek: &Kek, bits: usize) -> Result<WrappedKey, AppError> {
    if bits < MIN_RSA_BITS {
        return Err(AppError::Validation(format!(
            "RSA keys must be at least {} bits, got {}",
            MIN_RSA_BITS, bits
        )));
    }

    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, bits)
        .map_err(|e| AppError::Encryption(format!("RSA key generation failed: {}", e)))?;

    tracing::debug!(bits, "Generated actor key pair");

    wrap_private_key(kek, &private_key)
}

/// Wrap an existing private key under `kek` with a fresh salt
pub fn wrap_private_key(kek: &Kek, private_key: &RsaPrivateKey) -> Result<WrappedKey, AppError> {
    let public_key_pem = RsaPublicKey::from(private_key)
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| AppError::Encryption(format!("Failed to encode public key: {}", e)))?;

    let der = private_key
        .to_pkcs8_der()
        .map_err(|e| AppError::Encryption(format!("Failed to encode private key: {}", e)))?;

    let mut salt = vec![0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);

    let wrapping_key = derive_wrapping_key(kek, &salt)?;
    let wrapped_private_key = wrapping_key
        .wrap_with_padding_vec(der.as_bytes())
        .map_err(|e| AppError::Encryption(format!("Failed to wrap private key: {}", e)))?;

    Ok(WrappedKey {
        wrapped_private_key,
        salt,
        public_key_pem,
    })
}

/// Recover the private key wrapped by [`wrap_private_key`].
///
/// A wrong secret, a different salt or altered ciphertext all fail the
/// key-wrap integrity check and yield [`AppError::KeyUnwrap`].
pub fn unwrap_key(kek: &Kek, wrapped: &[u8], salt: &[u8]) -> Result<RsaPrivateKey, AppError> {
    let wrapping_key = derive_wrapping_key(kek, salt)?;

    let der = wrapping_key
        .unwrap_with_padding_vec(wrapped)
        .map_err(|_| AppError::KeyUnwrap)?;

    RsaPrivateKey::from_pkcs8_der(&der).map_err(|_| AppError::KeyUnwrap)
}

fn derive_wrapping_key(kek: &Kek, salt: &[u8]) -> Result<KekAes256, AppError> {
    let mut derived = [0u8; 32];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(kek.expose(), salt, PBKDF2_ITERATIONS, &mut derived)
        .map_err(|e| AppError::Encryption(format!("Key derivation failed: {}", e)))?;

    Ok(KekAes256::from(derived))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1v15::SigningKey;
    use rsa::signature::{SignatureEncoding, Signer};

    fn test_kek() -> Kek {
        Kek::new("test-secret-that-is-long-enough-0001")
    }

    fn small_key() -> RsaPrivateKey {
        RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("test key")
    }

    #[test]
    fn wrapped_key_round_trips_to_identical_signatures() {
        let kek = test_kek();
        let original = small_key();
        let wrapped = wrap_private_key(&kek, &original).expect("wrap");

        let recovered =
            unwrap_key(&kek, &wrapped.wrapped_private_key, &wrapped.salt).expect("unwrap");

        let message = b"(request-target): post /inbox";
        let expected = SigningKey::<Sha256>::new(original).sign(message).to_bytes();
        let actual = SigningKey::<Sha256>::new(recovered).sign(message).to_bytes();
        assert_eq!(expected, actual);
    }

    #[test]
    fn wrong_secret_fails_to_unwrap() {
        let wrapped = wrap_private_key(&test_kek(), &small_key()).expect("wrap");
        let other = Kek::new("a-completely-different-secret-value-x");

        let result = unwrap_key(&other, &wrapped.wrapped_private_key, &wrapped.salt);
        assert!(matches!(result, Err(AppError::KeyUnwrap)));
    }

    #[test]
    fn corrupted_ciphertext_fails_to_unwrap() {
        let kek = test_kek();
        let mut wrapped = wrap_private_key(&kek, &small_key()).expect("wrap");
        wrapped.wrapped_private_key[10] ^= 0x01;

        let result = unwrap_key(&kek, &wrapped.wrapped_private_key, &wrapped.salt);
        assert!(matches!(result, Err(AppError::KeyUnwrap)));
    }

    #[test]
    fn salt_mismatch_fails_to_unwrap() {
        let kek = test_kek();
        let wrapped = wrap_private_key(&kek, &small_key()).expect("wrap");

        let result = unwrap_key(&kek, &wrapped.wrapped_private_key, &[0u8; SALT_LEN]);
        assert!(matches!(result, Err(AppError::KeyUnwrap)));
    }

    #[test]
    fn each_wrap_uses_a_fresh_salt() {
        let kek = test_kek();
        let key = small_key();
        let first = wrap_private_key(&kek, &key).expect("wrap");
        let second = wrap_private_key(&kek, &key).expect("wrap");

        assert_eq!(first.salt.len(), SALT_LEN);
        assert_ne!(first.salt, second.salt);
        assert_ne!(first.wrapped_private_key, second.wrapped_private_key);
        assert_eq!(first.public_key_pem, second.public_key_pem);
    }

    #[test]
    fn undersized_keys_are_refused() {
        let result = generate_key_with_bits(&test_kek(), 1024);
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn generated_key_is_2048_bit_with_standard_exponent() {
        use rsa::traits::PublicKeyParts;

        let kek = test_kek();
        let generated = generate_key(&kek).expect("generate");
        let private_key =
            unwrap_key(&kek, &generated.wrapped_private_key, &generated.salt).expect("unwrap");

        assert_eq!(private_key.size() * 8, 2048);
        assert_eq!(private_key.e(), &rsa::BigUint::from(65_537u32));
        assert!(generated.public_key_pem.starts_with("-----BEGIN PUBLIC KEY-----"));
    }

    #[test]
    fn debug_output_does_not_leak_secret() {
        let rendered = format!("{:?}", test_kek());
        assert!(!rendered.contains("test-secret"));
    }
}
