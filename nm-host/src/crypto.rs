//! # Crypto 模块
//!
//! 资源包与存档共用的密码学原语。
//!
//! - AES-256-GCM：分离标签（detached tag）的原地加解密
//! - Ed25519：PEM 密钥读写、分离签名与验证
//! - 系统随机数（IV / 密钥生成）

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{AeadInPlace, OsRng};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce, Tag};
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use nm_runtime::ErrorKind;
use thiserror::Error;

/// AES-256 密钥长度
pub const AES_KEY_LEN: usize = 32;
/// GCM 认证标签长度
pub const TAG_LEN: usize = 16;
/// GCM nonce 长度
pub const NONCE_LEN: usize = 12;
/// Ed25519 签名长度
pub const SIGNATURE_LEN: usize = 64;

/// 密码学错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("密钥长度无效: {actual} 字节（需要 {expected} 字节）")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("十六进制密钥无效: {0}")]
    InvalidHex(String),

    #[error("认证标签不匹配")]
    AuthenticationFailed,

    #[error("PEM 密钥无效: {0}")]
    InvalidPem(String),

    #[error("签名无效")]
    InvalidSignature,
}

impl CryptoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidKeyLength { .. } | Self::InvalidHex(_) | Self::InvalidPem(_) => {
                ErrorKind::KeyMissing
            }
            Self::AuthenticationFailed => ErrorKind::IntegrityFailure,
            Self::InvalidSignature => ErrorKind::SignatureInvalid,
        }
    }
}

/// AES-256 密钥
#[derive(Clone, PartialEq, Eq)]
pub struct AesKey([u8; AES_KEY_LEN]);

impl AesKey {
    pub fn new(bytes: [u8; AES_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// 从任意字节切片构造，长度必须恰好 32
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; AES_KEY_LEN] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: AES_KEY_LEN,
                    actual: bytes.len(),
                })?;
        Ok(Self(array))
    }

    /// 从十六进制字符串构造（允许首尾空白）
    pub fn from_hex(text: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(text.trim()).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// 随机生成
    pub fn generate() -> Self {
        Self(random_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; AES_KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl std::fmt::Debug for AesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AesKey(<redacted>)")
    }
}

/// 原地加密，返回认证标签
pub fn seal_in_place(
    key: &AesKey,
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    buffer: &mut [u8],
) -> Result<[u8; TAG_LEN], CryptoError> {
    let tag = key
        .cipher()
        .encrypt_in_place_detached(Nonce::from_slice(nonce), aad, buffer)
        .map_err(|_| CryptoError::AuthenticationFailed)?;
    let mut out = [0u8; TAG_LEN];
    out.copy_from_slice(tag.as_slice());
    Ok(out)
}

/// 原地解密并验证标签
///
/// 失败时缓冲区内容未定义，调用方应丢弃。
pub fn open_in_place(
    key: &AesKey,
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    buffer: &mut [u8],
    tag: &[u8; TAG_LEN],
) -> Result<(), CryptoError> {
    key.cipher()
        .decrypt_in_place_detached(Nonce::from_slice(nonce), aad, buffer, Tag::from_slice(tag))
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// 系统随机字节
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

// =============================================================================
// Ed25519
// =============================================================================

pub fn public_key_from_pem(pem: &str) -> Result<VerifyingKey, CryptoError> {
    VerifyingKey::from_public_key_pem(pem).map_err(|e| CryptoError::InvalidPem(e.to_string()))
}

pub fn signing_key_from_pem(pem: &str) -> Result<SigningKey, CryptoError> {
    SigningKey::from_pkcs8_pem(pem).map_err(|e| CryptoError::InvalidPem(e.to_string()))
}

pub fn public_key_to_pem(key: &VerifyingKey) -> Result<String, CryptoError> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| CryptoError::InvalidPem(e.to_string()))
}

pub fn signing_key_to_pem(key: &SigningKey) -> Result<String, CryptoError> {
    key.to_pkcs8_pem(LineEnding::LF)
        .map(|pem| pem.as_str().to_string())
        .map_err(|e| CryptoError::InvalidPem(e.to_string()))
}

/// 随机生成签名密钥
pub fn generate_signing_key() -> SigningKey {
    SigningKey::from_bytes(&random_bytes())
}

pub fn sign(key: &SigningKey, message: &[u8]) -> [u8; SIGNATURE_LEN] {
    key.sign(message).to_bytes()
}

/// 严格验证分离签名
pub fn verify(key: &VerifyingKey, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let signature = Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
    key.verify_strict(message, &signature)
        .map_err(|_| CryptoError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip_and_tamper() {
        let key = AesKey::new([3u8; 32]);
        let nonce = [9u8; NONCE_LEN];
        let mut data = b"hello pack".to_vec();
        let tag = seal_in_place(&key, &nonce, b"id", &mut data).unwrap();
        assert_ne!(data, b"hello pack");

        let mut good = data.clone();
        open_in_place(&key, &nonce, b"id", &mut good, &tag).unwrap();
        assert_eq!(good, b"hello pack");

        let mut wrong_aad = data.clone();
        assert_eq!(
            open_in_place(&key, &nonce, b"other", &mut wrong_aad, &tag),
            Err(CryptoError::AuthenticationFailed)
        );

        let mut flipped = data;
        flipped[0] ^= 1;
        assert!(open_in_place(&key, &nonce, b"id", &mut flipped, &tag).is_err());
    }

    #[test]
    fn test_key_parsing() {
        let key = AesKey::from_hex(&format!(" {} \n", "ab".repeat(32))).unwrap();
        assert_eq!(key.as_bytes()[0], 0xAB);
        assert_eq!(
            AesKey::from_slice(&[0u8; 16]),
            Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 16
            })
        );
        assert!(matches!(AesKey::from_hex("zz"), Err(CryptoError::InvalidHex(_))));
        assert_eq!(format!("{:?}", key), "AesKey(<redacted>)");
    }

    #[test]
    fn test_signature_pem_roundtrip() {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let pem = public_key_to_pem(&signing.verifying_key()).unwrap();
        let public = public_key_from_pem(&pem).unwrap();

        let sig = sign(&signing, b"tables");
        verify(&public, b"tables", &sig).unwrap();
        assert_eq!(
            verify(&public, b"tampered", &sig),
            Err(CryptoError::InvalidSignature)
        );
        assert_eq!(verify(&public, b"tables", &sig[..10]), Err(CryptoError::InvalidSignature));

        let private_pem = signing_key_to_pem(&signing).unwrap();
        assert_eq!(signing_key_from_pem(&private_pem).unwrap().to_bytes(), [7u8; 32]);
    }
}
