//! 资源包密钥来源
//!
//! 优先级：显式设置 > 配置文件 > 环境变量。
//!
//! | 环境变量 | 含义 |
//! |---|---|
//! | `NOVELMIND_PACK_AES_KEY_HEX` | 十六进制 32 字节 AES 密钥 |
//! | `NOVELMIND_PACK_AES_KEY_FILE` | 二进制密钥文件路径 |
//! | `NOVELMIND_PACK_PUBLIC_KEY` | PEM 公钥文件路径 |

use std::path::Path;

use ed25519_dalek::VerifyingKey;
use tracing::debug;

use super::VfsError;
use crate::config::VfsConfig;
use crate::crypto::{self, AesKey};

pub const ENV_AES_KEY_HEX: &str = "NOVELMIND_PACK_AES_KEY_HEX";
pub const ENV_AES_KEY_FILE: &str = "NOVELMIND_PACK_AES_KEY_FILE";
pub const ENV_PUBLIC_KEY: &str = "NOVELMIND_PACK_PUBLIC_KEY";

/// 解析后的密钥
#[derive(Debug, Clone, Default)]
pub struct PackKeys {
    pub aes_key: Option<AesKey>,
    pub public_key: Option<VerifyingKey>,
}

impl PackKeys {
    /// 从配置与进程环境解析
    pub fn resolve(config: &VfsConfig) -> Result<Self, VfsError> {
        Self::resolve_with(config, |name| std::env::var(name).ok())
    }

    /// 从配置与给定的环境查询函数解析
    pub fn resolve_with<F>(config: &VfsConfig, env: F) -> Result<Self, VfsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let aes_key = if let Some(hex) = &config.aes_key_hex {
            Some(parse_hex_key(hex, "配置 aes_key_hex")?)
        } else if let Some(path) = &config.aes_key_file {
            Some(read_key_file(path)?)
        } else if let Some(hex) = env(ENV_AES_KEY_HEX).filter(|s| !s.trim().is_empty()) {
            debug!("使用环境变量 {} 中的资源包密钥", ENV_AES_KEY_HEX);
            Some(parse_hex_key(&hex, ENV_AES_KEY_HEX)?)
        } else if let Some(path) = env(ENV_AES_KEY_FILE).filter(|s| !s.trim().is_empty()) {
            Some(read_key_file(Path::new(&path))?)
        } else {
            None
        };

        let public_key = match &config.public_key_path {
            Some(path) => Some(read_public_key(path)?),
            None => match env(ENV_PUBLIC_KEY).filter(|s| !s.trim().is_empty()) {
                Some(path) => Some(read_public_key(Path::new(&path))?),
                None => None,
            },
        };

        Ok(Self {
            aes_key,
            public_key,
        })
    }
}

fn parse_hex_key(hex: &str, source: &str) -> Result<AesKey, VfsError> {
    AesKey::from_hex(hex).map_err(|e| VfsError::KeyMissing(format!("{}: {}", source, e)))
}

fn read_key_file(path: &Path) -> Result<AesKey, VfsError> {
    let bytes = std::fs::read(path).map_err(|e| VfsError::io(path, e))?;
    AesKey::from_slice(&bytes)
        .map_err(|e| VfsError::KeyMissing(format!("{}: {}", path.display(), e)))
}

/// 读取 PEM 公钥文件
pub fn read_public_key(path: &Path) -> Result<VerifyingKey, VfsError> {
    let pem = std::fs::read_to_string(path).map_err(|e| VfsError::io(path, e))?;
    crypto::public_key_from_pem(&pem)
        .map_err(|e| VfsError::KeyMissing(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, String)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_config_takes_precedence_over_env() {
        let config = VfsConfig {
            aes_key_hex: Some("11".repeat(32)),
            ..VfsConfig::default()
        };
        let env = env_of(&[(ENV_AES_KEY_HEX, "22".repeat(32))]);
        let keys = PackKeys::resolve_with(&config, env).unwrap();
        assert_eq!(keys.aes_key.unwrap().as_bytes()[0], 0x11);
    }

    #[test]
    fn test_env_sources() {
        let dir = tempfile::tempdir().unwrap();
        let key_file = dir.path().join("pack.key");
        std::fs::write(&key_file, [0x33u8; 32]).unwrap();

        let signing = ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]);
        let pem_path = dir.path().join("pub.pem");
        std::fs::write(&pem_path, crypto::public_key_to_pem(&signing.verifying_key()).unwrap())
            .unwrap();

        let env = env_of(&[
            (ENV_AES_KEY_FILE, key_file.display().to_string()),
            (ENV_PUBLIC_KEY, pem_path.display().to_string()),
        ]);
        let keys = PackKeys::resolve_with(&VfsConfig::default(), env).unwrap();
        assert_eq!(keys.aes_key.unwrap().as_bytes(), &[0x33u8; 32]);
        assert_eq!(keys.public_key.unwrap(), signing.verifying_key());
    }

    #[test]
    fn test_bad_key_is_reported() {
        let env = env_of(&[(ENV_AES_KEY_HEX, "abcd".to_string())]);
        assert!(matches!(
            PackKeys::resolve_with(&VfsConfig::default(), env),
            Err(VfsError::KeyMissing(_))
        ));
        let none = PackKeys::resolve_with(&VfsConfig::default(), |_| None).unwrap();
        assert!(none.aes_key.is_none() && none.public_key.is_none());
    }
}
