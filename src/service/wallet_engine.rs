//! 钱包派生引擎
//!
//! 一个安装实例只有一个主种子；每条带钱包的链按固定派生索引
//! 确定性派生出子启动器（starter）。派生是针对主种子的只读操作，
//! 不同链并发派生安全。子钱包只缓存不落盘，随时可重新派生；
//! 删除主钱包即作废全部子钱包。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bip39::{Language, Mnemonic};
use chrono::{DateTime, Utc};
use coins_bip32::path::DerivationPath;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use tokio::sync::RwLock;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::domain::chain_registry::{ChainDefinition, ChainRegistry, ChainType};
use crate::error::AppError;
use crate::infrastructure::event_bus::{EventBus, OrchestratorEvent};

/// 主种子材料，销毁时清零
#[derive(Zeroize, ZeroizeOnDrop)]
struct SecretSeed(Vec<u8>);

struct MasterWallet {
    mnemonic: String,
    passphrase: String,
    seed: SecretSeed,
    created_at: DateTime<Utc>,
}

/// 落盘格式（钱包目录下 master.json）
#[derive(Serialize, Deserialize)]
struct PersistedMaster {
    mnemonic: String,
    passphrase: String,
    created_at: DateTime<Utc>,
}

/// 主钱包公开信息，不含种子材料
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct MasterWalletInfo {
    pub fingerprint: String,
    pub word_count: usize,
    pub created_at: DateTime<Utc>,
}

/// 链钱包公开信息
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct ChainWalletInfo {
    pub chain_id: String,
    pub derivation_path: String,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
struct ChainWallet {
    info: ChainWalletInfo,
    mnemonic: String,
}

/// 预览结果：未持久化任何内容
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct WalletPreview {
    pub mnemonic: String,
    pub fingerprint: String,
    pub word_count: usize,
}

/// 高级创建/预览参数
#[derive(Debug, Clone, Default, Deserialize, utoipa::ToSchema)]
pub struct AdvancedWalletOptions {
    /// 熵（hex 编码，16 或 32 字节）
    pub entropy: Option<String>,
    /// 直接给定助记词（与 entropy 二选一）
    pub mnemonic: Option<String>,
    pub passphrase: Option<String>,
}

/// 单次揭示一个助记词；互斥展示由消费方契约保证
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct StarterReveal {
    pub starter_type: String,
    pub mnemonic: String,
}

pub struct WalletEngine {
    wallet_dir: PathBuf,
    registry: Arc<ChainRegistry>,
    events: Arc<EventBus>,
    master: RwLock<Option<MasterWallet>>,
    derived: RwLock<HashMap<String, ChainWallet>>,
}

impl WalletEngine {
    pub fn new(wallet_dir: PathBuf, registry: Arc<ChainRegistry>, events: Arc<EventBus>) -> Self {
        Self {
            wallet_dir,
            registry,
            events,
            master: RwLock::new(None),
            derived: RwLock::new(HashMap::new()),
        }
    }

    fn master_path(&self) -> PathBuf {
        self.wallet_dir.join("master.json")
    }

    /// 启动时恢复已持久化的主钱包
    pub async fn load_persisted(&self) -> Result<bool> {
        let path = self.master_path();
        if !path.exists() {
            return Ok(false);
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {:?}", path))?;
        let persisted: PersistedMaster =
            serde_json::from_str(&content).context("Corrupt master wallet file")?;

        let mnemonic = Mnemonic::parse_in(Language::English, &persisted.mnemonic)
            .context("Persisted master mnemonic is invalid")?;
        let seed = mnemonic.to_seed(&persisted.passphrase);

        let mut guard = self.master.write().await;
        *guard = Some(MasterWallet {
            mnemonic: persisted.mnemonic,
            passphrase: persisted.passphrase,
            seed: SecretSeed(seed.to_vec()),
            created_at: persisted.created_at,
        });

        tracing::info!("Master wallet restored from disk");
        Ok(true)
    }

    /// 创建主钱包
    ///
    /// 已存在时拒绝，必须先显式删除。
    pub async fn create_master(&self, word_count: Option<u8>) -> Result<MasterWalletInfo, AppError> {
        let entropy_len = match word_count.unwrap_or(12) {
            12 => 16,
            24 => 32,
            other => {
                return Err(AppError::bad_request(format!(
                    "word_count must be 12 or 24, got {}",
                    other
                )))
            }
        };

        let mut entropy = vec![0u8; entropy_len];
        rand::thread_rng().fill_bytes(&mut entropy);
        let mnemonic = Mnemonic::from_entropy_in(Language::English, &entropy)
            .map_err(|e| AppError::internal(format!("Entropy rejected: {}", e)))?;

        self.install_master(mnemonic.to_string(), String::new())
            .await
    }

    /// 导入主钱包
    pub async fn import_master(
        &self,
        mnemonic: &str,
        passphrase: &str,
    ) -> Result<MasterWalletInfo, AppError> {
        Mnemonic::parse_in(Language::English, mnemonic)
            .map_err(|e| AppError::invalid_mnemonic(format!("Invalid mnemonic: {}", e)))?;

        self.install_master(mnemonic.to_string(), passphrase.to_string())
            .await
    }

    /// 高级创建：熵/派生参数先选定再提交
    pub async fn create_advanced_wallet(
        &self,
        options: AdvancedWalletOptions,
    ) -> Result<MasterWalletInfo, AppError> {
        let mnemonic = Self::mnemonic_from_options(&options)?;
        let passphrase = options.passphrase.unwrap_or_default();
        self.install_master(mnemonic.to_string(), passphrase).await
    }

    /// 预览：不持久化任何内容
    pub async fn preview_wallet(
        &self,
        options: AdvancedWalletOptions,
    ) -> Result<WalletPreview, AppError> {
        let mnemonic = Self::mnemonic_from_options(&options)?;
        let passphrase = options.passphrase.as_deref().unwrap_or("");
        let seed = mnemonic.to_seed(passphrase);

        Ok(WalletPreview {
            fingerprint: fingerprint(&seed),
            word_count: mnemonic.word_count(),
            mnemonic: mnemonic.to_string(),
        })
    }

    /// 生成 16 字节随机熵（hex）
    pub fn generate_random_entropy() -> String {
        let mut entropy = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut entropy);
        hex::encode(entropy)
    }

    fn mnemonic_from_options(options: &AdvancedWalletOptions) -> Result<Mnemonic, AppError> {
        if let Some(m) = &options.mnemonic {
            return Mnemonic::parse_in(Language::English, m)
                .map_err(|e| AppError::invalid_mnemonic(format!("Invalid mnemonic: {}", e)));
        }
        if let Some(entropy_hex) = &options.entropy {
            let entropy = hex::decode(entropy_hex)
                .map_err(|e| AppError::bad_request(format!("Invalid entropy hex: {}", e)))?;
            if entropy.len() != 16 && entropy.len() != 32 {
                return Err(AppError::bad_request(
                    "Entropy must be 16 or 32 bytes".to_string(),
                ));
            }
            return Mnemonic::from_entropy_in(Language::English, &entropy)
                .map_err(|e| AppError::bad_request(format!("Entropy rejected: {}", e)));
        }

        let mut entropy = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut entropy);
        Mnemonic::from_entropy_in(Language::English, &entropy)
            .map_err(|e| AppError::internal(format!("Entropy rejected: {}", e)))
    }

    async fn install_master(
        &self,
        mnemonic: String,
        passphrase: String,
    ) -> Result<MasterWalletInfo, AppError> {
        let mut guard = self.master.write().await;
        if guard.is_some() {
            return Err(AppError::already_exists(
                "Master wallet already exists; delete it first".to_string(),
            ));
        }

        let parsed = Mnemonic::parse_in(Language::English, &mnemonic)
            .map_err(|e| AppError::invalid_mnemonic(format!("Invalid mnemonic: {}", e)))?;
        let seed = parsed.to_seed(&passphrase);
        let created_at = Utc::now();

        tokio::fs::create_dir_all(&self.wallet_dir)
            .await
            .map_err(|e| AppError::internal(format!("Failed to create wallet dir: {}", e)))?;
        let persisted = PersistedMaster {
            mnemonic: mnemonic.clone(),
            passphrase: passphrase.clone(),
            created_at,
        };
        let json = serde_json::to_vec_pretty(&persisted)?;
        tokio::fs::write(self.master_path(), json)
            .await
            .map_err(|e| AppError::internal(format!("Failed to persist master wallet: {}", e)))?;

        let info = MasterWalletInfo {
            fingerprint: fingerprint(&seed),
            word_count: parsed.word_count(),
            created_at,
        };

        *guard = Some(MasterWallet {
            mnemonic,
            passphrase,
            seed: SecretSeed(seed.to_vec()),
            created_at,
        });
        drop(guard);

        self.events
            .publish(OrchestratorEvent::WalletUpdated {
                wallet_type: "master".to_string(),
            })
            .await;

        tracing::info!("Master wallet installed");
        Ok(info)
    }

    /// 主钱包公开信息
    pub async fn get_master(&self) -> Result<MasterWalletInfo, AppError> {
        let guard = self.master.read().await;
        let master = guard
            .as_ref()
            .ok_or_else(|| AppError::wallet_not_found("No master wallet".to_string()))?;

        Ok(MasterWalletInfo {
            fingerprint: fingerprint(&master.seed.0),
            word_count: master.mnemonic.split_whitespace().count(),
            created_at: master.created_at,
        })
    }

    /// 删除主钱包并作废所有已派生链钱包
    pub async fn delete_master(&self) -> Result<(), AppError> {
        let mut guard = self.master.write().await;
        if guard.is_none() {
            return Err(AppError::wallet_not_found("No master wallet".to_string()));
        }
        *guard = None;
        drop(guard);

        self.derived.write().await.clear();
        tokio::fs::remove_file(self.master_path()).await.ok();

        self.events
            .publish(OrchestratorEvent::WalletUpdated {
                wallet_type: "master".to_string(),
            })
            .await;

        tracing::info!("Master wallet deleted, chain wallets invalidated");
        Ok(())
    }

    /// 链的固定派生索引：L1 主链为 0，侧链用各自槽位
    fn derivation_index(def: &ChainDefinition) -> Option<u32> {
        match def.chain_type {
            ChainType::L1 if def.has_height_probe() => Some(0),
            _ => def.sidechain_slot,
        }
    }

    /// 派生链钱包
    ///
    /// 确定性且幂等：同一链任意次调用得到同一结果。派生路径只由
    /// 链的固定索引决定，与调用顺序和随机状态无关。
    pub async fn derive_chain_wallet(&self, chain_id: &str) -> Result<ChainWalletInfo, AppError> {
        if let Some(existing) = self.derived.read().await.get(chain_id) {
            return Ok(existing.info.clone());
        }

        let def = self
            .registry
            .get(chain_id)
            .ok_or_else(|| AppError::not_found(format!("Unknown chain: {}", chain_id)))?;
        let index = Self::derivation_index(def).ok_or_else(|| {
            AppError::chain_not_supported(format!("Chain '{}' has no wallet", chain_id))
        })?;

        let wallet = {
            let guard = self.master.read().await;
            let master = guard
                .as_ref()
                .ok_or_else(|| AppError::wallet_not_found("No master wallet".to_string()))?;
            derive_starter(&master.seed.0, chain_id, index)?
        };

        let info = wallet.info.clone();
        self.derived
            .write()
            .await
            .insert(chain_id.to_string(), wallet);

        self.events
            .publish(OrchestratorEvent::WalletUpdated {
                wallet_type: chain_id.to_string(),
            })
            .await;

        Ok(info)
    }

    /// 获取已派生的链钱包
    pub async fn get_chain_wallet(&self, chain_id: &str) -> Result<ChainWalletInfo, AppError> {
        self.derived
            .read()
            .await
            .get(chain_id)
            .map(|w| w.info.clone())
            .ok_or_else(|| {
                AppError::wallet_not_found(format!(
                    "Chain wallet '{}' not derived yet",
                    chain_id
                ))
            })
    }

    /// 揭示单个钱包助记词
    ///
    /// 每次调用只返回一个助记词，绝不同时返回多个。
    pub async fn get_wallet_starter(&self, starter_type: &str) -> Result<StarterReveal, AppError> {
        let chain_id = match starter_type {
            "master" => {
                let guard = self.master.read().await;
                let master = guard
                    .as_ref()
                    .ok_or_else(|| AppError::wallet_not_found("No master wallet".to_string()))?;
                return Ok(StarterReveal {
                    starter_type: "master".to_string(),
                    mnemonic: master.mnemonic.clone(),
                });
            }
            "layer1" => "bitcoin",
            "thunder" | "bitnames" | "zside" => starter_type,
            other => {
                return Err(AppError::bad_request(format!(
                    "Unknown starter type: {}",
                    other
                )))
            }
        };

        // 未派生则按需派生（确定性，等价于读取）
        self.derive_chain_wallet(chain_id).await?;
        let derived = self.derived.read().await;
        let wallet = derived.get(chain_id).ok_or_else(|| {
            AppError::wallet_not_found(format!("Chain wallet '{}' not derived", chain_id))
        })?;

        Ok(StarterReveal {
            starter_type: starter_type.to_string(),
            mnemonic: wallet.mnemonic.clone(),
        })
    }
}

/// 种子指纹：SHA256 前 4 字节
fn fingerprint(seed: &[u8]) -> String {
    let digest = Sha256::digest(seed);
    hex::encode(&digest[..4])
}

/// 从主种子按固定索引派生子启动器
///
/// 子助记词的熵取自派生私钥的 HMAC-SHA512，摘要前 16 字节给出
/// 12 词启动器。同一 (seed, index) 恒得到同一助记词。
fn derive_starter(seed: &[u8], chain_id: &str, index: u32) -> Result<ChainWallet, AppError> {
    use coins_bip32::prelude::*;
    use k256::ecdsa::SigningKey;

    let path_str = format!("m/44'/0'/{}'", index);
    let inner = || -> Result<ChainWallet> {
        let derivation_path = path_str
            .parse::<DerivationPath>()
            .context("Invalid derivation path")?;

        let master_key =
            XPriv::root_from_seed(seed, None).context("Failed to derive master key")?;
        let derived_key = master_key
            .derive_path(&derivation_path)
            .context("Failed to derive key")?;

        let signing_key: &SigningKey = derived_key.as_ref();
        let key_bytes = signing_key.to_bytes();

        let mut mac = Hmac::<Sha512>::new_from_slice(b"drivecore-chain-starter")
            .map_err(|e| anyhow::anyhow!("HMAC init failed: {}", e))?;
        mac.update(&key_bytes);
        let digest = mac.finalize().into_bytes();

        let mnemonic = Mnemonic::from_entropy_in(Language::English, &digest[..16])
            .context("Child entropy rejected")?;
        let child_seed = mnemonic.to_seed("");

        Ok(ChainWallet {
            info: ChainWalletInfo {
                chain_id: chain_id.to_string(),
                derivation_path: path_str.clone(),
                fingerprint: fingerprint(&child_seed),
                created_at: Utc::now(),
            },
            mnemonic: mnemonic.to_string(),
        })
    };

    inner().map_err(AppError::from)
}
