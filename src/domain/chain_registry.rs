//! 链注册表模块
//!
//! 定义所有受管链及其依赖、探活方式与文件系统布局

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// 链层级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainType {
    /// Layer-1 基础结算层（及其伴生进程）
    L1,
    /// Layer-2 侧链
    L2,
}

/// 就绪探测方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// 暴露区块高度端点的链：进程存活且高度端点有响应
    Height,
    /// 守护进程型链：通过结算服务客户端做连通性探活
    Settlement,
    /// 无端点的链：进程存活即视为就绪
    Process,
}

/// 链定义（启动时加载，不可变）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainDefinition {
    /// 唯一标识
    pub id: String,
    /// 展示名称
    pub display_name: String,
    /// 链层级
    pub chain_type: ChainType,
    /// 就绪探测方式
    pub probe: ProbeKind,
    /// 启动前必须处于 running/ready 的链 id（有序）
    pub dependencies: Vec<String>,
    /// 源码仓库地址
    pub repo_url: String,
    /// 解包后预期的二进制文件名
    pub binary_name: String,
    /// 启动参数
    pub base_args: Vec<String>,
    /// 发布归档名前缀，平台三元组拼接其后
    pub archive_base: String,
    /// 侧链钱包派生槽位（无钱包的链为 None）
    pub sidechain_slot: Option<u32>,
    /// 文件系统目录名
    pub dir_name: String,
}

impl ChainDefinition {
    /// 当前平台的发布归档文件名
    pub fn archive_name(&self) -> String {
        format!("{}-{}.tar.gz", self.archive_base, platform_triple())
    }

    /// 发布归档完整下载地址
    pub fn download_url(&self, release_base: &str) -> String {
        format!(
            "{}/{}",
            release_base.trim_end_matches('/'),
            self.archive_name()
        )
    }

    /// 链数据目录
    pub fn data_dir(&self, base: &Path) -> PathBuf {
        base.join("data").join(&self.dir_name)
    }

    /// 链二进制目录
    pub fn binary_dir(&self, base: &Path) -> PathBuf {
        base.join("binaries").join(&self.dir_name)
    }

    /// 解包后二进制完整路径
    pub fn binary_path(&self, base: &Path) -> PathBuf {
        self.binary_dir(base).join(&self.binary_name)
    }

    pub fn has_height_probe(&self) -> bool {
        self.probe == ProbeKind::Height
    }

    /// 探活通过后的终态运行状态
    pub fn ready_status(&self) -> crate::domain::lifecycle::ChainStatus {
        match self.probe {
            ProbeKind::Settlement => crate::domain::lifecycle::ChainStatus::Ready,
            _ => crate::domain::lifecycle::ChainStatus::Running,
        }
    }
}

/// 发布归档使用的平台三元组
fn platform_triple() -> &'static str {
    match (std::env::consts::OS, std::env::consts::ARCH) {
        ("linux", _) => "x86_64-unknown-linux-gnu",
        ("macos", "aarch64") => "aarch64-apple-darwin",
        ("macos", _) => "x86_64-apple-darwin",
        ("windows", _) => "x86_64-pc-windows-msvc",
        _ => "x86_64-unknown-linux-gnu",
    }
}

/// 链注册表
///
/// 依赖关系必须构成 DAG，`validate` 失败属于致命配置错误，进程拒绝启动。
pub struct ChainRegistry {
    chains: HashMap<String, ChainDefinition>,
    order: Vec<String>,
}

impl ChainRegistry {
    /// 创建预配置的注册表
    pub fn new() -> Self {
        let mut registry = Self {
            chains: HashMap::new(),
            order: Vec::new(),
        };

        registry.register_default_chains();
        registry
    }

    /// 创建空注册表（测试用）
    pub fn empty() -> Self {
        Self {
            chains: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// 注册默认受管链
    fn register_default_chains(&mut self) {
        // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
        // Layer 1 及伴生进程
        // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

        self.register(ChainDefinition {
            id: "bitcoin".to_string(),
            display_name: "Bitcoin Core (Patched)".to_string(),
            chain_type: ChainType::L1,
            probe: ProbeKind::Height,
            dependencies: vec![],
            repo_url: "https://github.com/LayerTwo-Labs/bitcoin-patched".to_string(),
            binary_name: "bitcoind".to_string(),
            base_args: vec!["-signet".to_string()],
            archive_base: "L1-bitcoin-patched-latest".to_string(),
            sidechain_slot: None,
            dir_name: "bitcoin".to_string(),
        });

        self.register(ChainDefinition {
            id: "enforcer".to_string(),
            display_name: "BIP300/301 Enforcer".to_string(),
            chain_type: ChainType::L1,
            probe: ProbeKind::Process,
            dependencies: vec!["bitcoin".to_string()],
            repo_url: "https://github.com/LayerTwo-Labs/bip300301_enforcer".to_string(),
            binary_name: "bip300301-enforcer".to_string(),
            base_args: vec![],
            archive_base: "bip300301-enforcer-latest".to_string(),
            sidechain_slot: None,
            dir_name: "enforcer".to_string(),
        });

        self.register(ChainDefinition {
            id: "bitwindow".to_string(),
            display_name: "BitWindow".to_string(),
            chain_type: ChainType::L1,
            probe: ProbeKind::Settlement,
            dependencies: vec!["bitcoin".to_string(), "enforcer".to_string()],
            repo_url: "https://github.com/LayerTwo-Labs/bitwindow".to_string(),
            binary_name: "bitwindowd".to_string(),
            base_args: vec![],
            archive_base: "BitWindow-latest".to_string(),
            sidechain_slot: None,
            dir_name: "bitwindow".to_string(),
        });

        // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
        // Layer 2 侧链
        // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

        self.register(ChainDefinition {
            id: "thunder".to_string(),
            display_name: "Thunder".to_string(),
            chain_type: ChainType::L2,
            probe: ProbeKind::Process,
            dependencies: vec!["enforcer".to_string()],
            repo_url: "https://github.com/LayerTwo-Labs/thunder-rust".to_string(),
            binary_name: "thunder".to_string(),
            base_args: vec![],
            archive_base: "thunder-latest".to_string(),
            sidechain_slot: Some(9),
            dir_name: "thunder".to_string(),
        });

        self.register(ChainDefinition {
            id: "bitnames".to_string(),
            display_name: "BitNames".to_string(),
            chain_type: ChainType::L2,
            probe: ProbeKind::Process,
            dependencies: vec!["enforcer".to_string()],
            repo_url: "https://github.com/LayerTwo-Labs/plain-bitnames".to_string(),
            binary_name: "bitnames".to_string(),
            base_args: vec![],
            archive_base: "bitnames-latest".to_string(),
            sidechain_slot: Some(2),
            dir_name: "bitnames".to_string(),
        });

        self.register(ChainDefinition {
            id: "zside".to_string(),
            display_name: "ZSide".to_string(),
            chain_type: ChainType::L2,
            probe: ProbeKind::Process,
            dependencies: vec!["enforcer".to_string()],
            repo_url: "https://github.com/LayerTwo-Labs/zside".to_string(),
            binary_name: "zside".to_string(),
            base_args: vec![],
            archive_base: "zside-latest".to_string(),
            sidechain_slot: Some(8),
            dir_name: "zside".to_string(),
        });
    }

    /// 注册链定义
    pub fn register(&mut self, def: ChainDefinition) {
        if !self.chains.contains_key(&def.id) {
            self.order.push(def.id.clone());
        }
        self.chains.insert(def.id.clone(), def);
    }

    /// 通过 id 获取链定义
    pub fn get(&self, id: &str) -> Option<&ChainDefinition> {
        self.chains.get(id)
    }

    /// 列出所有链（注册顺序）
    pub fn list_all(&self) -> Vec<&ChainDefinition> {
        self.order
            .iter()
            .filter_map(|id| self.chains.get(id))
            .collect()
    }

    /// 所有链 id（注册顺序）
    pub fn ids(&self) -> Vec<String> {
        self.order.clone()
    }

    /// 验证注册表完整性
    ///
    /// 依赖指向未知链或依赖关系成环均为致命配置错误。
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for def in self.list_all() {
            if def.display_name.is_empty() {
                errors.push(format!("Chain '{}' has empty display_name", def.id));
            }
            if def.binary_name.is_empty() {
                errors.push(format!("Chain '{}' has empty binary_name", def.id));
            }
            for dep in &def.dependencies {
                if dep == &def.id {
                    errors.push(format!("Chain '{}' depends on itself", def.id));
                } else if !self.chains.contains_key(dep) {
                    errors.push(format!(
                        "Chain '{}' references unknown dependency '{}'",
                        def.id, dep
                    ));
                }
            }
            if def.chain_type == ChainType::L2 && def.sidechain_slot.is_none() {
                errors.push(format!("L2 chain '{}' has no sidechain_slot", def.id));
            }
        }

        if let Some(cycle_member) = self.find_cycle_member() {
            errors.push(format!(
                "Dependency cycle detected involving chain '{}'",
                cycle_member
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// DFS 三色标记找环，返回任一环内节点
    fn find_cycle_member(&self) -> Option<String> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Gray,
            Black,
        }

        fn visit(
            id: &str,
            chains: &HashMap<String, ChainDefinition>,
            marks: &mut HashMap<String, Mark>,
        ) -> Option<String> {
            match marks.get(id).copied().unwrap_or(Mark::White) {
                Mark::Gray => return Some(id.to_string()),
                Mark::Black => return None,
                Mark::White => {}
            }
            marks.insert(id.to_string(), Mark::Gray);
            if let Some(def) = chains.get(id) {
                for dep in &def.dependencies {
                    if chains.contains_key(dep) {
                        if let Some(hit) = visit(dep, chains, marks) {
                            return Some(hit);
                        }
                    }
                }
            }
            marks.insert(id.to_string(), Mark::Black);
            None
        }

        let mut marks = HashMap::new();
        for id in &self.order {
            if let Some(hit) = visit(id, &self.chains, &mut marks) {
                return Some(hit);
            }
        }
        None
    }

    /// 拓扑排序（依赖在前），用于反序关停
    pub fn topo_order(&self) -> Vec<String> {
        let mut indegree: HashMap<&str, usize> = self
            .order
            .iter()
            .map(|id| (id.as_str(), 0usize))
            .collect();
        for def in self.list_all() {
            for dep in &def.dependencies {
                if self.chains.contains_key(dep) {
                    *indegree.entry(def.id.as_str()).or_insert(0) += 1;
                }
            }
        }

        let mut queue: Vec<&str> = self
            .order
            .iter()
            .map(String::as_str)
            .filter(|id| indegree.get(id).copied().unwrap_or(0) == 0)
            .collect();
        let mut sorted = Vec::new();

        while let Some(id) = queue.first().copied() {
            queue.remove(0);
            sorted.push(id.to_string());
            for def in self.list_all() {
                if def.dependencies.iter().any(|d| d == id) {
                    let entry = indegree.entry(def.id.as_str()).or_insert(0);
                    *entry = entry.saturating_sub(1);
                    if *entry == 0 {
                        queue.push(def.id.as_str());
                    }
                }
            }
        }

        sorted
    }
}

impl Default for ChainRegistry {
    fn default() -> Self {
        Self::new()
    }
}
