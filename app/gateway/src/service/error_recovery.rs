//! 错误恢复状态机
//!
//! 固定的分派表把钱包类哨兵错误映射到恢复流程。恢复在进程内单飞：
//! 同一流程运行期间，并发触发者直接得到“正在运行”信号。

use crate::domain::error::{NodeError, NodeErrorKind};
use crate::domain::native_types::WalletDir;
use crate::infrastructure::node_client::NodeTransport;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// 钱包创建后在此窗口内不再重复创建
pub const CREATE_WALLET_WINDOW: Duration = Duration::from_secs(60);
/// 加载失败的钱包序号保留时长
pub const LOAD_INDEX_EXPIRY: Duration = Duration::from_secs(30);
/// 钱包目录为空时创建的默认钱包名
pub const DEFAULT_WALLET_NAME: &str = "wallet";

/// 恢复流程
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryProcedure {
    ReloadWallet,
}

/// 恢复结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// 执行了修复动作
    Recovered,
    /// 已恰好加载一个钱包，无需修复
    Healthy,
}

/// 恢复失败
#[derive(Debug, Clone, Error)]
pub enum RecoveryError {
    #[error("错误恢复流程已在运行")]
    AlreadyRunning,
    #[error("最近已创建过钱包，放弃重复创建")]
    RecentlyCreated,
    #[error("钱包恢复失败: {0}")]
    Failed(String),
    #[error("钱包恢复时节点调用失败: {0}")]
    Node(#[from] NodeError),
}

#[derive(Debug, Default)]
struct RecoveryState {
    created_wallet_at: Option<Instant>,
    /// 上次加载失败的钱包序号及记录时间
    failed_load: Option<(usize, Instant)>,
}

/// 错误恢复状态机
pub struct ErrorRecovery {
    transport: Arc<dyn NodeTransport>,
    table: HashMap<NodeErrorKind, RecoveryProcedure>,
    running: Mutex<HashSet<RecoveryProcedure>>,
    state: RwLock<RecoveryState>,
}

/// 运行标记守卫，离开作用域（包括 future 被丢弃）时清除标记
struct RunningGuard<'a> {
    running: &'a Mutex<HashSet<RecoveryProcedure>>,
    procedure: RecoveryProcedure,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(&self.procedure);
        }
    }
}

impl ErrorRecovery {
    pub fn new(transport: Arc<dyn NodeTransport>) -> Self {
        let mut table = HashMap::new();
        table.insert(NodeErrorKind::WalletNotFound, RecoveryProcedure::ReloadWallet);
        table.insert(NodeErrorKind::WalletNotSpecified, RecoveryProcedure::ReloadWallet);
        Self {
            transport,
            table,
            running: Mutex::new(HashSet::new()),
            state: RwLock::new(RecoveryState::default()),
        }
    }

    /// 错误对应的恢复流程
    pub fn procedure_for(&self, error: &NodeError) -> Option<RecoveryProcedure> {
        error.kind().and_then(|kind| self.table.get(&kind).copied())
    }

    /// 针对错误执行恢复
    pub async fn recover(&self, error: &NodeError) -> Result<RecoveryOutcome, RecoveryError> {
        let procedure = self
            .procedure_for(error)
            .ok_or_else(|| RecoveryError::Failed(format!("没有可用的恢复流程: {}", error)))?;

        let _guard = self.try_start(procedure)?;
        match procedure {
            RecoveryProcedure::ReloadWallet => self.reload_wallet().await,
        }
    }

    fn try_start(&self, procedure: RecoveryProcedure) -> Result<RunningGuard<'_>, RecoveryError> {
        let mut running = self
            .running
            .lock()
            .map_err(|_| RecoveryError::Failed("运行标记锁已损坏".to_string()))?;
        if !running.insert(procedure) {
            info!(?procedure, "错误恢复流程已在运行");
            return Err(RecoveryError::AlreadyRunning);
        }
        Ok(RunningGuard {
            running: &self.running,
            procedure,
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, RecoveryError> {
        Ok(self.transport.request(method, params).await?)
    }

    async fn list_wallets(&self) -> Result<Vec<String>, RecoveryError> {
        let value = self.call("listwallets", json!([])).await?;
        serde_json::from_value(value)
            .map_err(|e| RecoveryError::Node(NodeError::Decode(e.to_string())))
    }

    async fn reload_wallet(&self) -> Result<RecoveryOutcome, RecoveryError> {
        {
            let state = self.state.read().await;
            if let Some(at) = state.created_wallet_at {
                if at.elapsed() < CREATE_WALLET_WINDOW {
                    warn!("最近已创建钱包，跳过恢复");
                    return Err(RecoveryError::RecentlyCreated);
                }
            }
        }

        let wallets = self.list_wallets().await?;
        match wallets.len() {
            1 => {
                info!("节点已恰好加载一个钱包，可能已被其他实例修复");
                Ok(RecoveryOutcome::Healthy)
            }
            0 => {
                self.load_wallets().await?;
                Ok(RecoveryOutcome::Recovered)
            }
            _ => {
                for wallet in &wallets {
                    if let Err(e) = self.call("unloadwallet", json!([wallet])).await {
                        warn!(wallet = %wallet, error = %e, "卸载钱包失败");
                    }
                }
                let remaining = self.list_wallets().await?;
                match remaining.len() {
                    1 => {
                        info!("卸载后仍有一个钱包处于加载状态，视为已修复");
                        Ok(RecoveryOutcome::Healthy)
                    }
                    0 => {
                        self.load_wallets().await?;
                        Ok(RecoveryOutcome::Recovered)
                    }
                    n => Err(RecoveryError::Failed(format!("无法卸载全部钱包，仍有 {} 个", n))),
                }
            }
        }
    }

    /// 从钱包目录加载钱包；目录为空时创建默认钱包
    async fn load_wallets(&self) -> Result<(), RecoveryError> {
        let value = self.call("listwalletdir", json!([])).await?;
        let dir: WalletDir = serde_json::from_value(value)
            .map_err(|e| RecoveryError::Node(NodeError::Decode(e.to_string())))?;

        if dir.wallets.is_empty() {
            self.call("createwallet", json!([DEFAULT_WALLET_NAME])).await?;
            self.state.write().await.created_wallet_at = Some(Instant::now());
            info!(wallet = DEFAULT_WALLET_NAME, "已创建默认钱包");
            return Ok(());
        }

        // 每次只尝试一个候选钱包，失败后记录序号，下次从其后继续
        let index = {
            let state = self.state.read().await;
            match state.failed_load {
                Some((failed, at)) if at.elapsed() < LOAD_INDEX_EXPIRY && failed + 1 < dir.wallets.len() => {
                    failed + 1
                }
                _ => 0,
            }
        };
        let wallet = &dir.wallets[index];
        info!(index, available = dir.wallets.len(), wallet = %wallet.name, "尝试加载钱包");

        match self.call("loadwallet", json!([wallet.name])).await {
            Ok(_) => {
                info!(wallet = %wallet.name, "钱包加载成功");
                self.state.write().await.failed_load = None;
                Ok(())
            }
            Err(e) => {
                warn!(wallet = %wallet.name, index, error = %e, "钱包加载失败");
                self.state.write().await.failed_load = Some((index, Instant::now()));
                Err(RecoveryError::Failed(format!("加载钱包 {} 失败: {}", wallet.name, e)))
            }
        }
    }
}
