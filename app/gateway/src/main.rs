use clap::Parser;
use gateway::config::{Cli, GatewayConfig};
use gateway::inbound::jsonrpc::EthJsonRpcHandler;
use gateway::inbound::server::run_server;
use gateway::infrastructure::node_client::NodeRpcClient;
use gateway::infrastructure::response_cache::ResponseCache;
use gateway::service::cancel::CancelToken;
use gateway::service::chain_detector::ChainDetector;
use gateway::service::node_api::NodeApi;
use gateway::service::subscription::{PollingPolicy, SubscriptionEngine};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志追踪
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GatewayConfig::try_from(Cli::parse())?;
    let shutdown = CancelToken::new();

    // 基础设施层 - 节点传输与响应缓存
    let transport = Arc::new(NodeRpcClient::new(&config.node_url)?);
    info!(node = %transport.url(), "连接上游节点");
    let node = NodeApi::new(transport, ResponseCache::new(config.cache_ttl), shutdown.clone());

    // 服务层 - 网络探测与订阅
    let chain = match config.network {
        Some(chain) => ChainDetector::pinned(chain, shutdown.clone()),
        None => ChainDetector::spawn(node.clone(), shutdown.clone()),
    };
    let policy = PollingPolicy {
        dedup_capacity: config.dedup_window,
        ..PollingPolicy::default()
    };
    let subscriptions = Arc::new(SubscriptionEngine::new(node.clone(), Arc::clone(&chain), policy));

    // 用例层 - RPC 处理器
    let rpc_handler = Arc::new(EthJsonRpcHandler::new(node, chain, subscriptions, config.min_gas_price));

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("收到退出信号");
            signal.cancel();
        }
    });

    // 接口层 - 运行 HTTP 服务器
    run_server(config.listen, rpc_handler, config.single_threaded, shutdown).await?;

    Ok(())
}
