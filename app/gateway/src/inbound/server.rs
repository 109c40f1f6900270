//! 以太坊 JSON-RPC 的 HTTP / WebSocket 服务器
//!
//! `POST /` 处理单个或批量请求，`GET /` 升级为 WebSocket（支持订阅），
//! `GET /health` 返回节点调用计数。

use crate::inbound::json_types::{error_codes, JsonRpcError, JsonRpcResponse, RequestId};
use crate::inbound::jsonrpc::{EthJsonRpcHandler, WsSession};
use crate::service::cancel::CancelToken;
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::Method,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

/// HTTP 服务器状态
#[derive(Clone)]
pub struct ServerState {
    pub rpc_handler: Arc<EthJsonRpcHandler>,
    /// 单线程模式下串行化 POST 请求
    serial: Option<Arc<Mutex<()>>>,
}

/// 创建并配置路由
pub fn create_server(rpc_handler: Arc<EthJsonRpcHandler>, single_threaded: bool) -> Router {
    let state = ServerState {
        rpc_handler,
        serial: single_threaded.then(|| Arc::new(Mutex::new(()))),
    };

    // 为以太坊客户端配置 CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/", post(handle_rpc_request).get(handle_ws_upgrade))
        .route("/health", get(health_check))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

/// RPC 请求主处理器：解析失败返回 -32700，HTTP 状态始终为 200
async fn handle_rpc_request(State(state): State<ServerState>, body: Bytes) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            let response = JsonRpcResponse::error(
                RequestId::Null,
                JsonRpcError::new(error_codes::PARSE_ERROR, format!("解析错误: {}", e)),
            );
            return Json(response).into_response();
        }
    };

    let _serial = match &state.serial {
        Some(lock) => Some(lock.lock().await),
        None => None,
    };
    Json(state.rpc_handler.handle_payload(payload, None).await).into_response()
}

async fn handle_ws_upgrade(State(state): State<ServerState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, state.rpc_handler))
}

/// 单个 WebSocket 连接：请求按到达顺序处理，订阅通知经通道写回
async fn serve_socket(socket: WebSocket, handler: Arc<EthJsonRpcHandler>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let session = WsSession::new(tx.clone(), CancelToken::new());

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(Message::Text(message.to_string())).await.is_err() {
                break;
            }
        }
    });

    debug!("WebSocket 连接建立");
    while let Some(message) = receiver.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "WebSocket 读取失败");
                break;
            }
        };
        let response = match serde_json::from_str::<Value>(&text) {
            Ok(payload) => handler.handle_payload(payload, Some(&session)).await,
            Err(e) => serde_json::to_value(JsonRpcResponse::error(
                RequestId::Null,
                JsonRpcError::new(error_codes::PARSE_ERROR, format!("解析错误: {}", e)),
            ))
            .unwrap_or(Value::Null),
        };
        if tx.send(response).is_err() {
            break;
        }
    }

    handler.close_session(&session).await;
    // 已取消的订阅可能仍持有通道发送端
    writer.abort();
    debug!("WebSocket 连接关闭");
}

/// 健康检查端点
async fn health_check(State(state): State<ServerState>) -> impl IntoResponse {
    let node = state.rpc_handler.node();
    Json(json!({
        "status": "ok",
        "nodeCalls": {
            "successes": node.stats().successes(),
            "failures": node.stats().failures(),
        },
        "cache": {
            "hits": node.cache().hits(),
            "misses": node.cache().misses(),
        },
    }))
}

/// 运行服务器
pub async fn run_server(
    addr: SocketAddr,
    rpc_handler: Arc<EthJsonRpcHandler>,
    single_threaded: bool,
    shutdown: CancelToken,
) -> anyhow::Result<()> {
    let app = create_server(rpc_handler, single_threaded);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("以太坊 JSON-RPC 服务器启动于 {}", addr);
    info!("健康检查可访问 http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
