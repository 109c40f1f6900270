//! JSON-RPC 处理器集成测试
//!
//! 通过 MockNode 驱动完整的请求路径，不访问网络。

#[cfg(test)]
mod tests {
    use gateway::domain::address::Chain;
    use gateway::domain::amount::NativeAmount;
    use gateway::domain::error::{node_codes, NodeError};
    use gateway::inbound::jsonrpc::EthJsonRpcHandler;
    use gateway::infrastructure::mock_node::MockNode;
    use gateway::infrastructure::response_cache::ResponseCache;
    use gateway::service::cancel::CancelToken;
    use gateway::service::chain_detector::ChainDetector;
    use gateway::service::node_api::NodeApi;
    use gateway::service::subscription::{PollingPolicy, SubscriptionEngine};
    use serde_json::{json, Value};
    use std::sync::Arc;

    const TXID: &str = "11e97fa5877c5df349934bafc02da6218038a427e8ed081f048626fa6eb523f5";
    const BLOCK: &str = "bba11e1bacc69ba535d478cf1f2e542da3735a517b0b8eebaf7e6bb25eeb48c5";
    const SENDER: &str = "qUbxboqjBRp96j3La8D1RYkyqx5uQbJPoW";
    const RECEIVER: &str = "qLn9vqbr2Gx3TsVR9QyTVB5mrMoh4x43Uf";

    fn handler(node: &MockNode) -> EthJsonRpcHandler {
        let owner = CancelToken::new();
        let api = NodeApi::new(Arc::new(node.clone()), ResponseCache::default(), owner.clone());
        let chain = ChainDetector::pinned(Chain::Test, owner);
        let subscriptions = Arc::new(SubscriptionEngine::new(
            api.clone(),
            Arc::clone(&chain),
            PollingPolicy::default(),
        ));
        EthJsonRpcHandler::new(api, chain, subscriptions, NativeAmount::from_satoshis(40))
    }

    async fn call(handler: &EthJsonRpcHandler, method: &str, params: Value) -> Value {
        handler
            .handle_payload(json!({"jsonrpc": "2.0", "method": method, "params": params, "id": 1}), None)
            .await
    }

    fn not_recognized() -> NodeError {
        NodeError::rpc(node_codes::INVALID_ADDRESS_OR_KEY, "Invalid or non-wallet transaction id")
    }

    async fn reward_node() -> MockNode {
        let node = MockNode::new();
        node.set_error("gettransaction", not_recognized()).await;
        node.set_response("getrawtransaction", json!({
            "txid": TXID,
            "hex": "0200",
            "blockhash": BLOCK,
            "vin": [{"txid": "aa", "vout": 1, "address": SENDER, "valueSat": 100}],
            "vout": [
                {"value": 0.0000004, "valueSat": 40, "n": 0, "scriptPubKey": {"addresses": [SENDER]}},
                {"value": 0.00000059, "valueSat": 59, "n": 1, "scriptPubKey": {"addresses": [RECEIVER]}}
            ]
        }))
        .await;
        node.set_response("getblock", json!({"hash": BLOCK, "height": 42, "tx": ["00", TXID]})).await;
        node.set_response("decoderawtransaction", json!({
            "txid": TXID,
            "vout": [
                {"value": 0.0000004, "n": 0, "scriptPubKey": {"addresses": [SENDER]}},
                {"value": 0.00000059, "n": 1, "scriptPubKey": {"addresses": [RECEIVER]}}
            ]
        }))
        .await;
        node
    }

    #[tokio::test]
    async fn test_reward_transaction_accounting() {
        // 测试奖励交易：输入 100，找零 40，转出 59，手续费从找零中扣除
        let node = reward_node().await;
        let resp = call(&handler(&node), "eth_getTransactionByHash", json!([format!("0x{}", TXID)])).await;
        let tx = &resp["result"];

        assert_eq!(tx["value"], json!("0x895ebd8c00"));
        assert_eq!(tx["from"], json!("0x0000000000000000000000000000000000000000"));
        assert_eq!(tx["to"], json!("0x2352be3db3177f0a07efbe6da5857615b8c9901d"));
        assert_eq!(tx["blockNumber"], json!("0x2a"));
        assert_eq!(tx["transactionIndex"], json!("0x1"));
        assert_eq!(tx["hash"], json!(format!("0x{}", TXID)));
    }

    #[tokio::test]
    async fn test_reward_receipt_is_synthetic() {
        let node = reward_node().await;
        node.set_response("gettransactionreceipt", json!([])).await;
        let resp = call(&handler(&node), "eth_getTransactionReceipt", json!([format!("0x{}", TXID)])).await;
        let receipt = &resp["result"];

        assert_eq!(receipt["gasUsed"], json!("0x55f0"));
        assert_eq!(receipt["status"], json!("0x1"));
        assert_eq!(receipt["logs"], json!([]));
    }

    #[tokio::test]
    async fn test_unknown_filter_is_callback_error() {
        let node = MockNode::new();
        node.set_response("getblockcount", json!(10)).await;
        let h = handler(&node);
        let resp = call(&h, "eth_getFilterChanges", json!(["0x99"])).await;
        assert_eq!(resp["error"]["code"], json!(-32000));

        let created = call(&h, "eth_newBlockFilter", json!([])).await;
        assert_eq!(created["result"], json!("0x1"));
        let removed = call(&h, "eth_uninstallFilter", json!(["0x1"])).await;
        assert_eq!(removed["result"], json!(true));
    }

    #[tokio::test]
    async fn test_get_logs_uses_block_range() {
        let node = MockNode::new();
        node.set_response("getblockcount", json!(300)).await;
        node.set_response("searchlogs", json!([])).await;
        let resp = call(
            &handler(&node),
            "eth_getLogs",
            json!([{"fromBlock": "0x10", "address": "0xdb46f738bf32cdafb9a4a70eb8b44c76646bcaf0"}]),
        )
        .await;
        assert_eq!(resp["result"], json!([]));

        let calls = node.calls().await;
        let (_, params) = calls.iter().find(|(m, _)| m == "searchlogs").unwrap();
        assert_eq!(params[0], json!(16));
        assert_eq!(params[1], json!(300));
    }

    #[tokio::test]
    async fn test_node_failure_is_server_error() {
        let node = MockNode::new();
        node.set_error("getblockcount", NodeError::Transport("connection refused".to_string()))
            .await;
        let resp = call(&handler(&node), "eth_blockNumber", json!([])).await;
        assert_eq!(resp["error"]["code"], json!(-32000));
        assert!(resp.get("result").is_none());
    }
}
