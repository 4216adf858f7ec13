//! In-process JSON-RPC node for tests, served by axum on an ephemeral port.
//!
//! Holds a small chain of blocks and receipts, canned `eth_call` answers
//! (including Multicall3 `aggregate3`), and per-method failure injection.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use alloy::dyn_abi::{DynSolType, DynSolValue};
use alloy::primitives::{Address, Bytes, B256};
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use super::multicall::Multicaller;
use super::rpc::{hex_quantity, RetryConfig, RpcClient, RpcClientConfig};
use crate::executor::BatchWorkExecutor;
use crate::jobs::JobContext;
use crate::types::config::rpc::MulticallSettings;

type Shared = Arc<Mutex<NodeState>>;

#[derive(Default)]
struct NodeState {
    head: u64,
    blocks: BTreeMap<u64, Value>,
    receipts: BTreeMap<u64, Vec<Value>>,
    calls: HashMap<Bytes, Bytes>,
    multicall: Option<Address>,
    /// Method -> number of upcoming requests answered with an error.
    failures: HashMap<String, usize>,
    requests: HashMap<String, usize>,
}

pub struct MockNode {
    url: String,
    state: Shared,
    server: tokio::task::JoinHandle<()>,
}

impl MockNode {
    pub async fn start() -> Self {
        let state: Shared = Arc::new(Mutex::new(NodeState::default()));
        let app = Router::new().route("/", post(handle)).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { url, state, server }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap()
    }

    pub fn set_head(&self, head: u64) {
        self.state().head = head;
    }

    /// Insert or replace block `number` with the given transactions, raising
    /// the head to it.
    pub fn add_block(&self, number: u64, hash: B256, parent_hash: B256, transactions: Vec<Value>) {
        let mut state = self.state();
        state.blocks.insert(number, block_json(number, hash, parent_hash, transactions));
        state.receipts.entry(number).or_default();
        state.head = state.head.max(number);
    }

    /// A linked chain `1..=count` with block hashes `B256::repeat_byte(n)`.
    pub fn add_chain(&self, count: u8) {
        for n in 1..=count {
            self.add_block(n as u64, B256::repeat_byte(n), B256::repeat_byte(n - 1), vec![]);
        }
    }

    pub fn add_receipt(&self, block_number: u64, receipt: Value) {
        self.state().receipts.entry(block_number).or_default().push(receipt);
    }

    /// Answer `eth_call` with `data`, directly or inside aggregate3, with
    /// `result`. Unknown calldata reverts.
    pub fn answer_call(&self, data: Bytes, result: Bytes) {
        self.state().calls.insert(data, result);
    }

    pub fn deploy_multicall(&self, address: Address) {
        self.state().multicall = Some(address);
    }

    /// Fail the next `times` requests of `method` with a transient error.
    pub fn fail_method(&self, method: &str, times: usize) {
        self.state().failures.insert(method.to_string(), times);
    }

    pub fn request_count(&self, method: &str) -> usize {
        self.state().requests.get(method).copied().unwrap_or(0)
    }
}

/// Address of a local port with nothing listening on it.
pub fn closed_port_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{}", port)
}

/// Client of `url` that never retries on its own.
pub fn client(url: &str) -> Arc<RpcClient> {
    let config = RpcClientConfig::new(url::Url::parse(url).unwrap()).with_retry(RetryConfig::new(0));
    Arc::new(RpcClient::new(config).unwrap())
}

/// Job context against `url` with retries disabled and no Multicall3.
pub fn job_context(url: &str) -> JobContext {
    let rpc = client(url);
    let settings = MulticallSettings {
        address: None,
        deployed_at: 0,
        max_calls_per_multicall: 10,
        max_payload_bytes: 16 * 1024,
    };
    JobContext {
        rpc: rpc.clone(),
        debug_rpc: rpc.clone(),
        executor: BatchWorkExecutor::new(10, 2, 0),
        multicaller: Arc::new(Multicaller::new(rpc, settings, 2)),
        block_receipts_method: None,
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn handle(State(state): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let mut state = state.lock().unwrap();
    let reply = match body {
        Value::Array(requests) => Value::Array(requests.iter().map(|r| state.answer(r)).collect()),
        request => state.answer(&request),
    };
    Json(reply)
}

impl NodeState {
    fn answer(&mut self, request: &Value) -> Value {
        let id = request["id"].clone();
        let method = request["method"].as_str().unwrap_or_default().to_string();
        let params = &request["params"];
        *self.requests.entry(method.clone()).or_default() += 1;

        if let Some(left) = self.failures.get_mut(&method).filter(|left| **left > 0) {
            *left -= 1;
            return error(id, -32000, "header not found");
        }

        let result = match method.as_str() {
            "eth_blockNumber" => json!(hex_quantity(self.head)),
            "eth_chainId" => json!("0x1"),
            "eth_getBlockByNumber" => quantity(&params[0])
                .and_then(|n| self.blocks.get(&n).cloned())
                .unwrap_or(Value::Null),
            "eth_getBlockReceipts" => quantity(&params[0])
                .and_then(|n| self.receipts.get(&n).cloned())
                .map(Value::Array)
                .unwrap_or(Value::Null),
            "eth_getTransactionReceipt" => self
                .receipts
                .values()
                .flatten()
                .find(|r| r["transactionHash"] == params[0])
                .cloned()
                .unwrap_or(Value::Null),
            "eth_call" => match self.eth_call(&params[0]) {
                Some(result) => json!(result),
                None => return error(id, 3, "execution reverted"),
            },
            _ => return error(id, -32601, "method not found"),
        };
        json!({ "jsonrpc": "2.0", "id": id, "result": result })
    }

    fn eth_call(&self, call: &Value) -> Option<Bytes> {
        let to: Address = serde_json::from_value(call["to"].clone()).ok()?;
        let data: Bytes = serde_json::from_value(call["data"].clone()).ok()?;
        if self.multicall == Some(to) {
            return self.aggregate3(&data);
        }
        self.calls.get(&data).cloned()
    }

    fn aggregate3(&self, data: &[u8]) -> Option<Bytes> {
        let ty = DynSolType::Tuple(vec![DynSolType::Array(Box::new(DynSolType::Tuple(vec![
            DynSolType::Address,
            DynSolType::Bool,
            DynSolType::Bytes,
        ])))]);
        let DynSolValue::Tuple(mut params) = ty.abi_decode_params(data.get(4..)?).ok()? else {
            return None;
        };
        let DynSolValue::Array(sub_calls) = params.pop()? else {
            return None;
        };

        let results: Vec<DynSolValue> = sub_calls
            .into_iter()
            .map(|sub_call| {
                let answer = match sub_call {
                    DynSolValue::Tuple(fields) => match fields.get(2) {
                        Some(DynSolValue::Bytes(calldata)) => self.calls.get(&Bytes::from(calldata.clone())),
                        _ => None,
                    },
                    _ => None,
                };
                DynSolValue::Tuple(vec![
                    DynSolValue::Bool(answer.is_some()),
                    DynSolValue::Bytes(answer.map(|b| b.to_vec()).unwrap_or_default()),
                ])
            })
            .collect();
        Some(Bytes::from(DynSolValue::Array(results).abi_encode()))
    }
}

fn quantity(value: &Value) -> Option<u64> {
    u64::from_str_radix(value.as_str()?.trim_start_matches("0x"), 16).ok()
}

fn error(id: Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

pub fn block_json(number: u64, hash: B256, parent_hash: B256, transactions: Vec<Value>) -> Value {
    json!({
        "hash": hash,
        "number": hex_quantity(number),
        "timestamp": hex_quantity(1_700_000_000 + number * 12),
        "parentHash": parent_hash,
        "miner": Address::ZERO,
        "gasLimit": "0x1c9c380",
        "gasUsed": "0x5208",
        "baseFeePerGas": "0x7",
        "size": "0x220",
        "transactions": transactions,
    })
}

pub fn transaction_json(hash: B256, index: u64, from: Address, to: Address) -> Value {
    json!({
        "hash": hash,
        "nonce": "0x0",
        "transactionIndex": hex_quantity(index),
        "from": from,
        "to": to,
        "value": "0x0",
        "gas": "0x5208",
        "gasPrice": "0x1",
        "input": "0x",
        "type": "0x0",
    })
}

/// Successful receipt of `tx_hash` carrying `logs`.
pub fn receipt_json(block_number: u64, block_hash: B256, tx_hash: B256, index: u64, logs: Vec<Value>) -> Value {
    json!({
        "transactionHash": tx_hash,
        "transactionIndex": hex_quantity(index),
        "blockHash": block_hash,
        "blockNumber": hex_quantity(block_number),
        "status": "0x1",
        "gasUsed": "0x5208",
        "cumulativeGasUsed": "0x5208",
        "effectiveGasPrice": "0x1",
        "logs": logs,
    })
}

pub fn log_json(address: Address, topics: Vec<B256>, data: Bytes, tx_hash: B256, log_index: u64) -> Value {
    json!({
        "address": address,
        "topics": topics,
        "data": data,
        "logIndex": hex_quantity(log_index),
        "transactionHash": tx_hash,
        "transactionIndex": "0x0",
    })
}
