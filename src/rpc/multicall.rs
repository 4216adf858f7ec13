//! Batched contract reads through Multicall3 `aggregate3`.
//!
//! Calls are grouped per block into aggregate3 requests. The resulting
//! `eth_call` requests are packed into JSON-RPC batches by serialized size
//! and sent with bounded concurrency; results map back to the input order.

use std::collections::BTreeMap;
use std::sync::Arc;

use alloy::dyn_abi::{DynSolType, DynSolValue};
use alloy::primitives::{keccak256, Address, Bytes};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;

use super::rpc::{hex_quantity, with_retry, RpcClient, RpcError};
use crate::types::config::rpc::MulticallSettings;

/// A read-only contract call at a given block.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub target: Address,
    pub calldata: Bytes,
    pub block_number: u64,
}

impl Call {
    pub fn new(target: Address, calldata: Bytes, block_number: u64) -> Self {
        Self {
            target,
            calldata,
            block_number,
        }
    }
}

pub fn function_selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    let mut selector = [0u8; 4];
    selector.copy_from_slice(&hash[0..4]);
    selector
}

/// Selector followed by the ABI-encoded parameters.
pub fn encode_call(selector: [u8; 4], params: &[DynSolValue]) -> Bytes {
    let mut data = selector.to_vec();
    if !params.is_empty() {
        data.extend(DynSolValue::Tuple(params.to_vec()).abi_encode_params());
    }
    Bytes::from(data)
}

/// Build aggregate3 calldata for a batch of (target, calldata) pairs.
/// Encodes as: aggregate3((address target, bool allowFailure, bytes callData)[])
pub fn build_aggregate3_calldata(calls: &[(Address, &Bytes)]) -> Bytes {
    let selector = function_selector("aggregate3((address,bool,bytes)[])");

    let call_tuples: Vec<DynSolValue> = calls
        .iter()
        .map(|(addr, data)| {
            DynSolValue::Tuple(vec![
                DynSolValue::Address(*addr),
                DynSolValue::Bool(true), // allowFailure
                DynSolValue::Bytes(data.to_vec()),
            ])
        })
        .collect();

    encode_call(selector, &[DynSolValue::Array(call_tuples)])
}

/// Decode the return data from an aggregate3 call.
/// Returns Vec<(success, returnData)>.
pub fn decode_aggregate3_results(
    return_data: &[u8],
    expected_count: usize,
) -> Result<Vec<(bool, Vec<u8>)>, RpcError> {
    let result_type = DynSolType::Array(Box::new(DynSolType::Tuple(vec![
        DynSolType::Bool,
        DynSolType::Bytes,
    ])));

    let decoded = result_type
        .abi_decode(return_data)
        .map_err(|e| RpcError::Decode(format!("aggregate3 results: {}", e)))?;

    let results_array = match decoded {
        DynSolValue::Array(arr) => arr,
        _ => return Err(RpcError::Decode("aggregate3 results are not an array".to_string())),
    };

    if results_array.len() != expected_count {
        return Err(RpcError::Decode(format!(
            "aggregate3 returned {} results, expected {}",
            results_array.len(),
            expected_count
        )));
    }

    Ok(results_array
        .into_iter()
        .map(|item| match item {
            DynSolValue::Tuple(fields) if fields.len() == 2 => {
                let success = matches!(fields[0], DynSolValue::Bool(true));
                let data = match &fields[1] {
                    DynSolValue::Bytes(b) => b.clone(),
                    _ => Vec::new(),
                };
                (success, data)
            }
            _ => (false, Vec::new()),
        })
        .collect())
}

/// Partition `items` into chunks whose summed JSON size stays within
/// `max_bytes`. Order is preserved and no item is split; an item larger than
/// the budget on its own gets a chunk to itself.
pub fn rebatch_by_size<T: Serialize>(items: Vec<T>, max_bytes: usize) -> Vec<Vec<T>> {
    let mut chunks = Vec::new();
    let mut current: Vec<T> = Vec::new();
    let mut current_size = 0;

    for item in items {
        let size = serde_json::to_vec(&item).map(|v| v.len()).unwrap_or(0);
        if current_size + size > max_bytes && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current.push(item);
        current_size += size;
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// One `eth_call` on the wire, with the input slots it answers.
#[derive(Debug, Clone, Serialize)]
struct EthCallRequest {
    to: Address,
    data: Bytes,
    block: String,
    #[serde(skip)]
    block_number: u64,
    #[serde(skip)]
    slots: Vec<usize>,
    #[serde(skip)]
    aggregated: bool,
}

pub struct Multicaller {
    rpc: Arc<RpcClient>,
    settings: MulticallSettings,
    max_workers: usize,
}

impl Multicaller {
    pub fn new(rpc: Arc<RpcClient>, settings: MulticallSettings, max_workers: usize) -> Self {
        Self {
            rpc,
            settings,
            max_workers: max_workers.max(1),
        }
    }

    fn uses_multicall_at(&self, block_number: u64) -> Option<Address> {
        self.settings
            .address
            .filter(|_| block_number >= self.settings.deployed_at)
    }

    fn plan(&self, calls: &[Call]) -> Vec<EthCallRequest> {
        let mut by_block: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
        for (i, call) in calls.iter().enumerate() {
            by_block.entry(call.block_number).or_default().push(i);
        }

        let mut requests = Vec::new();
        for (block_number, indices) in by_block {
            match self.uses_multicall_at(block_number) {
                Some(multicall) => {
                    for group in indices.chunks(self.settings.max_calls_per_multicall.max(1)) {
                        let sub_calls: Vec<(Address, &Bytes)> = group
                            .iter()
                            .map(|&i| (calls[i].target, &calls[i].calldata))
                            .collect();
                        requests.push(EthCallRequest {
                            to: multicall,
                            data: build_aggregate3_calldata(&sub_calls),
                            block: hex_quantity(block_number),
                            block_number,
                            slots: group.to_vec(),
                            aggregated: true,
                        });
                    }
                }
                None => {
                    for &i in &indices {
                        requests.push(EthCallRequest {
                            to: calls[i].target,
                            data: calls[i].calldata.clone(),
                            block: hex_quantity(block_number),
                            block_number,
                            slots: vec![i],
                            aggregated: false,
                        });
                    }
                }
            }
        }
        requests
    }

    /// Run all calls; a call that reverts or fails decoding yields `None`.
    pub async fn execute(&self, calls: &[Call]) -> Result<Vec<Option<Bytes>>, RpcError> {
        let mut results: Vec<Option<Bytes>> = vec![None; calls.len()];
        if calls.is_empty() {
            return Ok(results);
        }

        let requests = self.plan(calls);
        let chunks = rebatch_by_size(requests, self.settings.max_payload_bytes);
        tracing::debug!(
            "Dispatching {} calls as {} JSON-RPC batches",
            calls.len(),
            chunks.len()
        );

        let answered: Vec<Vec<(EthCallRequest, Result<Bytes, RpcError>)>> = stream::iter(chunks)
            .map(|chunk| self.send_chunk(chunk))
            .buffered(self.max_workers)
            .try_collect()
            .await?;

        for (request, response) in answered.into_iter().flatten() {
            let bytes = match response {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::debug!("eth_call at block {} failed: {}", request.block_number, e);
                    continue;
                }
            };

            if !request.aggregated {
                results[request.slots[0]] = Some(bytes);
                continue;
            }

            match decode_aggregate3_results(&bytes, request.slots.len()) {
                Ok(decoded) => {
                    for (slot, (success, data)) in request.slots.iter().zip(decoded) {
                        if success {
                            results[*slot] = Some(Bytes::from(data));
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Multicall at block {}: {}", request.block_number, e);
                }
            }
        }

        Ok(results)
    }

    async fn send_chunk(
        &self,
        chunk: Vec<EthCallRequest>,
    ) -> Result<Vec<(EthCallRequest, Result<Bytes, RpcError>)>, RpcError> {
        let wire: Vec<(Address, Bytes, u64)> = chunk
            .iter()
            .map(|r| (r.to, r.data.clone(), r.block_number))
            .collect();

        let responses = with_retry(self.rpc.retry_config(), "eth_call batch", || async {
            let responses = self.rpc.call_batch(&wire).await?;
            // Throttling reported per call fails the whole batch so it is retried
            if let Some(e) = responses.iter().filter_map(|r| r.as_ref().err()).find(|e| e.is_retryable()) {
                return Err(RpcError::BatchError(e.to_string()));
            }
            Ok(responses)
        })
        .await?;

        Ok(chunk.into_iter().zip(responses).collect())
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::U256;

    use super::*;
    use crate::rpc::mock::{self, MockNode};

    #[test]
    fn test_selectors() {
        assert_eq!(function_selector("balanceOf(address)"), [0x70, 0xa0, 0x82, 0x31]);
        assert_eq!(function_selector("aggregate3((address,bool,bytes)[])"), [0x82, 0xad, 0x56, 0xcb]);
    }

    #[test]
    fn test_encode_call_appends_padded_params() {
        let holder = Address::repeat_byte(0xab);
        let data = encode_call(function_selector("balanceOf(address)"), &[DynSolValue::Address(holder)]);
        assert_eq!(data.len(), 4 + 32);
        assert_eq!(&data[4 + 12..], holder.as_slice());

        let no_args = encode_call(function_selector("decimals()"), &[]);
        assert_eq!(no_args.len(), 4);
    }

    #[test]
    fn test_decode_aggregate3_results() {
        let encoded = DynSolValue::Array(vec![
            DynSolValue::Tuple(vec![
                DynSolValue::Bool(true),
                DynSolValue::Bytes(DynSolValue::Uint(U256::from(18), 256).abi_encode()),
            ]),
            DynSolValue::Tuple(vec![DynSolValue::Bool(false), DynSolValue::Bytes(Vec::new())]),
        ])
        .abi_encode();

        let decoded = decode_aggregate3_results(&encoded, 2).unwrap();
        assert!(decoded[0].0);
        assert_eq!(U256::from_be_slice(&decoded[0].1), U256::from(18));
        assert!(!decoded[1].0);

        assert!(matches!(decode_aggregate3_results(&encoded, 3), Err(RpcError::Decode(_))));
        assert!(matches!(decode_aggregate3_results(&[0u8; 3], 1), Err(RpcError::Decode(_))));
    }

    #[test]
    fn test_rebatch_small_items_form_one_chunk() {
        let items: Vec<String> = (0..5).map(|i| format!("item-{}", i)).collect();
        let chunks = rebatch_by_size(items.clone(), 1024);
        assert_eq!(chunks, vec![items]);
    }

    #[test]
    fn test_rebatch_never_splits_items_and_keeps_order() {
        // each serializes to 12 bytes: quotes plus ten characters
        let items: Vec<String> = (0..7).map(|i| format!("{:010}", i)).collect();
        let chunks = rebatch_by_size(items.clone(), 30);

        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.len() <= 2));
        let flattened: Vec<String> = chunks.into_iter().flatten().collect();
        assert_eq!(flattened, items);
    }

    #[test]
    fn test_rebatch_oversized_item_gets_own_chunk() {
        let items = vec!["a".to_string(), "x".repeat(100), "b".to_string()];
        let chunks = rebatch_by_size(items, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1][0].len(), 100);
        assert!(rebatch_by_size(Vec::<String>::new(), 10).is_empty());
    }

    fn multicaller(address: Option<Address>, deployed_at: u64, max_calls: usize) -> Multicaller {
        let rpc = Arc::new(RpcClient::from_url("http://localhost:8545").unwrap());
        Multicaller::new(
            rpc,
            MulticallSettings {
                address,
                deployed_at,
                max_calls_per_multicall: max_calls,
                max_payload_bytes: 1024,
            },
            2,
        )
    }

    #[test]
    fn test_plan_groups_per_block_and_caps_group_size() {
        let mc = multicaller(Some(Address::repeat_byte(0xca)), 100, 2);
        let calls: Vec<Call> = [150, 200, 150, 150]
            .iter()
            .map(|&b| Call::new(Address::repeat_byte(1), Bytes::from(vec![1, 2, 3, 4]), b))
            .collect();

        let plan = mc.plan(&calls);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].slots, vec![0, 2]);
        assert_eq!(plan[1].slots, vec![3]);
        assert_eq!(plan[2].slots, vec![1]);
        assert!(plan.iter().all(|r| r.aggregated && r.to == Address::repeat_byte(0xca)));
    }

    #[tokio::test]
    async fn test_execute_merges_results_by_input_index() {
        let node = MockNode::start().await;
        let multicall = Address::repeat_byte(0xca);
        node.deploy_multicall(multicall);
        let data = |n: u8| Bytes::from(vec![n; 4]);
        let answer = |n: u64| Bytes::from(DynSolValue::Uint(U256::from(n), 256).abi_encode());
        for n in 1..=4u8 {
            node.answer_call(data(n), answer(n as u64 * 10));
        }

        let mc = Multicaller::new(
            mock::client(node.url()),
            MulticallSettings {
                address: Some(multicall),
                deployed_at: 100,
                max_calls_per_multicall: 2,
                max_payload_bytes: 16 * 1024,
            },
            2,
        );
        let token = Address::repeat_byte(1);
        // data(5) has no answer and reverts
        let calls = vec![
            Call::new(token, data(1), 150),
            Call::new(token, data(2), 50),
            Call::new(token, data(5), 150),
            Call::new(token, data(3), 150),
            Call::new(token, data(4), 50),
            Call::new(token, data(5), 50),
        ];

        let results = mc.execute(&calls).await.unwrap();
        assert_eq!(
            results,
            vec![Some(answer(10)), Some(answer(20)), None, Some(answer(30)), Some(answer(40)), None]
        );
        // two aggregate3 calls at block 150, three plain calls before deployment
        assert_eq!(node.request_count("eth_call"), 5);
    }

    #[test]
    fn test_plan_falls_back_before_deployment() {
        let mc = multicaller(Some(Address::repeat_byte(0xca)), 100, 10);
        let calls = vec![
            Call::new(Address::repeat_byte(1), Bytes::from(vec![1]), 50),
            Call::new(Address::repeat_byte(2), Bytes::from(vec![2]), 50),
        ];
        let plan = mc.plan(&calls);
        assert_eq!(plan.len(), 2);
        assert!(plan.iter().all(|r| !r.aggregated));
        assert_eq!(plan[1].to, Address::repeat_byte(2));

        let without_address = multicaller(None, 0, 10);
        assert!(without_address.plan(&calls).iter().all(|r| !r.aggregated));
    }
}
