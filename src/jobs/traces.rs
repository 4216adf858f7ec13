use alloy::primitives::{B256, U256};
use async_trait::async_trait;

use super::context::{BlockRange, JobContext};
use super::error::JobError;
use super::traits::Job;
use crate::rpc::types::{CallFrame, TxTraceResult};
use crate::types::items::{Block, ContractInternalTransaction, Item, ItemBuffer, ItemType, Trace};

/// Flattens `callTracer` output into traces and value-carrying internal
/// transactions.
pub struct ExportTracesJob;

#[async_trait]
impl Job for ExportTracesJob {
    fn name(&self) -> &'static str {
        "export_traces"
    }

    fn dependency_types(&self) -> &'static [ItemType] {
        &[ItemType::Block]
    }

    fn output_types(&self) -> &'static [ItemType] {
        &[ItemType::Trace, ItemType::ContractInternalTransaction]
    }

    async fn run(
        &self,
        ctx: &JobContext,
        range: BlockRange,
        buffer: &mut ItemBuffer,
    ) -> Result<(), JobError> {
        let mut blocks: Vec<Block> = buffer
            .blocks()
            .filter(|b| b.number >= range.start && b.number <= range.end)
            .cloned()
            .collect();
        blocks.sort_by_key(|b| b.number);

        let numbers: Vec<u64> = blocks.iter().map(|b| b.number).collect();
        let rpc = &ctx.debug_rpc;
        let block_traces: Vec<Vec<TxTraceResult>> = ctx
            .executor
            .execute(numbers, |chunk| async move { rpc.trace_blocks_batch(&chunk).await })
            .await?;

        let mut traces = Vec::new();
        for (block, tx_traces) in blocks.iter().zip(block_traces) {
            traces.extend(flatten_block_traces(block, tx_traces)?);
        }

        let internal: Vec<Item> = traces
            .iter()
            .filter(|t| is_internal_transaction(t))
            .map(|t| Item::ContractInternalTransaction(ContractInternalTransaction::from(t)))
            .collect();

        tracing::debug!(
            "Extracted {} traces and {} internal transactions for {}",
            traces.len(),
            internal.len(),
            range
        );
        buffer.extend(traces.into_iter().map(Item::Trace));
        buffer.extend(internal);
        Ok(())
    }
}

/// Non-root frames that move value.
fn is_internal_transaction(trace: &Trace) -> bool {
    trace.depth() > 0 && !trace.value.is_zero() && trace.call_type.as_deref() != Some("delegatecall")
}

fn flatten_block_traces(block: &Block, tx_traces: Vec<TxTraceResult>) -> Result<Vec<Trace>, JobError> {
    let mut traces = Vec::new();

    for (position, tx_trace) in tx_traces.into_iter().enumerate() {
        let tx = match tx_trace.tx_hash {
            Some(hash) => block.transactions.iter().find(|t| t.hash == hash),
            None => block.transactions.get(position),
        };
        let (tx_hash, tx_index) = match tx {
            Some(t) => (t.hash, t.transaction_index),
            None => match tx_trace.tx_hash {
                Some(hash) => (hash, position as u64),
                None => {
                    return Err(JobError::MissingData(format!(
                        "trace {} of block {} has no transaction",
                        position, block.number
                    )))
                }
            },
        };

        let frame = match (tx_trace.result, tx_trace.error) {
            (Some(frame), _) => frame,
            (None, error) => {
                return Err(JobError::failed(
                    "export_traces",
                    format!(
                        "tracer failed for {} in block {}: {}",
                        tx_hash,
                        block.number,
                        error.unwrap_or_default()
                    ),
                ))
            }
        };

        let tx_ctx = TxContext {
            block,
            tx_hash,
            tx_index,
        };
        let mut path = Vec::new();
        walk_frame(&tx_ctx, &frame, &mut path, true, &mut traces);
    }

    Ok(traces)
}

struct TxContext<'a> {
    block: &'a Block,
    tx_hash: B256,
    tx_index: u64,
}

/// Depth-first walk; a frame fails when it or any ancestor errored.
fn walk_frame(
    ctx: &TxContext<'_>,
    frame: &CallFrame,
    path: &mut Vec<usize>,
    parent_ok: bool,
    out: &mut Vec<Trace>,
) {
    let ok = parent_ok && frame.error.is_none();
    let trace_address = path
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("-");
    let (trace_type, call_type) = classify(&frame.call_type);

    let trace_id = if trace_address.is_empty() {
        format!("{}", ctx.tx_hash)
    } else {
        format!("{}-{}", ctx.tx_hash, trace_address)
    };

    out.push(Trace {
        trace_id,
        transaction_hash: ctx.tx_hash,
        transaction_index: ctx.tx_index,
        block_number: ctx.block.number,
        block_hash: ctx.block.hash,
        block_timestamp: ctx.block.timestamp,
        trace_address,
        subtraces: frame.calls.len() as u64,
        from_address: frame.from,
        to_address: frame.to,
        value: frame.value.unwrap_or(U256::ZERO),
        input: frame.input.clone(),
        output: frame.output.clone(),
        trace_type: trace_type.to_string(),
        call_type,
        gas: frame.gas.map(|g| g.to::<u64>()).unwrap_or(0),
        gas_used: frame.gas_used.map(|g| g.to::<u64>()).unwrap_or(0),
        error: frame.error.clone(),
        status: ok as u8,
    });

    for (i, child) in frame.calls.iter().enumerate() {
        path.push(i);
        walk_frame(ctx, child, path, ok, out);
        path.pop();
    }
}

/// Map a tracer frame type to (trace_type, call_type).
fn classify(frame_type: &str) -> (&'static str, Option<String>) {
    let lower = frame_type.to_ascii_lowercase();
    match lower.as_str() {
        "create" | "create2" => ("create", None),
        "selfdestruct" | "suicide" => ("suicide", None),
        _ => ("call", Some(lower)),
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{Address, Bytes, U64};

    use super::*;
    use crate::types::items::fixtures;

    fn frame(call_type: &str, value: u64, error: Option<&str>, calls: Vec<CallFrame>) -> CallFrame {
        CallFrame {
            call_type: call_type.to_string(),
            from: Address::repeat_byte(1),
            to: Some(Address::repeat_byte(2)),
            value: Some(U256::from(value)),
            gas: Some(U64::from(100_000)),
            gas_used: Some(U64::from(21_000)),
            input: Bytes::new(),
            output: None,
            error: error.map(str::to_string),
            calls,
        }
    }

    #[test]
    fn test_flatten_assigns_addresses_and_status() {
        let block = fixtures::block(20, 5, 4);
        let tx_hash = B256::repeat_byte(0xaa);
        let root = frame(
            "CALL",
            0,
            None,
            vec![
                frame("CALL", 5, Some("out of gas"), vec![frame("CALL", 1, None, vec![])]),
                frame("DELEGATECALL", 0, None, vec![]),
                frame("CREATE2", 3, None, vec![]),
            ],
        );

        let traces = flatten_block_traces(
            &block,
            vec![TxTraceResult {
                tx_hash: Some(tx_hash),
                result: Some(root),
                error: None,
            }],
        )
        .unwrap();

        let addresses: Vec<&str> = traces.iter().map(|t| t.trace_address.as_str()).collect();
        assert_eq!(addresses, vec!["", "0", "0-0", "1", "2"]);
        assert_eq!(traces[0].subtraces, 3);
        assert_eq!(traces[0].trace_id, format!("{}", tx_hash));
        assert_eq!(traces[2].trace_id, format!("{}-0-0", tx_hash));

        let statuses: Vec<u8> = traces.iter().map(|t| t.status).collect();
        assert_eq!(statuses, vec![1, 0, 0, 1, 1]);

        assert_eq!(traces[3].call_type.as_deref(), Some("delegatecall"));
        assert_eq!(traces[4].trace_type, "create");
        assert_eq!(traces[4].call_type, None);

        let internal: Vec<&str> = traces
            .iter()
            .filter(|t| is_internal_transaction(t))
            .map(|t| t.trace_address.as_str())
            .collect();
        assert_eq!(internal, vec!["0", "0-0", "2"]);
    }

    #[test]
    fn test_tracer_error_fails_the_block() {
        let block = fixtures::block(20, 5, 4);
        let err = flatten_block_traces(
            &block,
            vec![TxTraceResult {
                tx_hash: Some(B256::repeat_byte(1)),
                result: None,
                error: Some("execution timeout".into()),
            }],
        )
        .unwrap_err();
        assert!(err.to_string().contains("execution timeout"));
    }
}
