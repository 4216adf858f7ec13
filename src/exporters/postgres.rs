//! Bulk upserts of batch items into their Postgres tables.

use std::sync::Arc;

use async_trait::async_trait;

use super::{group_by_type, ExportError, ItemExporter};
use crate::db::{ConflictAction, DbError, DbOperation, DbPool, DbValue};
use crate::types::items::{Item, ItemType};

/// Storage layout of one item type.
pub struct TableSpec {
    pub table: &'static str,
    pub columns: &'static [&'static str],
    pub conflict_columns: &'static [&'static str],
    /// Tables carrying the `reorg` flag get `reorg = false` on every write.
    pub reorg_aware: bool,
    /// Optional guard on the update branch of the upsert.
    pub update_condition: Option<&'static str>,
}

impl TableSpec {
    fn all_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = self.columns.iter().map(|c| c.to_string()).collect();
        if self.reorg_aware {
            columns.push("reorg".to_string());
        }
        columns.push("update_time".to_string());
        columns
    }

    fn update_columns(&self) -> Vec<String> {
        self.all_columns()
            .into_iter()
            .filter(|c| !self.conflict_columns.contains(&c.as_str()))
            .collect()
    }
}

pub fn table_spec(item_type: ItemType) -> TableSpec {
    match item_type {
        ItemType::Block => TableSpec {
            table: "blocks",
            columns: &[
                "hash", "number", "timestamp", "parent_hash", "miner", "gas_limit", "gas_used",
                "base_fee_per_gas", "size", "transactions_count",
            ],
            conflict_columns: &["hash"],
            reorg_aware: true,
            update_condition: None,
        },
        ItemType::Transaction => TableSpec {
            table: "transactions",
            columns: &[
                "hash", "block_number", "block_hash", "block_timestamp", "transaction_index",
                "from_address", "to_address", "value", "input", "nonce", "gas", "gas_price",
                "max_fee_per_gas", "max_priority_fee_per_gas", "transaction_type", "receipt_status",
                "receipt_gas_used", "receipt_cumulative_gas_used", "receipt_effective_gas_price",
                "receipt_contract_address",
            ],
            conflict_columns: &["hash"],
            reorg_aware: true,
            update_condition: None,
        },
        ItemType::Log => TableSpec {
            table: "logs",
            columns: &[
                "transaction_hash", "log_index", "block_number", "block_hash", "block_timestamp",
                "transaction_index", "address", "topic0", "topic1", "topic2", "topic3", "data",
            ],
            conflict_columns: &["transaction_hash", "log_index"],
            reorg_aware: true,
            update_condition: None,
        },
        ItemType::TokenTransfer => TableSpec {
            table: "token_transfers",
            columns: &[
                "transaction_hash", "log_index", "block_number", "block_hash", "block_timestamp",
                "token_address", "token_type", "from_address", "to_address", "token_id", "value",
            ],
            conflict_columns: &["transaction_hash", "log_index", "token_id"],
            reorg_aware: true,
            update_condition: None,
        },
        ItemType::Token => TableSpec {
            table: "tokens",
            columns: &["address", "token_type", "name", "symbol", "decimals", "total_supply", "block_number"],
            conflict_columns: &["address"],
            reorg_aware: false,
            update_condition: Some("EXCLUDED.block_number >= tokens.block_number"),
        },
        ItemType::TokenBalance => TableSpec {
            table: "address_token_balances",
            columns: &[
                "address", "token_address", "token_type", "token_id", "balance", "block_number",
                "block_timestamp",
            ],
            conflict_columns: &["address", "token_address", "token_id", "block_number"],
            reorg_aware: true,
            update_condition: None,
        },
        ItemType::Trace => TableSpec {
            table: "traces",
            columns: &[
                "trace_id", "transaction_hash", "transaction_index", "block_number", "block_hash",
                "block_timestamp", "trace_address", "subtraces", "from_address", "to_address", "value",
                "input", "output", "trace_type", "call_type", "gas", "gas_used", "error", "status",
            ],
            conflict_columns: &["trace_id"],
            reorg_aware: true,
            update_condition: None,
        },
        ItemType::ContractInternalTransaction => TableSpec {
            table: "contract_internal_transactions",
            columns: &[
                "trace_id", "transaction_hash", "transaction_index", "block_number", "block_hash",
                "block_timestamp", "trace_type", "from_address", "to_address", "value", "gas",
                "gas_used", "error", "status",
            ],
            conflict_columns: &["trace_id"],
            reorg_aware: true,
            update_condition: None,
        },
    }
}

impl TableSpec {
    /// Column holding the block height.
    pub fn block_column(&self) -> &'static str {
        if self.columns.contains(&"block_number") {
            "block_number"
        } else {
            "number"
        }
    }
}

/// `(table, block column)` of every table whose rows are flagged when a
/// block range is reorganized.
pub fn reorg_tables() -> Vec<(&'static str, &'static str)> {
    ItemType::ALL
        .iter()
        .map(|t| table_spec(*t))
        .filter(|s| s.reorg_aware)
        .map(|s| (s.table, s.block_column()))
        .collect()
}

/// Values in `TableSpec::columns` order. Fungible token ids are stored as 0
/// because the id is part of the primary key.
pub fn row_for(item: &Item) -> Result<Vec<DbValue>, DbError> {
    let row = match item {
        Item::Block(b) => vec![
            DbValue::hash(&b.hash),
            DbValue::u64(b.number)?,
            DbValue::timestamp(b.timestamp)?,
            DbValue::hash(&b.parent_hash),
            DbValue::address(&b.miner),
            DbValue::u64(b.gas_limit)?,
            DbValue::u64(b.gas_used)?,
            DbValue::opt_numeric(b.base_fee_per_gas.as_ref()),
            DbValue::opt_u64(b.size)?,
            DbValue::u64(b.transactions_count)?,
        ],
        Item::Transaction(t) => vec![
            DbValue::hash(&t.hash),
            DbValue::u64(t.block_number)?,
            DbValue::hash(&t.block_hash),
            DbValue::timestamp(t.block_timestamp)?,
            DbValue::u64(t.transaction_index)?,
            DbValue::address(&t.from_address),
            DbValue::opt_address(t.to_address.as_ref()),
            DbValue::numeric(&t.value),
            DbValue::bytes(&t.input),
            DbValue::u64(t.nonce)?,
            DbValue::u64(t.gas)?,
            DbValue::opt_numeric(t.gas_price.as_ref()),
            DbValue::opt_numeric(t.max_fee_per_gas.as_ref()),
            DbValue::opt_numeric(t.max_priority_fee_per_gas.as_ref()),
            DbValue::opt_u64(t.transaction_type)?,
            DbValue::opt_u64(t.receipt_status)?,
            DbValue::opt_u64(t.receipt_gas_used)?,
            DbValue::opt_u64(t.receipt_cumulative_gas_used)?,
            DbValue::opt_numeric(t.receipt_effective_gas_price.as_ref()),
            DbValue::opt_address(t.receipt_contract_address.as_ref()),
        ],
        Item::Log(l) => vec![
            DbValue::hash(&l.transaction_hash),
            DbValue::u64(l.log_index)?,
            DbValue::u64(l.block_number)?,
            DbValue::hash(&l.block_hash),
            DbValue::timestamp(l.block_timestamp)?,
            DbValue::u64(l.transaction_index)?,
            DbValue::address(&l.address),
            DbValue::opt_hash(l.topic0.as_ref()),
            DbValue::opt_hash(l.topic1.as_ref()),
            DbValue::opt_hash(l.topic2.as_ref()),
            DbValue::opt_hash(l.topic3.as_ref()),
            DbValue::bytes(&l.data),
        ],
        Item::TokenTransfer(t) => vec![
            DbValue::hash(&t.transaction_hash),
            DbValue::u64(t.log_index)?,
            DbValue::u64(t.block_number)?,
            DbValue::hash(&t.block_hash),
            DbValue::timestamp(t.block_timestamp)?,
            DbValue::address(&t.token_address),
            DbValue::Text(t.token_type.as_str().to_string()),
            DbValue::address(&t.from_address),
            DbValue::address(&t.to_address),
            token_id(t.token_id.as_ref()),
            DbValue::numeric(&t.value),
        ],
        Item::Token(t) => vec![
            DbValue::address(&t.address),
            DbValue::Text(t.token_type.as_str().to_string()),
            DbValue::opt_text(t.name.as_deref()),
            DbValue::opt_text(t.symbol.as_deref()),
            t.decimals.map(|d| DbValue::Int16(d as i16)).unwrap_or(DbValue::Null),
            DbValue::opt_numeric(t.total_supply.as_ref()),
            DbValue::u64(t.block_number)?,
        ],
        Item::TokenBalance(b) => vec![
            DbValue::address(&b.address),
            DbValue::address(&b.token_address),
            DbValue::Text(b.token_type.as_str().to_string()),
            token_id(b.token_id.as_ref()),
            DbValue::numeric(&b.balance),
            DbValue::u64(b.block_number)?,
            DbValue::timestamp(b.block_timestamp)?,
        ],
        Item::Trace(t) => vec![
            DbValue::Text(t.trace_id.clone()),
            DbValue::hash(&t.transaction_hash),
            DbValue::u64(t.transaction_index)?,
            DbValue::u64(t.block_number)?,
            DbValue::hash(&t.block_hash),
            DbValue::timestamp(t.block_timestamp)?,
            DbValue::Text(t.trace_address.clone()),
            DbValue::u64(t.subtraces)?,
            DbValue::address(&t.from_address),
            DbValue::opt_address(t.to_address.as_ref()),
            DbValue::numeric(&t.value),
            DbValue::bytes(&t.input),
            t.output.as_ref().map(DbValue::bytes).unwrap_or(DbValue::Null),
            DbValue::Text(t.trace_type.clone()),
            DbValue::opt_text(t.call_type.as_deref()),
            DbValue::u64(t.gas)?,
            DbValue::u64(t.gas_used)?,
            DbValue::opt_text(t.error.as_deref()),
            DbValue::Int16(t.status as i16),
        ],
        Item::ContractInternalTransaction(t) => vec![
            DbValue::Text(t.trace_id.clone()),
            DbValue::hash(&t.transaction_hash),
            DbValue::u64(t.transaction_index)?,
            DbValue::u64(t.block_number)?,
            DbValue::hash(&t.block_hash),
            DbValue::timestamp(t.block_timestamp)?,
            DbValue::Text(t.trace_type.clone()),
            DbValue::address(&t.from_address),
            DbValue::opt_address(t.to_address.as_ref()),
            DbValue::numeric(&t.value),
            DbValue::u64(t.gas)?,
            DbValue::u64(t.gas_used)?,
            DbValue::opt_text(t.error.as_deref()),
            DbValue::Int16(t.status as i16),
        ],
    };
    Ok(row)
}

fn token_id(id: Option<&alloy::primitives::U256>) -> DbValue {
    id.map(DbValue::numeric)
        .unwrap_or_else(|| DbValue::Numeric("0".to_string()))
}

/// One bulk upsert per item type present in the batch.
pub fn build_operations(items: &[Item], now: i64) -> Result<Vec<DbOperation>, DbError> {
    group_by_type(items)
        .into_iter()
        .map(|(item_type, group)| {
            let spec = table_spec(item_type);
            let rows = group
                .into_iter()
                .map(|item| {
                    let mut row = row_for(item)?;
                    if spec.reorg_aware {
                        row.push(DbValue::Bool(false));
                    }
                    row.push(DbValue::Timestamp(now));
                    Ok(row)
                })
                .collect::<Result<Vec<_>, DbError>>()?;
            Ok(DbOperation::BulkUpsert {
                table: spec.table.to_string(),
                columns: spec.all_columns(),
                rows,
                conflict_columns: spec.conflict_columns.iter().map(|c| c.to_string()).collect(),
                action: ConflictAction::DoUpdate {
                    update_columns: spec.update_columns(),
                    condition: spec.update_condition.map(str::to_string),
                },
            })
        })
        .collect()
}

/// Writes each batch in a single transaction.
pub struct PostgresExporter {
    pool: Arc<DbPool>,
}

impl PostgresExporter {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ItemExporter for PostgresExporter {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn export_items(&self, items: &[Item]) -> Result<(), ExportError> {
        let now = chrono::Utc::now().timestamp();
        let operations = build_operations(items, now)?;
        let count = operations.len();
        self.pool.execute_transaction(operations).await?;
        tracing::debug!("Upserted {} items into {} tables", items.len(), count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{Address, U256};

    use super::*;
    use crate::types::items::fixtures;

    #[test]
    fn test_row_width_matches_columns() {
        let transfer = fixtures::erc20_transfer(1, Address::repeat_byte(1), Address::repeat_byte(2), Address::repeat_byte(3), 5);
        let items = vec![
            Item::Block(fixtures::block(1, 1, 0)),
            Item::Log(fixtures::log(1, 0, Address::ZERO, vec![], Default::default())),
            Item::TokenTransfer(transfer),
        ];
        for item in &items {
            let spec = table_spec(item.item_type());
            assert_eq!(row_for(item).unwrap().len(), spec.columns.len(), "{}", spec.table);
        }
    }

    #[test]
    fn test_fungible_transfer_stores_zero_token_id() {
        let transfer = fixtures::erc20_transfer(1, Address::repeat_byte(1), Address::repeat_byte(2), Address::repeat_byte(3), 5);
        let row = row_for(&Item::TokenTransfer(transfer)).unwrap();
        assert_eq!(row[9], DbValue::Numeric("0".to_string()));
        assert_eq!(row[10], DbValue::Numeric("5".to_string()));
    }

    #[test]
    fn test_operations_reset_reorg_flag_and_group_tables() {
        let items = vec![
            Item::Block(fixtures::block(1, 1, 0)),
            Item::Block(fixtures::block(2, 2, 1)),
            Item::Token(crate::types::items::Token {
                address: Address::repeat_byte(9),
                token_type: crate::types::items::TokenType::Erc20,
                name: None,
                symbol: Some("T".into()),
                decimals: Some(6),
                total_supply: Some(U256::from(1)),
                block_number: 2,
            }),
        ];
        let ops = build_operations(&items, 1_700_000_000).unwrap();
        assert_eq!(ops.len(), 2);

        match &ops[0] {
            DbOperation::BulkUpsert { table, columns, rows, action, .. } => {
                assert_eq!(table, "blocks");
                assert_eq!(rows.len(), 2);
                let reorg = columns.iter().position(|c| c == "reorg").unwrap();
                assert!(rows.iter().all(|r| r[reorg] == DbValue::Bool(false)));
                assert_eq!(rows[0].len(), columns.len());
                match action {
                    ConflictAction::DoUpdate { update_columns, condition } => {
                        assert!(!update_columns.contains(&"hash".to_string()));
                        assert!(update_columns.contains(&"reorg".to_string()));
                        assert!(condition.is_none());
                    }
                    other => panic!("unexpected action {:?}", other),
                }
            }
            other => panic!("unexpected operation {:?}", other),
        }

        match &ops[1] {
            DbOperation::BulkUpsert { table, columns, action, .. } => {
                assert_eq!(table, "tokens");
                assert!(!columns.contains(&"reorg".to_string()));
                assert!(matches!(action, ConflictAction::DoUpdate { condition: Some(_), .. }));
            }
            other => panic!("unexpected operation {:?}", other),
        }
    }

    #[test]
    fn test_oversized_values_are_not_wrapped() {
        let mut block = fixtures::block(1, 1, 0);
        block.base_fee_per_gas = Some(U256::from(u64::MAX) + U256::from(1));
        let row = row_for(&Item::Block(block.clone())).unwrap();
        assert_eq!(row[7], DbValue::Numeric("18446744073709551616".to_string()));

        block.number = u64::MAX;
        assert!(matches!(row_for(&Item::Block(block.clone())), Err(DbError::OutOfRange(u64::MAX))));
        assert!(build_operations(&[Item::Block(block)], 0).is_err());
    }

    #[test]
    fn test_reorg_tables_exclude_tokens() {
        let tables = reorg_tables();
        assert!(tables.contains(&("blocks", "number")));
        assert!(tables.contains(&("address_token_balances", "block_number")));
        assert!(tables.iter().all(|(t, _)| *t != "tokens"));
        assert_eq!(tables.len(), 7);
    }
}
