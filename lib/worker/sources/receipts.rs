use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{stream, StreamExt, TryStreamExt};
use serde_json::{json, Value};
use tracing::warn;

use super::{
    optional_quantity_field, optional_string_field, quantity_field, string_field, SourceKind,
    BLOCK_FETCH_CONCURRENCY,
};
use crate::pipeline::types::{BlockRange, OutputChannel, Record, WorkOutput};
use crate::worker::rpc::EvmRpcClient;
use crate::worker::{BlockSource, WorkerError};

/// Transaction receipts, one record per transaction.
///
/// Nodes sometimes serve the receipts of the newest blocks before they have all of them. A
/// block whose receipt count is below its transaction count is dropped when it is the last
/// block of the range and refetched on the next pass; anywhere else it is an error.
pub struct ReceiptsSource {
    client: Arc<EvmRpcClient>,
}

/// Receipts of one block alongside the transaction count its header declares.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockReceipts {
    pub block_number: i64,
    pub declared_transactions: usize,
    pub receipts: Vec<Value>,
}

impl ReceiptsSource {
    pub fn new(client: Arc<EvmRpcClient>) -> Self {
        Self { client }
    }

    async fn fetch_block_receipts(&self, number: i64) -> Result<BlockReceipts, WorkerError> {
        let block = self.client.get_block(number).await?;
        let declared_transactions = block["transactions"]
            .as_array()
            .map(Vec::len)
            .ok_or_else(|| WorkerError::Decode {
                block: number,
                message: "field transactions: expected an array".to_string(),
            })?;

        let receipts = if declared_transactions == 0 {
            Vec::new()
        } else {
            self.client.get_block_receipts(number).await?
        };

        Ok(BlockReceipts {
            block_number: number,
            declared_transactions,
            receipts,
        })
    }
}

impl BlockSource for ReceiptsSource {
    fn kind(&self) -> SourceKind {
        SourceKind::EthReceipts
    }

    fn channels(&self) -> &'static [OutputChannel] {
        &[OutputChannel::Receipts]
    }

    fn fetch_head<'a>(&'a self) -> BoxFuture<'a, Result<i64, WorkerError>> {
        Box::pin(async move { Ok(self.client.block_number().await?) })
    }

    fn fetch_range<'a>(&'a self, range: BlockRange) -> BoxFuture<'a, Result<WorkOutput, WorkerError>> {
        Box::pin(async move {
            let blocks: Vec<BlockReceipts> = stream::iter(range.blocks())
                .map(|number| self.fetch_block_receipts(number))
                .buffered(BLOCK_FETCH_CONCURRENCY)
                .try_collect()
                .await?;
            assemble_range(range, blocks)
        })
    }
}

/// Decodes the receipts of a range, applying the incomplete-tail policy.
pub fn assemble_range(range: BlockRange, blocks: Vec<BlockReceipts>) -> Result<WorkOutput, WorkerError> {
    let mut records = Vec::new();

    for block in blocks {
        let number = block.block_number;
        let fetched = block.receipts.len();

        if fetched < block.declared_transactions {
            if number == range.to_block {
                warn!(
                    event = "receipts_tail_trimmed",
                    block_number = number,
                    declared_transactions = block.declared_transactions,
                    fetched_receipts = fetched,
                    "last block of range has missing receipts; deferring it"
                );
                return Ok(WorkOutput {
                    records,
                    last_block: number - 1,
                });
            }
            return Err(WorkerError::DataIntegrity {
                block: number,
                message: format!(
                    "{fetched} receipts for {} declared transactions",
                    block.declared_transactions
                ),
            });
        }
        if fetched > block.declared_transactions {
            return Err(WorkerError::DataIntegrity {
                block: number,
                message: format!(
                    "{fetched} receipts exceed {} declared transactions",
                    block.declared_transactions
                ),
            });
        }

        let mut decoded = block
            .receipts
            .iter()
            .map(|receipt| decode_receipt(number, receipt))
            .collect::<Result<Vec<(i64, Record)>, _>>()?;
        decoded.sort_by_key(|(transaction_index, _)| *transaction_index);
        records.extend(decoded.into_iter().map(|(_, record)| record));
    }

    Ok(WorkOutput::complete(range, records))
}

/// Decodes one receipt into a record together with its transaction index.
pub fn decode_receipt(block: i64, receipt: &Value) -> Result<(i64, Record), WorkerError> {
    let receipt_block = quantity_field(receipt, "blockNumber", block)?;
    if receipt_block != block {
        return Err(WorkerError::DataIntegrity {
            block,
            message: format!("receipt belongs to block {receipt_block}"),
        });
    }

    let transaction_index = quantity_field(receipt, "transactionIndex", block)?;
    let payload = json!({
        "block_number": block,
        "transaction_hash": string_field(receipt, "transactionHash", block)?,
        "transaction_index": transaction_index,
        "from_address": string_field(receipt, "from", block)?,
        "to_address": optional_string_field(receipt, "to"),
        "contract_address": optional_string_field(receipt, "contractAddress"),
        "gas_used": quantity_field(receipt, "gasUsed", block)?,
        "cumulative_gas_used": quantity_field(receipt, "cumulativeGasUsed", block)?,
        "effective_gas_price": optional_quantity_field(receipt, "effectiveGasPrice", block)?,
        "status": optional_quantity_field(receipt, "status", block)?,
        "log_count": receipt["logs"].as_array().map(Vec::len).unwrap_or_default(),
    });

    Ok((
        transaction_index,
        Record {
            channel: OutputChannel::Receipts,
            block_number: block,
            payload,
        },
    ))
}
