use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{stream, StreamExt, TryStreamExt};
use serde_json::{json, Value};

use super::{
    optional_quantity_field, quantity_field, string_field, SourceKind, BLOCK_FETCH_CONCURRENCY,
};
use crate::pipeline::types::{BlockRange, OutputChannel, Record, WorkOutput};
use crate::worker::rpc::EvmRpcClient;
use crate::worker::{BlockSource, WorkerError};

/// One `blocks` record per block header.
pub struct BlocksSource {
    client: Arc<EvmRpcClient>,
}

impl BlocksSource {
    pub fn new(client: Arc<EvmRpcClient>) -> Self {
        Self { client }
    }

    async fn fetch_block(&self, number: i64) -> Result<Record, WorkerError> {
        let raw = self.client.get_block(number).await?;
        decode_block(number, &raw)
    }
}

impl BlockSource for BlocksSource {
    fn kind(&self) -> SourceKind {
        SourceKind::EthBlocks
    }

    fn channels(&self) -> &'static [OutputChannel] {
        &[OutputChannel::Blocks]
    }

    fn fetch_head<'a>(&'a self) -> BoxFuture<'a, Result<i64, WorkerError>> {
        Box::pin(async move { Ok(self.client.block_number().await?) })
    }

    fn fetch_range<'a>(&'a self, range: BlockRange) -> BoxFuture<'a, Result<WorkOutput, WorkerError>> {
        Box::pin(async move {
            let records: Vec<Record> = stream::iter(range.blocks())
                .map(|number| self.fetch_block(number))
                .buffered(BLOCK_FETCH_CONCURRENCY)
                .try_collect()
                .await?;
            Ok(WorkOutput::complete(range, records))
        })
    }
}

/// Decodes an `eth_getBlockByNumber(n, false)` result.
pub fn decode_block(expected: i64, raw: &Value) -> Result<Record, WorkerError> {
    let number = quantity_field(raw, "number", expected)?;
    if number != expected {
        return Err(WorkerError::DataIntegrity {
            block: expected,
            message: format!("node returned block {number} instead"),
        });
    }

    let transaction_count = raw["transactions"]
        .as_array()
        .map(Vec::len)
        .ok_or_else(|| WorkerError::Decode {
            block: number,
            message: "field transactions: expected an array".to_string(),
        })?;

    let payload = json!({
        "number": number,
        "hash": string_field(raw, "hash", number)?,
        "parent_hash": string_field(raw, "parentHash", number)?,
        "timestamp": quantity_field(raw, "timestamp", number)?,
        "miner": string_field(raw, "miner", number)?,
        "gas_used": quantity_field(raw, "gasUsed", number)?,
        "gas_limit": quantity_field(raw, "gasLimit", number)?,
        "base_fee_per_gas": optional_quantity_field(raw, "baseFeePerGas", number)?,
        "transaction_count": transaction_count,
    });

    Ok(Record {
        channel: OutputChannel::Blocks,
        block_number: number,
        payload,
    })
}
