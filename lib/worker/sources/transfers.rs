use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use super::{quantity_field, string_field, SourceKind};
use crate::pipeline::types::{BlockRange, OutputChannel, Record, WorkOutput};
use crate::worker::rpc::EvmRpcClient;
use crate::worker::{BlockSource, WorkerError};

/// `keccak256("Transfer(address,address,uint256)")`
pub const ERC20_TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// ERC-20 `Transfer` events decoded from `eth_getLogs`.
pub struct TransfersSource {
    client: Arc<EvmRpcClient>,
}

impl TransfersSource {
    pub fn new(client: Arc<EvmRpcClient>) -> Self {
        Self { client }
    }
}

impl BlockSource for TransfersSource {
    fn kind(&self) -> SourceKind {
        SourceKind::EthTransfers
    }

    fn channels(&self) -> &'static [OutputChannel] {
        &[OutputChannel::Transfers]
    }

    fn fetch_head<'a>(&'a self) -> BoxFuture<'a, Result<i64, WorkerError>> {
        Box::pin(async move { Ok(self.client.block_number().await?) })
    }

    fn fetch_range<'a>(&'a self, range: BlockRange) -> BoxFuture<'a, Result<WorkOutput, WorkerError>> {
        Box::pin(async move {
            let logs = self.client.get_logs(range, ERC20_TRANSFER_TOPIC).await?;
            let fetched = logs.len();

            let mut keyed = Vec::with_capacity(fetched);
            for log in &logs {
                if let Some(decoded) = decode_transfer_log(range, log)? {
                    keyed.push(decoded);
                }
            }
            keyed.sort_by_key(|(log_index, record)| (record.block_number, *log_index));

            debug!(
                event = "transfers_decoded",
                from_block = range.from_block,
                to_block = range.to_block,
                fetched_logs = fetched,
                transfers = keyed.len(),
                "decoded transfer logs"
            );

            let records = keyed.into_iter().map(|(_, record)| record).collect();
            Ok(WorkOutput::complete(range, records))
        })
    }
}

/// Decodes one log into a transfer record together with its log index.
///
/// Returns `None` for logs that share the topic but are not ERC-20 transfers (ERC-721 puts
/// the token id in a fourth topic) and for logs removed by a reorg.
pub fn decode_transfer_log(range: BlockRange, log: &Value) -> Result<Option<(i64, Record)>, WorkerError> {
    let block = quantity_field(log, "blockNumber", range.from_block)?;
    if block < range.from_block || block > range.to_block {
        return Err(WorkerError::DataIntegrity {
            block,
            message: format!("log outside of requested range {range}"),
        });
    }

    if log["removed"].as_bool() == Some(true) {
        return Ok(None);
    }
    let topics = match log["topics"].as_array() {
        Some(topics) if topics.len() == 3 => topics,
        _ => return Ok(None),
    };

    let log_index = quantity_field(log, "logIndex", block)?;
    let from = topic_address(&topics[1], block)?;
    let to = topic_address(&topics[2], block)?;

    let payload = json!({
        "block_number": block,
        "transaction_hash": string_field(log, "transactionHash", block)?,
        "log_index": log_index,
        "token_address": string_field(log, "address", block)?.to_ascii_lowercase(),
        "from_address": from,
        "to_address": to,
        "value": string_field(log, "data", block)?,
    });

    Ok(Some((
        log_index,
        Record {
            channel: OutputChannel::Transfers,
            block_number: block,
            payload,
        },
    )))
}

/// Extracts the address from a 32-byte left-padded topic.
fn topic_address(topic: &Value, block: i64) -> Result<String, WorkerError> {
    let raw = topic.as_str().unwrap_or_default();
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    if digits.len() != 64 || !digits.is_ascii() {
        return Err(WorkerError::Decode {
            block,
            message: format!("topic {raw:?} is not a 32-byte word"),
        });
    }
    Ok(format!("0x{}", digits[24..].to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{decode_transfer_log, ERC20_TRANSFER_TOPIC};
    use crate::pipeline::types::BlockRange;
    use crate::worker::WorkerError;

    const FROM: &str = "0x000000000000000000000000a9d1e08c7793af67e9d92fe308d5697fb81d3e43";
    const TO: &str = "0x00000000000000000000000077696bb39917c91a0c3908d577d5e322095425ca";

    fn log(block: &str, log_index: &str, topics: Vec<&str>) -> serde_json::Value {
        json!({
            "address": "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48",
            "blockNumber": block,
            "transactionHash": "0xfeed",
            "logIndex": log_index,
            "topics": topics,
            "data": "0x00000000000000000000000000000000000000000000000000000000000f4240",
            "removed": false,
        })
    }

    #[test]
    fn decodes_erc20_transfer() {
        let range = BlockRange::new(10, 20);
        let (log_index, record) =
            decode_transfer_log(range, &log("0xc", "0x5", vec![ERC20_TRANSFER_TOPIC, FROM, TO]))
                .expect("decode")
                .expect("transfer");

        assert_eq!(log_index, 5);
        assert_eq!(record.block_number, 12);
        assert_eq!(
            record.payload["from_address"],
            "0xa9d1e08c7793af67e9d92fe308d5697fb81d3e43"
        );
        assert_eq!(
            record.payload["to_address"],
            "0x77696bb39917c91a0c3908d577d5e322095425ca"
        );
        assert_eq!(
            record.payload["token_address"],
            "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"
        );
    }

    #[test]
    fn skips_erc721_and_removed_logs() {
        let range = BlockRange::new(10, 20);
        let nft = log("0xc", "0x1", vec![ERC20_TRANSFER_TOPIC, FROM, TO, FROM]);
        assert!(decode_transfer_log(range, &nft).expect("decode").is_none());

        let mut removed = log("0xc", "0x1", vec![ERC20_TRANSFER_TOPIC, FROM, TO]);
        removed["removed"] = json!(true);
        assert!(decode_transfer_log(range, &removed).expect("decode").is_none());
    }

    #[test]
    fn log_outside_range_is_rejected() {
        let range = BlockRange::new(10, 20);
        let stray = log("0x15", "0x0", vec![ERC20_TRANSFER_TOPIC, FROM, TO]);
        assert!(matches!(
            decode_transfer_log(range, &stray),
            Err(WorkerError::DataIntegrity { block: 21, .. })
        ));
    }

    #[test]
    fn short_topic_is_a_decode_error() {
        let range = BlockRange::new(10, 20);
        let bad = log("0xc", "0x0", vec![ERC20_TRANSFER_TOPIC, "0x1234", TO]);
        assert!(matches!(
            decode_transfer_log(range, &bad),
            Err(WorkerError::Decode { block: 12, .. })
        ));
    }
}
