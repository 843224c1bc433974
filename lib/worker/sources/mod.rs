mod blocks;
mod receipts;
mod transfers;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;

pub use blocks::{decode_block, BlocksSource};
pub use receipts::{decode_receipt, ReceiptsSource};
pub use transfers::{decode_transfer_log, TransfersSource, ERC20_TRANSFER_TOPIC};

use super::rpc::{parse_quantity, EvmRpcClient};
use super::{BlockSource, WorkerError};

/// Blocks requested concurrently while working one range.
const BLOCK_FETCH_CONCURRENCY: usize = 4;

/// Closed set of data sources; selected once at startup from `--source`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    EthBlocks,
    EthTransfers,
    EthReceipts,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [
        SourceKind::EthBlocks,
        SourceKind::EthTransfers,
        SourceKind::EthReceipts,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::EthBlocks => "eth-blocks",
            SourceKind::EthTransfers => "eth-transfers",
            SourceKind::EthReceipts => "eth-receipts",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        SourceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(raw))
            .ok_or_else(|| {
                let known: Vec<&str> = SourceKind::ALL.iter().map(|kind| kind.as_str()).collect();
                format!("unknown source {raw:?}; expected one of {}", known.join(", "))
            })
    }
}

/// Builds the source variant for `kind` on top of a shared RPC client.
pub fn build_source(kind: SourceKind, client: Arc<EvmRpcClient>) -> Arc<dyn BlockSource> {
    match kind {
        SourceKind::EthBlocks => Arc::new(BlocksSource::new(client)),
        SourceKind::EthTransfers => Arc::new(TransfersSource::new(client)),
        SourceKind::EthReceipts => Arc::new(ReceiptsSource::new(client)),
    }
}

fn quantity_field(object: &Value, field: &str, block: i64) -> Result<i64, WorkerError> {
    parse_quantity(&object[field]).map_err(|message| WorkerError::Decode {
        block,
        message: format!("field {field}: {message}"),
    })
}

fn optional_quantity_field(object: &Value, field: &str, block: i64) -> Result<Option<i64>, WorkerError> {
    match &object[field] {
        Value::Null => Ok(None),
        _ => quantity_field(object, field, block).map(Some),
    }
}

fn string_field(object: &Value, field: &str, block: i64) -> Result<String, WorkerError> {
    object[field]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| WorkerError::Decode {
            block,
            message: format!("field {field}: expected a string, got {}", object[field]),
        })
}

fn optional_string_field(object: &Value, field: &str) -> Option<String> {
    object[field].as_str().map(str::to_string)
}
