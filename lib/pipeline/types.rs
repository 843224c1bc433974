use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inclusive interval of block numbers fetched as one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    pub from_block: i64,
    pub to_block: i64,
}

impl BlockRange {
    pub fn new(from_block: i64, to_block: i64) -> Self {
        Self {
            from_block,
            to_block,
        }
    }

    /// Validates that the range is non-empty.
    pub fn validate(&self) -> Result<(), String> {
        if self.from_block < 0 {
            return Err(format!(
                "from_block must be >= 0, got {}",
                self.from_block
            ));
        }
        if self.from_block > self.to_block {
            return Err(format!(
                "from_block ({}) must be <= to_block ({})",
                self.from_block, self.to_block
            ));
        }
        Ok(())
    }

    pub fn len(&self) -> i64 {
        (self.to_block - self.from_block + 1).max(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn blocks(&self) -> impl Iterator<Item = i64> {
        self.from_block..=self.to_block
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.from_block, self.to_block)
    }
}

/// Durable export progress for one pipeline.
///
/// `block_number` is the last block whose records are fully exported and `primary_key` the
/// last key assigned to an exported record. Sources may stash their own fields in `extra`;
/// the core round-trips them untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub block_number: i64,
    pub primary_key: i64,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Position {
    pub fn new(block_number: i64, primary_key: i64) -> Self {
        Self {
            block_number,
            primary_key,
            extra: BTreeMap::new(),
        }
    }

    /// Position a fresh pipeline starts from so that the first range begins at `start_block`.
    pub fn genesis(start_block: i64) -> Self {
        Self::new(start_block - 1, 0)
    }

    /// Returns a copy advanced to `block_number`, keeping keys and source extras.
    pub fn advanced_to(&self, block_number: i64) -> Self {
        Self {
            block_number,
            primary_key: self.primary_key,
            extra: self.extra.clone(),
        }
    }
}

/// Closed set of downstream output channels.
///
/// Every channel resolves to one concrete topic at startup via [`ChannelTopics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputChannel {
    Blocks,
    Transfers,
    Receipts,
}

impl OutputChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputChannel::Blocks => "blocks",
            OutputChannel::Transfers => "transfers",
            OutputChannel::Receipts => "receipts",
        }
    }
}

/// Topic names resolved once from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTopics {
    pub blocks: String,
    pub transfers: String,
    pub receipts: String,
}

impl ChannelTopics {
    /// Builds `<prefix>-blocks`, `<prefix>-transfers`, `<prefix>-receipts`.
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            blocks: format!("{prefix}-blocks"),
            transfers: format!("{prefix}-transfers"),
            receipts: format!("{prefix}-receipts"),
        }
    }

    pub fn topic(&self, channel: OutputChannel) -> &str {
        match channel {
            OutputChannel::Blocks => &self.blocks,
            OutputChannel::Transfers => &self.transfers,
            OutputChannel::Receipts => &self.receipts,
        }
    }
}

/// One decoded record as produced by a source. The core never looks inside `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub channel: OutputChannel,
    pub block_number: i64,
    pub payload: Value,
}

/// Record with its exporter-assigned primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyedRecord {
    pub primary_key: i64,
    pub record: Record,
}

/// Result of one `work(range)` call.
///
/// `last_block` equals `range.to_block` unless the source trimmed an incomplete tail block,
/// in which case everything after `last_block` must be fetched again.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkOutput {
    pub records: Vec<Record>,
    pub last_block: i64,
}

impl WorkOutput {
    pub fn complete(range: BlockRange, records: Vec<Record>) -> Self {
        Self {
            records,
            last_block: range.to_block,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_round_trips_source_extras() {
        let mut position = Position::new(120, 9_001);
        position
            .extra
            .insert("last_block_hash".to_string(), Value::from("0xabc"));

        let encoded = serde_json::to_value(&position).expect("encode position");
        assert_eq!(encoded["block_number"], 120);
        assert_eq!(encoded["primary_key"], 9_001);
        assert_eq!(encoded["last_block_hash"], "0xabc");

        let decoded: Position = serde_json::from_value(encoded).expect("decode position");
        assert_eq!(decoded, position);
    }

    #[test]
    fn genesis_starts_one_before_start_block() {
        let position = Position::genesis(0);
        assert_eq!(position.block_number, -1);
        assert_eq!(position.primary_key, 0);
    }

    #[test]
    fn empty_or_inverted_range_is_invalid() {
        assert!(BlockRange::new(10, 9).validate().is_err());
        assert!(BlockRange::new(-1, 9).validate().is_err());
        assert!(BlockRange::new(10, 10).validate().is_ok());
        assert_eq!(BlockRange::new(10, 19).len(), 10);
    }

    #[test]
    fn channel_topics_resolve_every_channel() {
        let topics = ChannelTopics::with_prefix("eth");
        assert_eq!(topics.topic(OutputChannel::Blocks), "eth-blocks");
        assert_eq!(topics.topic(OutputChannel::Transfers), "eth-transfers");
        assert_eq!(topics.topic(OutputChannel::Receipts), "eth-receipts");
    }
}
