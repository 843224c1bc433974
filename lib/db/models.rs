use diesel::prelude::*;
use serde_json::Value;

use super::schema::{export_checkpoints, exported_records};

/// One row of `exported_records`; `exported_at` is filled in by the database.
#[derive(Debug, Clone, PartialEq, Insertable)]
#[diesel(table_name = exported_records)]
pub struct NewExportedRecord {
    pub topic: String,
    pub primary_key: i64,
    pub block_number: i64,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable)]
#[diesel(table_name = export_checkpoints)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CheckpointRow {
    pub pipeline: String,
    pub position: Value,
}

#[derive(Debug, Clone, PartialEq, Insertable)]
#[diesel(table_name = export_checkpoints)]
pub struct NewCheckpoint<'a> {
    pub pipeline: &'a str,
    pub position: Value,
}
