use diesel::pg::upsert::excluded;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::Timestamptz;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use futures::future::BoxFuture;
use tracing::{debug, warn};

use super::{CheckpointError, CheckpointStore, LogSink, SinkError};
use crate::db::models::{CheckpointRow, NewCheckpoint, NewExportedRecord};
use crate::db::schema::{export_checkpoints, exported_records};
use crate::db::PgPool;
use crate::health::SinkProbe;
use crate::pipeline::types::{ChannelTopics, KeyedRecord, Position};

/// Rows per INSERT statement; keeps bind parameters well below the Postgres limit.
const INSERT_CHUNK_ROWS: usize = 1_000;

/// Postgres-backed sink writing into `exported_records`.
///
/// Rows are staged between `begin` and `commit` and written in a single database
/// transaction at commit time. Conflicting `(topic, primary_key)` rows are overwritten, so a
/// batch re-emitted after a crash replaces itself.
pub struct PgLogSink {
    pool: PgPool,
    topics: ChannelTopics,
    staged: Option<Vec<NewExportedRecord>>,
}

impl PgLogSink {
    pub fn new(pool: PgPool, topics: ChannelTopics) -> Self {
        Self {
            pool,
            topics,
            staged: None,
        }
    }

    /// Reachability probe sharing this sink's pool.
    pub fn probe(&self) -> PgSinkProbe {
        PgSinkProbe {
            pool: self.pool.clone(),
        }
    }
}

impl LogSink for PgLogSink {
    fn begin<'a>(&'a mut self) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            if self.staged.is_some() {
                return Err(SinkError::TransactionState("begin while a batch is open"));
            }
            self.staged = Some(Vec::new());
            Ok(())
        })
    }

    fn append<'a>(&'a mut self, records: &'a [KeyedRecord]) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            let topics = &self.topics;
            let staged = self
                .staged
                .as_mut()
                .ok_or(SinkError::TransactionState("append without begin"))?;
            staged.extend(records.iter().map(|keyed| NewExportedRecord {
                topic: topics.topic(keyed.record.channel).to_string(),
                primary_key: keyed.primary_key,
                block_number: keyed.record.block_number,
                payload: keyed.record.payload.clone(),
            }));
            Ok(())
        })
    }

    fn commit<'a>(&'a mut self) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            let rows = self
                .staged
                .take()
                .ok_or(SinkError::TransactionState("commit without begin"))?;
            if rows.is_empty() {
                return Ok(());
            }

            let mut conn = self
                .pool
                .get()
                .await
                .map_err(|err| SinkError::Unavailable(format!("failed to acquire DB connection: {err}")))?;

            let row_count = rows.len();
            conn.transaction::<_, DieselError, _>(|conn| {
                async move {
                    for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
                        diesel::insert_into(exported_records::table)
                            .values(chunk)
                            .on_conflict((exported_records::topic, exported_records::primary_key))
                            .do_update()
                            .set((
                                exported_records::block_number
                                    .eq(excluded(exported_records::block_number)),
                                exported_records::payload.eq(excluded(exported_records::payload)),
                                exported_records::exported_at
                                    .eq(diesel::dsl::sql::<Timestamptz>("now()")),
                            ))
                            .execute(conn)
                            .await?;
                    }
                    Ok(())
                }
                .scope_boxed()
            })
            .await
            .map_err(map_sink_error)?;

            debug!(event = "sink_batch_committed", rows = row_count, "committed batch");
            Ok(())
        })
    }

    fn abort<'a>(&'a mut self) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            if let Some(rows) = self.staged.take() {
                warn!(event = "sink_batch_aborted", rows = rows.len(), "discarded staged batch");
            }
            Ok(())
        })
    }
}

fn map_sink_error(error: DieselError) -> SinkError {
    match error {
        DieselError::DatabaseError(
            kind @ (DatabaseErrorKind::ClosedConnection | DatabaseErrorKind::UnableToSendCommand),
            info,
        ) => SinkError::Unavailable(format!("{kind:?}: {}", info.message())),
        other => SinkError::Database(other),
    }
}

pub struct PgSinkProbe {
    pool: PgPool,
}

impl SinkProbe for PgSinkProbe {
    fn ping<'a>(&'a self) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            let mut conn = self
                .pool
                .get()
                .await
                .map_err(|err| SinkError::Unavailable(format!("failed to acquire DB connection: {err}")))?;
            diesel::sql_query("SELECT 1").execute(&mut conn).await?;
            Ok(())
        })
    }
}

/// Checkpoints stored as JSON in `export_checkpoints`, one row per pipeline.
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl CheckpointStore for PgCheckpointStore {
    fn load<'a>(&'a self, pipeline: &'a str) -> BoxFuture<'a, Result<Option<Position>, CheckpointError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await.map_err(|err| {
                CheckpointError::Unavailable(format!("failed to acquire DB connection: {err}"))
            })?;

            let row: Option<CheckpointRow> = export_checkpoints::table
                .filter(export_checkpoints::pipeline.eq(pipeline))
                .select(CheckpointRow::as_select())
                .first(&mut conn)
                .await
                .optional()?;

            row.map(|row| {
                serde_json::from_value(row.position).map_err(|err| CheckpointError::Corrupt {
                    pipeline: row.pipeline,
                    message: err.to_string(),
                })
            })
            .transpose()
        })
    }

    fn save<'a>(&'a self, pipeline: &'a str, position: &'a Position) -> BoxFuture<'a, Result<(), CheckpointError>> {
        Box::pin(async move {
            let encoded = serde_json::to_value(position).map_err(|err| CheckpointError::Corrupt {
                pipeline: pipeline.to_string(),
                message: err.to_string(),
            })?;

            let mut conn = self.pool.get().await.map_err(|err| {
                CheckpointError::Unavailable(format!("failed to acquire DB connection: {err}"))
            })?;

            diesel::insert_into(export_checkpoints::table)
                .values(NewCheckpoint {
                    pipeline,
                    position: encoded,
                })
                .on_conflict(export_checkpoints::pipeline)
                .do_update()
                .set((
                    export_checkpoints::position.eq(excluded(export_checkpoints::position)),
                    export_checkpoints::updated_at.eq(diesel::dsl::sql::<Timestamptz>("now()")),
                ))
                .execute(&mut conn)
                .await?;
            Ok(())
        })
    }
}
