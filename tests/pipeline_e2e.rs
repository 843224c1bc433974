mod support;

use std::time::Duration;

use chain_exporter_lib::pipeline::exporter::memory::{MemoryCheckpointStore, MemoryLogSink};
use chain_exporter_lib::pipeline::exporter::{CheckpointError, ExportError};
use chain_exporter_lib::pipeline::scheduler::SchedulerError;
use chain_exporter_lib::pipeline::types::Position;
use chain_exporter_lib::pipeline::Error;
use support::{pipeline, topics, ScriptedChain, PIPELINE};
use tokio_util::sync::CancellationToken;

async fn wait_for_checkpoint(store: &MemoryCheckpointStore, block: i64) {
    while store
        .position(PIPELINE)
        .map_or(true, |position| position.block_number < block)
    {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn exported_blocks(sink: &MemoryLogSink) -> Vec<i64> {
    sink.committed(&topics().blocks)
        .iter()
        .map(|keyed| keyed.record.block_number)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn catch_up_hands_off_to_live_following() {
    let chain = ScriptedChain::with_head(52);
    let sink = MemoryLogSink::new(topics());
    let store = MemoryCheckpointStore::default();
    let shutdown = CancellationToken::new();
    let force = CancellationToken::new();

    let run = tokio::spawn(
        pipeline(chain.clone(), sink.clone(), store.clone(), 10).run(shutdown.clone(), force),
    );

    // Head 52 with depth 2: historic ranges up to block 50.
    wait_for_checkpoint(&store, 50).await;
    assert_eq!(exported_blocks(&sink), (0..=50).collect::<Vec<_>>());

    for head in [55, 61, 64] {
        chain.set_head(head);
        wait_for_checkpoint(&store, head - 2).await;
    }

    shutdown.cancel();
    let summary = run.await.expect("join").expect("clean stop");

    assert_eq!(summary.start_position, Position::new(-1, 0));
    assert_eq!(summary.last_position, Position::new(62, 63));
    assert_eq!(summary.exported_records, 63);
    assert_eq!(exported_blocks(&sink), (0..=62).collect::<Vec<_>>());
    assert_eq!(sink.committed_keys(), (1..=63).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn restart_after_lost_checkpoint_re_emits_under_same_keys() {
    let chain = ScriptedChain::with_head(22);
    let sink = MemoryLogSink::new(topics());
    let store = MemoryCheckpointStore::default();

    // First run exports up to block 20 and stops cleanly.
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(
        pipeline(chain.clone(), sink.clone(), store.clone(), 5)
            .run(shutdown.clone(), CancellationToken::new()),
    );
    wait_for_checkpoint(&store, 20).await;
    shutdown.cancel();
    let first = run.await.expect("join").expect("clean stop");
    assert_eq!(first.last_position, Position::new(20, 21));

    // Second run commits its next batch but crashes before the checkpoint lands.
    chain.set_head(42);
    store.fail_next_save("checkpoint store went away");
    let err = pipeline(chain.clone(), sink.clone(), store.clone(), 5)
        .run(CancellationToken::new(), CancellationToken::new())
        .await
        .expect_err("checkpoint failure is fatal");
    assert!(matches!(
        err,
        Error::Export(ExportError::Checkpoint(CheckpointError::Unavailable(_)))
    ));
    assert_eq!(store.position(PIPELINE), Some(Position::new(20, 21)));
    let committed_before_restart = sink.committed_keys();
    assert!(committed_before_restart.len() > 21, "the lost batch reached the sink");

    // Third run resumes from block 21 and overwrites the re-emitted batch in place.
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(
        pipeline(chain.clone(), sink.clone(), store.clone(), 5)
            .run(shutdown.clone(), CancellationToken::new()),
    );
    wait_for_checkpoint(&store, 40).await;
    shutdown.cancel();
    let third = run.await.expect("join").expect("clean stop");

    assert_eq!(third.start_position, Position::new(20, 21));
    assert_eq!(third.last_position, Position::new(40, 41));
    assert_eq!(sink.committed_keys(), (1..=41).collect::<Vec<_>>());
    for keyed in sink.committed(&topics().blocks) {
        assert_eq!(keyed.primary_key, keyed.record.block_number + 1);
    }
}

#[tokio::test(start_paused = true)]
async fn failed_range_stops_after_exporting_the_ordered_prefix() {
    let chain = ScriptedChain::with_head(100);
    chain.fail_range_starting_at(30, "block body missing transactions");
    let sink = MemoryLogSink::new(topics());
    let store = MemoryCheckpointStore::default();

    let err = pipeline(chain, sink.clone(), store.clone(), 10)
        .run(CancellationToken::new(), CancellationToken::new())
        .await
        .expect_err("failed range is fatal");

    match err {
        Error::Scheduler(SchedulerError::TaskFailed { range, .. }) => {
            assert_eq!((range.from_block, range.to_block), (30, 39));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(exported_blocks(&sink), (0..=29).collect::<Vec<_>>());
    assert_eq!(store.position(PIPELINE), Some(Position::new(29, 30)));
}
