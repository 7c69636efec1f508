mod common;

use std::sync::Arc;

use common::{text, RoutedPolicy, TestEnv};
use shardpump::shard::policy::{BucketPolicy, LegacyPolicy, StatisticalPolicy};
use shardpump::{
    AssignmentPolicy, Error, MemoryRepository, PolicyKind, RequestError, ShardPhase, TransactionMode,
    WriterConfig,
};

#[test_log::test]
fn seven_documents_batch_three_commit_every_two_flushes() {
    let config = WriterConfig::new().with_batch_size(3).with_transaction_size(2);
    let mut env = TestEnv::new(1, config);
    assert_eq!(env.writer.transaction_mode(), TransactionMode::Update);

    for i in 0..7 {
        env.writer.write(format!("/doc-{}.xml", i), text("<d/>")).unwrap();
        let counters = env.repo.counters("forest-0");
        match i {
            2 => assert_eq!((counters.batch_inserts, counters.commits), (1, 0)),
            5 => assert_eq!((counters.batch_inserts, counters.commits), (2, 1)),
            _ => {}
        }
    }

    env.writer.close().unwrap();

    let counters = env.repo.counters("forest-0");
    assert_eq!(counters.batch_inserts, 3);
    assert_eq!(counters.commits, 2);
    assert_eq!(env.repo.committed("forest-0").len(), 7);

    let stats = env.writer.stats();
    assert_eq!(stats.flushes, 3);
    assert_eq!(stats.commits, 2);
    assert_eq!(stats.written, 7);
}

#[test_log::test]
fn rejected_single_insert_is_skipped_without_feedback() {
    let repo = MemoryRepository::with_shards(1);
    repo.reject_when(|uri| uri == "/broken.xml");
    let policy = Arc::new(StatisticalPolicy::new(1));
    let config = WriterConfig::new()
        .with_batch_size(1)
        .with_policy(PolicyKind::Statistical);
    let mut env = TestEnv::with_policy(repo, config, policy.clone());

    env.writer.write("/broken.xml", text("x")).unwrap();
    assert_eq!(policy.count(0), Some(0));

    env.writer.write("/fine-1.xml", text("x")).unwrap();
    env.writer.write("/fine-2.xml", text("x")).unwrap();
    assert_eq!(policy.count(0), Some(2));

    env.writer.close().unwrap();
    assert_eq!(env.writer.stats().failed, 1);
    assert_eq!(env.repo.committed_uris("forest-0"), vec!["/fine-1.xml", "/fine-2.xml"]);
}

#[test_log::test]
fn fatal_loss_on_one_shard_aborts_the_task() {
    let repo = MemoryRepository::with_shards(3);
    repo.lose_connection_after("forest-2", 1);
    let policy = Arc::new(RoutedPolicy::new(3));
    let config = WriterConfig::new().with_batch_size(3).with_transaction_size(10);
    let mut env = TestEnv::with_policy(repo, config, policy.clone());

    for i in 0..2 {
        env.writer.write(format!("/s0/a{}.txt", i), text("x")).unwrap();
        env.writer.write(format!("/s1/b{}.txt", i), text("x")).unwrap();
    }
    for i in 0..3 {
        env.writer.write(format!("/s2/c{}.txt", i), text("x")).unwrap();
    }
    assert_eq!(policy.count(2), 3);

    env.writer.write("/s2/c3.txt", text("x")).unwrap();
    env.writer.write("/s2/c4.txt", text("x")).unwrap();
    let err = env.writer.write("/s2/c5.txt", text("x")).unwrap_err();

    assert!(matches!(
        err,
        Error::Shard { ref shard, source: RequestError::ConnectionLost(_) } if shard == "forest-2"
    ));
    assert_eq!(policy.count(2), 0);
    assert_eq!(policy.count(0), 0);
    assert_eq!(policy.count(1), 0);

    let failed = env.writer.shard_status("forest-2").unwrap();
    assert_eq!(failed.phase, ShardPhase::Aborted);
    assert!(!failed.connection_open);
    for shard in ["forest-0", "forest-1"] {
        let status = env.writer.shard_status(shard).unwrap();
        assert_eq!(status.phase, ShardPhase::Buffering);
        assert_eq!(status.buffered, 2);
    }

    // abort is task-wide: buffered documents elsewhere are dropped too
    env.writer.abort();
    let stats = env.writer.stats();
    assert_eq!(stats.submitted, 10);
    assert_eq!(stats.discarded, 10);
    assert_eq!(env.repo.total_committed(), 0);
    assert_eq!(env.repo.open_connections(), 0);
}

#[test_log::test]
fn statistical_feedback_steers_away_from_loaded_shard() {
    fn placements(preload: bool) -> Vec<usize> {
        let repo = MemoryRepository::with_shards(3);
        let policy = Arc::new(StatisticalPolicy::new(3));
        if preload {
            policy.update(0, 100);
        }
        let config = WriterConfig::new()
            .with_batch_size(1)
            .with_transaction_size(1)
            .with_policy(PolicyKind::Statistical);
        let mut env = TestEnv::with_policy(repo, config, policy);

        for i in 0..5 {
            env.writer.write(format!("/doc-{}.txt", i), text("x")).unwrap();
        }
        env.writer.close().unwrap();

        (0..3).map(|s| env.repo.committed(&format!("forest-{}", s)).len()).collect()
    }

    let control = placements(false);
    let loaded = placements(true);

    assert!(control[0] > 0);
    assert_eq!(loaded[0], 0);
    assert_eq!(loaded.iter().sum::<usize>(), 5);
}

#[test_log::test]
fn rollback_restores_count_from_last_commit() {
    let repo = MemoryRepository::with_shards(2);
    repo.lose_connection_after("forest-0", 3);
    let policy = Arc::new(StatisticalPolicy::seeded(vec![0, 1000]));
    let config = WriterConfig::new()
        .with_batch_size(2)
        .with_transaction_size(2)
        .with_policy(PolicyKind::Statistical);
    let mut env = TestEnv::with_policy(repo, config, policy.clone());

    for i in 0..4 {
        env.writer.write(format!("/d{}.txt", i), text("x")).unwrap();
    }
    assert_eq!(env.repo.counters("forest-0").commits, 1);
    assert_eq!(policy.count(0), Some(4));

    env.writer.write("/d4.txt", text("x")).unwrap();
    env.writer.write("/d5.txt", text("x")).unwrap();
    assert_eq!(policy.count(0), Some(6));

    env.writer.write("/d6.txt", text("x")).unwrap();
    assert!(env.writer.write("/d7.txt", text("x")).is_err());

    assert_eq!(policy.count(0), Some(4));
    assert_eq!(policy.count(1), Some(1000));
    env.writer.abort();

    let stats = env.writer.stats();
    assert_eq!(stats.written, 4);
    assert_eq!(stats.discarded, 4);
    assert_eq!(env.repo.total_committed(), 4);
    assert_eq!(env.writer.metrics().snapshot().feedback_rollbacks, 1);
}

#[test_log::test]
fn partial_batch_failures_only_count_accepted_documents() {
    let repo = MemoryRepository::with_shards(1);
    repo.reject_when(|uri| uri.ends_with("-1.txt") || uri.ends_with("-3.txt"));
    let policy = Arc::new(StatisticalPolicy::new(1));
    let config = WriterConfig::new()
        .with_batch_size(4)
        .with_policy(PolicyKind::Statistical);
    let mut env = TestEnv::with_policy(repo, config, policy.clone());

    for i in 0..4 {
        env.writer.write(format!("/doc-{}.txt", i), text("x")).unwrap();
    }
    assert_eq!(policy.count(0), Some(2));

    env.writer.close().unwrap();
    let stats = env.writer.stats();
    assert_eq!(stats.written, 2);
    assert_eq!(stats.failed, 2);
}

#[test_log::test]
fn unreachable_shard_fails_on_first_use() {
    let repo = MemoryRepository::with_shards(2);
    repo.make_unreachable("forest-1");
    let policy = Arc::new(RoutedPolicy::new(2));
    let mut env = TestEnv::with_policy(repo, WriterConfig::new().with_batch_size(1), policy);

    env.writer.write("/s0/ok.txt", text("x")).unwrap();
    let err = env.writer.write("/s1/nope.txt", text("x")).unwrap_err();
    assert!(matches!(err, Error::Shard { source: RequestError::Connectivity(_), .. }));

    env.writer.abort();
    assert_eq!(env.writer.stats().discarded, 2);
}

#[test_log::test]
fn deterministic_policies_place_reruns_identically() {
    let uris: Vec<String> = (0..200).map(|i| format!("/catalog/item-{}.json", i)).collect();

    for kind in [PolicyKind::Legacy, PolicyKind::Bucket] {
        let run = || {
            let mut env = TestEnv::new(5, WriterConfig::new().with_batch_size(7).with_policy(kind));
            for uri in &uris {
                env.writer.write(uri.as_str(), text("{}")).unwrap();
            }
            env.writer.close().unwrap();
            uris.iter()
                .map(|uri| env.repo.document(uri).map(|(shard, _)| shard))
                .collect::<Vec<_>>()
        };

        let first = run();
        assert!(first.iter().all(Option::is_some));
        assert_eq!(first, run());
    }

    let legacy = LegacyPolicy::new(5);
    let bucket = BucketPolicy::new(5);
    assert_eq!(legacy.shard_count(), bucket.shard_count());
}

#[test_log::test]
fn close_is_idempotent_and_ends_the_writer() {
    let mut env = TestEnv::new(2, WriterConfig::new().with_batch_size(10));
    for i in 0..15 {
        env.writer.write(format!("/d{}.txt", i), text("x")).unwrap();
    }

    env.writer.close().unwrap();
    env.writer.close().unwrap();
    assert!(env.writer.is_finished());
    assert_eq!(env.repo.total_committed(), 15);
    assert!(env.writer.write("/late.txt", text("x")).is_err());
}
