use std::time::Duration;

use futures::StreamExt;
use refetch::FetchStreamExt;
use tokio::time::{self, Instant};

use crate::{FetchCounter, assert_around, collect_timed, ms, options, schedule, setup};

#[tokio::test]
async fn test_latest_event_wins() {
    setup();
    time::pause();

    let counter = FetchCounter::new();
    let origin = Instant::now();
    let input = schedule([(0, "a"), (0, "a"), (0, "a"), (310, "a"), (310, "a")]);
    let options = options(counter.echo(ms(300))).key_of(|key| *key);

    let outputs = collect_timed(input.fetch_with(options), origin).await;

    assert_eq!(outputs.len(), 2);
    assert_eq!(counter.invocations(), 2);
    assert_around(outputs[0].0, 300);
    assert_around(outputs[1].0, 610);
}

#[tokio::test]
async fn test_pending_fetch_is_shared() {
    setup();
    time::pause();

    let counter = FetchCounter::new();
    let origin = Instant::now();
    let input = schedule([(0, 7), (50, 7), (100, 7)]);
    let options = options(counter.echo(ms(200))).key_of(|key| *key);

    let outputs = collect_timed(input.fetch_with(options), origin).await;

    // switching to the same computation does not restart it
    assert_eq!(counter.invocations(), 1);
    assert_eq!(counter.completed(), 1);
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].1, Ok(7));
    assert_around(outputs[0].0, 200);
}

#[tokio::test]
async fn test_keys_do_not_block_each_other() {
    setup();
    time::pause();

    let counter = FetchCounter::new();
    let origin = Instant::now();
    let input = schedule([(0, ("slow", 1000)), (10, ("fast", 100)), (20, ("fast", 100))]);

    let recorder = counter.clone();
    let fetch = move |(key, latency): (&'static str, u64)| {
        recorder.record();
        async move {
            time::sleep(ms(latency)).await;
            Ok::<_, String>(key)
        }
    };
    let options = options(fetch).key_of(|(key, _)| *key);

    let outputs = collect_timed(input.fetch_with(options), origin).await;

    assert_eq!(counter.invocations(), 2);
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0].1, Ok("fast"));
    assert_around(outputs[0].0, 110);
    assert_eq!(outputs[1].1, Ok("slow"));
    assert_around(outputs[1].0, 1000);
}

#[tokio::test]
async fn test_concurrent_keys_each_fetch_once() {
    setup();
    time::pause();

    let counter = FetchCounter::new();
    let input = schedule((0..30).map(|i| (i, i % 3)));
    let options = options(counter.delayed(ms(500), |key: u64| Ok(key * 100))).key_of(|key| *key);

    let mut outputs: Vec<_> = input.fetch_with(options).collect().await;
    outputs.sort();

    assert_eq!(outputs, vec![Ok(0), Ok(100), Ok(200)]);
    assert_eq!(counter.invocations(), 3);
}

#[tokio::test]
async fn test_partitions_survive_without_idle_timeout() {
    setup();
    time::pause();

    let counter = FetchCounter::new();
    let input = schedule([(0, 1), (0, 2), (60_000, 1), (60_000, 2)]);
    let options = options(counter.echo(ms(10)))
        .key_of(|key| *key)
        .ttl(Duration::from_secs(3600));

    let outputs: Vec<_> = input.fetch_with(options).collect().await;

    assert_eq!(outputs.len(), 4);
    assert_eq!(counter.invocations(), 2);
}

#[tokio::test]
async fn test_latest_event_wins_at_completion() {
    setup();
    time::pause();

    let counter = FetchCounter::new();
    let origin = Instant::now();
    // the second burst arrives exactly when the first fetch completes
    let input = schedule([
        (0, ("k", 1)),
        (0, ("k", 1)),
        (0, ("k", 1)),
        (300, ("k", 2)),
        (300, ("k", 2)),
    ]);
    let options = options(counter.echo(ms(300))).key_of(|(key, _)| *key);

    let outputs = collect_timed(input.fetch_with(options), origin).await;

    assert_eq!(outputs.len(), 2);
    assert_eq!(counter.invocations(), 2);
    assert_eq!(outputs[0].1, Ok(("k", 1)));
    assert_around(outputs[0].0, 300);
    assert_eq!(outputs[1].1, Ok(("k", 2)));
    assert_around(outputs[1].0, 600);
}

#[tokio::test]
async fn test_completions_are_delivered_before_new_events() {
    setup();
    time::pause();

    let counter = FetchCounter::new();
    let origin = Instant::now();
    let input = schedule([(0, "b"), (0, "a"), (100, "a")]);
    let options = options(counter.echo(ms(100)))
        .key_of(|key| *key)
        .ttl(Duration::from_secs(10));

    let outputs = collect_timed(input.fetch_with(options), origin).await;

    let mut values: Vec<_> = outputs.iter().map(|(_, output)| output.clone()).collect();
    values.sort();
    // `a` completes at the instant its next event arrives, which is then served from the cache
    assert_eq!(values, vec![Ok("a"), Ok("a"), Ok("b")]);
    assert_eq!(counter.invocations(), 2);
    for (offset, _) in outputs {
        assert_around(offset, 100);
    }
}

#[tokio::test]
async fn test_idle_timeout_keeps_pending_partitions() {
    setup();

    // partition eviction runs on the wall clock
    let counter = FetchCounter::new();
    let input = schedule([(0, 1), (120, 1)]);
    let options = options(counter.echo(ms(300)))
        .key_of(|key| *key)
        .partition_idle_timeout(ms(50));

    let outputs: Vec<_> = input.fetch_with(options).collect().await;

    assert_eq!(outputs, vec![Ok(1)]);
    assert_eq!(counter.invocations(), 1);
}
