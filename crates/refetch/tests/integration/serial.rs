use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use refetch::{FetchOptions, FetchStreamExt, fetch_operator};
use tokio::time::{self, Instant};

use crate::{FetchCounter, Output, assert_around, collect_timed, ms, options, schedule, setup};

#[tokio::test]
async fn test_events_wait_for_previous_fetch() {
    setup();
    time::pause();

    let counter = FetchCounter::new();
    let origin = Instant::now();
    let input = schedule([(0, 1), (10, 2), (20, 3)]);

    let outputs = collect_timed(fetch_operator(input, options(counter.echo(ms(100)))), origin).await;

    let values: Vec<_> = outputs.iter().map(|(_, output)| output.clone()).collect();
    assert_eq!(values, vec![Ok(1), Ok(2), Ok(3)]);

    // each fetch only starts once the previous one delivered its output
    let starts = counter.starts();
    assert_eq!(starts.len(), 3);
    assert_around(starts[0], 0);
    assert_around(starts[1], 100);
    assert_around(starts[2], 200);

    assert_around(outputs[0].0, 100);
    assert_around(outputs[1].0, 200);
    assert_around(outputs[2].0, 300);
}

#[tokio::test]
async fn test_cached_value_serves_later_events() {
    setup();
    time::pause();

    let counter = FetchCounter::new();
    let origin = Instant::now();
    // the value is set at 100ms and expires at 1100ms
    let input = schedule([(0, 1), (150, 2), (1050, 3), (1200, 4)]);
    let options = options(counter.echo(ms(100))).ttl(Duration::from_secs(1));

    let outputs = collect_timed(input.fetch_with(options), origin).await;

    let values: Vec<_> = outputs.iter().map(|(_, output)| output.clone()).collect();
    assert_eq!(values, vec![Ok(1), Ok(1), Ok(1), Ok(4)]);
    assert_eq!(counter.invocations(), 2);

    // cache hits are delivered without delay
    assert_around(outputs[1].0, 150);
    assert_around(outputs[2].0, 1050);
    assert_around(outputs[3].0, 1300);
}

#[tokio::test]
async fn test_queued_events_reuse_fresh_value() {
    setup();
    time::pause();

    let counter = FetchCounter::new();
    let input = schedule([(0, "a"), (10, "b"), (20, "c")]);
    let options = options(counter.echo(ms(100))).ttl(Duration::from_secs(1));

    let outputs: Vec<_> = input.fetch_with(options).collect().await;

    // events queued behind the first fetch are evaluated after it stored its value
    assert_eq!(outputs, vec![Ok("a"), Ok("a"), Ok("a")]);
    assert_eq!(counter.invocations(), 1);
}

#[tokio::test]
async fn test_stream_completes_after_last_output() {
    setup();
    time::pause();

    let counter = FetchCounter::new();
    let mut outputs = schedule([(0, 1)]).fetch_with(options(counter.echo(ms(100))));

    assert_eq!(outputs.next().await, Some(Ok(1)));
    assert_eq!(outputs.next().await, None);
    assert_eq!(counter.completed(), 1);
}

#[tokio::test]
async fn test_failure_is_not_cached() {
    setup();
    time::pause();

    let counter = FetchCounter::new();
    let failed = Arc::new(AtomicBool::new(false));
    let fetch = counter.delayed(ms(100), move |n: u32| {
        if failed.swap(true, Ordering::SeqCst) {
            Ok(n)
        } else {
            Err("upstream unavailable".to_owned())
        }
    });
    let origin = Instant::now();
    let input = schedule([(0, 1), (10, 2), (20, 3)]);
    let options = options(fetch).ttl(Duration::from_secs(60));

    let outputs = collect_timed(input.fetch_with(options), origin).await;

    let values: Vec<_> = outputs.iter().map(|(_, output)| output.clone()).collect();
    assert_eq!(
        values,
        vec![Err("upstream unavailable".into()), Ok(2), Ok(2)]
    );
    // the queued event fetches again, the one behind it is served from the cache
    assert_eq!(counter.invocations(), 2);
    assert_around(outputs[0].0, 100);
    assert_around(outputs[1].0, 200);
    assert_around(outputs[2].0, 200);
}

#[tokio::test]
async fn test_rejection_does_not_stall_queue() {
    setup();
    time::pause();

    let counter = FetchCounter::new();
    let recorder = counter.clone();
    let options: FetchOptions<u32, (), u32, Output<u32>> = FetchOptions::try_new(
        move |n: u32| {
            recorder.record();
            if n > 100 {
                return Err(format!("{n} is out of range"));
            }
            Ok(async move {
                time::sleep(ms(100)).await;
                Ok::<_, String>(n)
            })
        },
        Ok,
        Err,
    );

    let origin = Instant::now();
    let input = schedule([(0, 1), (10, 500), (20, 2)]);
    let outputs = collect_timed(input.fetch_with(options), origin).await;

    let values: Vec<_> = outputs.iter().map(|(_, output)| output.clone()).collect();
    assert_eq!(values, vec![Ok(1), Err("500 is out of range".into()), Ok(2)]);
    assert_eq!(counter.invocations(), 3);

    // the rejected event is answered as soon as it is evaluated, the next one starts right away
    let starts = counter.starts();
    assert_around(starts[1], 100);
    assert_around(starts[2], 100);
    assert_around(outputs[1].0, 100);
    assert_around(outputs[2].0, 200);
}
