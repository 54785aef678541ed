use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use refetch::{FetchOptions, FetchStreamExt};
use tokio::time::{self, Instant};

use crate::{FetchCounter, Output, assert_around, collect_timed, ms, options, schedule, setup};

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
    let input = schedule([(0, 1), (200, 1), (350, 1)]);
    let options = options(fetch).key_of(|n| *n).ttl(Duration::from_secs(60));

    let outputs: Vec<_> = input.fetch_with(options).collect().await;

    assert_eq!(
        outputs,
        vec![Err("upstream unavailable".into()), Ok(1), Ok(1)]
    );
    // the failure did not stick, the success did
    assert_eq!(counter.invocations(), 2);
}

#[tokio::test]
async fn test_coalesced_events_share_failure() {
    setup();
    time::pause();

    let counter = FetchCounter::new();
    let fetch = counter.delayed(ms(100), |_: &'static str| Err::<u32, _>("boom".into()));
    let origin = Instant::now();
    let input = schedule([(0, "a"), (50, "a"), (200, "a")]);
    let options = options(fetch).key_of(|key| *key);

    let outputs = collect_timed(input.fetch_with(options), origin).await;

    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0].1, Err("boom".into()));
    assert_around(outputs[0].0, 100);
    assert_eq!(outputs[1].1, Err("boom".into()));
    assert_around(outputs[1].0, 300);
    assert_eq!(counter.invocations(), 2);
}

#[tokio::test]
async fn test_rejection_is_immediate() {
    setup();
    time::pause();

    let counter = FetchCounter::new();
    let recorder = counter.clone();
    let options: FetchOptions<u32, u32, u32, Output<u32>> = FetchOptions::try_new(
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
    )
    .key_of(|n| *n);

    let origin = Instant::now();
    let input = schedule([(0, 1), (10, 500), (20, 2)]);
    let outputs = collect_timed(input.fetch_with(options), origin).await;

    assert_eq!(outputs.len(), 3);
    assert_eq!(outputs[0].1, Err("500 is out of range".into()));
    assert_around(outputs[0].0, 10);
    assert_eq!(outputs[1].1, Ok(1));
    assert_eq!(outputs[2].1, Ok(2));
    assert_eq!(counter.invocations(), 3);
}

#[tokio::test]
async fn test_panics_become_errors() {
    setup();
    time::pause();

    let options = options(|n: u32| async move {
        time::sleep(ms(10)).await;
        if n % 2 == 0 {
            panic!("cannot fetch {n}");
        }
        Ok::<_, String>(n)
    })
    .key_of(|n| *n);

    let input = schedule([(0, 1), (0, 2), (0, 3)]);
    let mut outputs: Vec<_> = input.fetch_with(options).collect().await;
    outputs.sort();

    assert_eq!(
        outputs,
        vec![Ok(1), Ok(3), Err("cannot fetch 2".into())]
    );
}

#[tokio::test]
async fn test_failing_key_does_not_affect_others() {
    setup();
    time::pause();

    let counter = FetchCounter::new();
    let fetch = counter.delayed(ms(100), |key: &'static str| match key {
        "bad" => Err(format!("{key} failed")),
        _ => Ok(key.len()),
    });
    let input = schedule([(0, "bad"), (0, "good"), (150, "good"), (150, "bad")]);
    let options = options(fetch).key_of(|key| *key).ttl(Duration::from_secs(60));

    let outputs: Vec<_> = input.fetch_with(options).collect().await;

    assert_eq!(outputs.len(), 4);
    assert_eq!(outputs.iter().filter(|output| output.is_err()).count(), 2);
    // `good` is served from its cache, `bad` is fetched again
    assert_eq!(counter.invocations(), 3);
}
