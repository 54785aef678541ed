use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use refetch::config::FetchConfig;
use refetch::{FetchOptions, FetchStreamExt};
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;

use crate::workloads::{
    Event, FetchStats, Mode, Outcome, Workload, WorkloadsConfig, simulated_fetch,
};

/// What a single workload achieved.
struct Report {
    mode: Mode,
    concurrency: usize,
    events: usize,
    invocations: usize,
    failures: usize,
    last_failure: Option<String>,
    /// Age of every delivered value, from the start of its fetch until delivery.
    ages: DDSketch,
}

pub async fn perform_stresstest(
    fetch_config: FetchConfig,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.workloads.len());
    for (i, workload) in workloads.workloads.into_iter().enumerate() {
        let config = FetchConfig {
            name: format!("{}.{i}", fetch_config.name),
            ttl: workload.ttl.or(fetch_config.ttl),
            partition_idle_timeout: fetch_config.partition_idle_timeout,
        };

        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
        let transaction = hub.start_transaction(ctx);

        let future = async move {
            let report = run_workload(config, workload, duration).await;
            transaction.finish();
            report
        };
        tasks.push(tokio::spawn(future.bind_hub(hub)));
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let report = task.context("workload task failed")?;
        let Report {
            mode,
            concurrency,
            events,
            invocations,
            failures,
            last_failure,
            ages,
        } = report;

        let outputs = ages.count() + failures;
        let ops_ps = outputs as f32 / duration.as_secs_f32();
        println!(
            "Workload {i} ({mode}, concurrency: {concurrency}): {events} events, {outputs} outputs, \
             {invocations} fetches, {failures} failures, {ops_ps:.2} outputs/s"
        );
        if let Some(reason) = last_failure {
            println!("  last failure: {reason}");
        }

        if ages.count() == 0 {
            continue;
        }
        let quantile = |q| {
            let secs = ages.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let avg = Duration::from_secs_f64(ages.sum().unwrap_or_default() / ages.count() as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  value age avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    Ok(())
}

async fn run_workload(config: FetchConfig, workload: Workload, duration: Duration) -> Report {
    let stats = Arc::new(FetchStats::default());
    let (tx, rx) = mpsc::channel::<Event>(workload.concurrency * 16);

    let options = FetchOptions::new(
        simulated_fetch(&workload, Arc::clone(&stats)),
        Outcome::Fetched,
        Outcome::Failed,
    )
    .with_config(&config);
    let mut outputs = match workload.mode {
        Mode::Keyed => rx.fetch_with(options.key_of(|event| event.key)).boxed(),
        Mode::Serial => rx.fetch_with(options).boxed(),
    };

    let deadline = tokio::time::Instant::now() + duration;
    let producers: Vec<_> = (0..workload.concurrency)
        .map(|_| {
            let mut tx = tx.clone();
            let keys = workload.keys;
            let interval = workload.interval;
            tokio::spawn(async move {
                let mut sent: usize = 0;
                while tokio::time::Instant::now() < deadline {
                    let key = rand::rng().random_range(0..keys);
                    if tx.send(Event { key }).await.is_err() {
                        break;
                    }
                    sent += 1;
                    tokio::time::sleep(interval).await;
                }
                sent
            })
        })
        .collect();
    // the output stream ends once every producer is done
    drop(tx);

    let mut ages = DDSketch::default();
    let mut failures = 0;
    let mut last_failure = None;
    while let Some(outcome) = outputs.next().await {
        match outcome {
            Outcome::Fetched(fetched) => ages.add(fetched.started.elapsed().as_secs_f64()),
            Outcome::Failed(reason) => {
                failures += 1;
                last_failure = Some(reason);
            }
        }
    }

    let events = futures::future::join_all(producers)
        .await
        .into_iter()
        .map(|sent| sent.unwrap_or_default())
        .sum();

    Report {
        mode: workload.mode,
        concurrency: workload.concurrency,
        events,
        invocations: stats.invocations.load(Ordering::Relaxed),
        failures,
        last_failure,
        ages,
    }
}
