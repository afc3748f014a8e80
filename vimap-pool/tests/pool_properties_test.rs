//! End-to-end behaviour of the pool with in-process workers

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use serde_json::{json, Value as JsonValue};
use vimap_pool::{
    from_fn, try_from_fn, Inputs, OutputIter, Pool, PoolConfig, PoolError, TaskLauncher,
    Transform, TransformError, TransformRegistry, WorkerSpec,
};

/// Emits every value twice
struct Duplicate;

impl Transform for Duplicate {
    fn run<'a>(&'a mut self, inputs: Inputs<'a>) -> OutputIter<'a> {
        Box::new(inputs.flat_map(|v| vec![Ok::<_, TransformError>(v.clone()), Ok(v)]))
    }
}

/// Answers every item with its identifier
struct EchoId;

impl Transform for EchoId {
    fn run<'a>(&'a mut self, mut inputs: Inputs<'a>) -> OutputIter<'a> {
        Box::new(std::iter::from_fn(move || {
            inputs.next()?;
            Some(Ok(json!(inputs.current_id())))
        }))
    }
}

fn registry() -> TransformRegistry {
    let mut registry = TransformRegistry::new();
    registry
        .register("identity", |_| Ok(from_fn(|x: JsonValue| x)))
        .register("fail-on-third", |_| {
            let mut seen = 0;
            Ok(try_from_fn(move |x: i64| {
                seen += 1;
                if seen == 3 {
                    Err("third item")
                } else {
                    Ok(x)
                }
            }))
        })
        .register("fail-init", |_| -> Result<Duplicate, TransformError> {
            Err(TransformError::new("refusing to start"))
        })
        .register("duplicate", |_| Ok(Duplicate))
        .register("echo-id", |_| Ok(EchoId));
    registry
}

fn launcher() -> Arc<TaskLauncher> {
    Arc::new(TaskLauncher::new(registry()))
}

fn config() -> PoolConfig {
    PoolConfig {
        result_poll_interval: Duration::from_millis(20),
        join_timeout: Some(Duration::from_secs(10)),
        ..PoolConfig::default()
    }
}

async fn forked<O: serde::de::DeserializeOwned>(specs: Vec<WorkerSpec>) -> Pool<i64, O> {
    Pool::forked(specs, launcher(), config()).await.unwrap()
}

fn workers(name: &str, n: usize) -> Vec<WorkerSpec> {
    vec![WorkerSpec::new(name); n]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_identity_two_workers() {
    let mut pool = forked::<i64>(workers("identity", 2)).await;
    pool.imap(vec![1, 2, 3, 4, 5]).unwrap();

    let mut pairs = pool.zip_in_out().collect().await.unwrap();
    pairs.sort();

    assert_eq!(pairs, vec![(1, 1), (2, 2), (3, 3), (4, 4), (5, 5)]);
    assert!(pool.is_finished());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_every_input_returned_once() {
    let mut pool = forked::<i64>(workers("identity", 4)).await;
    pool.imap(0..200).unwrap();

    let pairs = pool.zip_in_out().collect().await.unwrap();
    let originals: HashSet<_> = pairs.iter().map(|(input, _)| *input).collect();

    assert_eq!(pairs.len(), 200);
    assert_eq!(originals.len(), 200);
    assert!(pairs.iter().all(|(input, output)| input == output));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failure_on_third_item() {
    let mut pool = forked::<i64>(workers("fail-on-third", 1)).await;
    pool.imap(vec![1, 2, 3, 4, 5]).unwrap();

    let pairs = tokio::time::timeout(Duration::from_secs(10), pool.zip_in_out().collect())
        .await
        .expect("pool did not terminate")
        .unwrap();

    assert_eq!(pairs, vec![(1, 1), (2, 2)]);
    assert!(pool.is_finished());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failure_before_first_item() {
    let specs = vec![WorkerSpec::new("fail-init"), WorkerSpec::new("identity")];
    let mut pool = forked::<i64>(specs).await;
    pool.imap(vec![10, 20, 30, 40]).unwrap();

    let mut pairs = pool.zip_in_out().collect().await.unwrap();
    pairs.sort();

    assert_eq!(pairs, vec![(10, 10), (20, 20), (30, 30), (40, 40)]);
    let stats = pool.stats();
    assert_eq!(stats.sent, 4);
    assert_eq!(stats.received, 5);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_double_output_is_not_yielded_twice() {
    let mut pool = forked::<i64>(workers("duplicate", 1)).await;
    pool.imap(vec![7, 8, 9]).unwrap();

    let pairs = tokio::time::timeout(Duration::from_secs(10), pool.zip_in_out().collect())
        .await
        .expect("pool did not terminate")
        .unwrap();

    assert_eq!(pairs, vec![(7, 7)]);
    // one output plus the violation
    assert_eq!(pool.stats().received, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_finish_is_idempotent() {
    let mut pool = forked::<i64>(workers("identity", 3)).await;

    pool.finish().await.unwrap();
    pool.finish().await.unwrap();

    let stats = pool.stats();
    assert_eq!(stats.sentinel_broadcasts, 1);
    assert!(stats.finished);
    assert!(matches!(pool.imap(vec![1]), Err(PoolError::PoolFinished)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ids_increase_across_registrations() {
    let mut pool: Pool<i64, u64> = Pool::forked(
        workers("echo-id", 1),
        launcher(),
        PoolConfig {
            close_if_done: false,
            ..config()
        },
    )
    .await
    .unwrap();

    pool.imap(vec![100, 101]).unwrap();
    let mut first = pool.zip_in_out().collect().await.unwrap();
    assert!(!pool.is_finished());

    pool.map(vec![102, 103]).unwrap().imap(vec![104]).unwrap();
    let mut second = pool.zip_in_out().collect().await.unwrap();
    pool.finish().await.unwrap();

    first.sort();
    second.sort();
    assert_eq!(first, vec![(100, 0), (101, 1)]);
    assert_eq!(second, vec![(102, 2), (103, 3), (104, 4)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_in_flight_counter_tracks_messages() {
    let mut pool = forked::<i64>(workers("identity", 2)).await;
    pool.imap(0..50).unwrap();

    let mut zip = pool.zip_in_out_keep_alive();
    let mut yielded = 0;
    while zip.next().await.unwrap().is_some() {
        yielded += 1;
    }
    drop(zip);

    let stats = pool.stats();
    assert_eq!(yielded, 50);
    assert_eq!(stats.in_flight, stats.sent - stats.received);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.issued, 50);

    pool.finish().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_spool_without_depth_query() {
    let mut pool: Pool<i64, i64> = Pool::forked(
        workers("identity", 2),
        launcher(),
        PoolConfig {
            query_input_depth: false,
            ..config()
        },
    )
    .await
    .unwrap();

    pool.imap(0..20).unwrap();
    assert!(pool.stats().sent <= 4);

    let pairs = pool.zip_in_out().collect().await.unwrap();
    assert_eq!(pairs.len(), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stream_of_pairs() {
    let mut pool = forked::<String>(workers("identity", 2)).await;
    pool.imap_pretransformed((0..5).map(|i| (i, format!("item-{}", i))))
        .unwrap();

    let mut pairs: Vec<(i64, String)> = pool.zip_in_out().into_stream().try_collect().await.unwrap();
    pairs.sort();

    assert_eq!(pairs[0], (0, "item-0".to_string()));
    assert_eq!(pairs.len(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_input_finishes() {
    let mut pool = forked::<i64>(workers("identity", 2)).await;
    pool.imap(Vec::<i64>::new()).unwrap();

    let pairs = pool.zip_in_out().collect().await.unwrap();
    assert!(pairs.is_empty());
    assert!(pool.is_finished());
}

#[tokio::test]
async fn test_zip_before_fork() {
    let mut pool: Pool<i64> = Pool::unlabeled(WorkerSpec::new("identity"), Some(2), launcher(), config());
    let result = pool.zip_in_out().next().await;
    assert!(matches!(result, Err(PoolError::NotForked)));
}
