use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use quartermaster::prelude::*;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePoolOptions;

struct JobTiming {
    queue_millis: i64,
    job_id: i64,
}

#[derive(Serialize, Deserialize)]
struct BenchPayload {
    enqueued_at_millis: i64,
}

impl Default for BenchPayload {
    fn default() -> Self {
        Self {
            enqueued_at_millis: Utc::now().timestamp_millis(),
        }
    }
}

async fn make_queue(tx: UnboundedSender<JobTiming>, processed: Arc<AtomicUsize>) -> JobQueue {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .unwrap();

    let mut cfg = Config::new(pool);
    cfg.poll_interval = Duration::from_millis(50);
    cfg.backoff_time = Duration::from_secs(1);
    cfg.retry_count = 1;
    // Keep the bench output readable: drop info events, keep errors.
    cfg.info_log = Some(Arc::new(|_ev| {}));

    let queue = JobQueue::new(cfg);
    queue.ensure_schema().await.unwrap();

    queue
        .register_handler("bench", move |job: JobRecord| {
            let tx = tx.clone();
            let processed = processed.clone();
            async move {
                processed.fetch_add(1, Ordering::SeqCst);
                let payload: BenchPayload = job.decode_payload()?;
                let queue_millis = Utc::now().timestamp_millis() - payload.enqueued_at_millis;
                tx.unbounded_send(JobTiming {
                    queue_millis,
                    job_id: job.id,
                })
                .map_err(|_| anyhow::anyhow!("failed to send results"))?;
                Ok(None)
            }
        })
        .unwrap();

    queue
}

async fn enqueue_jobs(queue: Arc<JobQueue>, count: usize, interval: Duration) {
    let mut delay = tokio::time::interval(interval);
    for _ in 0..count {
        delay.tick().await;
        if let Err(e) = queue.enqueue_now("bench", &BenchPayload::default()).await {
            eprintln!("Failed to enqueue job: {e}");
        }
    }
}

#[tokio::main]
async fn main() {
    let count = std::env::args()
        .nth(1)
        .map(|c| usize::from_str(&c).unwrap())
        .unwrap_or(10_000);
    let workers = std::env::args()
        .nth(2)
        .map(|c| usize::from_str(&c).unwrap())
        .unwrap_or(8);
    let interval_nanos = std::env::args()
        .nth(3)
        .map(|c| u64::from_str(&c).unwrap())
        .unwrap_or(700_000);

    let (tx, rx) = unbounded::<JobTiming>();
    let processed = Arc::new(AtomicUsize::new(0));
    let queue = Arc::new(make_queue(tx, processed.clone()).await);

    let started = Instant::now();
    queue.start_workers(workers);

    let _enqueuer = {
        let queue = queue.clone();
        let interval = Duration::from_nanos(interval_nanos);
        tokio::spawn(async move {
            enqueue_jobs(queue, count, interval).await;
        })
    };

    let mut results = rx
        .take(count.try_into().unwrap())
        .collect::<Vec<JobTiming>>()
        .await;
    let total_duration = started.elapsed();

    let mut seen = std::collections::HashSet::new();
    let duplicates = results
        .iter()
        .filter(|timing| !seen.insert(timing.job_id))
        .count();
    if duplicates > 0 {
        eprintln!("{duplicates} jobs were executed more than once");
    }

    results.sort_by_key(|timing| timing.queue_millis);
    let throughput = count as f64 / total_duration.as_secs_f64();
    println!("Processed: {} jobs", processed.load(Ordering::SeqCst));
    println!("min: {}ms", results[0].queue_millis);
    println!("max: {}ms", results[count - 1].queue_millis);
    println!("median: {}ms", results[count / 2].queue_millis);
    println!("95th percentile: {}ms", results[(count * 19) / 20].queue_millis);
    println!("throughput: {throughput:.0}/s");

    queue.shutdown(Duration::from_secs(5)).await;
}
