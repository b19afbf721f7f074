//! Eventscope Scan Benchmark
//!
//! Seeds the in-memory store with partitioned streams, runs concurrent range
//! scans through the service with a deliberately slow consumer, and checks the
//! scan invariants on everything it reads.
//! Run with: `cargo run --bin scan_bench -- [OPTIONS]`
//!
//! # Examples
//!
//! ```bash
//! # Default run: 20 streams of 2000 events, partition size 100
//! cargo run --release --bin scan_bench
//!
//! # Small pages, slow consumer, batches that overshoot partition boundaries
//! cargo run --release --bin scan_bench -- --page-size 7 --delay-us 50 --overshoot
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

use eventscope::store::memory::EventRecord;
use eventscope::{
    CodecRegistry, EventStoreService, EventTableConfig, JsonCodec, MemoryStore, ScanConfig,
    StoreSession, TableConfig, TableConfigs,
};

const TABLE: &str = "messages";

/// Benchmark configuration
struct Config {
    /// Number of persistence ids to seed and scan
    num_streams: usize,
    /// Events per persistence id
    events_per_stream: u64,
    /// Sequence numbers per partition
    partition_size: u64,
    /// Rows per store page
    page_size: usize,
    /// Scan channel capacity
    channel_capacity: usize,
    /// Consumer delay per entity, in microseconds
    delay_us: u64,
    /// Write the first row of every partition into the previous partition
    overshoot: bool,
    /// RNG seed for ranges and payload sizes
    seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_streams: 20,
            events_per_stream: 2000,
            partition_size: 100,
            page_size: 50,
            channel_capacity: 64,
            delay_us: 0,
            overshoot: false,
            seed: 42,
        }
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--streams" | "-s" => {
                i += 1;
                config.num_streams = args[i].parse().expect("Invalid --streams value");
            }
            "--events" | "-e" => {
                i += 1;
                config.events_per_stream = args[i].parse().expect("Invalid --events value");
            }
            "--partition-size" | "-p" => {
                i += 1;
                config.partition_size = args[i].parse().expect("Invalid --partition-size value");
            }
            "--page-size" => {
                i += 1;
                config.page_size = args[i].parse().expect("Invalid --page-size value");
            }
            "--capacity" | "-c" => {
                i += 1;
                config.channel_capacity = args[i].parse().expect("Invalid --capacity value");
            }
            "--delay-us" => {
                i += 1;
                config.delay_us = args[i].parse().expect("Invalid --delay-us value");
            }
            "--overshoot" => {
                config.overshoot = true;
            }
            "--seed" => {
                i += 1;
                config.seed = args[i].parse().expect("Invalid --seed value");
            }
            "--help" | "-h" => {
                println!(
                    r#"Eventscope Scan Benchmark

Usage: scan_bench [OPTIONS]

Options:
  -s, --streams <N>         Persistence ids to scan (default: 20)
  -e, --events <N>          Events per persistence id (default: 2000)
  -p, --partition-size <N>  Sequence numbers per partition (default: 100)
      --page-size <N>       Rows per store page (default: 50)
  -c, --capacity <N>        Scan channel capacity (default: 64)
      --delay-us <N>        Consumer delay per entity (default: 0)
      --overshoot           Put each partition's first row in the previous partition
      --seed <N>            RNG seed (default: 42)
  -h, --help                Show this help
"#
                );
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

fn seed_store(store: &MemoryStore, config: &Config, rng: &mut StdRng) {
    let size = config.partition_size as i64;
    for stream in 0..config.num_streams {
        let pid = format!("stream-{}", stream);
        for seq in 1..=config.events_per_stream as i64 {
            let mut partition = (seq - 1) / size;
            if config.overshoot && partition > 0 && (seq - 1) % size == 0 {
                partition -= 1;
            }
            let padding = "x".repeat(rng.gen_range(0..256));
            let event = serde_json::json!({ "n": seq, "pad": padding });
            store.insert_event(
                TABLE,
                EventRecord::new(pid.clone(), partition, seq, event.to_string().into_bytes()),
            );
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = parse_args();

    println!("Eventscope Scan Benchmark");
    println!("=========================");
    println!("Streams:        {}", config.num_streams);
    println!("Events/stream:  {}", config.events_per_stream);
    println!("Partition size: {}", config.partition_size);
    println!("Page size:      {}", config.page_size);
    println!("Capacity:       {}", config.channel_capacity);
    println!("Consumer delay: {}us", config.delay_us);
    println!("Overshoot:      {}", config.overshoot);
    println!();

    let mut rng = StdRng::seed_from_u64(config.seed);
    let store = Arc::new(MemoryStore::new().with_page_size(config.page_size));
    seed_store(&store, &config, &mut rng);

    let event_table = EventTableConfig::new(TABLE, "json", config.partition_size);
    let table = TableConfig::Event(event_table.clone());
    let service = EventStoreService::new(
        Arc::clone(&store),
        TableConfigs {
            messages: vec![event_table],
            snapshots: vec![],
        },
        CodecRegistry::new().with("json", JsonCodec::new()),
        ScanConfig {
            channel_capacity: config.channel_capacity,
        },
    )
    .expect("build service");

    println!("Starting scans...");
    let start = Instant::now();

    let mut handles = Vec::new();
    for stream in 0..config.num_streams {
        let from = rng.gen_range(1..=config.events_per_stream);
        let to = rng.gen_range(from..=config.events_per_stream);
        let service = service.clone();
        let table = table.clone();
        let delay = Duration::from_micros(config.delay_us);
        let capacity = config.channel_capacity;

        handles.push(tokio::spawn(async move {
            let mut rows = service
                .select(format!("stream-{}", stream), from, to, &table)
                .expect("start scan");
            let mut expected = from;
            let mut max_buffered = 0;
            while let Some(row) = rows.recv().await {
                let entity = row.expect("scan failed");
                assert_eq!(
                    entity.seq_nr().as_raw(),
                    expected,
                    "stream-{}: out of order or out of range",
                    stream
                );
                expected += 1;
                max_buffered = max_buffered.max(rows.buffered());
                assert!(max_buffered <= capacity, "channel exceeded its capacity");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            assert_eq!(expected, to + 1, "stream-{}: scan ended early", stream);
            (to - from + 1, max_buffered)
        }));
    }

    let mut total_rows = 0;
    let mut max_buffered = 0;
    for handle in handles {
        let (rows, buffered) = handle.await.unwrap();
        total_rows += rows;
        max_buffered = max_buffered.max(buffered);
    }
    let elapsed = start.elapsed();

    println!();
    println!("Results");
    println!("-------");
    println!("Rows read:       {}", total_rows);
    println!("First pages:     {}", store.query_calls());
    println!("Fetch-more:      {}", store.fetch_more_calls());
    println!("Rows served:     {}", store.rows_served());
    println!("Max buffered:    {}", max_buffered);
    println!("Duration:        {:?}", elapsed);
    println!(
        "Throughput:      {:.2} rows/sec",
        total_rows as f64 / elapsed.as_secs_f64()
    );
    println!();

    println!("Verifying invariants...");
    println!("  Ordering and range:  every scan in order, no gaps ✓");
    println!("  Backpressure:        buffered <= {} ✓", config.channel_capacity);

    // A cancelled scan stops paging.
    let mut rows = service
        .select("stream-0", 1, config.events_per_stream, &table)
        .expect("start scan");
    for _ in 0..config.events_per_stream.min(10) {
        rows.recv().await.expect("row").expect("scan failed");
    }
    rows.cancel();
    // The producer may be mid-page on another worker when the abort lands.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let fetches = store.fetch_more_calls();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rows.recv().await.is_none(), "cancelled scan kept yielding");
    assert_eq!(store.fetch_more_calls(), fetches, "cancelled scan kept fetching");
    println!("  Cancellation:        no fetches after cancel ✓");

    service.close().await.expect("close service");
    assert!(store.prepare(&eventscope::schema::Statement::for_table(
        &table,
        eventscope::schema::StatementKind::Delete
    ))
    .await
    .is_err());
    println!("  Close:               session refuses work ✓");

    println!();
    println!("Scan benchmark PASSED ✓");
}
