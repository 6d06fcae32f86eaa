//! Spool ingest benchmark.
//!
//! Pushes synthetic rows (a mix of narrow and wide payloads) through a
//! `BoundedExecutor` and reports throughput, the capacity the queue settled
//! on, and how the byte budget shaped it.
//!
//! Usage:
//!   cargo run -p spool_bench -- --records 200000 --wide-pct 10 --producers 2
//!   cargo run -p spool_bench -- --budget 65536 --consume-delay-us 50
//!   cargo run -p spool_bench -- --print-default-config

use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use deepsize::DeepSizeOf;

use spool_common::config::SpoolConfig;
use spool_common::error::BoxError;
use spool_exec::{Consumer, ExecutorBuilder};

/// Bounded executor ingest benchmark.
#[derive(Parser, Debug)]
#[command(name = "spool-bench", about = "Ingest benchmark for the bounded executor")]
struct Args {
    /// Total number of rows, split across producers.
    #[arg(long, default_value_t = 100_000)]
    records: u64,

    /// Percentage of rows with a wide payload (0-100).
    #[arg(long, default_value_t = 10)]
    wide_pct: u8,

    /// Payload size of a wide row, in bytes.
    #[arg(long, default_value_t = 16 * 1024)]
    wide_bytes: usize,

    /// Number of producer threads.
    #[arg(long, default_value_t = 1)]
    producers: u64,

    /// Write buffer limit in bytes (overrides config).
    #[arg(long)]
    budget: Option<u64>,

    /// Simulated per-row write latency in the consumer, in microseconds.
    #[arg(long, default_value_t = 0)]
    consume_delay_us: u64,

    /// Config file path.
    #[arg(short, long, default_value = "spool.toml")]
    config: String,

    /// Metrics listen address (overrides config).
    #[arg(long)]
    metrics_addr: Option<String>,

    /// Print the default configuration as TOML and exit.
    #[arg(long)]
    print_default_config: bool,
}

/// Synthetic ingest row.
#[derive(Debug, Clone, DeepSizeOf)]
struct Row {
    key: u64,
    partition: String,
    payload: Vec<u8>,
}

/// splitmix64: deterministic per-key mixing so every producer thread agrees
/// on which keys are wide.
fn mix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

fn make_row(key: u64, wide_pct: u8, wide_bytes: usize) -> Row {
    let h = mix(key);
    let len = if (h % 100) < wide_pct as u64 { wide_bytes } else { 64 };
    Row {
        key,
        partition: format!("p{:02}", h % 16),
        payload: vec![(h & 0xff) as u8; len],
    }
}

#[derive(Debug, Default)]
struct SinkStats {
    rows: u64,
    bytes: u64,
    max_key: u64,
}

struct CountingSink {
    delay: Duration,
    stats: SinkStats,
}

impl Consumer<Row> for CountingSink {
    type Output = SinkStats;

    fn consume(&mut self, row: Row) -> Result<(), BoxError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.stats.rows += 1;
        self.stats.bytes += row.payload.len() as u64 + row.partition.len() as u64;
        self.stats.max_key = self.stats.max_key.max(row.key);
        Ok(())
    }

    fn result(&mut self) -> SinkStats {
        std::mem::take(&mut self.stats)
    }
}

struct BenchResult {
    stats: SinkStats,
    elapsed_ms: u64,
    rows_per_sec: f64,
    budget: u64,
    capacity: usize,
    avg_entry_bytes: u64,
}

fn run(args: &Args, config: &SpoolConfig) -> Result<BenchResult> {
    let mut exec_config = config.executor.clone();
    if let Some(budget) = args.budget {
        exec_config.write_buffer_limit_bytes = budget;
    }

    let producers = args.producers.max(1);
    let per_producer = args.records / producers;
    let mut builder = ExecutorBuilder::new(exec_config);
    for p in 0..producers {
        let start = p * per_producer;
        let end = if p + 1 == producers {
            args.records
        } else {
            start + per_producer
        };
        builder = builder.source(start..end);
    }

    let wide_pct = args.wide_pct.min(100);
    let wide_bytes = args.wide_bytes;
    let exec = builder
        .transform(move |key: u64| Ok(make_row(key, wide_pct, wide_bytes)))
        .consumer(CountingSink {
            delay: Duration::from_micros(args.consume_delay_us),
            stats: SinkStats::default(),
        })
        .build()?;

    let start = Instant::now();
    let stats = exec.execute()?;
    let elapsed = start.elapsed();
    exec.shutdown_now();
    exec.await_termination();

    let elapsed_ms = elapsed.as_millis() as u64;
    let rows_per_sec = if elapsed.as_secs_f64() > 0.0 {
        stats.rows as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };
    Ok(BenchResult {
        stats,
        elapsed_ms,
        rows_per_sec,
        budget: exec.config().write_buffer_limit_bytes,
        capacity: exec.queue().effective_capacity(),
        avg_entry_bytes: exec.queue().average_entry_bytes(),
    })
}

fn print_result(args: &Args, r: &BenchResult) {
    println!("═══════════════════════════════════════════════");
    println!("  Bounded executor ingest");
    println!("═══════════════════════════════════════════════");
    println!("  Producers:         {}", args.producers.max(1));
    println!("  Rows:              {}", r.stats.rows);
    println!("  Payload bytes:     {}", r.stats.bytes);
    println!("  Max key:           {}", r.stats.max_key);
    println!("  Elapsed:           {} ms", r.elapsed_ms);
    println!("  Rows/sec:          {:.1}", r.rows_per_sec);
    println!("  ─── Queue ───");
    println!("  Budget:            {} bytes", r.budget);
    println!("  Avg entry:         {} bytes", r.avg_entry_bytes);
    println!("  Capacity:          {} entries", r.capacity);
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_default_config {
        let toml_str = toml::to_string_pretty(&SpoolConfig::default())
            .unwrap_or_else(|e| format!("# failed to serialize default config: {}", e));
        println!("{}", toml_str);
        return Ok(());
    }

    let config = SpoolConfig::load_or_default(&args.config);
    spool_observability::init_tracing(&config.observability.log_filter);
    tracing::info!(records = args.records, producers = args.producers, "starting spool bench");

    let metrics_addr = args
        .metrics_addr
        .clone()
        .unwrap_or_else(|| config.observability.metrics_addr.clone());
    if !metrics_addr.is_empty() {
        if let Err(e) = spool_observability::init_metrics(&metrics_addr) {
            tracing::warn!("Failed to initialize metrics: {}", e);
        }
    }

    let result = run(&args, &config)?;
    print_result(&args, &result);
    Ok(())
}
