//! Performance benchmarks for a BlobVault server
//!
//! Measures latency and throughput for inserts, gets, a mixed workload and
//! many concurrent clients. Each client registers its own user, so run the
//! server with request and byte quotas large enough for the chosen sizes.

use blobvault::{Client, Credentials, Response, Status};
use clap::Parser;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "BlobVault load generator", long_about = None)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:9999")]
    server: String,

    /// Operations per single-client benchmark
    #[arg(short = 'n', long, default_value_t = 1000)]
    operations: usize,

    /// Operations per client in the concurrent benchmarks
    #[arg(long, default_value_t = 200)]
    ops_per_client: usize,

    /// Concurrent client counts to try
    #[arg(short, long, value_delimiter = ',', default_values_t = vec![4, 16, 64])]
    clients: Vec<usize>,

    /// Size of each value in bytes
    #[arg(long, default_value_t = 64)]
    value_size: usize,
}

#[derive(Debug)]
struct BenchmarkResults {
    operation: String,
    total_operations: usize,
    rejected: usize,
    duration: Duration,
    ops_per_second: f64,
    avg_latency_ms: f64,
    p95_latency_ms: f64,
    p99_latency_ms: f64,
}

impl BenchmarkResults {
    fn new(
        operation: String,
        total_operations: usize,
        rejected: usize,
        duration: Duration,
        latencies: &mut [Duration],
    ) -> Self {
        latencies.sort();

        let ops_per_second = total_operations as f64 / duration.as_secs_f64();
        let avg_latency_ms = latencies.iter().map(|d| d.as_secs_f64() * 1000.0).sum::<f64>()
            / latencies.len().max(1) as f64;

        let p95_index = (latencies.len() as f64 * 0.95) as usize;
        let p99_index = (latencies.len() as f64 * 0.99) as usize;

        let p95_latency_ms = latencies.get(p95_index).unwrap_or(&Duration::ZERO).as_secs_f64() * 1000.0;
        let p99_latency_ms = latencies.get(p99_index).unwrap_or(&Duration::ZERO).as_secs_f64() * 1000.0;

        Self {
            operation,
            total_operations,
            rejected,
            duration,
            ops_per_second,
            avg_latency_ms,
            p95_latency_ms,
            p99_latency_ms,
        }
    }

    fn print(&self) {
        println!("=== {} Benchmark Results ===", self.operation);
        println!("Total operations: {}", self.total_operations);
        println!("Quota rejections: {}", self.rejected);
        println!("Duration: {:.2}s", self.duration.as_secs_f64());
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
        println!("Average latency: {:.2}ms", self.avg_latency_ms);
        println!("P95 latency: {:.2}ms", self.p95_latency_ms);
        println!("P99 latency: {:.2}ms", self.p99_latency_ms);
        println!();
    }
}

/// Latencies plus the number of quota rejections seen
#[derive(Default)]
struct Samples {
    latencies: Vec<Duration>,
    rejected: usize,
}

impl Samples {
    fn record(&mut self, started: Instant, response: &Response) {
        self.latencies.push(started.elapsed());
        if matches!(
            response.status,
            Status::ErrQuotaReq | Status::ErrQuotaUp | Status::ErrQuotaDown
        ) {
            self.rejected += 1;
        }
    }

    fn finish(mut self, operation: String, duration: Duration) -> BenchmarkResults {
        let total = self.latencies.len();
        BenchmarkResults::new(operation, total, self.rejected, duration, &mut self.latencies)
    }
}

/// Connect a fresh session for `user`, registering it if needed
async fn session(server: &str, pem: &str, user: &str) -> Result<(Client, Credentials), BoxError> {
    let creds = Credentials::new(user, format!("{}_password", user));
    let mut client = Client::connect(server, pem).await?;
    let response = client.register(&creds).await?;
    if !matches!(response.status, Status::Ok | Status::ErrUserExists) {
        return Err(format!("registering {} failed: {}", user, response.status).into());
    }
    Ok((client, creds))
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();

    println!("BlobVault Performance Benchmarks");
    println!("================================");
    println!("Server: {}", args.server);
    println!();

    println!("Waiting for server to be ready...");
    let pem = loop {
        if let Ok(pem) = Client::fetch_public_key(&args.server).await {
            break pem;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };
    println!("Server is ready!");
    println!();

    run_single_client_benchmarks(&args, &pem).await?;
    run_concurrent_benchmarks(&args, &pem).await?;

    Ok(())
}

async fn run_single_client_benchmarks(args: &Args, pem: &str) -> Result<(), BoxError> {
    println!("Running single client benchmarks...");

    benchmark_insert_operations(args, pem).await?.print();
    benchmark_get_operations(args, pem).await?.print();
    benchmark_mixed_workload(args, pem).await?.print();

    Ok(())
}

async fn run_concurrent_benchmarks(args: &Args, pem: &str) -> Result<(), BoxError> {
    println!("Running concurrent client benchmarks...");

    for &num_clients in &args.clients {
        benchmark_concurrent_operations(args, pem, num_clients).await?.print();
    }

    Ok(())
}

async fn benchmark_insert_operations(args: &Args, pem: &str) -> Result<BenchmarkResults, BoxError> {
    let (mut client, creds) = session(&args.server, pem, "bench_insert").await?;
    let value = vec![b'x'; args.value_size];
    let mut samples = Samples::default();

    let start = Instant::now();
    for i in 0..args.operations {
        let key = format!("bench_key_{}", i);
        let op_start = Instant::now();
        let response = client.upsert(&creds, &key, value.clone()).await?;
        samples.record(op_start, &response);
    }
    let total_duration = start.elapsed();
    client.close().await?;

    Ok(samples.finish("INSERT".to_string(), total_duration))
}

async fn benchmark_get_operations(args: &Args, pem: &str) -> Result<BenchmarkResults, BoxError> {
    // Populate from one user, read back from another
    let (mut setup, setup_creds) = session(&args.server, pem, "bench_setup").await?;
    let value = vec![b'y'; args.value_size];
    for i in 0..args.operations {
        let key = format!("get_bench_key_{}", i);
        setup.upsert(&setup_creds, &key, value.clone()).await?;
    }
    setup.close().await?;

    let (mut client, creds) = session(&args.server, pem, "bench_get").await?;
    let mut samples = Samples::default();

    let start = Instant::now();
    for i in 0..args.operations {
        let key = format!("get_bench_key_{}", i);
        let op_start = Instant::now();
        let response = client.get(&creds, &key).await?;
        samples.record(op_start, &response);
    }
    let total_duration = start.elapsed();
    client.close().await?;

    Ok(samples.finish("GET".to_string(), total_duration))
}

async fn benchmark_mixed_workload(args: &Args, pem: &str) -> Result<BenchmarkResults, BoxError> {
    let (mut client, creds) = session(&args.server, pem, "bench_mixed").await?;
    let mut samples = Samples::default();

    let start = Instant::now();
    for i in 0..args.operations {
        // Reuse keys for a realistic hit rate
        let key = format!("mixed_key_{}", i % 100);
        let op_start = Instant::now();

        let response = match i % 10 {
            0..=6 => client.get(&creds, &key).await?,
            7..=8 => {
                let value = format!("mixed_value_{}", i).into_bytes();
                client.upsert(&creds, &key, value).await?
            }
            _ => client.delete(&creds, &key).await?,
        };
        samples.record(op_start, &response);
    }
    let total_duration = start.elapsed();
    client.close().await?;

    Ok(samples.finish("Mixed Workload".to_string(), total_duration))
}

async fn benchmark_concurrent_operations(
    args: &Args,
    pem: &str,
    num_clients: usize,
) -> Result<BenchmarkResults, BoxError> {
    let semaphore = Arc::new(Semaphore::new(num_clients));
    let mut handles = Vec::new();
    let mut all = Samples::default();

    let start = Instant::now();

    for client_id in 0..num_clients {
        let semaphore = Arc::clone(&semaphore);
        let server = args.server.clone();
        let pem = pem.to_string();
        let ops = args.ops_per_client;
        let value = vec![b'z'; args.value_size];

        let handle = tokio::spawn(async move {
            let _permit = semaphore.acquire().await?;
            let user = format!("bench_client_{}", client_id);
            let (mut client, creds) = session(&server, &pem, &user).await?;
            let mut samples = Samples::default();

            for i in 0..ops {
                let key = format!("concurrent_key_{}_{}", client_id, i);
                let op_start = Instant::now();
                let response = client.upsert(&creds, &key, value.clone()).await?;
                samples.record(op_start, &response);
            }

            client.close().await?;
            Ok::<Samples, BoxError>(samples)
        });

        handles.push(handle);
    }

    for handle in handles {
        let samples = handle.await??;
        all.latencies.extend(samples.latencies);
        all.rejected += samples.rejected;
    }

    let total_duration = start.elapsed();
    Ok(all.finish(format!("Concurrent ({} clients)", num_clients), total_duration))
}
