use clap::Parser;
use hdrhistogram::Histogram;
use hyper::{Body, Client, Method, Request, StatusCode};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of concurrent clients
    #[arg(short, long, default_value = "1")]
    concurrency: usize,

    /// INTERVAL ms
    #[arg(short, long, default_value = "100")]
    interval: u64,

    /// Duration of the benchmark in seconds
    #[arg(short, long, default_value = "30")]
    duration: u64,

    /// Key-value API address
    #[arg(short, long, default_value = "http://127.0.0.1:12380")]
    server: String,

    /// Number of distinct keys written
    #[arg(short, long, default_value = "1000")]
    keys: u64,
}

fn put_request(server: &str, key: u64, value: u64) -> Result<Request<Body>, hyper::http::Error> {
    Request::builder()
        .method(Method::PUT)
        .uri(format!("{}/bench/{}", server, key))
        .body(Body::from(value.to_string()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let server_addr = args.server.trim_end_matches('/').to_string();
    let histogram = Arc::new(Mutex::new(Histogram::<u64>::new(3)?));
    let total_requests = Arc::new(Mutex::new(0u64));
    let keys = args.keys.max(1);
    let interval = Duration::from_millis(args.interval);

    println!(
        "Starting benchmark with {} concurrent clients, target INTERVAL: {}",
        args.concurrency, args.interval
    );

    // Spawn client tasks
    let mut handles = vec![];
    for _ in 0..args.concurrency {
        let server_addr = server_addr.clone();
        let histogram = histogram.clone();
        let total_requests = total_requests.clone();
        let client = Client::new();

        let handle = tokio::spawn(async move {
            loop {
                let start = Instant::now();

                let request = match put_request(
                    &server_addr,
                    rand::random::<u64>() % keys,
                    rand::random::<u64>(),
                ) {
                    Ok(request) => request,
                    Err(e) => {
                        eprintln!("Invalid request: {}", e);
                        return;
                    }
                };

                match client.request(request).await {
                    Ok(response) if response.status() == StatusCode::NO_CONTENT => {
                        let duration = start.elapsed();
                        let mut hist = histogram.lock().await;
                        if let Err(e) = hist.record(duration.as_micros() as u64) {
                            eprintln!("Failed to record latency: {}", e);
                        }
                        let mut total = total_requests.lock().await;
                        *total += 1;
                    }
                    Ok(response) => eprintln!("Request failed: {}", response.status()),
                    Err(e) => eprintln!("Request failed: {}", e),
                }

                sleep(interval).await;
            }
        });

        handles.push(handle);
    }

    // Run for specified duration
    sleep(Duration::from_secs(args.duration)).await;

    // Cancel all tasks
    for handle in handles {
        handle.abort();
    }

    // Print statistics
    let total = *total_requests.lock().await;
    let hist = histogram.lock().await;

    println!("\nBenchmark Results:");
    println!("Total Requests: {}", total);
    println!("Average TPS: {:.2}", total as f64 / args.duration as f64);
    println!("\nLatency Distribution (microseconds):");
    println!("p50: {}", hist.value_at_percentile(50.0));
    println!("p90: {}", hist.value_at_percentile(90.0));
    println!("p95: {}", hist.value_at_percentile(95.0));
    println!("p99: {}", hist.value_at_percentile(99.0));
    println!("p99.9: {}", hist.value_at_percentile(99.9));

    Ok(())
}
