//! Load simulator for the ingest endpoint
//!
//! Usage: `load-simulator [addr] [events] [clients] [subscriber]`
//! Defaults: `127.0.0.1:8080 1000 10 alex_doe`
//!
//! Each client posts its share of events to `http://<addr>/events`.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

const EVENT_TYPES: &[&str] = &["click", "view", "purchase", "scroll"];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args: Vec<String> = std::env::args().collect();
    let addr = args.get(1).cloned().unwrap_or_else(|| "127.0.0.1:8080".to_string());
    let total: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(1_000);
    let clients: usize = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(10).max(1);
    let subscriber = args.get(4).cloned().unwrap_or_else(|| "alex_doe".to_string());

    println!("Ingest load simulator");
    println!("  Target: {}", addr);
    println!("  Events: {} for subscriber '{}'", total, subscriber);
    println!("  Concurrent clients: {}\n", clients);

    let accepted = Arc::new(AtomicU64::new(0));
    let rejected = Arc::new(AtomicU64::new(0));
    let start = Instant::now();

    let url = format!("http://{}/events", addr);
    let http = reqwest::Client::new();
    let mut handles = Vec::with_capacity(clients);
    for client_id in 0..clients {
        // Spread the remainder over the first clients
        let share = total / clients + usize::from(client_id < total % clients);
        let url = url.clone();
        let http = http.clone();
        let subscriber = subscriber.clone();
        let accepted = accepted.clone();
        let rejected = rejected.clone();

        handles.push(tokio::spawn(async move {
            run_client(client_id, &http, &url, &subscriber, share, &accepted, &rejected).await
        }));
    }

    for handle in handles {
        handle.await??;
    }

    let elapsed = start.elapsed();
    let accepted = accepted.load(Ordering::Relaxed);
    let rejected = rejected.load(Ordering::Relaxed);
    println!("Results:");
    println!("  {} accepted, {} rejected in {:.2}s", accepted, rejected, elapsed.as_secs_f64());
    println!(
        "  {:.0} events per second",
        (accepted + rejected) as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );

    Ok(())
}

async fn run_client(
    client_id: usize,
    http: &reqwest::Client,
    url: &str,
    subscriber: &str,
    events: usize,
    accepted: &AtomicU64,
    rejected: &AtomicU64,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut rng = StdRng::from_entropy();

    for seq in 0..events {
        let event_type = EVENT_TYPES.choose(&mut rng).copied().unwrap_or("click");
        let event = json!({
            "eventType": event_type,
            "subscriberId": subscriber,
            "metadata": format!("client-{}-{}", client_id, seq),
            "value": rng.gen_range(1.0..100.0),
        });
        let response = http.post(url).json(&event).send().await?;
        if response.status() == reqwest::StatusCode::ACCEPTED {
            accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            rejected.fetch_add(1, Ordering::Relaxed);
        }
    }
    Ok(())
}
