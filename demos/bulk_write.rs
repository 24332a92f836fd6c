// demos/bulk_write.rs
//
// Drives a simulated storage backend through the CPU feedback limiter. The backend's
// CPU grows with the request rate it sees; watch the permitted rate settle where the
// busiest location sits near 70%.
//
//     RUST_LOG=info,cpu_throttle=debug cargo run --example bulk_write

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use cpu_throttle::rate_limiting::{
    CallError, CpuStats, LoadReport, RateLimitingLayer, RateLimitingSettings, ServerStats,
};
use futures::{StreamExt, stream};
use tower::{Service, ServiceBuilder, ServiceExt, service_fn};
use tracing::{info, warn};

// Requests per second one location absorbs at 100% CPU.
const LOCATION_CAPACITY: f64 = 400.0;
const LOCATIONS: [&str; 3] = ["us-east1-b", "us-east1-c", "us-east1-d"];
const RUN_FOR: Duration = Duration::from_secs(30);
const WORKERS: usize = 8;

#[derive(Debug, Clone)]
struct MutateRowsResponse {
    entries: usize,
    server_stats: Option<ServerStats>,
}

impl LoadReport for MutateRowsResponse {
    fn server_stats(&self) -> Option<&ServerStats> {
        self.server_stats.as_ref()
    }
}

/// Requests served during the last full second, and the running count for the
/// current one.
#[derive(Default)]
struct Backend {
    current: AtomicU64,
    last_second: AtomicU64,
}

impl Backend {
    fn cpu_for(&self, skew: f64) -> f64 {
        let served = self.last_second.load(Ordering::Relaxed) as f64;
        let jitter = 0.9 + rand::random::<f64>() * 0.2;
        (served / LOCATION_CAPACITY * 100.0 * skew * jitter).clamp(1.0, 100.0)
    }

    fn mutate_rows(&self, entries: usize) -> Result<MutateRowsResponse, CallError> {
        self.current.fetch_add(1, Ordering::Relaxed);

        // An overloaded backend starts missing deadlines.
        if self.cpu_for(1.0) > 95.0 && rand::random::<f64>() < 0.05 {
            return Err(CallError::DeadlineExceeded {
                message: "MutateRows".to_string(),
            });
        }

        // Stats are sampled, not attached to every response.
        let server_stats = (rand::random::<f64>() < 0.5).then(|| ServerStats {
            cpu_stats: LOCATIONS
                .iter()
                .zip([1.0, 0.8, 0.6])
                .map(|(location, skew)| CpuStats {
                    location: location.to_string(),
                    cpu_percent: self.cpu_for(skew),
                })
                .collect(),
        });

        Ok(MutateRowsResponse {
            entries,
            server_stats,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), cpu_throttle::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = RateLimitingSettings::builder()
        .initial_rate(1_000.0)
        .lower_bound(10.0)
        .upper_bound(5_000.0)
        .cooldown(Duration::from_secs(2))
        .acquire_timeout(Duration::from_secs(5))
        .build();
    let layer = RateLimitingLayer::new(settings)?;

    let backend = Arc::new(Backend::default());
    {
        let backend = Arc::clone(&backend);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                let served = backend.current.swap(0, Ordering::Relaxed);
                backend.last_second.store(served, Ordering::Relaxed);
            }
        });
    }

    let inner = {
        let backend = Arc::clone(&backend);
        service_fn(move |entries: usize| {
            let result = backend.mutate_rows(entries);
            async move { Ok::<_, CallError>(stream::iter(vec![result])) }
        })
    };

    let mut workers = Vec::new();
    for worker in 0..WORKERS {
        let mut svc = ServiceBuilder::new().layer(layer.clone()).service(inner.clone());
        workers.push(tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + RUN_FOR;
            let mut written = 0usize;
            while tokio::time::Instant::now() < deadline {
                let responses = match ServiceExt::<usize>::ready(&mut svc).await {
                    Ok(svc) => svc.call(100).await,
                    Err(error) => Err(error),
                };
                let mut responses = match responses {
                    Ok(responses) => responses,
                    Err(error) => {
                        warn!(worker, %error, "Call failed.");
                        continue;
                    }
                };
                while let Some(item) = responses.next().await {
                    match item {
                        Ok(response) => written += response.entries,
                        Err(error) => warn!(worker, %error, "Mutation failed."),
                    }
                }
            }
            written
        }));
    }

    let mut report = tokio::time::interval(Duration::from_secs(1));
    report.tick().await;
    let stats = Arc::clone(layer.stats());
    let reporter = tokio::spawn(async move {
        loop {
            report.tick().await;
            let snapshot = stats.snapshot();
            info!(
                permitted_rate = %format!("{:.1}", snapshot.current_rate),
                served_last_second = backend.last_second.load(Ordering::Relaxed),
                "Throttle status."
            );
        }
    });

    let mut total = 0;
    for worker in workers {
        total += worker.await?;
    }
    reporter.abort();

    info!(
        total_entries = total,
        final_rate = layer.stats().current_rate(),
        "Done."
    );
    Ok(())
}
