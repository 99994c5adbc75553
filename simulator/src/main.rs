mod telemetry;

use chrono::Utc;
use clap::Parser;
use rand::Rng;
use std::time::Duration;
use telemetry::{boot_query, device_datetime, MeterSample};
use tracing::{error, info, warn};

/// Emulates a fleet of energy meters reporting to the ingestor over HTTP.
#[derive(Debug, Parser)]
#[command(name = "meter-simulator", version)]
struct Args {
    /// Base URL of the ingestor
    #[arg(long, env = "SERVER_URL", default_value = "http://localhost:8080")]
    server: String,

    /// Readings per second across all devices
    #[arg(long, env = "RATE", default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    rate: u64,

    /// Number of simulated meters
    #[arg(long, env = "DEVICES", default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    devices: u64,

    /// Share of readings pushed out of the accepted ranges
    #[arg(long, env = "OUTLIER_RATIO", default_value_t = 0.05)]
    outlier_ratio: f64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Starting meter simulator");
    info!(
        "Server: {}, Rate: {} readings/s, Devices: {}",
        args.server, args.rate, args.devices
    );

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|e| {
            error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        });
    let url = format!("{}/meter", args.server.trim_end_matches('/'));
    let outlier_ratio = if args.outlier_ratio.is_finite() {
        args.outlier_ratio.clamp(0.0, 1.0)
    } else {
        0.0
    };

    let device_ids: Vec<String> = (0..args.devices).map(|i| format!("meter-{}", i)).collect();

    for device_id in &device_ids {
        match client.get(&url).query(&boot_query(device_id)).send().await {
            Ok(response) if response.status().is_success() => {
                info!("{} booted", device_id);
            }
            Ok(response) => warn!("Boot of {} rejected: {}", device_id, response.status()),
            Err(e) => warn!("Boot of {} failed: {}", device_id, e),
        }
    }

    let mut rng = rand::thread_rng();
    let mut meters: Vec<f64> = device_ids.iter().map(|_| rng.gen_range(0.0..1000.0)).collect();
    let mut counter = 0u64;
    let mut rejected = 0u64;

    let burst_size = args.rate.min(200);
    let burst_interval = Duration::from_millis((burst_size * 1000) / args.rate);

    info!("Sending in bursts of {} readings every {:?}", burst_size, burst_interval);

    loop {
        let burst_start = std::time::Instant::now();

        for _ in 0..burst_size {
            let index = (counter % args.devices) as usize;
            let sample = generate_sample(
                &mut rng,
                device_ids[index].clone(),
                &mut meters[index],
                outlier_ratio,
            );

            match client.get(&url).query(&sample).send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    rejected += 1;
                    warn!("Reading from {} rejected: {}", sample.source, response.status());
                }
                Err(e) => {
                    error!("Failed to send reading: {}", e);
                }
            }
            counter += 1;
        }

        // Log progress periodically
        if counter % 1000 < burst_size {
            info!("Sent {} readings, {} rejected", counter, rejected);
        }

        let elapsed = burst_start.elapsed();
        if elapsed < burst_interval {
            tokio::time::sleep(burst_interval - elapsed).await;
        } else if elapsed > burst_interval * 2 {
            warn!(
                "Burst took {:?}, target was {:?} - server may be overloaded",
                elapsed, burst_interval
            );
        }
    }
}

fn generate_sample(
    rng: &mut impl Rng,
    source: String,
    kwh: &mut f64,
    outlier_ratio: f64,
) -> MeterSample {
    let voltage = if rng.gen_bool(outlier_ratio) {
        rng.gen_range(510.0..700.0) // over the accepted maximum
    } else {
        rng.gen_range(220.0..240.0)
    };

    let current = rng.gen_range(0.2..25.0);

    let power_factor = if rng.gen_bool(outlier_ratio) {
        rng.gen_range(1.1..2.0)
    } else {
        rng.gen_range(0.8..1.0)
    };

    let frequency = rng.gen_range(49.8..50.2);
    let load_kw = voltage * current * power_factor / 1000.0;

    // Energy is cumulative per meter
    *kwh += load_kw * rng.gen_range(0.0001..0.001);

    MeterSample {
        voltage: round_to(voltage, 2),
        current: round_to(current, 3),
        power_factor: round_to(power_factor, 2),
        load_kw: round_to(load_kw, 4),
        kwh: round_to(*kwh, 3),
        frequency: round_to(frequency, 2),
        datetime_str: device_datetime(Utc::now()),
        retry_count: if rng.gen_bool(0.02) { rng.gen_range(1..4) } else { 0 },
        source,
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
