//! CAN monitor example
//!
//! Opens a network SLCAN adapter, sends one frame and prints everything
//! received on the bus for a while.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example can_monitor -- --endpoint socket://192.168.0.7:1234 --bitrate 500000
//! ```

use std::env;
use std::time::{Duration, Instant};

use boardlink::{CanConfig, CanTransport};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    println!("=== Boardlink CAN Monitor Example ===\n");
    println!("Connecting to {} at {} bit/s...", args.endpoint, args.bitrate);

    let can = CanTransport::open(CanConfig::new(&args.endpoint, args.bitrate)).await?;
    can.register_callback(|frame| {
        log::debug!("#{} {}", frame.seq, frame.data);
    });

    if can.send_message(0x7df, &[0x02, 0x01, 0x00], false).await? {
        println!("Sent request on 0x7df");
    }

    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        if let Some(frame) = can.receive(remaining).await {
            println!("  {}", frame.data);
        }
    }

    can.close().await;
    println!("\nDone!");
    Ok(())
}

struct Args {
    endpoint: String,
    bitrate: u32,
    seconds: u64,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = env::args().collect();
        let mut endpoint = CanConfig::default().endpoint;
        let mut bitrate = 500_000u32;
        let mut seconds = 10u64;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--endpoint" | "-e" => {
                    i += 1;
                    if i < args.len() {
                        endpoint = args[i].clone();
                    }
                }
                "--bitrate" | "-b" => {
                    i += 1;
                    if i < args.len() {
                        bitrate = args[i].parse().unwrap_or(500_000);
                    }
                }
                "--seconds" | "-s" => {
                    i += 1;
                    if i < args.len() {
                        seconds = args[i].parse().unwrap_or(10);
                    }
                }
                _ => {}
            }
            i += 1;
        }

        Self {
            endpoint,
            bitrate,
            seconds,
        }
    }
}
