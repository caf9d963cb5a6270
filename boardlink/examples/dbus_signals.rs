//! D-Bus signal example
//!
//! Logs in on the board console, subscribes to firmware manager signals,
//! triggers a firmware check and prints every signal that arrives.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example dbus_signals -- --port /dev/ttyUSB0 --host imx6-board --wait 120
//! ```

use std::env;
use std::time::{Duration, Instant};

use boardlink::ConsoleBuilder;

const SIGNALS: [&str; 3] = [
    "newFirmwareAvailable",
    "firmwareCheckResults",
    "firmwareUpdateState",
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    println!("=== Boardlink D-Bus Signal Example ===\n");
    let console = ConsoleBuilder::new(&args.port)
        .hostname(&args.host)
        .password(&args.password)
        .build()
        .await?;

    if !console.machine().login(false).await {
        eprintln!("Login failed");
        console.close().await?;
        return Ok(());
    }

    let dbus = console.dbus();
    for signal in SIGNALS {
        if !dbus.subscribe(signal).await? {
            eprintln!("Could not subscribe to {signal}");
        }
    }
    println!("Subscribed to: {:?}", dbus.subscriptions());

    for method in ["getCurrentPartition", "getCurrentSWversion", "getCurrentBootDev"] {
        match dbus.run_method(method, None, true).await? {
            Some(value) => println!("{method}: {value}"),
            None => println!("{method}: no reply"),
        }
    }

    dbus.run_method("forceUpdate", None, false).await?;

    let deadline = Instant::now() + Duration::from_secs(args.wait);
    println!("\nWaiting {}s for signals...", args.wait);
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        let Some(signal) = dbus.get_signal(remaining).await else {
            break;
        };
        let values: Vec<String> = signal.results.iter().map(ToString::to_string).collect();
        println!("  {} -> {}", signal.name, values.join(", "));
    }

    for violation in dbus.take_violations() {
        println!("Protocol violation: {violation}");
    }

    console.close().await?;
    println!("\nDone!");
    Ok(())
}

struct Args {
    port: String,
    host: String,
    password: String,
    wait: u64,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = env::args().collect();
        let mut port = "/dev/ttyUSB0".to_string();
        let mut host = "localhost".to_string();
        let mut password = String::new();
        let mut wait = 60u64;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--port" | "-p" => {
                    i += 1;
                    if i < args.len() {
                        port = args[i].clone();
                    }
                }
                "--host" | "-h" => {
                    i += 1;
                    if i < args.len() {
                        host = args[i].clone();
                    }
                }
                "--password" | "-P" => {
                    i += 1;
                    if i < args.len() {
                        password = args[i].clone();
                    }
                }
                "--wait" | "-w" => {
                    i += 1;
                    if i < args.len() {
                        wait = args[i].parse().unwrap_or(60);
                    }
                }
                _ => {}
            }
            i += 1;
        }

        Self {
            port,
            host,
            password,
            wait,
        }
    }
}
