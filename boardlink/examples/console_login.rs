//! Console login example
//!
//! Finds out where the board console is, boots Linux if it sits in the
//! bootloader, logs in and waits for the network links.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example console_login -- --port /dev/ttyUSB0 --host imx6-board --password secret
//! ```
//!
//! Reboot through the bootloader into eMMC first:
//! ```bash
//! cargo run --example console_login -- --port /dev/ttyUSB0 --host imx6-board --emmc
//! ```

use std::env;
use std::time::Duration;

use boardlink::{BootDevice, ConsoleBuilder, SessionState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    println!("=== Boardlink Console Login Example ===\n");
    println!("Opening {} at {} baud...", args.port, args.baud);

    let mut builder = ConsoleBuilder::new(&args.port)
        .baud_rate(args.baud)
        .hostname(&args.host)
        .username(&args.user)
        .skip(["audit: ", "random: crng init"]);
    if let Some(password) = &args.password {
        builder = builder.password(password);
    }
    let console = builder.build().await?;
    let machine = console.machine();

    let state = machine.where_am_i(Duration::from_secs(30)).await;
    println!("Console is at: {}", state.unwrap_or(SessionState::Unknown));

    if state == Some(SessionState::Bootloader) && !machine.switch_to_normal_mode().await {
        eprintln!("Board did not boot to the login prompt");
        console.close().await?;
        return Ok(());
    }

    if args.emmc {
        println!("\nRebooting into eMMC...");
        if !machine.reboot_to(BootDevice::Emmc).await {
            eprintln!("Reboot into eMMC failed");
        }
    }

    if machine.login(true).await {
        println!("\nLogged in as {}", args.user);
        let links = machine.wait_for_links_ready(Duration::from_secs(5)).await;
        println!("Links ready: {:?}", links.ready);
        if !links.all_ready() {
            println!("Links pending: {:?}", links.pending);
        }

        console.session().send("uname -a").await?;
        if let Some(line) = console
            .session()
            .receive(Duration::from_secs(5), Some(&boardlink::PatternSet::new(["^Linux "])?))
            .await
        {
            println!("Kernel: {line}");
        }

        machine.logout().await;
    } else {
        eprintln!("Login failed");
    }

    console.close().await?;
    println!("\nDone!");
    Ok(())
}

struct Args {
    port: String,
    baud: u32,
    host: String,
    user: String,
    password: Option<String>,
    emmc: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = env::args().collect();
        let mut port = "/dev/ttyUSB0".to_string();
        let mut baud = 115_200u32;
        let mut host = "localhost".to_string();
        let mut user = "root".to_string();
        let mut password = None;
        let mut emmc = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--port" | "-p" => {
                    i += 1;
                    if i < args.len() {
                        port = args[i].clone();
                    }
                }
                "--baud" | "-b" => {
                    i += 1;
                    if i < args.len() {
                        baud = args[i].parse().unwrap_or(115_200);
                    }
                }
                "--host" | "-h" => {
                    i += 1;
                    if i < args.len() {
                        host = args[i].clone();
                    }
                }
                "--user" | "-u" => {
                    i += 1;
                    if i < args.len() {
                        user = args[i].clone();
                    }
                }
                "--password" | "-P" => {
                    i += 1;
                    if i < args.len() {
                        password = Some(args[i].clone());
                    }
                }
                "--emmc" => emmc = true,
                "--help" => {
                    println!(
                        "Usage: console_login [--port DEV] [--baud N] [--host NAME] \
                         [--user USER] [--password PASS] [--emmc]"
                    );
                    std::process::exit(0);
                }
                _ => {}
            }
            i += 1;
        }

        Self {
            port,
            baud,
            host,
            user,
            password,
            emmc,
        }
    }
}
