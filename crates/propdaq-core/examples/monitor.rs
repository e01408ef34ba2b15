//! PropDAQ Live Monitor
//!
//! Opens a link to a PropDAQ device (discovering the port if none is
//! given), starts a sample stream, and prints decoded control packets
//! and stream samples until interrupted.
//!
//! Usage:
//!   cargo run --example monitor -- [OPTIONS]
//!
//! Options:
//!   --port PORT       Serial port (default: probe all ports)
//!   --stream N        Stream to listen on, 0-7 (default: 0)
//!   --channel N       Device channel to start (default: 3)
//!   --seconds N       How long to run (default: 10)

use anyhow::Result;
use propdaq_core::protocol::{Link, LinkConfig, Message, StreamListener};
use std::sync::Arc;
use std::time::Duration;

struct Printer {
    stream_id: u8,
}

impl StreamListener for Printer {
    fn on_samples(&self, samples: &[u32]) {
        println!("stream {}: {} samples {:?}", self.stream_id, samples.len(), samples);
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut port: Option<String> = None;
    let mut stream_id = 0u8;
    let mut channel = 3u32;
    let mut seconds = 10u64;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                if i < args.len() {
                    port = Some(args[i].clone());
                }
            }
            "--stream" | "-s" => {
                i += 1;
                if i < args.len() {
                    stream_id = args[i].parse().unwrap_or(0);
                }
            }
            "--channel" | "-c" => {
                i += 1;
                if i < args.len() {
                    channel = args[i].parse().unwrap_or(3);
                }
            }
            "--seconds" => {
                i += 1;
                if i < args.len() {
                    seconds = args[i].parse().unwrap_or(10);
                }
            }
            other => {
                eprintln!("unknown option: {}", other);
                std::process::exit(2);
            }
        }
        i += 1;
    }

    let link = Link::new(LinkConfig::default());

    link.register(
        Message::Version,
        Arc::new(|words: &[u32]| {
            println!("device version: {:?}", words);
        }),
        None,
    );
    link.register(
        Message::Info,
        Arc::new(|words: &[u32]| {
            println!("info: {:?}", words);
        }),
        None,
    );
    link.add_listener(stream_id, Arc::new(Printer { stream_id }))?;

    match &port {
        Some(name) => {
            println!("Opening {}...", name);
            link.open(Some(name))?;
        }
        None => {
            println!("Probing for a device...");
            let mut retries = 3;
            let name = link.open_first(|| {
                retries -= 1;
                if retries > 0 {
                    eprintln!("no device found, retrying sweep");
                }
                retries > 0
            })?;
            println!("Found device on {}", name);
        }
    }

    println!("Starting channel {} on stream {}", channel, stream_id);
    link.send(Message::Start, &[channel])?;

    std::thread::sleep(Duration::from_secs(seconds));

    println!("Device time: {:.3}s", link.current_time());
    let (tx_b, rx_b, tx_p, rx_p) = link.counters();
    println!("tx: {} bytes / {} packets, rx: {} bytes / {} packets", tx_b, tx_p, rx_b, rx_p);

    link.send(Message::Stop, &[channel])?;
    link.close();
    Ok(())
}
