//! TF-Mini bench probe
//!
//! Opens the sensor's serial port and prints every decoded frame with the
//! validity verdict the timer would apply, plus a rate summary per second.
//! Useful for checking wiring, mounting height and gate threshold before a
//! session.

use clap::Parser;
use pumptrack_timer::io::tfmini::{FrameDecoder, FrameLimits};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio_serial::SerialPortBuilderExt;

#[derive(Parser, Debug)]
#[command(name = "sensor-probe", about = "Print decoded TF-Mini frames")]
struct Args {
    #[arg(long, default_value = "/dev/serial0")]
    device: String,

    #[arg(long, default_value = "115200")]
    baud: u32,

    #[arg(long, default_value = "100")]
    min_strength: u16,

    #[arg(long, default_value = "1200")]
    max_distance_cm: f64,

    /// Mark frames closer than this as inside the gate
    #[arg(long, default_value = "50")]
    threshold_cm: f64,

    /// Stop after this many frames (0 = run until interrupted)
    #[arg(long, default_value = "0")]
    count: u64,

    /// Only print the once-per-second summary
    #[arg(long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut port = tokio_serial::new(&args.device, args.baud)
        .timeout(Duration::from_millis(100))
        .open_native_async()
        .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", args.device))?;

    println!("Probing {} @ {} baud (threshold {} cm)", args.device, args.baud, args.threshold_cm);

    let limits = FrameLimits { min_strength: args.min_strength, max_distance_cm: args.max_distance_cm };
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 64];
    let started = Instant::now();
    let mut window_start = Instant::now();
    let (mut frames, mut window_frames, mut window_invalid) = (0u64, 0u64, 0u64);

    loop {
        let n = match tokio::time::timeout(Duration::from_millis(500), port.read(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => 0,
            Ok(Err(e)) => return Err(anyhow::anyhow!("Read from {} failed: {e}", args.device)),
            Err(_) => {
                println!("[{:>8.3}s] no data", started.elapsed().as_secs_f64());
                0
            }
        };
        decoder.extend(&buf[..n]);

        // Newest complete frame from this read
        if let Some(frame) = decoder.latest_frame() {
            let reading = limits.to_reading(&frame, Instant::now());
            frames += 1;
            window_frames += 1;
            if !reading.valid {
                window_invalid += 1;
            }

            if !args.quiet {
                let verdict = match (reading.valid, reading.distance_cm < args.threshold_cm) {
                    (false, _) => "INVALID",
                    (true, true) => "IN GATE",
                    (true, false) => "clear",
                };
                println!(
                    "[{:>8.3}s] dist={:>5} cm  strength={:>5}  temp={:>5.1} C  {}",
                    started.elapsed().as_secs_f64(),
                    frame.distance_cm,
                    frame.strength,
                    frame.temperature_c,
                    verdict
                );
            }

            if args.count > 0 && frames >= args.count {
                println!("{frames} frames, {} checksum errors", decoder.checksum_errors());
                return Ok(());
            }
        }

        if window_start.elapsed() >= Duration::from_secs(1) {
            println!(
                "-- {window_frames} frames/s, {window_invalid} invalid, {} checksum errors total",
                decoder.checksum_errors()
            );
            window_start = Instant::now();
            window_frames = 0;
            window_invalid = 0;
        }
    }
}
