//! Basic example: several capture threads feeding one reader.
//!
//! This example shows:
//! - Enabling an endpoint's queues
//! - Enqueuing batches from several producer threads at once
//! - Draining with the single reader, parking while the queue is idle
//!
//! Run with: `cargo run --example basic -p pktq`

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use pktq::prelude::*;

const PRODUCERS: u32 = 4;
const BATCHES: u32 = 2_000;
const BATCH: u32 = 32;

fn frame(producer: u32, seq: u32) -> Packet {
    let mut bytes = vec![0u8; 60 + (seq % 64) as usize];
    bytes[..4].copy_from_slice(&seq.to_be_bytes());
    Packet::linear(bytes).with_meta(PacketMeta {
        if_index: 1,
        rx_queue: producer as u16,
        mark: seq,
        ..Default::default()
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pktq_shm=debug".parse()?),
        )
        .init();

    let endpoint = Endpoint::new(
        0,
        QueueConfig {
            rx_size: 1024,
            wake_interval: 64,
            ..Default::default()
        },
    );
    endpoint.enable(None)?;

    let done = AtomicBool::new(false);
    let start = Instant::now();

    let received = thread::scope(|s| {
        for p in 0..PRODUCERS {
            let endpoint = &endpoint;
            s.spawn(move || {
                for b in 0..BATCHES {
                    let batch: Vec<Packet> =
                        (0..BATCH).map(|i| frame(p, b * BATCH + i)).collect();
                    endpoint.enqueue(&batch, u64::MAX, p);
                }
            });
        }

        let reader = s.spawn(|| {
            let Some(mut reader) = endpoint.reader() else {
                return 0u64;
            };
            let mut received = 0u64;
            loop {
                let finished = done.load(Ordering::Acquire);
                if let Some(mut batch) = reader.read() {
                    received += batch.slots().count() as u64;
                }
                if finished {
                    return received;
                }
                reader.wait(Duration::from_millis(10), None);
            }
        });

        let total = (PRODUCERS * BATCHES * BATCH) as u64;
        loop {
            let stats = endpoint.stats();
            if stats.recv + stats.lost >= total {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done.store(true, Ordering::Release);
        reader.join().unwrap_or(0)
    });

    let stats = endpoint.stats();
    tracing::info!(
        received,
        committed = stats.recv,
        lost = stats.lost,
        wakes = stats.wake,
        elapsed = ?start.elapsed(),
        "capture finished"
    );

    endpoint.disable();
    Ok(())
}
