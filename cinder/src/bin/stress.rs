//! Multi-threaded allocation stress driver. Each worker keeps a
//! sliding window of live objects on its stack (so conservative
//! scanning pins them), churns garbage around it, and verifies the
//! pinned payloads after every collection-prone step.

use std::hint::black_box;
use std::ptr::NonNull;
use std::sync::Arc;

use clap::Parser;

use cinder::{AttachedThread, GcConfig, GcRuntime, StackState};

// Window lives in a stack array so the collector sees it.
const WINDOW: usize = 64;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Allocation stress for the collector")]
struct Cli {
    /// Worker threads to attach
    #[arg(short, long, default_value_t = 4)]
    threads: usize,

    /// Allocations per worker
    #[arg(short, long, default_value_t = 200_000)]
    iterations: usize,

    /// Largest payload in bytes
    #[arg(long, default_value_t = 512)]
    max_object: usize,

    /// Growth floor in KiB before a collection is requested
    #[arg(long, default_value_t = 512)]
    growth_min_kib: usize,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let runtime = GcRuntime::new(GcConfig {
        heap_growth_min: cli.growth_min_kib * 1024,
        ..GcConfig::default()
    });

    let workers: Vec<_> = (0..cli.threads)
        .map(|id| {
            let runtime = runtime.clone();
            let cli = cli.clone();
            std::thread::spawn(move || worker(id, runtime, &cli))
        })
        .collect();
    for handle in workers {
        if handle.join().is_err() {
            log::error!("a worker panicked");
            std::process::exit(1);
        }
    }

    let stats = runtime.stats();
    log::info!(
        "done: {} collections ({} abandoned), {} objects marked last, \
         {} bytes swept, {} pages pooled",
        stats.collections,
        stats.abandoned,
        stats.objects_marked_last,
        stats.swept_bytes,
        stats.pages_pooled
    );
}

fn worker(id: usize, runtime: Arc<GcRuntime>, cli: &Cli) {
    let thread = AttachedThread::attach(runtime);
    let mut rng = 0x9E37_79B9_u64.wrapping_mul(id as u64 + 1) | 1;

    let mut window: [(NonNull<u8>, u64); WINDOW] =
        [(seed_object(&thread, 0), 0); WINDOW];
    for (slot, entry) in window.iter_mut().enumerate() {
        *entry = (seed_object(&thread, slot as u64), slot as u64);
    }

    for i in 0..cli.iterations {
        rng ^= rng << 13;
        rng ^= rng >> 7;
        rng ^= rng << 17;
        let payload = 8 + (rng as usize) % cli.max_object.max(16);
        let tag = rng ^ i as u64;

        let object = thread.allocate(payload, None);
        // SAFETY: payload is at least 8 bytes
        unsafe { object.cast::<u64>().as_ptr().write(tag) };

        // The replaced entry becomes garbage; everything else stays
        // pinned through the stack array.
        let slot = i % WINDOW;
        window[slot] = (object, tag);
        black_box(&window);

        if i % 1024 == 0 {
            thread.safe_point(StackState::MayContainHeapPointers);
            for &(pinned, expected) in &window {
                // SAFETY: window objects are stack-reachable, so every
                // collection must have kept them intact
                let got = unsafe { pinned.cast::<u64>().as_ptr().read() };
                assert_eq!(got, expected, "pinned object corrupted");
            }
        }
    }
    black_box(&window);

    log::info!(
        "worker {id}: {} bytes allocated since last gc, {} live after it",
        thread.allocated_since_gc(),
        thread.live_after_last_gc()
    );
    thread.collect_garbage(StackState::NoHeapPointers);
    thread.detach();
}

fn seed_object(thread: &AttachedThread, tag: u64) -> NonNull<u8> {
    let object = thread.allocate(16, None);
    // SAFETY: fresh 16-byte payload
    unsafe { object.cast::<u64>().as_ptr().write(tag) };
    object
}
