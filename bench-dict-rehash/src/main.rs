//! Dict benchmark: throughput, incremental-rehash latency, and memory.
//!
//! Measures insert, hit/miss lookup, full-scan, and sampling cost at two
//! scales, plus the property the two-table design exists for: the
//! worst-case latency of a single foreground operation while a table
//! migration is in flight. A single-table rehash would pay the whole
//! copy on one unlucky insert; here every operation migrates at most one
//! bucket, so the per-op maximum should stay flat as the table grows.

use std::alloc::{GlobalAlloc, Layout, System};
use std::hint::black_box;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use emberkv_structs::{BinaryKeys, Dict};

// ============================================================================
// Tracking allocator
// ============================================================================

struct TrackingAllocator;

static ALLOCATED: AtomicUsize = AtomicUsize::new(0);
static PEAK: AtomicUsize = AtomicUsize::new(0);

#[global_allocator]
static ALLOC: TrackingAllocator = TrackingAllocator;

unsafe impl GlobalAlloc for TrackingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc(layout) };
        if !ptr.is_null() {
            let prev = ALLOCATED.fetch_add(layout.size(), Ordering::Relaxed);
            let current = prev + layout.size();
            let mut peak = PEAK.load(Ordering::Relaxed);
            while current > peak {
                match PEAK.compare_exchange_weak(
                    peak,
                    current,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(p) => peak = p,
                }
            }
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        ALLOCATED.fetch_sub(layout.size(), Ordering::Relaxed);
        unsafe { System.dealloc(ptr, layout) };
    }
}

fn current_allocated() -> usize {
    ALLOCATED.load(Ordering::Relaxed)
}

// ============================================================================
// Data generation
// ============================================================================

type BenchDict = Dict<String, u64, BinaryKeys>;

/// Generate key strings shaped like server keyspace entries
/// (type-prefixed, mixed cardinality).
fn generate_keys(count: usize, seed: u64) -> Vec<String> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let prefixes = [
        "user:", "session:", "cart:", "rate:", "queue:", "page:", "object:",
    ];
    (0..count)
        .map(|i| {
            let prefix = prefixes[rng.gen_range(0..prefixes.len())];
            format!("{prefix}{i}:{}", rng.gen_range(0u32..1_000_000))
        })
        .collect()
}

/// Build lookup keys: 50% known entries (hits), 50% novel (misses).
fn build_lookups(source: &[String], count: usize, seed: u64) -> Vec<String> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            if rng.gen_bool(0.5) && !source.is_empty() {
                source[rng.gen_range(0..source.len())].clone()
            } else {
                format!("miss:{}", rng.gen_range(0u64..10_000_000))
            }
        })
        .collect()
}

// ============================================================================
// Benchmark result
// ============================================================================

struct BenchResult {
    scale: usize,
    lookup_count: usize,
    insert_ms: f64,
    lookup_ms: f64,
    scan_ms: f64,
    sample_ms: f64,
    mem_bytes: usize,
    unique_count: usize,
}

fn print_detail(r: &BenchResult) {
    println!("\n--- dict ({} entries) ---", format_count(r.scale));
    println!("  Unique keys: {:>10}", format_count(r.unique_count));
    println!("  Insert:      {:>10.2} ms", r.insert_ms);
    println!(
        "  Lookup:      {:>10.2} ms  ({} mixed hit/miss)",
        r.lookup_ms,
        format_count(r.lookup_count)
    );
    println!("  Full scan:   {:>10.2} ms", r.scan_ms);
    println!("  Sample 1k:   {:>10.2} ms", r.sample_ms);
    println!(
        "  Memory:      {:>10.2} MB  ({} bytes/entry)",
        r.mem_bytes as f64 / (1024.0 * 1024.0),
        if r.unique_count > 0 { r.mem_bytes / r.unique_count } else { 0 }
    );
}

fn format_count(n: usize) -> String {
    if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{}k", n / 1_000)
    } else {
        n.to_string()
    }
}

// ============================================================================
// Benchmark functions
// ============================================================================

fn bench_throughput(n: usize) -> BenchResult {
    let keys = generate_keys(n, 42);
    let lookup_count = n.clamp(10_000, 500_000);
    let lookups = build_lookups(&keys, lookup_count, 99);

    let baseline = current_allocated();

    let start = Instant::now();
    let mut d = BenchDict::new();
    for (i, k) in keys.iter().enumerate() {
        let _ = d.add(k.clone(), i as u64);
    }
    let insert_ms = start.elapsed().as_secs_f64() * 1000.0;
    let mem_bytes = current_allocated().saturating_sub(baseline);
    let unique_count = d.len();

    let start = Instant::now();
    for k in &lookups {
        black_box(d.find(k));
    }
    let lookup_ms = start.elapsed().as_secs_f64() * 1000.0;

    let start = Instant::now();
    let mut visited = 0usize;
    let mut cursor = 0;
    loop {
        cursor = d.scan(cursor, |k, v| {
            black_box((k, v));
            visited += 1;
        });
        if cursor == 0 {
            break;
        }
    }
    let scan_ms = start.elapsed().as_secs_f64() * 1000.0;
    assert!(visited >= unique_count, "scan pass missed entries");

    let mut rng = SmallRng::seed_from_u64(7);
    let start = Instant::now();
    for _ in 0..100 {
        black_box(d.sample(&mut rng, 10));
    }
    let sample_ms = start.elapsed().as_secs_f64() * 1000.0;

    black_box(&d);

    BenchResult {
        scale: n,
        lookup_count,
        insert_ms,
        lookup_ms,
        scan_ms,
        sample_ms,
        mem_bytes,
        unique_count,
    }
}

/// Worst-case single-operation latency across a full migration window.
///
/// Fills the dictionary to the growth threshold, then times every
/// individual find while the resulting rehash drains. Reports the max
/// against the max observed on a quiet (non-rehashing) table of the same
/// size.
fn bench_rehash_latency(n: usize) -> (f64, f64, usize) {
    let keys = generate_keys(n, 1234);
    let mut d = BenchDict::new();
    for (i, k) in keys.iter().enumerate() {
        let _ = d.add(k.clone(), i as u64);
    }
    // drain any in-flight migration, then force a fresh one
    while d.is_rehashing() {
        d.rehash_step(128);
    }

    let quiet_max = {
        let mut max_ns = 0u128;
        for k in keys.iter().take(50_000) {
            let t = Instant::now();
            black_box(d.find(k));
            max_ns = max_ns.max(t.elapsed().as_nanos());
        }
        max_ns as f64 / 1000.0
    };

    assert!(d.expand(d.len() * 2), "forced expand must start a rehash");
    let mut rehash_max = 0u128;
    let mut ops_to_drain = 0usize;
    let mut i = 0;
    while d.is_rehashing() {
        let k = &keys[i % keys.len()];
        let t = Instant::now();
        black_box(d.find(k));
        rehash_max = rehash_max.max(t.elapsed().as_nanos());
        ops_to_drain += 1;
        i += 1;
    }
    (quiet_max, rehash_max as f64 / 1000.0, ops_to_drain)
}

/// Background batch migration: how much budget `rehash_for` actually uses.
fn bench_rehash_for(n: usize) -> (f64, Duration) {
    let keys = generate_keys(n, 77);
    let mut d = BenchDict::new();
    for (i, k) in keys.iter().enumerate() {
        let _ = d.add(k.clone(), i as u64);
    }
    while d.is_rehashing() {
        d.rehash_step(128);
    }
    assert!(d.expand(d.len() * 2));

    let budget = Duration::from_millis(1);
    let start = Instant::now();
    while d.is_rehashing() {
        d.rehash_for(budget);
    }
    (start.elapsed().as_secs_f64() * 1000.0, budget)
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    println!("Dict Incremental-Rehash Benchmark");
    println!("==================================");
    println!();

    // --- Warmup (exercises allocator paths, populates CPU caches) ---
    println!("Warming up...");
    let _ = bench_throughput(10_000);
    println!("Warmup complete.\n");

    // -----------------------------------------------------------------------
    // Throughput and memory at two scales
    // -----------------------------------------------------------------------
    println!("{}", "=".repeat(76));
    println!("  Throughput: insert / mixed lookup / scan / sample");
    println!("{}", "=".repeat(76));

    for &n in &[100_000, 2_000_000] {
        let r = bench_throughput(n);
        print_detail(&r);
    }

    // -----------------------------------------------------------------------
    // Per-operation latency across a migration window
    // -----------------------------------------------------------------------
    println!("\n{}", "=".repeat(76));
    println!("  Worst-case single-op latency, quiet table vs mid-rehash");
    println!("{}", "=".repeat(76));

    for &n in &[100_000, 1_000_000] {
        let (quiet_us, rehash_us, ops) = bench_rehash_latency(n);
        println!("\n--- dict ({} entries) ---", format_count(n));
        println!("  Max find, quiet:       {quiet_us:>10.1} us");
        println!("  Max find, mid-rehash:  {rehash_us:>10.1} us");
        println!("  Ops to drain rehash:   {ops:>10}");
    }

    // -----------------------------------------------------------------------
    // Batch migration from a maintenance tick
    // -----------------------------------------------------------------------
    println!("\n{}", "=".repeat(76));
    println!("  rehash_for: 1 ms budget slices until migration completes");
    println!("{}", "=".repeat(76));

    for &n in &[1_000_000] {
        let (total_ms, budget) = bench_rehash_for(n);
        println!("\n--- dict ({} entries) ---", format_count(n));
        println!("  Budget per slice:  {:>8.1} ms", budget.as_secs_f64() * 1000.0);
        println!("  Total drain time:  {total_ms:>8.1} ms");
    }

    println!("\nDone.");
}
