use pmwcas::{pload, DescriptorPool};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::TempDir;
use tracing::debug;

pub const CAPACITY: usize = 4;

pub fn open_pool(dir: &TempDir, name: &str) -> DescriptorPool {
    DescriptorPool::open(dir.path().join(name), "integration").expect("failed to open the pool")
}

/// Run `threads` workers, each performing `iterations` PMwCAS operations
/// which increment `CAPACITY` randomly chosen distinct words out of
/// `field_count`, retrying on conflict. Asserts that no increment is lost
/// or duplicated.
pub fn increment_stress(threads: usize, iterations: usize, field_count: usize) {
    let dir: TempDir = TempDir::new().unwrap();
    let pool: DescriptorPool = open_pool(&dir, "stress.pool");

    let fields: Vec<AtomicU64> = (0..field_count).map(|_| AtomicU64::new(0)).collect();

    std::thread::scope(|scope| {
        for seed in 0..threads as u64 {
            let pool: &DescriptorPool = &pool;
            let fields: &[AtomicU64] = &fields;
            scope.spawn(move || {
                let mut rng: StdRng = StdRng::seed_from_u64(seed);
                for _ in 0..iterations {
                    // pick distinct target fields; keeping them sorted
                    // prevents two operations from claiming the same pair
                    // of words in opposite order
                    let mut indices: Vec<usize> = Vec::with_capacity(CAPACITY);
                    while indices.len() < CAPACITY {
                        let index: usize = rng.gen_range(0..field_count);
                        if !indices.contains(&index) {
                            indices.push(index);
                        }
                    }
                    indices.sort_unstable();

                    // retry until the increments commit
                    loop {
                        let mut desc = pool.get();
                        for &index in &indices {
                            let current: u64 = pload(&fields[index], Ordering::Relaxed);
                            desc.add(&fields[index], current, current + 1, Ordering::Relaxed);
                        }
                        if desc.pmwcas() {
                            break;
                        }
                    }
                }
            });
        }
    });

    let total: u64 = fields
        .iter()
        .map(|field| pload::<u64>(field, Ordering::Relaxed))
        .sum();
    debug!("incremented {total} words across {threads} threads");
    assert_eq!(total, (threads * iterations * CAPACITY) as u64);
}
