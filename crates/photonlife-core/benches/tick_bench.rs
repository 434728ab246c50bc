use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use photonlife_core::{AudioFeatures, ParticleSystem, PhotonLifeConfig};
use std::time::Duration;

fn bench_system_ticks(c: &mut Criterion) {
    let mut group = c.benchmark_group("system_tick");
    // Allow env overrides so long runs can be dialed in without recompiling.
    let samples: usize = std::env::var("PL_BENCH_SAMPLES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(20);
    let warm: u64 = std::env::var("PL_BENCH_WARMUP_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(2);
    let measure: u64 = std::env::var("PL_BENCH_MEASURE_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(8);
    group.sample_size(samples);
    group.warm_up_time(Duration::from_secs(warm));
    group.measurement_time(Duration::from_secs(measure));

    let steps: usize = std::env::var("PL_BENCH_STEPS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64);
    let populations: Vec<usize> = std::env::var("PL_BENCH_POPULATIONS")
        .ok()
        .map(|s| {
            s.split(',')
                .filter_map(|t| t.trim().parse::<usize>().ok())
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec![500, 2_000, 5_000]);

    let sample = AudioFeatures {
        volume: 65.0,
        tempo: 128.0,
        pitch: 440.0,
        bands: vec![0.6, 0.5, 0.4, 0.5, 0.6, 0.4, 0.3, 0.2],
    };

    for &population in &populations {
        group.bench_function(format!("steps{steps}_particles{population}"), |b| {
            b.iter_batched(
                || {
                    let config = PhotonLifeConfig {
                        population_size: population,
                        rng_seed: Some(0xBEEF),
                        summary_interval: 0,
                        ..PhotonLifeConfig::default()
                    };
                    ParticleSystem::new(config).expect("system")
                },
                |mut system| {
                    for _ in 0..steps {
                        system.tick(&sample, 1.0 / 60.0);
                    }
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_system_ticks);
criterion_main!(benches);
