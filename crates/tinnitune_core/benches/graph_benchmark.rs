//! Therapy engine benchmarks
//!
//! Measures the render path of complete therapy chains.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tinnitune_core::{
    DecodedAudio, EngineConfig, ModulationParams, TherapyEngine, TherapySource, Waveform,
};

const SAMPLE_RATE: u32 = 48000;

fn engine() -> TherapyEngine {
    let mut config = EngineConfig::headless(SAMPLE_RATE);
    config.noise_seed = Some(1);
    let mut engine = TherapyEngine::new(config).unwrap();
    engine.initialize().unwrap();
    engine
}

fn bench_render(c: &mut Criterion, name: &str, mut engine: TherapyEngine) {
    let mut group = c.benchmark_group(name);

    // Typical callback sizes
    for frames in [128, 256, 512, 1024] {
        let mut buffer = vec![0.0_f32; frames];
        group.throughput(Throughput::Elements(frames as u64));
        group.bench_function(format!("render_{}_frames", frames), |b| {
            b.iter(|| {
                engine.render(black_box(&mut buffer)).unwrap();
            })
        });
    }

    group.finish();
}

fn benchmark_tone(c: &mut Criterion) {
    let mut engine = engine();
    engine.play_pure_tone(4000.0, Waveform::Sine, -30.0).unwrap();
    bench_render(c, "pure_tone", engine);
}

fn benchmark_band_gap_sessions(c: &mut Criterion) {
    let mut engine = engine();
    engine
        .start_band_gap_session(TherapySource::Pink, 4000.0)
        .unwrap();
    bench_render(c, "band_gap_pink", engine);

    // Nine-partial oscillator bank
    let mut engine = self::engine();
    engine
        .start_band_gap_session(TherapySource::Sawtooth, 4000.0)
        .unwrap();
    bench_render(c, "band_gap_harmonic", engine);
}

fn benchmark_modulation(c: &mut Criterion) {
    let mut engine = engine();
    engine
        .start_modulation_session(ModulationParams::new(4000.0))
        .unwrap();
    bench_render(c, "modulation", engine);
}

fn benchmark_file_chain(c: &mut Criterion) {
    let mut engine = engine();
    let clip: Vec<f32> = (0..44100 * 5)
        .map(|i| (i as f32 * 0.05).sin() * 0.3)
        .collect();
    let audio = DecodedAudio::new(44100, 1, clip).unwrap();
    engine.build_file_therapy_chain(&audio, 4000.0).unwrap();
    bench_render(c, "file_chain", engine);
}

criterion_group!(
    benches,
    benchmark_tone,
    benchmark_band_gap_sessions,
    benchmark_modulation,
    benchmark_file_chain
);
criterion_main!(benches);
