//! Shared helpers for strategy parity tests.

use stagedattn::config::{ContextStrategy, EngineConfig, SimulatorConfig};
use stagedattn::memory::TierSimulator;
use stagedattn::oracle::ReferenceOracle;
use stagedattn::run_attention;

/// Install a test-writer subscriber once; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic pseudo-random rows using sin-based pattern.
pub fn det_rows(n: usize, d: usize, phase: f32) -> Vec<Vec<f32>> {
    (0..n)
        .map(|i| {
            (0..d)
                .map(|j| ((i * d + j) as f32 * 0.1 + phase).sin() * 0.5)
                .collect()
        })
        .collect()
}

/// Per-step committed outputs of a full run, plus the worst reference error.
pub struct RunOutput {
    pub answers: Vec<Vec<f32>>,
    pub max_error: f32,
}

pub fn run(
    config: &EngineConfig,
    keys: &[Vec<f32>],
    values: &[Vec<f32>],
    queries: &[Vec<f32>],
) -> RunOutput {
    init_tracing();
    let sim = TierSimulator::with_config(&SimulatorConfig::default());
    let mut oracle = ReferenceOracle::new(&sim, keys, values, queries).unwrap();
    let (k, v) = (oracle.keys().to_vec(), oracle.values().to_vec());
    run_attention(&sim, &mut oracle, &k, &v, config).unwrap();
    oracle.close(&sim).unwrap();
    sim.audit(&[]).unwrap();
    RunOutput {
        answers: oracle.answers().to_vec(),
        max_error: oracle.max_error(),
    }
}

pub fn run_strategy(
    strategy: ContextStrategy,
    keys: &[Vec<f32>],
    values: &[Vec<f32>],
    queries: &[Vec<f32>],
) -> RunOutput {
    run(&EngineConfig::with_strategy(strategy), keys, values, queries)
}

pub fn assert_parity_f32_tol(a: &[f32], b: &[f32], op: &str, rtol: f32, atol: f32) {
    assert_eq!(
        a.len(),
        b.len(),
        "parity_f32[{}]: length mismatch: {} vs {}",
        op,
        a.len(),
        b.len()
    );
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let diff = (x - y).abs();
        let tol = atol + rtol * y.abs();
        if diff > tol {
            panic!(
                "parity_f32[{}] at index {}: {} vs {} (diff={}, tol={})",
                op, i, x, y, diff, tol
            );
        }
    }
}

pub fn assert_parity_f32(a: &[f32], b: &[f32], op: &str) {
    assert_parity_f32_tol(a, b, op, 1e-5, 1e-7);
}

/// Step-by-step parity of two runs.
pub fn assert_runs_match(a: &RunOutput, b: &RunOutput, op: &str, rtol: f32, atol: f32) {
    assert_eq!(a.answers.len(), b.answers.len(), "{op}: step count");
    for (step, (x, y)) in a.answers.iter().zip(&b.answers).enumerate() {
        assert_parity_f32_tol(x, y, &format!("{op} step {step}"), rtol, atol);
    }
}
