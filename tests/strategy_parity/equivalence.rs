//! Parity of the three context strategies.

use super::helpers::*;
use stagedattn::config::ContextStrategy;

#[test]
fn test_strategies_match_unit_rows() {
    let rows = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]];
    let baseline = run_strategy(ContextStrategy::Recompute, &rows, &rows, &rows);
    for strategy in [ContextStrategy::Incremental, ContextStrategy::IncrementalTranspose] {
        let out = run_strategy(strategy, &rows, &rows, &rows);
        assert_runs_match(&out, &baseline, strategy.name(), 1e-5, 1e-7);
    }
}

#[test]
fn test_strategies_match_rectangular() {
    let (n, dk, dv) = (9, 5, 3);
    let keys = det_rows(n, dk, 0.0);
    let values = det_rows(n, dv, 1.3);
    let queries = det_rows(n, dk, 2.1);

    let baseline = run_strategy(ContextStrategy::Recompute, &keys, &values, &queries);
    assert!(baseline.max_error < 1e-5, "recompute: {}", baseline.max_error);
    for strategy in [ContextStrategy::Incremental, ContextStrategy::IncrementalTranspose] {
        let out = run_strategy(strategy, &keys, &values, &queries);
        assert!(out.max_error < 1e-5, "{}: {}", strategy.name(), out.max_error);
        assert_runs_match(&out, &baseline, strategy.name(), 1e-5, 1e-7);
    }
}

#[test]
fn test_every_step_commits_full_history() {
    let n = 4;
    let rows = det_rows(n, 2, 0.5);
    let out = run_strategy(ContextStrategy::IncrementalTranspose, &rows, &rows, &rows);
    for (step, answer) in out.answers.iter().enumerate() {
        assert_eq!(answer.len(), (step + 1) * 2);
    }
}

#[test]
fn test_last_step_matches_reference_per_row() {
    let n = 7;
    let keys = det_rows(n, 4, 0.2);
    let values = det_rows(n, 4, 0.9);
    let queries = det_rows(n, 4, 1.7);
    let out = run_strategy(ContextStrategy::Incremental, &keys, &values, &queries);

    let (client, device) = {
        let device = numr::runtime::cpu::CpuDevice::new();
        (numr::runtime::cpu::CpuClient::new(device.clone()), device)
    };
    let flat = |rows: &[Vec<f32>]| rows.concat();
    let expected = stagedattn::oracle::reference_attention(
        &client,
        &device,
        &flat(&keys),
        &flat(&values),
        &flat(&queries),
        n,
        4,
        4,
    )
    .unwrap();
    assert_parity_f32_tol(&out.answers[n - 1], &expected, "last step", 1e-5, 1e-6);
}
