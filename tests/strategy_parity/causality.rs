//! Outputs at step i never depend on rows revealed after i.

use super::helpers::*;
use stagedattn::config::ContextStrategy;

fn perturb_from(rows: &[Vec<f32>], from: usize) -> Vec<Vec<f32>> {
    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            if i >= from {
                row.iter().map(|x| x * -3.0 + 1.0).collect()
            } else {
                row.clone()
            }
        })
        .collect()
}

#[test]
fn test_future_rows_do_not_leak() {
    let (n, d, cut) = (6, 3, 3);
    let keys = det_rows(n, d, 0.0);
    let values = det_rows(n, d, 0.8);
    let queries = det_rows(n, d, 1.6);

    for strategy in ContextStrategy::ALL {
        let clean = run_strategy(strategy, &keys, &values, &queries);
        let dirty = run_strategy(
            strategy,
            &perturb_from(&keys, cut),
            &perturb_from(&values, cut),
            &perturb_from(&queries, cut),
        );

        for step in 0..cut {
            assert_eq!(
                clean.answers[step], dirty.answers[step],
                "{} step {step} changed",
                strategy.name()
            );
        }
        assert_ne!(clean.answers[cut], dirty.answers[cut]);
    }
}

#[test]
fn test_prefix_run_matches_full_run() {
    let n = 5;
    let rows = det_rows(n, 2, 0.4);
    let full = run_strategy(ContextStrategy::IncrementalTranspose, &rows, &rows, &rows);
    let prefix = run_strategy(
        ContextStrategy::IncrementalTranspose,
        &rows[..3],
        &rows[..3],
        &rows[..3],
    );
    for step in 0..3 {
        assert_parity_f32(&prefix.answers[step], &full.answers[step], "prefix");
    }
}
