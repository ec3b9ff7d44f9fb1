//! Max-subtracted softmax gives the same weights as the plain form.

use super::helpers::*;
use stagedattn::config::{ContextStrategy, EngineConfig};

#[test]
fn test_stable_matches_plain() {
    let n = 6;
    let keys = det_rows(n, 4, 0.3);
    let values = det_rows(n, 2, 1.1);
    let queries = det_rows(n, 4, 2.4);

    for strategy in ContextStrategy::ALL {
        let plain = run(&EngineConfig::with_strategy(strategy), &keys, &values, &queries);
        let stable = run(&EngineConfig::with_strategy(strategy).stable(true), &keys, &values, &queries);
        assert!(stable.max_error < 1e-5, "{}: {}", strategy.name(), stable.max_error);
        assert_runs_match(&stable, &plain, strategy.name(), 1e-5, 1e-6);
    }
}

#[test]
fn test_stable_survives_large_logits() {
    // Logits around 400 overflow f32 exp.
    let rows = vec![vec![20.0, 0.0], vec![0.0, 20.0], vec![20.0, 1.0]];
    let values = vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]];

    let stable = run(&EngineConfig::default().stable(true), &rows, &values, &rows);
    for answer in &stable.answers {
        assert!(answer.iter().all(|x| x.is_finite()));
    }
    assert!(stable.max_error < 1e-4, "{}", stable.max_error);

    let plain = run(&EngineConfig::default(), &rows, &values, &rows);
    assert!(plain.answers[0].iter().any(|x| !x.is_finite()));
}
