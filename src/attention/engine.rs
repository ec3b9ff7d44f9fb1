//! Streaming causal attention engine
//!
//! One step per revealed row. Step i pulls Q_{0..i} from the oracle, extends
//! the context to rows 0..=i, computes softmax(Q Kᵗ) V and commits the full
//! (i+1, d_v) output in the bulk tier. Everything allocated inside a step is
//! released before the step returns, except the committed output (owned by
//! the oracle afterwards) and the persistent context.

use super::context::KvContext;
use super::scores::causal_logits;
use super::softmax::row_softmax;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::memory::{MatrixAllocator, MatrixId, PoolAllocator, Scoped, TierSimulator};
use crate::oracle::QueryOracle;

/// What a single step produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepReport {
    pub step: usize,
    pub context_rows: usize,
    pub logits_shape: (usize, usize),
    pub weights_shape: (usize, usize),
    pub output_shape: (usize, usize),
}

/// Totals for a full run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub steps: usize,
    pub syncs: usize,
    pub peak_scratch_elements: usize,
    pub peak_scratch_handles: usize,
}

/// Multi-step attention state.
///
/// The context is the only state carried between steps. Dropping the engine
/// mid-run releases it.
pub struct AttentionEngine<'s, A: MatrixAllocator = PoolAllocator> {
    sim: &'s TierSimulator<A>,
    context: KvContext<'s, A>,
    config: EngineConfig,
    step: usize,
}

impl<'s, A: MatrixAllocator> AttentionEngine<'s, A> {
    /// Create an engine over bulk-tier (1, d) key and value rows.
    pub fn new(
        sim: &'s TierSimulator<A>,
        keys: &[MatrixId],
        values: &[MatrixId],
        config: &EngineConfig,
    ) -> Result<Self> {
        let context = KvContext::new(sim, keys, values, config.strategy)?;
        Ok(Self {
            sim,
            context,
            config: config.clone(),
            step: 0,
        })
    }

    /// Sequence length N
    pub fn len(&self) -> usize {
        self.context.sequence_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Steps committed so far
    pub fn steps_done(&self) -> usize {
        self.step
    }

    pub fn is_done(&self) -> bool {
        self.step >= self.len()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run the next step and commit its output to `oracle`.
    pub fn step<O>(&mut self, oracle: &mut O) -> Result<StepReport>
    where
        O: QueryOracle<A> + ?Sized,
    {
        if self.is_done() {
            return Err(Error::InvalidArgument {
                arg: "step",
                reason: format!("all {} steps already committed", self.len()),
            });
        }
        let i = self.step;
        let sim = self.sim;

        let query = oracle.next_query(sim)?;
        let q_shape = sim.shape(query)?;
        let expected = (i + 1, self.context.key_dim());
        if q_shape != expected {
            return Err(Error::ShapeMismatch {
                op: "query",
                lhs: q_shape,
                rhs: expected,
            });
        }

        let (weights, logits_shape) = self.attention_weights(query)?;
        let weights_shape = weights.shape()?;

        let out = sim.scoped("out")?;
        sim.matmul(weights.id(), self.context.values()?, out.id())?;
        weights.release()?;
        sim.move_to_bulk(out.id())?;
        let output_shape = out.shape()?;

        self.context.end_step()?;
        sim.synchronize(self.config.verbose_sync)?;
        oracle.commit(sim, out.into_id())?;

        self.step += 1;
        let report = StepReport {
            step: i,
            context_rows: self.context.len(),
            logits_shape,
            weights_shape,
            output_shape,
        };
        tracing::debug!(
            step = i,
            context_rows = report.context_rows,
            logits = ?logits_shape,
            output = ?output_shape,
            "step committed"
        );
        Ok(report)
    }

    /// Reveal the current row and compute softmax(Q Kᵗ) for `query`.
    ///
    /// Returns the scratch-resident weights and the logits shape.
    fn attention_weights(&mut self, query: MatrixId) -> Result<(Scoped<'s, A>, (usize, usize))> {
        let sim = self.sim;
        self.context.advance(self.step)?;

        let keys_t = self.context.keys_transposed()?;
        let logits = causal_logits(sim, query, keys_t.id())?;
        keys_t.release()?;
        let logits_shape = logits.shape()?;

        let weights = row_softmax(sim, logits.id(), self.config.stable_softmax)?;
        logits.release()?;
        Ok((weights, logits_shape))
    }

    /// Release the persistent context and drain the instruction queue, so
    /// the simulator is idle once the engine is gone.
    pub fn finish(self) -> Result<()> {
        let sim = self.sim;
        let verbose = self.config.verbose_sync;
        self.context.finish()?;
        sim.synchronize(verbose)
    }
}

/// Drive every step of a sequence, then release the engine's state.
pub fn run_attention<A, O>(
    sim: &TierSimulator<A>,
    oracle: &mut O,
    keys: &[MatrixId],
    values: &[MatrixId],
    config: &EngineConfig,
) -> Result<RunSummary>
where
    A: MatrixAllocator,
    O: QueryOracle<A> + ?Sized,
{
    tracing::info!(
        steps = keys.len(),
        strategy = config.strategy.name(),
        stable_softmax = config.stable_softmax,
        "streaming attention started"
    );

    let mut engine = AttentionEngine::new(sim, keys, values, config)?;
    while !engine.is_done() {
        engine.step(oracle)?;
    }
    let steps = engine.steps_done();
    engine.finish()?;

    let stats = sim.stats();
    let summary = RunSummary {
        steps,
        syncs: stats.syncs,
        peak_scratch_elements: stats.peak_scratch_elements,
        peak_scratch_handles: stats.peak_scratch_handles,
    };
    tracing::info!(
        steps,
        peak_scratch_elements = summary.peak_scratch_elements,
        peak_scratch_handles = summary.peak_scratch_handles,
        "streaming attention finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContextStrategy, SimulatorConfig};
    use crate::oracle::ReferenceOracle;

    #[test]
    fn test_first_step_returns_first_value() {
        let sim = TierSimulator::with_config(&SimulatorConfig::default());
        let keys = vec![vec![1.0, 0.0]];
        let values = vec![vec![5.0, 7.0]];
        let mut oracle = ReferenceOracle::new(&sim, &keys, &values, &keys).unwrap();
        let (k, v) = (oracle.keys().to_vec(), oracle.values().to_vec());

        let mut engine = AttentionEngine::new(&sim, &k, &v, &EngineConfig::default()).unwrap();
        let report = engine.step(&mut oracle).unwrap();
        assert_eq!(report.logits_shape, (1, 1));
        assert_eq!(report.output_shape, (1, 2));
        assert_eq!(oracle.answers()[0], vec![5.0, 7.0]);

        assert!(engine.is_done());
        assert!(matches!(engine.step(&mut oracle), Err(Error::InvalidArgument { arg: "step", .. })));
        engine.finish().unwrap();
    }

    #[test]
    fn test_step_leaves_only_context_live() {
        let sim = TierSimulator::with_config(&SimulatorConfig::default());
        let rows = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let mut oracle = ReferenceOracle::new(&sim, &rows, &rows, &rows).unwrap();
        let (k, v) = (oracle.keys().to_vec(), oracle.values().to_vec());
        let inputs = sim.allocator().live_count();

        let config = EngineConfig::with_strategy(ContextStrategy::IncrementalTranspose);
        let mut engine = AttentionEngine::new(&sim, &k, &v, &config).unwrap();
        engine.step(&mut oracle).unwrap();
        // K stack, V stack and the transpose cache.
        assert_eq!(sim.allocator().live_count(), inputs + 3);

        drop(engine);
        assert_eq!(sim.allocator().live_count(), inputs);
    }

    #[test]
    fn test_finish_leaves_simulator_idle() {
        let sim = TierSimulator::with_config(&SimulatorConfig::default());
        let rows = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let mut oracle = ReferenceOracle::new(&sim, &rows, &rows, &rows).unwrap();
        let (k, v) = (oracle.keys().to_vec(), oracle.values().to_vec());

        let mut engine = AttentionEngine::new(&sim, &k, &v, &EngineConfig::default()).unwrap();
        while !engine.is_done() {
            engine.step(&mut oracle).unwrap();
        }
        assert!(sim.pending() > 0);
        engine.finish().unwrap();
        assert_eq!(sim.pending(), 0);
        assert_eq!(sim.read(k[0]).unwrap(), vec![1.0, 0.0]);
    }

    #[test]
    fn test_step_weights_are_row_stochastic() {
        let n = 5;
        let rows: Vec<Vec<f32>> = (0..n)
            .map(|i| (0..3).map(|j| ((i * 3 + j) as f32 * 0.7).sin() * 2.0).collect())
            .collect();

        for strategy in ContextStrategy::ALL {
            for stable in [false, true] {
                let sim = TierSimulator::with_config(&SimulatorConfig::default());
                let oracle = ReferenceOracle::new(&sim, &rows, &rows, &rows).unwrap();
                let (k, v) = (oracle.keys().to_vec(), oracle.values().to_vec());
                let config = EngineConfig::with_strategy(strategy).stable(stable);
                let mut engine = AttentionEngine::new(&sim, &k, &v, &config).unwrap();

                for i in 0..n {
                    let block: Vec<f32> = rows[..=i].concat();
                    let query = sim.upload("query", &block, i + 1, 3).unwrap();
                    let (weights, logits_shape) = engine.attention_weights(query).unwrap();
                    assert_eq!(logits_shape, (i + 1, i + 1));
                    sim.synchronize(false).unwrap();

                    let w = sim.read(weights.id()).unwrap();
                    for (r, row) in w.chunks(i + 1).enumerate() {
                        let sum: f32 = row.iter().sum();
                        assert!(
                            (sum - 1.0).abs() < 1e-6,
                            "{} stable={stable} step {i} row {r} sums to {sum}",
                            strategy.name()
                        );
                    }

                    weights.release().unwrap();
                    sim.release(query).unwrap();
                    engine.context.end_step().unwrap();
                    engine.step += 1;
                }
                engine.finish().unwrap();
            }
        }
    }
}
