//! Reference oracle
//!
//! Feeds host key/value/query rows through the simulator and scores every
//! committed answer against a direct numr computation of causal attention.

use numr::ops::{ActivationOps, MatmulOps};
use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
use numr::tensor::Tensor;

use super::types::{QueryOracle, StepScore};
use crate::error::{Error, Result};
use crate::memory::{MatrixAllocator, MatrixId, Scoped, Tier, TierSimulator};

/// Reference causal attention for the first `rows` positions.
///
/// Inputs are row-major host buffers holding at least `rows` rows each.
/// Returns softmax(Q Kᵗ) V as a row-major (rows, value_dim) buffer.
#[allow(clippy::too_many_arguments)]
pub fn reference_attention(
    client: &CpuClient,
    device: &CpuDevice,
    keys: &[f32],
    values: &[f32],
    queries: &[f32],
    rows: usize,
    key_dim: usize,
    value_dim: usize,
) -> Result<Vec<f32>> {
    for (arg, buf, width) in [("keys", keys, key_dim), ("values", values, value_dim), ("queries", queries, key_dim)] {
        if buf.len() < rows * width {
            return Err(Error::InvalidArgument {
                arg,
                reason: format!("{} elements cannot hold {rows} rows of width {width}", buf.len()),
            });
        }
    }

    let k = Tensor::<CpuRuntime>::from_slice(&keys[..rows * key_dim], &[rows, key_dim], device);
    let v = Tensor::<CpuRuntime>::from_slice(&values[..rows * value_dim], &[rows, value_dim], device);
    let q = Tensor::<CpuRuntime>::from_slice(&queries[..rows * key_dim], &[rows, key_dim], device);

    let k_t = k.transpose(-2, -1)?.contiguous();
    let scores = client.matmul(&q, &k_t)?;
    let weights = client.softmax(&scores, -1)?;
    let out = client.matmul(&weights, &v)?;
    Ok(out.to_vec::<f32>())
}

fn flatten(arg: &'static str, rows: &[Vec<f32>]) -> Result<(Vec<f32>, usize)> {
    let Some(width) = rows.first().map(Vec::len) else {
        return Ok((Vec::new(), 0));
    };
    if width == 0 {
        return Err(Error::InvalidArgument {
            arg,
            reason: "rows must have at least one column".into(),
        });
    }
    if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != width) {
        return Err(Error::InvalidArgument {
            arg,
            reason: format!("row {i} has {} columns, expected {width}", row.len()),
        });
    }
    Ok((rows.concat(), width))
}

/// Oracle backed by host data and a numr reference.
pub struct ReferenceOracle {
    client: CpuClient,
    device: CpuDevice,
    keys: Vec<f32>,
    values: Vec<f32>,
    queries: Vec<f32>,
    len: usize,
    key_dim: usize,
    value_dim: usize,
    key_ids: Vec<MatrixId>,
    value_ids: Vec<MatrixId>,
    next_step: usize,
    pending_query: Option<MatrixId>,
    answers: Vec<Vec<f32>>,
    scores: Vec<StepScore>,
    allocations: usize,
    releases: usize,
    adopted: usize,
}

impl ReferenceOracle {
    /// Upload keys and values (one bulk-tier matrix per row).
    ///
    /// All three sequences must have the same length; queries and keys must
    /// have the same width. An empty sequence yields an oracle with no steps.
    pub fn new<A: MatrixAllocator>(
        sim: &TierSimulator<A>,
        keys: &[Vec<f32>],
        values: &[Vec<f32>],
        queries: &[Vec<f32>],
    ) -> Result<Self> {
        if keys.len() != values.len() || keys.len() != queries.len() {
            return Err(Error::InvalidArgument {
                arg: "queries",
                reason: format!(
                    "sequence lengths differ: {} keys, {} values, {} queries",
                    keys.len(),
                    values.len(),
                    queries.len()
                ),
            });
        }
        let len = keys.len();
        let (keys, key_dim) = flatten("keys", keys)?;
        let (values, value_dim) = flatten("values", values)?;
        let (queries, query_dim) = flatten("queries", queries)?;
        if query_dim != key_dim {
            return Err(Error::InvalidArgument {
                arg: "queries",
                reason: format!("query width {query_dim} != key width {key_dim}"),
            });
        }

        let device = CpuDevice::new();
        let mut oracle = Self {
            client: CpuClient::new(device.clone()),
            device,
            keys,
            values,
            queries,
            len,
            key_dim,
            value_dim,
            key_ids: Vec::with_capacity(len),
            value_ids: Vec::with_capacity(len),
            next_step: 0,
            pending_query: None,
            answers: Vec::with_capacity(len),
            scores: Vec::with_capacity(len),
            allocations: 0,
            releases: 0,
            adopted: 0,
        };

        for i in 0..len {
            let k = &oracle.keys[i * key_dim..(i + 1) * key_dim];
            let key = sim.upload(&format!("key[{i}]"), k, 1, key_dim)?;
            oracle.key_ids.push(key);
            let v = &oracle.values[i * value_dim..(i + 1) * value_dim];
            let value = sim.upload(&format!("value[{i}]"), v, 1, value_dim)?;
            oracle.value_ids.push(value);
            oracle.allocations += 2;
        }

        Ok(oracle)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn key_dim(&self) -> usize {
        self.key_dim
    }

    pub fn value_dim(&self) -> usize {
        self.value_dim
    }

    /// Bulk-tier key rows, in sequence order.
    pub fn keys(&self) -> &[MatrixId] {
        &self.key_ids
    }

    /// Bulk-tier value rows, in sequence order.
    pub fn values(&self) -> &[MatrixId] {
        &self.value_ids
    }

    /// Committed answers, row-major, one per step.
    pub fn answers(&self) -> &[Vec<f32>] {
        &self.answers
    }

    pub fn scores(&self) -> &[StepScore] {
        &self.scores
    }

    pub fn committed(&self) -> usize {
        self.answers.len()
    }

    /// Largest error over every committed answer.
    pub fn max_error(&self) -> f32 {
        self.scores.iter().map(|s| s.max_abs_err).fold(0.0, f32::max)
    }

    /// Handles this oracle allocated (uploads).
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    /// Handles this oracle released (queries, answers, inputs).
    pub fn releases(&self) -> usize {
        self.releases
    }

    /// Answers handed over by `commit`, accepted or not.
    ///
    /// Once closed, `releases() == allocations() + adopted()`.
    pub fn adopted(&self) -> usize {
        self.adopted
    }

    /// Reference output for `step`, (step+1, d_v) row-major.
    pub fn expected(&self, step: usize) -> Result<Vec<f32>> {
        if step >= self.len {
            return Err(Error::OracleError {
                reason: format!("step {step} out of range for {} steps", self.len),
            });
        }
        reference_attention(
            &self.client,
            &self.device,
            &self.keys,
            &self.values,
            &self.queries,
            step + 1,
            self.key_dim,
            self.value_dim,
        )
    }

    /// Release the uploaded inputs and any outstanding query.
    pub fn close<A: MatrixAllocator>(&mut self, sim: &TierSimulator<A>) -> Result<()> {
        let outstanding = self.pending_query.take();
        let inputs = self.key_ids.drain(..).chain(self.value_ids.drain(..));
        for id in outstanding.into_iter().chain(inputs).collect::<Vec<_>>() {
            sim.release(id)?;
            self.releases += 1;
        }
        Ok(())
    }
}

impl<A: MatrixAllocator> QueryOracle<A> for ReferenceOracle {
    fn next_query(&mut self, sim: &TierSimulator<A>) -> Result<MatrixId> {
        if self.pending_query.is_some() {
            return Err(Error::OracleError {
                reason: format!("query for step {} requested before commit", self.next_step),
            });
        }
        if self.next_step >= self.len {
            return Err(Error::OracleError {
                reason: format!("all {} queries already issued", self.len),
            });
        }

        let rows = self.next_step + 1;
        let block = &self.queries[..rows * self.key_dim];
        let query = sim.upload(&format!("query[{}]", self.next_step), block, rows, self.key_dim)?;
        self.allocations += 1;
        self.pending_query = Some(query);
        self.next_step += 1;
        Ok(query)
    }

    fn commit(&mut self, sim: &TierSimulator<A>, answer: MatrixId) -> Result<()> {
        // Guards release on every path below, so count them up front.
        let answer = Scoped::adopt(sim, answer);
        self.adopted += 1;
        self.releases += 1;

        let query = self.pending_query.take().ok_or_else(|| Error::OracleError {
            reason: "commit without an outstanding query".into(),
        })?;
        let query = Scoped::adopt(sim, query);
        self.releases += 1;
        let step = self.next_step - 1;

        let tier = sim.tier(answer.id())?;
        if tier != Tier::Bulk {
            return Err(Error::TierViolation {
                op: "commit",
                label: sim.label(answer.id()).unwrap_or_default(),
                expected: Tier::Bulk,
                actual: tier,
            });
        }
        let shape = answer.shape()?;
        if shape != (step + 1, self.value_dim) {
            return Err(Error::ShapeMismatch {
                op: "commit",
                lhs: shape,
                rhs: (step + 1, self.value_dim),
            });
        }

        let got = sim.read(answer.id())?;
        let expected = self.expected(step)?;
        let max_abs_err = got
            .iter()
            .zip(&expected)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max);

        self.scores.push(StepScore { step, max_abs_err });
        self.answers.push(got);

        // Reads are done; releases queue behind them.
        query.release()?;
        answer.release()
    }
}
