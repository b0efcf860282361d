//! Adaptive definite integrator.
//!
//! The interval maps onto u ∈ (-1, 1) through x = a + w·(1 + u + (u-u³)/2)/2,
//! whose derivative vanishes at both ends; samples sit at odd multiples of a
//! halving step, so no evaluation ever lands on an endpoint and integrable
//! endpoint singularities cannot abort the run. Partial sums refine by
//! halve-and-average and feed a fixed-width Richardson table.
//!
//! Like the solver, the integrator is a resumable machine: each sample is
//! requested through the continuation protocol and fed back one at a time.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::protocol::{CallableRef, Continuation};
use crate::value::Value;

/// Richardson table width; the deepest column slides once it is full.
const TABLE_COLS: usize = 5;
/// Refinement levels before the convergence test may fire.
const MIN_LEVELS: u32 = 4;
/// Hard cap on refinement levels (worst case ~2^19 evaluations).
const MAX_LEVEL: u32 = 19;
/// Accuracy used when the ACC variable is absent or non-positive.
const DEFAULT_ACC: f64 = 1e-10;

/// Final report: the extrapolated estimate and the last inter-level change,
/// which doubles as the error bound.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegFinish {
    pub estimate: f64,
    pub error: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum IntegStep {
    /// Evaluate the integrand at `x`.
    Eval { x: f64 },
    Done(IntegFinish),
}

/// In-flight integrator run; round-trips through serde mid-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegState {
    pub callable: CallableRef,
    /// Integration variable; `None` routes samples over the evaluation stack.
    pub var_name: Option<String>,
    #[serde(default)]
    pub param_unit: Option<String>,
    #[serde(default)]
    pub result_unit: Option<String>,
    lower: f64,
    width: f64,
    acc: f64,
    table: [f64; TABLE_COLS],
    levels: u32,
    level: u32,
    idx: u32,
    level_sum: f64,
    prev_t: f64,
    prev_est: f64,
    evals: u64,
    pub(crate) continuation: Continuation,
}

impl IntegState {
    pub(crate) fn new(
        callable: CallableRef,
        var_name: Option<String>,
        param_unit: Option<String>,
        lower: f64,
        upper: f64,
        acc: f64,
        continuation: Continuation,
    ) -> Self {
        Self {
            callable,
            var_name,
            param_unit,
            result_unit: None,
            lower,
            width: upper - lower,
            acc: if acc > 0.0 { acc } else { DEFAULT_ACC },
            table: [0.0; TABLE_COLS],
            levels: 0,
            level: 0,
            idx: 0,
            level_sum: 0.0,
            prev_t: 0.0,
            prev_est: 0.0,
            evals: 0,
            continuation,
        }
    }

    pub(crate) fn first_step(&self) -> IntegStep {
        IntegStep::Eval { x: self.sample_x() }
    }

    pub(crate) fn candidate_value(&self, x: f64) -> Value {
        match &self.param_unit {
            Some(unit) => Value::quantity(x, unit.clone()),
            None => Value::Number(x),
        }
    }

    fn step_h(&self) -> f64 {
        0.5f64.powi(self.level as i32)
    }

    fn sample_u(&self) -> f64 {
        -1.0 + (2 * self.idx + 1) as f64 * self.step_h()
    }

    fn sample_x(&self) -> f64 {
        let u = self.sample_u();
        self.lower + self.width * (1.0 + u + (u - u * u * u) * 0.5) * 0.5
    }

    /// Feed one integrand sample. The caller has already reduced the value
    /// to a plain magnitude; evaluation failures abort before reaching here.
    pub(crate) fn on_result(&mut self, f: f64) -> IntegStep {
        let u = self.sample_u();
        self.level_sum += f * (3.0 - 3.0 * u * u) * 0.25;
        self.idx += 1;
        self.evals += 1;

        if self.idx < (1u32 << self.level) {
            return IntegStep::Eval { x: self.sample_x() };
        }

        // Level complete: halve-and-average into the running partial sum,
        // then extrapolate across the table.
        let t = self.prev_t * 0.5 + self.step_h() * self.width * self.level_sum;
        self.prev_t = t;
        let est = self.push_romberg(t);
        let change = (est - self.prev_est).abs();
        trace!(level = self.level, estimate = est, change, "refinement level complete");

        let converged = self.levels >= MIN_LEVELS && change <= self.acc * est.abs();
        if converged || self.level >= MAX_LEVEL {
            debug!(
                estimate = est,
                error = change,
                evals = self.evals,
                converged,
                "integrator finished"
            );
            return IntegStep::Done(IntegFinish {
                estimate: est,
                error: change,
            });
        }

        self.prev_est = est;
        self.level += 1;
        self.idx = 0;
        self.level_sum = 0.0;
        IntegStep::Eval { x: self.sample_x() }
    }

    /// In-place Richardson update. Each completed level enters column 0; the
    /// extrapolation bubbles rightward with weights 4, 16, 64, … and the
    /// deepest column keeps sliding once all five are occupied.
    fn push_romberg(&mut self, t: f64) -> f64 {
        let mut carry = t;
        let mut pow4 = 4.0;
        let cols = (self.levels as usize).min(TABLE_COLS);
        for j in 0..cols {
            let prev = self.table[j];
            self.table[j] = carry;
            carry = (pow4 * carry - prev) / (pow4 - 1.0);
            pow4 *= 4.0;
        }
        if (self.levels as usize) < TABLE_COLS {
            self.table[self.levels as usize] = carry;
        }
        self.levels += 1;
        carry
    }
}
