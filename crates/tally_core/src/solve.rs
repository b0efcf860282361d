//! Root solver: secant search with expansion of degenerate guesses, then
//! Ridders' method once a sign change is bracketed.
//!
//! The solver never calls the target function itself. Every evaluation is a
//! [`Step::Eval`] handed to the continuation protocol; the interpreter runs
//! the callable and feeds the result back through `on_result`, one full
//! state transition per evaluation.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::protocol::{CallableRef, Continuation};
use crate::traits::Scalar;
use crate::value::Value;

/// How a solver run ended. `Root` is the silent success; the other four are
/// reported to the user with a short message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TermCode {
    Root,
    SignReversal,
    Extremum,
    BadGuesses,
    Constant,
}

impl TermCode {
    /// Stack encoding of the termination code.
    pub fn code(self) -> f64 {
        match self {
            TermCode::Root => 0.0,
            TermCode::SignReversal => 1.0,
            TermCode::Extremum => 2.0,
            TermCode::BadGuesses => 3.0,
            TermCode::Constant => 4.0,
        }
    }

    /// Display message, or `None` for the silent code.
    pub fn message(self) -> Option<&'static str> {
        match self {
            TermCode::Root => None,
            TermCode::SignReversal => Some("Sign Reversal"),
            TermCode::Extremum => Some("Extremum"),
            TermCode::BadGuesses => Some("Bad Guess(es)"),
            TermCode::Constant => Some("Constant?"),
        }
    }
}

/// Consecutive same-|f| steps tolerated before giving up as Extremum.
const NO_IMPROVE_LIMIT: u32 = 30;
/// Cap on the secant extrapolation step, in bracket widths.
const MAX_STEP_WIDTHS: f64 = 100.0;
/// Worsening endpoint-gap brackets needed to call a sign reversal.
const GAP_WORSE_LIMIT: u32 = 3;

/// One secant step from `(x1, fx1)`, `(x2, fx2)`; `fx2 - fx1` is nonzero for
/// every caller. The step is capped at 100x the bracket width and floored at
/// a tenth of it, so the iteration can neither run away nor stall on a
/// returned point.
pub(crate) fn secant_step<T: Scalar>(x1: T, fx1: T, x2: T, fx2: T) -> T {
    let width = x2 - x1;
    let w = width.abs();
    let raw = -fx2 * width / (fx2 - fx1);
    let mut dx = if raw.is_finite() {
        raw
    } else {
        // Infinite residual on the far point: step past x2, away from it.
        width.signum() * w
    };
    let cap = w * T::from_f64(MAX_STEP_WIDTHS).unwrap();
    if dx.abs() > cap {
        dx = dx.signum() * cap;
    }
    let floor = w / T::from_f64(10.0).unwrap();
    if dx.abs() < floor {
        dx = if dx == T::zero() {
            width.signum() * floor
        } else {
            dx.signum() * floor
        };
    }
    x2 + dx
}

/// Ridders' quadratic correction through the bracket `(x1, fx1)`, `(x2,
/// fx2)` and its midpoint sample. `None` when the correction is singular and
/// the caller should bisect instead.
pub(crate) fn ridders_step<T: Scalar>(x1: T, fx1: T, fx2: T, xm: T, fxm: T) -> Option<T> {
    let s = (fxm * fxm - fx1 * fx2).sqrt();
    if s == T::zero() || !s.is_finite() {
        return None;
    }
    let sign = if fx1 < fx2 { -T::one() } else { T::one() };
    let x_new = xm + (xm - x1) * sign * fxm / s;
    x_new.is_finite().then_some(x_new)
}

fn opposite_signs(a: f64, b: f64) -> bool {
    (a < 0.0) != (b < 0.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum SolvePhase {
    /// Awaiting the cached symbolic inverse.
    Inverse,
    /// Awaiting f at the first and second guess.
    Init1,
    Init2,
    /// Awaiting f at an expansion candidate on the given side.
    Expand { low: bool },
    /// Awaiting f at the secant candidate `x3`.
    Secant,
    /// Awaiting f at the bracket midpoint `x3`.
    RiddersMid,
    /// Awaiting f at the Ridders candidate `x3`.
    RiddersNew { xm: f64, fxm: f64 },
}

/// Final report of a solver run.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveFinish {
    pub root: f64,
    pub second: f64,
    pub residual: f64,
    pub code: TermCode,
}

/// What the machine wants next.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Step {
    /// Evaluate f at `x`.
    Eval { x: f64 },
    /// Evaluate the cached symbolic inverse.
    EvalInverse,
    Done(SolveFinish),
}

/// In-flight solver run. Every field round-trips through serde so a state
/// file written mid-run resumes at the same evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolveState {
    pub callable: CallableRef,
    /// Target variable; `None` routes candidates over the evaluation stack.
    pub var_name: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub residual_unit: Option<String>,
    #[serde(default)]
    pub inverse: Option<CallableRef>,
    x1: f64,
    fx1: f64,
    x2: f64,
    fx2: f64,
    x3: f64,
    best_x: f64,
    best_f: f64,
    second_x: f64,
    second_f: f64,
    no_improve: u32,
    retries: u32,
    expand_low: bool,
    init_fail: bool,
    gap_worse: u32,
    prev_gap: f64,
    evals: u64,
    phase: SolvePhase,
    pub(crate) continuation: Continuation,
}

impl SolveState {
    pub(crate) fn new(
        callable: CallableRef,
        var_name: Option<String>,
        unit: Option<String>,
        x1: f64,
        mut x2: f64,
        inverse: Option<CallableRef>,
        continuation: Continuation,
    ) -> Self {
        // A single guess is split into two nearby points before the
        // distinct-f search.
        if x2 == x1 {
            x2 = if x1 == 0.0 { 1.0 } else { x1 * 1.1 };
        }
        let phase = if inverse.is_some() {
            SolvePhase::Inverse
        } else {
            SolvePhase::Init1
        };
        Self {
            callable,
            var_name,
            unit,
            residual_unit: None,
            inverse,
            x1,
            fx1: 0.0,
            x2,
            fx2: 0.0,
            x3: 0.0,
            best_x: x1,
            best_f: f64::MAX,
            second_x: x1,
            second_f: f64::MAX,
            no_improve: 0,
            retries: 0,
            expand_low: true,
            init_fail: false,
            gap_worse: 0,
            prev_gap: 0.0,
            evals: 0,
            phase,
            continuation,
        }
    }

    pub(crate) fn first_step(&mut self) -> Step {
        match self.phase {
            SolvePhase::Inverse => Step::EvalInverse,
            _ => Step::Eval { x: self.x1 },
        }
    }

    /// True while the direct-inverse shortcut is outstanding; its result is
    /// the unknown itself, not a residual.
    pub(crate) fn awaiting_inverse(&self) -> bool {
        matches!(self.phase, SolvePhase::Inverse)
    }

    /// The candidate value as it is written into the target variable.
    pub(crate) fn candidate_value(&self, x: f64) -> Value {
        match &self.unit {
            Some(unit) => Value::quantity(x, unit.clone()),
            None => Value::Number(x),
        }
    }

    /// Feed one evaluation result. `None` marks a failed evaluation, which
    /// counts as an infinite residual everywhere past the initial pair.
    pub(crate) fn on_result(&mut self, res: Option<f64>) -> Step {
        self.evals += 1;
        match self.phase.clone() {
            SolvePhase::Inverse => match res {
                Some(x) if x.is_finite() => {
                    debug!(root = x, "direct solution from symbolic inverse");
                    Step::Done(SolveFinish {
                        root: x,
                        second: x,
                        residual: 0.0,
                        code: TermCode::Root,
                    })
                }
                // Fall through to the iterative search, guesses untouched.
                _ => {
                    self.phase = SolvePhase::Init1;
                    Step::Eval { x: self.x1 }
                }
            },
            SolvePhase::Init1 => {
                match res {
                    Some(f) => {
                        self.fx1 = f;
                        self.track_best(self.x1, f);
                    }
                    None => {
                        self.fx1 = f64::INFINITY;
                        self.init_fail = true;
                    }
                }
                self.phase = SolvePhase::Init2;
                Step::Eval { x: self.x2 }
            }
            SolvePhase::Init2 => {
                match res {
                    Some(f) => {
                        self.fx2 = f;
                        self.track_best(self.x2, f);
                    }
                    None => {
                        if self.init_fail {
                            return Step::Done(self.finish(TermCode::BadGuesses));
                        }
                        self.fx2 = f64::INFINITY;
                    }
                }
                self.after_pair()
            }
            SolvePhase::Expand { low } => {
                let f3 = res.unwrap_or(f64::INFINITY);
                if f3 == 0.0 {
                    return Step::Done(self.finish_root(self.x3, self.x2, 0.0));
                }
                self.track_best(self.x3, f3);
                if f3 == self.fx1 {
                    // Still flat: adopt the expanded point and keep widening.
                    if low {
                        self.x1 = self.x3;
                    } else {
                        self.x2 = self.x3;
                    }
                    self.expand_step()
                } else {
                    // Distinct f at last; pair the new point with the
                    // endpoint it expanded past.
                    if low {
                        self.x2 = self.x1;
                        self.fx2 = self.fx1;
                    }
                    self.x1 = self.x3;
                    self.fx1 = f3;
                    self.after_pair()
                }
            }
            SolvePhase::Secant => {
                let f3 = res.unwrap_or(f64::INFINITY);
                if f3 == 0.0 {
                    return Step::Done(self.finish_root(self.x3, self.x2, 0.0));
                }
                if self.track_best(self.x3, f3) {
                    self.no_improve = 0;
                } else {
                    self.no_improve += 1;
                    if self.no_improve >= NO_IMPROVE_LIMIT {
                        return Step::Done(self.finish(TermCode::Extremum));
                    }
                }
                let straddles = opposite_signs(f3, self.fx2);
                self.x1 = self.x2;
                self.fx1 = self.fx2;
                self.x2 = self.x3;
                self.fx2 = f3;
                if straddles {
                    self.enter_ridders()
                } else {
                    self.secant_next()
                }
            }
            SolvePhase::RiddersMid => {
                let xm = self.x3;
                let fxm = match res {
                    Some(f) if f == 0.0 => {
                        return Step::Done(self.finish_root(xm, self.x2, 0.0));
                    }
                    Some(f) => f,
                    // Midpoint evaluation failed: an infinite residual pairs
                    // the midpoint with the negative endpoint, degrading the
                    // step to a bisection that pushes the failure away.
                    None => f64::INFINITY,
                };
                self.track_best(xm, fxm);
                match ridders_step(self.x1, self.fx1, self.fx2, xm, fxm) {
                    None => {
                        if opposite_signs(fxm, self.fx1) {
                            self.x2 = xm;
                            self.fx2 = fxm;
                        } else {
                            self.x1 = xm;
                            self.fx1 = fxm;
                        }
                        self.update_gap();
                        self.start_ridders()
                    }
                    Some(xn) => {
                        if xn == self.x1 || xn == self.x2 || xn == xm {
                            return Step::Done(self.finish_bracketed());
                        }
                        self.x3 = xn;
                        self.phase = SolvePhase::RiddersNew { xm, fxm };
                        Step::Eval { x: xn }
                    }
                }
            }
            SolvePhase::RiddersNew { xm, fxm } => {
                let xn = self.x3;
                let fxn = res.unwrap_or(f64::INFINITY);
                if fxn == 0.0 {
                    return Step::Done(self.finish_root(xn, xm, 0.0));
                }
                self.track_best(xn, fxn);
                if opposite_signs(fxm, fxn) {
                    self.x1 = xm;
                    self.fx1 = fxm;
                    self.x2 = xn;
                    self.fx2 = fxn;
                } else if opposite_signs(self.fx1, fxn) {
                    self.x2 = xn;
                    self.fx2 = fxn;
                } else {
                    self.x1 = xn;
                    self.fx1 = fxn;
                }
                self.update_gap();
                self.start_ridders()
            }
        }
    }

    fn after_pair(&mut self) -> Step {
        if self.fx1 == 0.0 {
            return Step::Done(self.finish_root(self.x1, self.x2, 0.0));
        }
        if self.fx2 == 0.0 {
            return Step::Done(self.finish_root(self.x2, self.x1, 0.0));
        }
        if self.fx1 == self.fx2 {
            return self.expand_step();
        }
        if opposite_signs(self.fx1, self.fx2) {
            self.enter_ridders()
        } else {
            self.secant_next()
        }
    }

    fn expand_step(&mut self) -> Step {
        let width = self.x2 - self.x1;
        let low = self.expand_low;
        self.expand_low = !low;
        let xe = if low {
            self.x2 - MAX_STEP_WIDTHS * width
        } else {
            self.x1 + MAX_STEP_WIDTHS * width
        };
        if !xe.is_finite() {
            return self.expand_diverged();
        }
        trace!(candidate = xe, low, "expanding flat guess pair");
        self.x3 = xe;
        self.phase = SolvePhase::Expand { low };
        Step::Eval { x: xe }
    }

    fn expand_diverged(&mut self) -> Step {
        if self.retries == 0 {
            // One fresh start from the default guesses before giving up.
            debug!("expansion diverged, retrying from (0, 1)");
            self.retries = 1;
            self.x1 = 0.0;
            self.x2 = 1.0;
            self.expand_low = true;
            self.init_fail = false;
            self.phase = SolvePhase::Init1;
            Step::Eval { x: 0.0 }
        } else {
            Step::Done(self.finish(TermCode::Constant))
        }
    }

    fn secant_next(&mut self) -> Step {
        let x3 = secant_step(self.x1, self.fx1, self.x2, self.fx2);
        if !x3.is_finite() {
            return Step::Done(self.finish(TermCode::Extremum));
        }
        self.x3 = x3;
        self.phase = SolvePhase::Secant;
        Step::Eval { x: x3 }
    }

    fn enter_ridders(&mut self) -> Step {
        self.prev_gap = (self.fx1 - self.fx2).abs();
        self.gap_worse = 0;
        self.start_ridders()
    }

    fn start_ridders(&mut self) -> Step {
        let xm = 0.5 * (self.x1 + self.x2);
        if xm == self.x1 || xm == self.x2 {
            return Step::Done(self.finish_bracketed());
        }
        self.x3 = xm;
        self.phase = SolvePhase::RiddersMid;
        Step::Eval { x: xm }
    }

    fn update_gap(&mut self) {
        // An infinite gap counts as worsening outright: endpoint residuals
        // only overflow near a pole, never while closing in on a root.
        let gap = (self.fx1 - self.fx2).abs();
        if gap > self.prev_gap || gap.is_infinite() {
            self.gap_worse += 1;
        } else {
            self.gap_worse = 0;
        }
        self.prev_gap = gap;
    }

    fn track_best(&mut self, x: f64, f: f64) -> bool {
        if f.abs() < self.best_f.abs() {
            self.second_x = self.best_x;
            self.second_f = self.best_f;
            self.best_x = x;
            self.best_f = f;
            true
        } else {
            if f.abs() < self.second_f.abs() {
                self.second_x = x;
                self.second_f = f;
            }
            false
        }
    }

    /// Bracket collapsed at float resolution. The residual gap growing over
    /// the final Ridders steps marks a pole crossing rather than a root; a
    /// reversal reports the collapse point itself, not the best-|f| sample,
    /// which for a pole sits far from the crossing.
    fn finish_bracketed(&mut self) -> SolveFinish {
        if self.gap_worse < GAP_WORSE_LIMIT {
            return self.finish(TermCode::Root);
        }
        let (root, second, residual) = if self.fx2.abs() <= self.fx1.abs() {
            (self.x2, self.x1, self.fx2)
        } else {
            (self.x1, self.x2, self.fx1)
        };
        debug!(root, evals = self.evals, "sign reversal at bracket collapse");
        SolveFinish {
            root,
            second,
            residual,
            code: TermCode::SignReversal,
        }
    }

    fn finish(&mut self, code: TermCode) -> SolveFinish {
        debug!(
            code = ?code,
            root = self.best_x,
            residual = self.best_f,
            evals = self.evals,
            "solver finished"
        );
        SolveFinish {
            root: self.best_x,
            second: self.second_x,
            residual: self.best_f,
            code,
        }
    }

    fn finish_root(&mut self, root: f64, second: f64, residual: f64) -> SolveFinish {
        debug!(root, evals = self.evals, "solver found exact root");
        SolveFinish {
            root,
            second,
            residual,
            code: TermCode::Root,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ridders_step, secant_step, SolveFinish, SolveState, Step, TermCode};
    use crate::protocol::{CallableRef, Continuation, Origin};

    fn state(x1: f64, x2: f64) -> SolveState {
        SolveState::new(
            CallableRef::Label("F".into()),
            Some("X".into()),
            None,
            x1,
            x2,
            None,
            Continuation {
                origin: Origin::Program,
                silent: false,
            },
        )
    }

    fn drive(mut st: SolveState, f: impl Fn(f64) -> Option<f64>) -> SolveFinish {
        let mut step = st.first_step();
        for _ in 0..200_000 {
            match step {
                Step::Eval { x } => step = st.on_result(f(x)),
                Step::EvalInverse => panic!("no inverse in these tests"),
                Step::Done(finish) => return finish,
            }
        }
        panic!("solver did not terminate");
    }

    #[test]
    fn secant_step_caps_extrapolation() {
        // Nearly flat pair: the raw step explodes, the cap holds it to 100
        // bracket widths.
        let x3 = secant_step(0.0, 1.0, 1.0, 0.999_999);
        assert_eq!(x3, 101.0);
    }

    #[test]
    fn secant_step_enforces_minimum_motion() {
        let x3: f64 = secant_step(0.0, 10.0, 1.0, 1e-9);
        assert!((x3 - 1.1).abs() < 1e-12, "got {x3}");
    }

    #[test]
    fn ridders_step_matches_hand_computation() {
        let xn = ridders_step(0.0, -1.0, 1.0, 0.5, 0.25).expect("regular step");
        let s = (0.0625f64 + 1.0).sqrt();
        assert!((xn - (0.5 - 0.125 / s)).abs() < 1e-15);
    }

    #[test]
    fn ridders_step_reports_singular_correction() {
        assert_eq!(ridders_step(0.0, 0.0, 0.0, 0.5, 0.0), None);
    }

    #[test]
    fn linear_function_roots_exactly() {
        let finish = drive(state(0.0, 10.0), |x| Some(x - 5.0));
        assert_eq!(finish.code, TermCode::Root);
        assert_eq!(finish.root, 5.0);
        assert_eq!(finish.residual, 0.0);
    }

    #[test]
    fn tangent_quadratic_reports_extremum() {
        let finish = drive(state(0.0, 10.0), |x| Some((x - 3.0) * (x - 3.0)));
        assert_eq!(finish.code, TermCode::Extremum);
        assert!(finish.residual >= 0.0);
    }

    #[test]
    fn constant_function_reports_constant() {
        let finish = drive(state(0.0, 1.0), |_| Some(1.0));
        assert_eq!(finish.code, TermCode::Constant);
    }

    #[test]
    fn pole_crossing_reports_sign_reversal() {
        let finish = drive(state(-1.0, 2.0), |x| Some(1.0 / x));
        assert_eq!(finish.code, TermCode::SignReversal);
        assert!(finish.root.abs() < 1e-6, "root estimate {}", finish.root);
    }

    #[test]
    fn smooth_sign_change_is_still_a_root() {
        let finish = drive(state(0.0, 4.0), |x| Some(x * x - 2.0));
        assert_eq!(finish.code, TermCode::Root);
        assert!((finish.root - 2f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn persistent_initial_failure_is_bad_guesses() {
        let finish = drive(state(0.0, 1.0), |_| None);
        assert_eq!(finish.code, TermCode::BadGuesses);
    }

    #[test]
    fn evaluation_failure_pushes_the_bracket_away() {
        let finish = drive(state(-1.0, 10.0), |x| {
            if x < 0.0 {
                None
            } else {
                Some(x - 5.0)
            }
        });
        assert_eq!(finish.code, TermCode::Root);
        assert!((finish.root - 5.0).abs() < 1e-9);
    }

    #[test]
    fn single_guess_is_split_before_search() {
        let finish = drive(state(2.0, 2.0), |x| Some(x - 5.0));
        assert_eq!(finish.code, TermCode::Root);
        assert!((finish.root - 5.0).abs() < 1e-9);
    }

    #[test]
    fn flat_region_retries_from_default_guesses() {
        let finish = drive(state(2e6, 4e6), |x| {
            if x.abs() > 1e6 {
                Some(7.0)
            } else {
                Some(x - 0.5)
            }
        });
        assert_eq!(finish.code, TermCode::Root);
        assert!((finish.root - 0.5).abs() < 1e-9);
    }

    #[test]
    fn midrun_state_roundtrips_through_serde() {
        let mut st = state(0.0, 10.0);
        let f = |x: f64| Some((x - 7.3).tan());
        let mut step = st.first_step();
        // Run a few evaluations, snapshot, then finish both copies.
        for _ in 0..3 {
            match step {
                Step::Eval { x } => step = st.on_result(f(x)),
                _ => panic!("expected an evaluation request"),
            }
        }
        let snapshot: SolveState =
            serde_json::from_str(&serde_json::to_string(&st).expect("serialize"))
                .expect("deserialize");
        let finish_original = drive_from(st, step.clone(), f);
        let finish_restored = drive_from(snapshot, step, f);
        assert_eq!(finish_original, finish_restored);
    }

    fn drive_from(
        mut st: SolveState,
        mut step: Step,
        f: impl Fn(f64) -> Option<f64>,
    ) -> SolveFinish {
        for _ in 0..200_000 {
            match step {
                Step::Eval { x } => step = st.on_result(f(x)),
                Step::EvalInverse => panic!("no inverse in these tests"),
                Step::Done(finish) => return finish,
            }
        }
        panic!("solver did not terminate");
    }
}
