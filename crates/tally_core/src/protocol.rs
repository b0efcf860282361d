//! Continuation protocol: the re-entrant calling convention shared by the
//! solver and the integrator.
//!
//! Neither component ever calls interpreted code. An evaluation is requested
//! by writing the candidate into the target variable (or the evaluation
//! stack) and handing back an [`EvalRequest`] naming the callable and a
//! [`Sentinel`]. The interpreter pushes that sentinel as a return frame,
//! runs the callable, and on popping the sentinel routes the produced value
//! into [`Session::dispatch`] instead of resuming normal code. Arming an
//! inner solver while the integrator awaits a sample chains the two: the
//! root becomes that sample, unwound through the same dispatch.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MathError, Result};
use crate::integrate::{IntegFinish, IntegState, IntegStep};
use crate::solve::{SolveFinish, SolveState, Step, TermCode};
use crate::units::{self, UnitEnv, UnitSource, UserUnit};
use crate::value::Value;

/// Interpreter services the numeric components consume. Callable invocation
/// is deliberately absent: control transfers happen by returning an
/// [`EvalRequest`], never by calling into the interpreter.
pub trait Host {
    /// Read a named variable; `None` when absent.
    fn read_var(&self, name: &str) -> Option<Value>;
    /// Write a named variable, creating it as needed.
    fn write_var(&mut self, name: &str, value: Value) -> Result<()>;
    /// Push a value onto the evaluation stack.
    fn push_stack(&mut self, value: Value) -> Result<()>;
}

/// User-defined units live in the host's variable space: a Number variable
/// is a new base dimension, a PhysicalQuantity a derived unit.
struct HostUnits<'a, H: Host + ?Sized>(&'a H);

impl<H: Host + ?Sized> UnitSource for HostUnits<'_, H> {
    fn lookup_unit(&self, name: &str) -> Option<UserUnit> {
        match self.0.read_var(name)? {
            Value::Number(_) => Some(UserUnit::Base),
            Value::PhysicalQuantity { magnitude, unit } => {
                Some(UserUnit::Derived { magnitude, unit })
            }
            _ => None,
        }
    }
}

/// The five reserved return-frame markers. The session handles `Solver` and
/// `Integrator`; the rest belong to host subsystems and come back
/// [`Dispatched::Unhandled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sentinel {
    Solver,
    Integrator,
    Plot,
    EquationEditor,
    Caller,
}

/// Which context armed a component, and therefore where control lands when
/// its continuation is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    Program,
    Interactive,
    Plot,
    Integrator,
}

/// Created when a component is armed, consumed exactly once on finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Continuation {
    pub origin: Origin,
    /// Suppresses the display disposition, never the cancellation check.
    pub silent: bool,
}

/// What the interpreter should run: a global program label or a compiled
/// equation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallableRef {
    Label(String),
    Equation(String),
}

/// One requested evaluation. The candidate has already been written to the
/// target variable or pushed on the stack by the time this is returned.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalRequest {
    pub callable: CallableRef,
    pub sentinel: Sentinel,
}

/// Result of an evaluation, passed back when the sentinel is popped.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalOutcome {
    Value(Value),
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    NeedEval(EvalRequest),
    Finished(Finish),
}

/// Terminal report of a run, with the values pushed for the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Finish {
    pub disposition: Disposition,
    pub results: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    ContinueSilently,
    StopAndDisplay(String),
    PropagateError(MathError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    Handled(Progress),
    Unhandled(Sentinel),
}

/// Parameters for arming the solver.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveRequest {
    pub callable: CallableRef,
    /// Target variable; `None` feeds candidates through the evaluation stack.
    pub var_name: Option<String>,
    pub guess1: Value,
    pub guess2: Option<Value>,
    /// Cached symbolic inverse, tried in one step before the iteration.
    pub inverse: Option<CallableRef>,
}

/// Explicit context owning both engine states. One session per execution
/// context; arming a component that is already active is rejected, not
/// queued.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Session {
    pub solver: Option<SolveState>,
    pub integrator: Option<IntegState>,
    #[serde(skip)]
    stop_requested: bool,
    /// Range policy: substitute the signed huge sentinel for overflowing
    /// unit conversions instead of failing.
    pub suppress_range_errors: bool,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the active run to unwind. Observed at the next resume point,
    /// never mid-iteration.
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    /// Route a popped sentinel to the matching resume entry. `Plot`,
    /// `EquationEditor` and `Caller` frames belong to host subsystems.
    pub fn dispatch<H: Host>(
        &mut self,
        host: &mut H,
        sentinel: Sentinel,
        outcome: EvalOutcome,
    ) -> Result<Dispatched> {
        match sentinel {
            Sentinel::Solver => Ok(Dispatched::Handled(self.resume_solver(host, outcome)?)),
            Sentinel::Integrator => {
                Ok(Dispatched::Handled(self.resume_integrator(host, outcome)?))
            }
            other => Ok(Dispatched::Unhandled(other)),
        }
    }

    // --- Solver entry points ---

    pub fn arm_solver<H: Host>(
        &mut self,
        host: &mut H,
        req: SolveRequest,
        origin: Origin,
        silent: bool,
    ) -> Result<Progress> {
        if self.solver.is_some() {
            return Err(MathError::SolverBusy);
        }
        // Arming while the integrator awaits a sample is the combined mode:
        // the root will be fed back as that sample.
        let origin = if self.integrator.is_some() {
            Origin::Integrator
        } else {
            origin
        };

        let (x1, mut unit) = scalar_guess(&req.guess1)?;
        let (mut x2, unit2) = match &req.guess2 {
            Some(guess) => scalar_guess(guess)?,
            None => (x1, None),
        };
        if let (Some(u1), Some(u2)) = (&unit, &unit2) {
            if u1 != u2 {
                let source = HostUnits(&*host);
                let env = UnitEnv {
                    user: &source,
                    huge_on_overflow: self.suppress_range_errors,
                };
                x2 = units::convert_text(&env, u1, u2, x2)?;
            }
        }
        if unit.is_none() {
            unit = unit2;
        }

        debug!(var = ?req.var_name, x1, x2, unit = ?unit, "solver armed");
        let mut state = SolveState::new(
            req.callable,
            req.var_name,
            unit,
            x1,
            x2,
            req.inverse,
            Continuation { origin, silent },
        );
        let step = state.first_step();
        self.solver = Some(state);
        self.solver_progress(host, step)
    }

    /// Resume entry invoked when the interpreter pops the Solver sentinel.
    pub fn resume_solver<H: Host>(
        &mut self,
        host: &mut H,
        outcome: EvalOutcome,
    ) -> Result<Progress> {
        let mut state = self.solver.take().ok_or(MathError::NotSuspended)?;
        if self.stop_requested {
            return Ok(self.stopped(state.continuation));
        }
        let res = if state.awaiting_inverse() {
            // The inverse produces the unknown itself, not a residual.
            match outcome {
                EvalOutcome::Value(value) => value.as_magnitude().map(|(m, _)| m),
                EvalOutcome::Failed => None,
            }
        } else {
            match outcome {
                EvalOutcome::Failed => None,
                EvalOutcome::Value(value) => {
                    match self.solver_residual(&*host, &mut state, value) {
                        Ok(res) => res,
                        Err(err) => return Ok(self.abort(err)),
                    }
                }
            }
        };
        let step = state.on_result(res);
        self.solver = Some(state);
        self.solver_progress(host, step)
    }

    fn solver_progress<H: Host>(&mut self, host: &mut H, step: Step) -> Result<Progress> {
        let state = self.solver.as_ref().expect("solver armed");
        match step {
            Step::Eval { x } => {
                let candidate = state.candidate_value(x);
                match &state.var_name {
                    Some(name) => host.write_var(name, candidate)?,
                    None => host.push_stack(candidate)?,
                }
                Ok(Progress::NeedEval(EvalRequest {
                    callable: state.callable.clone(),
                    sentinel: Sentinel::Solver,
                }))
            }
            Step::EvalInverse => {
                let callable = state.inverse.clone().expect("inverse armed");
                Ok(Progress::NeedEval(EvalRequest {
                    callable,
                    sentinel: Sentinel::Solver,
                }))
            }
            Step::Done(finish) => self.finish_solver(host, finish),
        }
    }

    fn finish_solver<H: Host>(&mut self, host: &mut H, finish: SolveFinish) -> Result<Progress> {
        let state = self.solver.take().expect("solver armed");
        let continuation = state.continuation;
        let root_value = state.candidate_value(finish.root);

        // The target variable is finalized exactly once, here.
        if let Some(name) = &state.var_name {
            host.write_var(name, root_value.clone())?;
        }

        if continuation.origin == Origin::Integrator {
            // Combined mode: the root is the integrand sample. Anything but
            // a clean root makes the sample unusable.
            let outcome = if finish.code == TermCode::Root {
                EvalOutcome::Value(root_value)
            } else {
                EvalOutcome::Failed
            };
            return self.resume_integrator(host, outcome);
        }

        let residual_value = match &state.residual_unit {
            Some(unit) => Value::quantity(finish.residual, unit.clone()),
            None => Value::Number(finish.residual),
        };
        let results = vec![
            root_value,
            state.candidate_value(finish.second),
            residual_value,
            Value::Number(finish.code.code()),
        ];
        for value in &results {
            host.push_stack(value.clone())?;
        }
        let disposition = match finish.code.message() {
            Some(message) if !continuation.silent => {
                Disposition::StopAndDisplay(message.to_string())
            }
            _ => Disposition::ContinueSilently,
        };
        Ok(Progress::Finished(Finish {
            disposition,
            results,
        }))
    }

    /// Reduce a produced value to a residual magnitude. A unit-tagged
    /// residual fixes the residual unit on first sight; later samples must
    /// convert into it. `None` (a NaN) counts as a failed evaluation.
    fn solver_residual<H: Host + ?Sized>(
        &self,
        host: &H,
        state: &mut SolveState,
        value: Value,
    ) -> Result<Option<f64>> {
        let magnitude = match value {
            Value::Number(v) => v,
            Value::PhysicalQuantity { magnitude, unit } => match &state.residual_unit {
                None => {
                    state.residual_unit = Some(unit);
                    magnitude
                }
                Some(expected) if *expected == unit => magnitude,
                Some(expected) => {
                    let source = HostUnits(host);
                    let env = UnitEnv {
                        user: &source,
                        huge_on_overflow: self.suppress_range_errors,
                    };
                    units::convert_text(&env, expected, &unit, magnitude)?
                }
            },
            other => return Err(MathError::InvalidResidual(other.type_name())),
        };
        Ok((!magnitude.is_nan()).then_some(magnitude))
    }

    // --- Integrator entry points ---

    /// Arm the integrator. Limits come from the fixed-name variables LLIM
    /// and ULIM, the tolerance from ACC (defaulted when absent).
    pub fn arm_integrator<H: Host>(
        &mut self,
        host: &mut H,
        callable: CallableRef,
        var_name: Option<String>,
        origin: Origin,
        silent: bool,
    ) -> Result<Progress> {
        if self.integrator.is_some() {
            return Err(MathError::IntegratorBusy);
        }
        let llim = host
            .read_var("LLIM")
            .ok_or_else(|| MathError::MissingVariable("LLIM".into()))?;
        let ulim = host
            .read_var("ULIM")
            .ok_or_else(|| MathError::MissingVariable("ULIM".into()))?;
        let (lower, lower_unit) = scalar_limit(&llim)?;
        let (mut upper, upper_unit) = scalar_limit(&ulim)?;
        let mut param_unit = lower_unit;
        if let (Some(lu), Some(uu)) = (&param_unit, &upper_unit) {
            if lu != uu {
                let source = HostUnits(&*host);
                let env = UnitEnv {
                    user: &source,
                    huge_on_overflow: self.suppress_range_errors,
                };
                upper = units::convert_text(&env, lu, uu, upper)?;
            }
        }
        if param_unit.is_none() {
            param_unit = upper_unit;
        }
        let acc = match host.read_var("ACC") {
            None => 0.0,
            Some(value) => value
                .as_magnitude()
                .map(|(m, _)| m)
                .ok_or(MathError::InvalidAccuracy)?,
        };

        debug!(var = ?var_name, lower, upper, acc, unit = ?param_unit, "integrator armed");
        let state = IntegState::new(
            callable,
            var_name,
            param_unit,
            lower,
            upper,
            acc,
            Continuation { origin, silent },
        );
        let step = state.first_step();
        self.integrator = Some(state);
        self.integrator_progress(host, step)
    }

    /// Resume entry invoked when the interpreter pops the Integrator
    /// sentinel.
    pub fn resume_integrator<H: Host>(
        &mut self,
        host: &mut H,
        outcome: EvalOutcome,
    ) -> Result<Progress> {
        let mut state = self.integrator.take().ok_or(MathError::NotSuspended)?;
        if self.stop_requested {
            return Ok(self.stopped(state.continuation));
        }
        let sample = match outcome {
            // Unlike the solver, the integrator cannot absorb failures.
            EvalOutcome::Failed => return Ok(self.abort(MathError::EvalFailed)),
            EvalOutcome::Value(value) => {
                match self.integrand_magnitude(&*host, &mut state, value) {
                    Ok(sample) => sample,
                    Err(err) => return Ok(self.abort(err)),
                }
            }
        };
        let step = state.on_result(sample);
        self.integrator = Some(state);
        self.integrator_progress(host, step)
    }

    fn integrator_progress<H: Host>(&mut self, host: &mut H, step: IntegStep) -> Result<Progress> {
        let state = self.integrator.as_ref().expect("integrator armed");
        match step {
            IntegStep::Eval { x } => {
                let candidate = state.candidate_value(x);
                match &state.var_name {
                    Some(name) => host.write_var(name, candidate)?,
                    None => host.push_stack(candidate)?,
                }
                Ok(Progress::NeedEval(EvalRequest {
                    callable: state.callable.clone(),
                    sentinel: Sentinel::Integrator,
                }))
            }
            IntegStep::Done(finish) => self.finish_integrator(host, finish),
        }
    }

    fn finish_integrator<H: Host>(&mut self, host: &mut H, finish: IntegFinish) -> Result<Progress> {
        let state = self.integrator.take().expect("integrator armed");
        let unit = match units::compose_unit_texts(
            state.param_unit.as_deref(),
            state.result_unit.as_deref(),
        ) {
            Ok(unit) => unit,
            Err(err) => return Ok(self.abort(err)),
        };
        let tagged = |v: f64| match &unit {
            Some(u) => Value::quantity(v, u.clone()),
            None => Value::Number(v),
        };
        let results = vec![tagged(finish.estimate), tagged(finish.error)];
        for value in &results {
            host.push_stack(value.clone())?;
        }
        Ok(Progress::Finished(Finish {
            disposition: Disposition::ContinueSilently,
            results,
        }))
    }

    /// Reduce an integrand value to a magnitude, fixing the result unit on
    /// first sight. NaN and type failures abort the run.
    fn integrand_magnitude<H: Host + ?Sized>(
        &self,
        host: &H,
        state: &mut IntegState,
        value: Value,
    ) -> Result<f64> {
        let magnitude = match value {
            Value::Number(v) => v,
            Value::PhysicalQuantity { magnitude, unit } => match &state.result_unit {
                None => {
                    state.result_unit = Some(unit);
                    magnitude
                }
                Some(expected) if *expected == unit => magnitude,
                Some(expected) => {
                    let source = HostUnits(host);
                    let env = UnitEnv {
                        user: &source,
                        huge_on_overflow: self.suppress_range_errors,
                    };
                    units::convert_text(&env, expected, &unit, magnitude)?
                }
            },
            other => return Err(MathError::InvalidResidual(other.type_name())),
        };
        if magnitude.is_nan() {
            return Err(MathError::EvalFailed);
        }
        Ok(magnitude)
    }

    // --- Unwinding ---

    /// Hard error: discard all iteration state, unwind to the caller.
    fn abort(&mut self, err: MathError) -> Progress {
        debug!(error = %err, "run aborted");
        self.solver = None;
        self.integrator = None;
        Progress::Finished(Finish {
            disposition: Disposition::PropagateError(err),
            results: vec![],
        })
    }

    /// Stop observed at a resume point: unwind without a further
    /// evaluation, through the outermost continuation of a nested run.
    fn stopped(&mut self, inner: Continuation) -> Progress {
        self.stop_requested = false;
        let continuation = match self.integrator.take() {
            Some(outer) => outer.continuation,
            None => inner,
        };
        self.solver = None;
        debug!("run interrupted");
        let disposition = if continuation.silent {
            Disposition::ContinueSilently
        } else {
            Disposition::StopAndDisplay("Interrupted".to_string())
        };
        Progress::Finished(Finish {
            disposition,
            results: vec![],
        })
    }
}

fn scalar_guess(value: &Value) -> Result<(f64, Option<String>)> {
    match value.as_magnitude() {
        Some((m, unit)) if m.is_finite() => Ok((m, unit.map(str::to_string))),
        _ => Err(MathError::BadGuess),
    }
}

fn scalar_limit(value: &Value) -> Result<(f64, Option<String>)> {
    match value.as_magnitude() {
        Some((m, unit)) if m.is_finite() => Ok((m, unit.map(str::to_string))),
        _ => Err(MathError::InvalidLimit),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        CallableRef, Dispatched, Disposition, EvalOutcome, Origin, Progress, Sentinel, Session,
        SolveRequest,
    };
    use crate::error::MathError;
    use crate::value::Value;
    use std::collections::HashMap;

    #[derive(Debug, Clone, Default)]
    struct FakeHost {
        vars: HashMap<String, Value>,
        stack: Vec<Value>,
    }

    impl super::Host for FakeHost {
        fn read_var(&self, name: &str) -> Option<Value> {
            self.vars.get(name).cloned()
        }

        fn write_var(&mut self, name: &str, value: Value) -> crate::error::Result<()> {
            self.vars.insert(name.to_string(), value);
            Ok(())
        }

        fn push_stack(&mut self, value: Value) -> crate::error::Result<()> {
            self.stack.push(value);
            Ok(())
        }
    }

    fn magnitude(host: &FakeHost, name: &str) -> f64 {
        host.vars
            .get(name)
            .and_then(Value::as_magnitude)
            .map(|(m, _)| m)
            .expect("numeric variable")
    }

    fn solve_request(guess1: Value, guess2: Value) -> SolveRequest {
        SolveRequest {
            callable: CallableRef::Label("F".into()),
            var_name: Some("X".into()),
            guess1,
            guess2: Some(guess2),
            inverse: None,
        }
    }

    /// Play the interpreter: answer every evaluation request by applying
    /// `f` to the target variable, until the run finishes.
    fn run(
        session: &mut Session,
        host: &mut FakeHost,
        mut progress: Progress,
        f: impl Fn(&FakeHost) -> EvalOutcome,
    ) -> super::Finish {
        for _ in 0..1_000_000 {
            match progress {
                Progress::NeedEval(req) => {
                    let outcome = f(host);
                    progress = match session
                        .dispatch(host, req.sentinel, outcome)
                        .expect("dispatch")
                    {
                        Dispatched::Handled(next) => next,
                        Dispatched::Unhandled(s) => panic!("unhandled sentinel {s:?}"),
                    };
                }
                Progress::Finished(finish) => return finish,
            }
        }
        panic!("run did not finish");
    }

    #[test]
    fn solver_writes_candidates_and_finalizes_the_target() {
        let mut session = Session::new();
        let mut host = FakeHost::default();
        let progress = session
            .arm_solver(
                &mut host,
                solve_request(Value::Number(0.0), Value::Number(10.0)),
                Origin::Interactive,
                false,
            )
            .expect("arm");
        let finish = run(&mut session, &mut host, progress, |h| {
            EvalOutcome::Value(Value::Number(magnitude(h, "X") - 5.0))
        });
        assert_eq!(finish.disposition, Disposition::ContinueSilently);
        assert_eq!(finish.results[0], Value::Number(5.0));
        assert_eq!(finish.results[3], Value::Number(0.0));
        assert_eq!(host.vars["X"], Value::Number(5.0));
        assert_eq!(host.stack.len(), 4);
        assert!(session.solver.is_none(), "state must reset after finish");
    }

    #[test]
    fn unit_tagged_guesses_carry_through_the_run() {
        let mut session = Session::new();
        let mut host = FakeHost::default();
        let progress = session
            .arm_solver(
                &mut host,
                solve_request(Value::quantity(0.0, "m"), Value::quantity(10.0, "m")),
                Origin::Interactive,
                false,
            )
            .expect("arm");
        let finish = run(&mut session, &mut host, progress, |h| {
            let (x, unit) = h.vars["X"].as_magnitude().expect("candidate");
            assert_eq!(unit, Some("m"), "candidate must carry its unit");
            EvalOutcome::Value(Value::Number(x - 5.0))
        });
        assert_eq!(finish.results[0], Value::quantity(5.0, "m"));
        assert_eq!(host.vars["X"], Value::quantity(5.0, "m"));
    }

    #[test]
    fn mixed_unit_guesses_convert_into_the_first_tag() {
        let mut session = Session::new();
        let mut host = FakeHost::default();
        // 0.002 km and 9 m: same dimension, different tags.
        let progress = session
            .arm_solver(
                &mut host,
                solve_request(Value::quantity(0.0, "km"), Value::quantity(10.0, "m")),
                Origin::Interactive,
                false,
            )
            .expect("arm");
        let finish = run(&mut session, &mut host, progress, |h| {
            let (x, unit) = h.vars["X"].as_magnitude().expect("candidate");
            assert_eq!(unit, Some("km"));
            EvalOutcome::Value(Value::Number(x - 0.005))
        });
        assert_eq!(finish.results[0], Value::quantity(0.005, "km"));
    }

    #[test]
    fn stack_mode_routes_candidates_over_the_stack() {
        let mut session = Session::new();
        let mut host = FakeHost::default();
        let progress = session
            .arm_solver(
                &mut host,
                SolveRequest {
                    callable: CallableRef::Equation("E".into()),
                    var_name: None,
                    guess1: Value::Number(0.0),
                    guess2: Some(Value::Number(10.0)),
                    inverse: None,
                },
                Origin::Program,
                true,
            )
            .expect("arm");
        let finish = run(&mut session, &mut host, progress, |h| {
            let (x, _) = h
                .stack
                .last()
                .and_then(Value::as_magnitude)
                .expect("candidate on stack");
            EvalOutcome::Value(Value::Number(x - 5.0))
        });
        assert_eq!(finish.results[0], Value::Number(5.0));
    }

    #[test]
    fn arming_twice_is_rejected_outright() {
        let mut session = Session::new();
        let mut host = FakeHost::default();
        session
            .arm_solver(
                &mut host,
                solve_request(Value::Number(0.0), Value::Number(1.0)),
                Origin::Program,
                false,
            )
            .expect("arm");
        let err = session
            .arm_solver(
                &mut host,
                solve_request(Value::Number(0.0), Value::Number(1.0)),
                Origin::Program,
                false,
            )
            .expect_err("second arm");
        assert_eq!(err, MathError::SolverBusy);
    }

    #[test]
    fn non_numeric_guesses_are_rejected() {
        let mut session = Session::new();
        let mut host = FakeHost::default();
        let err = session
            .arm_solver(
                &mut host,
                solve_request(Value::Text("oops".into()), Value::Number(1.0)),
                Origin::Program,
                false,
            )
            .expect_err("bad guess");
        assert_eq!(err, MathError::BadGuess);
    }

    #[test]
    fn displayable_termination_codes_report_a_message() {
        let mut session = Session::new();
        let mut host = FakeHost::default();
        let progress = session
            .arm_solver(
                &mut host,
                solve_request(Value::Number(0.0), Value::Number(1.0)),
                Origin::Interactive,
                false,
            )
            .expect("arm");
        let finish = run(&mut session, &mut host, progress, |_| {
            EvalOutcome::Value(Value::Number(1.0))
        });
        assert_eq!(
            finish.disposition,
            Disposition::StopAndDisplay("Constant?".to_string())
        );
    }

    #[test]
    fn silent_mode_suppresses_the_display() {
        let mut session = Session::new();
        let mut host = FakeHost::default();
        let progress = session
            .arm_solver(
                &mut host,
                solve_request(Value::Number(0.0), Value::Number(1.0)),
                Origin::Plot,
                true,
            )
            .expect("arm");
        let finish = run(&mut session, &mut host, progress, |_| {
            EvalOutcome::Value(Value::Number(1.0))
        });
        assert_eq!(finish.disposition, Disposition::ContinueSilently);
    }

    #[test]
    fn stop_requests_unwind_at_the_resume_point() {
        let mut session = Session::new();
        let mut host = FakeHost::default();
        let progress = session
            .arm_solver(
                &mut host,
                solve_request(Value::Number(0.0), Value::Number(10.0)),
                Origin::Interactive,
                false,
            )
            .expect("arm");
        let Progress::NeedEval(_) = progress else {
            panic!("expected an evaluation request");
        };
        session.request_stop();
        let progress = session
            .resume_solver(&mut host, EvalOutcome::Value(Value::Number(-5.0)))
            .expect("resume");
        match progress {
            Progress::Finished(finish) => {
                assert_eq!(
                    finish.disposition,
                    Disposition::StopAndDisplay("Interrupted".to_string())
                );
                assert!(finish.results.is_empty());
            }
            other => panic!("expected finish, got {other:?}"),
        }
        assert!(session.solver.is_none());
    }

    #[test]
    fn type_errors_abort_and_discard_state() {
        let mut session = Session::new();
        let mut host = FakeHost::default();
        let progress = session
            .arm_solver(
                &mut host,
                solve_request(Value::Number(0.0), Value::Number(10.0)),
                Origin::Program,
                false,
            )
            .expect("arm");
        let finish = run(&mut session, &mut host, progress, |_| {
            EvalOutcome::Value(Value::Text("not a number".into()))
        });
        assert_eq!(
            finish.disposition,
            Disposition::PropagateError(MathError::InvalidResidual("text"))
        );
        assert!(session.solver.is_none());
    }

    #[test]
    fn resume_without_a_run_is_a_structural_error() {
        let mut session = Session::new();
        let mut host = FakeHost::default();
        let err = session
            .resume_solver(&mut host, EvalOutcome::Failed)
            .expect_err("nothing armed");
        assert_eq!(err, MathError::NotSuspended);
    }

    #[test]
    fn foreign_sentinels_are_left_to_the_host() {
        let mut session = Session::new();
        let mut host = FakeHost::default();
        let dispatched = session
            .dispatch(&mut host, Sentinel::Plot, EvalOutcome::Failed)
            .expect("dispatch");
        assert_eq!(dispatched, Dispatched::Unhandled(Sentinel::Plot));
    }

    #[test]
    fn integrator_reads_fixed_name_variables_and_converges() {
        let mut session = Session::new();
        let mut host = FakeHost::default();
        host.vars.insert("LLIM".into(), Value::Number(0.0));
        host.vars.insert("ULIM".into(), Value::Number(1.0));
        host.vars.insert("ACC".into(), Value::Number(1e-8));
        let progress = session
            .arm_integrator(
                &mut host,
                CallableRef::Label("F".into()),
                Some("X".into()),
                Origin::Program,
                true,
            )
            .expect("arm");
        let finish = run(&mut session, &mut host, progress, |h| {
            EvalOutcome::Value(Value::Number(magnitude(h, "X")))
        });
        let (estimate, _) = finish.results[0].as_magnitude().expect("estimate");
        assert!((estimate - 0.5).abs() < 1e-7, "estimate {estimate}");
        assert_eq!(finish.disposition, Disposition::ContinueSilently);
        assert!(session.integrator.is_none());
    }

    #[test]
    fn missing_limits_are_reported_by_name() {
        let mut session = Session::new();
        let mut host = FakeHost::default();
        let err = session
            .arm_integrator(
                &mut host,
                CallableRef::Label("F".into()),
                None,
                Origin::Program,
                false,
            )
            .expect_err("no limits");
        assert_eq!(err, MathError::MissingVariable("LLIM".into()));
    }

    #[test]
    fn integral_unit_is_the_parameter_result_product() {
        let mut session = Session::new();
        let mut host = FakeHost::default();
        host.vars.insert("LLIM".into(), Value::quantity(0.0, "s"));
        host.vars.insert("ULIM".into(), Value::quantity(2.0, "s"));
        host.vars.insert("ACC".into(), Value::Number(1e-8));
        let progress = session
            .arm_integrator(
                &mut host,
                CallableRef::Label("F".into()),
                Some("X".into()),
                Origin::Program,
                true,
            )
            .expect("arm");
        // Constant 3 m/s over 2 s of parameter: 6 m.
        let finish = run(&mut session, &mut host, progress, |_| {
            EvalOutcome::Value(Value::quantity(3.0, "m/s"))
        });
        match &finish.results[0] {
            Value::PhysicalQuantity { magnitude, unit } => {
                assert!((magnitude - 6.0).abs() < 1e-7, "estimate {magnitude}");
                assert_eq!(unit, "m");
            }
            other => panic!("expected a tagged integral, got {other:?}"),
        }
    }

    #[test]
    fn integrand_failure_aborts_the_run() {
        let mut session = Session::new();
        let mut host = FakeHost::default();
        host.vars.insert("LLIM".into(), Value::Number(0.0));
        host.vars.insert("ULIM".into(), Value::Number(1.0));
        let progress = session
            .arm_integrator(
                &mut host,
                CallableRef::Label("F".into()),
                Some("X".into()),
                Origin::Program,
                false,
            )
            .expect("arm");
        let finish = run(&mut session, &mut host, progress, |_| EvalOutcome::Failed);
        assert_eq!(
            finish.disposition,
            Disposition::PropagateError(MathError::EvalFailed)
        );
        assert!(session.integrator.is_none());
    }

    #[test]
    fn combined_mode_feeds_inner_roots_back_as_samples() -> anyhow::Result<()> {
        let mut session = Session::new();
        let mut host = FakeHost::default();
        host.vars.insert("LLIM".into(), Value::Number(0.0));
        host.vars.insert("ULIM".into(), Value::Number(1.0));
        host.vars.insert("ACC".into(), Value::Number(1e-7));
        let mut progress = session.arm_integrator(
            &mut host,
            CallableRef::Label("SHELL".into()),
            Some("X".into()),
            Origin::Program,
            true,
        )?;
        // The integrand at each X is the root t of t - X = 0, found by an
        // inner solver run; the integral of that root over [0, 1] is 1/2.
        let finish = loop {
            match progress {
                Progress::NeedEval(req) => match req.sentinel {
                    Sentinel::Integrator => {
                        progress = session
                            .arm_solver(
                                &mut host,
                                SolveRequest {
                                    callable: CallableRef::Label("INNER".into()),
                                    var_name: Some("T".into()),
                                    guess1: Value::Number(0.0),
                                    guess2: Some(Value::Number(10.0)),
                                    inverse: None,
                                },
                                Origin::Program,
                                true,
                            )
                            .expect("arm inner solver");
                    }
                    Sentinel::Solver => {
                        let residual = magnitude(&host, "T") - magnitude(&host, "X");
                        progress = match session
                            .dispatch(
                                &mut host,
                                Sentinel::Solver,
                                EvalOutcome::Value(Value::Number(residual)),
                            )
                            .expect("dispatch")
                        {
                            Dispatched::Handled(next) => next,
                            other => panic!("unexpected {other:?}"),
                        };
                    }
                    other => panic!("unexpected sentinel {other:?}"),
                },
                Progress::Finished(finish) => break finish,
            }
        };
        let (estimate, _) = finish.results[0].as_magnitude().expect("estimate");
        assert!((estimate - 0.5).abs() < 1e-6, "estimate {estimate}");
        assert!(session.solver.is_none());
        assert!(session.integrator.is_none());
        Ok(())
    }

    #[test]
    fn symbolic_inverse_solves_in_one_evaluation() {
        let mut session = Session::new();
        let mut host = FakeHost::default();
        let progress = session
            .arm_solver(
                &mut host,
                SolveRequest {
                    callable: CallableRef::Equation("E".into()),
                    var_name: Some("X".into()),
                    guess1: Value::Number(0.0),
                    guess2: Some(Value::Number(1.0)),
                    inverse: Some(CallableRef::Equation("E'".into())),
                },
                Origin::Interactive,
                false,
            )
            .expect("arm");
        let Progress::NeedEval(req) = progress else {
            panic!("expected the inverse request");
        };
        assert_eq!(req.callable, CallableRef::Equation("E'".into()));
        let progress = session
            .resume_solver(&mut host, EvalOutcome::Value(Value::Number(42.0)))
            .expect("resume");
        match progress {
            Progress::Finished(finish) => {
                assert_eq!(finish.results[0], Value::Number(42.0));
                assert_eq!(host.vars["X"], Value::Number(42.0));
            }
            other => panic!("expected finish, got {other:?}"),
        }
    }

    #[test]
    fn failed_inverse_falls_through_to_the_guesses() {
        let mut session = Session::new();
        let mut host = FakeHost::default();
        let mut progress = session
            .arm_solver(
                &mut host,
                SolveRequest {
                    callable: CallableRef::Label("F".into()),
                    var_name: Some("X".into()),
                    guess1: Value::Number(0.0),
                    guess2: Some(Value::Number(10.0)),
                    inverse: Some(CallableRef::Label("FINV".into())),
                },
                Origin::Interactive,
                false,
            )
            .expect("arm");
        let Progress::NeedEval(req) = &progress else {
            panic!("expected the inverse request");
        };
        assert_eq!(req.callable, CallableRef::Label("FINV".into()));
        progress = session
            .resume_solver(&mut host, EvalOutcome::Failed)
            .expect("resume");
        let finish = run(&mut session, &mut host, progress, |h| {
            EvalOutcome::Value(Value::Number(magnitude(h, "X") - 5.0))
        });
        assert_eq!(finish.results[0], Value::Number(5.0));
    }

    #[test]
    fn session_roundtrips_mid_run_and_resumes_identically() {
        let f = |h: &FakeHost| EvalOutcome::Value(Value::Number((magnitude(h, "X") - 7.3).exp() - 1.0));
        let mut session = Session::new();
        let mut host = FakeHost::default();
        let mut progress = session
            .arm_solver(
                &mut host,
                solve_request(Value::Number(0.0), Value::Number(10.0)),
                Origin::Program,
                true,
            )
            .expect("arm");
        for _ in 0..3 {
            let Progress::NeedEval(req) = progress else {
                panic!("finished too early");
            };
            let outcome = f(&host);
            progress = match session
                .dispatch(&mut host, req.sentinel, outcome)
                .expect("dispatch")
            {
                Dispatched::Handled(next) => next,
                other => panic!("unexpected {other:?}"),
            };
        }
        let mut restored: Session =
            serde_json::from_str(&serde_json::to_string(&session).expect("serialize"))
                .expect("deserialize");
        let mut host_copy = host.clone();
        let finish = run(&mut session, &mut host, progress.clone(), f);
        let finish_restored = run(&mut restored, &mut host_copy, progress, f);
        assert_eq!(finish, finish_restored);
        let (root, _) = finish.results[0].as_magnitude().expect("root");
        assert!((root - 7.3).abs() < 1e-9, "root {root}");
    }

    #[test]
    fn older_snapshots_default_the_unit_fields() {
        // A state file written before per-call unit tags existed.
        let json = r#"{
            "solver": {
                "callable": {"Label": "F"},
                "var_name": "X",
                "x1": 0.0, "fx1": -5.0,
                "x2": 10.0, "fx2": 5.0,
                "x3": 0.0,
                "best_x": 0.0, "best_f": -5.0,
                "second_x": 10.0, "second_f": 5.0,
                "no_improve": 0, "retries": 0,
                "expand_low": true, "init_fail": false,
                "gap_worse": 0, "prev_gap": 10.0,
                "evals": 2,
                "phase": "Init2",
                "continuation": {"origin": "Program", "silent": false}
            },
            "integrator": null,
            "suppress_range_errors": false
        }"#;
        let session: Session = serde_json::from_str(json).expect("older snapshot must load");
        let solver = session.solver.expect("solver present");
        assert_eq!(solver.unit, None);
        assert_eq!(solver.residual_unit, None);
        assert_eq!(solver.inverse, None);
    }
}
