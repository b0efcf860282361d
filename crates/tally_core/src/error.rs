use thiserror::Error;

pub type Result<T> = std::result::Result<T, MathError>;

/// Failure taxonomy for the numeric core.
///
/// Termination codes of the root solver are deliberately *not* errors; they
/// travel through [`crate::solve::TermCode`] instead. Everything here aborts
/// the operation that raised it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MathError {
    /// The unit expression failed to parse; `offset` is the byte position of
    /// the offending token in the source text.
    #[error("invalid unit expression at offset {offset}")]
    UnitParse { offset: usize },

    /// A name resolved neither as a table unit, a user unit, nor any
    /// single-prefix-stripped form of either.
    #[error("unknown unit \"{0}\"")]
    UnknownUnit(String),

    /// The operands reduce to different base dimensions.
    #[error("inconsistent units: \"{left}\" vs \"{right}\"")]
    UnitMismatch { left: String, right: String },

    /// A conversion left the finite range and range-error suppression was
    /// not in effect.
    #[error("result out of range")]
    OutOfRange,

    /// A solver run is already in flight on this session.
    #[error("solver already running")]
    SolverBusy,

    /// An integrator run is already in flight on this session.
    #[error("integrator already running")]
    IntegratorBusy,

    /// Initial guesses must be real numbers or unit-tagged real numbers.
    #[error("initial guesses must be real numbers")]
    BadGuess,

    /// A fixed-name input variable (LLIM, ULIM) is absent.
    #[error("variable \"{0}\" not found")]
    MissingVariable(String),

    /// An integration limit holds something other than a real number.
    #[error("integration limits must be real numbers")]
    InvalidLimit,

    /// The accuracy variable holds something other than a real number.
    #[error("accuracy must be a real number")]
    InvalidAccuracy,

    /// The callable produced a value no residual can be read from: wrong
    /// type, or a unit incompatible with the residual unit seen first.
    #[error("function result is not a usable number ({0})")]
    InvalidResidual(&'static str),

    /// The callable signalled failure and the component cannot absorb it.
    #[error("function evaluation failed")]
    EvalFailed,

    /// A resume entry was invoked with no evaluation outstanding.
    #[error("no evaluation outstanding")]
    NotSuspended,
}
