pub mod parser;
pub mod table;

use crate::error::{MathError, Result};
use std::fmt;

pub use parser::parse;

/// Value substituted for an overflowing conversion when range-error
/// suppression is in effect.
pub const HUGE: f64 = f64::MAX;

/// Metric prefixes, 10^-30 through 10^30. `da` (deca) is handled separately
/// since it is the only two-letter prefix.
const PREFIXES: &[(char, i32)] = &[
    ('q', -30),
    ('r', -27),
    ('y', -24),
    ('z', -21),
    ('a', -18),
    ('f', -15),
    ('p', -12),
    ('n', -9),
    ('µ', -6),
    ('u', -6),
    ('m', -3),
    ('c', -2),
    ('d', -1),
    ('h', 2),
    ('k', 3),
    ('M', 6),
    ('G', 9),
    ('T', 12),
    ('P', 15),
    ('E', 18),
    ('Z', 21),
    ('Y', 24),
    ('R', 27),
    ('Q', 30),
];

const DECA_EXP: i32 = 1;

/// A user-defined unit, resolved from the variable space of the host.
#[derive(Debug, Clone, PartialEq)]
pub enum UserUnit {
    /// A new named base dimension.
    Base,
    /// A unit equal to `magnitude` times its own unit expression.
    Derived { magnitude: f64, unit: String },
}

/// Where user-defined units come from. The interpreter exposes its variable
/// space through this; standalone use goes through [`NoUserUnits`].
pub trait UnitSource {
    fn lookup_unit(&self, name: &str) -> Option<UserUnit>;
}

pub struct NoUserUnits;

impl UnitSource for NoUserUnits {
    fn lookup_unit(&self, _name: &str) -> Option<UserUnit> {
        None
    }
}

/// Resolution context for base reduction and conversion.
pub struct UnitEnv<'a> {
    pub user: &'a dyn UnitSource,
    /// Substitute the signed [`HUGE`] sentinel for overflowing conversions
    /// instead of failing with `OutOfRange`.
    pub huge_on_overflow: bool,
}

impl UnitEnv<'_> {
    /// An environment with no user units and strict range checking.
    pub fn bare() -> UnitEnv<'static> {
        UnitEnv {
            user: &NoUserUnits,
            huge_on_overflow: false,
        }
    }
}

/// Ordered mapping unit-name → integer exponent. Zero-exponent entries are
/// pruned as they appear, so the term list is always minimal.
#[derive(Debug, Clone, Default)]
pub struct UnitProduct {
    terms: Vec<(String, i32)>,
}

impl UnitProduct {
    pub fn new() -> Self {
        Self { terms: Vec::new() }
    }

    pub fn is_dimensionless(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn get(&self, name: &str) -> i32 {
        self.terms
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, e)| *e)
            .unwrap_or(0)
    }

    /// Merge `exp` into the entry for `name`, dropping it if the sum is zero.
    pub fn push_term(&mut self, name: &str, exp: i32) {
        if exp == 0 {
            return;
        }
        if let Some(pos) = self.terms.iter().position(|(n, _)| n == name) {
            self.terms[pos].1 += exp;
            if self.terms[pos].1 == 0 {
                self.terms.remove(pos);
            }
        } else {
            self.terms.push((name.to_string(), exp));
        }
    }

    /// Pointwise add of exponents.
    pub fn mul(&mut self, other: &UnitProduct) {
        for (name, exp) in &other.terms {
            self.push_term(name, *exp);
        }
    }

    /// Pointwise scale of exponents.
    pub fn pow(&mut self, n: i32) {
        if n == 0 {
            self.terms.clear();
            return;
        }
        for term in &mut self.terms {
            term.1 *= n;
        }
    }

    /// Pointwise divide of exponents; false if any exponent is not evenly
    /// divisible (the product is left untouched in that case).
    pub fn root(&mut self, n: i32) -> bool {
        if n == 0 || self.terms.iter().any(|(_, e)| e % n != 0) {
            return false;
        }
        for term in &mut self.terms {
            term.1 /= n;
        }
        true
    }

    fn sort_terms(&mut self) {
        self.terms.sort_by(|a, b| a.0.cmp(&b.0));
    }

    /// Reduce to base dimensions: a scale factor and the canonical
    /// (name-sorted) product of base units. Table entries expand
    /// recursively; unresolved names fall back to user units and then to a
    /// single stripped metric prefix.
    pub fn to_base(&self, env: &UnitEnv) -> Result<(f64, UnitProduct)> {
        let mut factor = 1.0;
        let mut base = UnitProduct::new();
        for (name, exp) in &self.terms {
            resolve_name(env, name, *exp, &mut factor, &mut base, true, 0)?;
        }
        base.sort_terms();
        Ok((factor, base))
    }

    fn single_temperature(&self) -> Option<Temp> {
        match self.terms.as_slice() {
            [(name, 1)] => temp_of(name),
            _ => None,
        }
    }

    fn is_pure_radian(&self) -> bool {
        matches!(self.terms.as_slice(), [(name, 1)] if name == "r")
    }
}

impl PartialEq for UnitProduct {
    fn eq(&self, other: &Self) -> bool {
        let mut a = self.terms.clone();
        let mut b = other.terms.clone();
        a.sort();
        b.sort();
        a == b
    }
}

impl Eq for UnitProduct {}

impl fmt::Display for UnitProduct {
    /// Numerator terms first (exponent 1 omitted, >1 as `name^n`), then `/`
    /// and the denominator, parenthesized if multi-term. Dimensionless
    /// renders as `1`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.terms.is_empty() {
            return write!(f, "1");
        }
        let write_term = |f: &mut fmt::Formatter<'_>, name: &str, exp: i32| {
            if exp == 1 {
                write!(f, "{name}")
            } else {
                write!(f, "{name}^{exp}")
            }
        };
        let numer: Vec<_> = self.terms.iter().filter(|(_, e)| *e > 0).collect();
        let denom: Vec<_> = self.terms.iter().filter(|(_, e)| *e < 0).collect();
        if numer.is_empty() {
            write!(f, "1")?;
        } else {
            for (i, (name, exp)) in numer.iter().enumerate() {
                if i > 0 {
                    write!(f, "*")?;
                }
                write_term(f, name, *exp)?;
            }
        }
        if !denom.is_empty() {
            write!(f, "/")?;
            if denom.len() > 1 {
                write!(f, "(")?;
            }
            for (i, (name, exp)) in denom.iter().enumerate() {
                if i > 0 {
                    write!(f, "*")?;
                }
                write_term(f, name, -exp)?;
            }
            if denom.len() > 1 {
                write!(f, ")")?;
            }
        }
        Ok(())
    }
}

fn resolve_name(
    env: &UnitEnv,
    name: &str,
    exp: i32,
    factor: &mut f64,
    base: &mut UnitProduct,
    allow_prefix: bool,
    depth: u32,
) -> Result<()> {
    // Cycle guard for self-referential user units.
    if depth > 16 {
        return Err(MathError::UnknownUnit(name.to_string()));
    }

    if let Some(def) = table::lookup(name) {
        *factor *= def.factor().powi(exp);
        return match def.expr {
            None => {
                base.push_term(name, exp);
                Ok(())
            }
            Some(expr) => {
                let sub = parser::parse(expr)?;
                for (sub_name, sub_exp) in &sub.terms {
                    resolve_name(env, sub_name, sub_exp * exp, factor, base, true, depth + 1)?;
                }
                Ok(())
            }
        };
    }

    if let Some(user) = env.user.lookup_unit(name) {
        return match user {
            UserUnit::Base => {
                base.push_term(name, exp);
                Ok(())
            }
            UserUnit::Derived { magnitude, unit } => {
                *factor *= magnitude.powi(exp);
                let sub = parser::parse(&unit)?;
                for (sub_name, sub_exp) in &sub.terms {
                    resolve_name(env, sub_name, sub_exp * exp, factor, base, true, depth + 1)?;
                }
                Ok(())
            }
        };
    }

    if allow_prefix {
        // A leading "d" gets one chance to read as "da" (deca) before
        // falling back to "d" (deci).
        if let Some(rest) = name.strip_prefix("da") {
            if !rest.is_empty()
                && try_prefixed(env, rest, exp, DECA_EXP, factor, base, depth).is_ok()
            {
                return Ok(());
            }
        }
        let first = name.chars().next().expect("term names are nonempty");
        if let Some(&(_, p)) = PREFIXES.iter().find(|(c, _)| *c == first) {
            let rest = &name[first.len_utf8()..];
            if !rest.is_empty() && try_prefixed(env, rest, exp, p, factor, base, depth).is_ok() {
                return Ok(());
            }
        }
    }

    Err(MathError::UnknownUnit(name.to_string()))
}

/// Resolve `rest` as a literal unit (no second prefix) on scratch state, and
/// merge only on success so a failed probe leaves no residue.
fn try_prefixed(
    env: &UnitEnv,
    rest: &str,
    exp: i32,
    prefix_exp10: i32,
    factor: &mut f64,
    base: &mut UnitProduct,
    depth: u32,
) -> Result<()> {
    let mut probe_factor = 1.0;
    let mut probe_base = UnitProduct::new();
    resolve_name(
        env,
        rest,
        exp,
        &mut probe_factor,
        &mut probe_base,
        false,
        depth + 1,
    )?;
    *factor *= probe_factor * 10f64.powi(prefix_exp10 * exp);
    base.mul(&probe_base);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Temp {
    Celsius,
    Fahrenheit,
    Kelvin,
    Rankine,
}

fn temp_of(name: &str) -> Option<Temp> {
    match name {
        "°C" => Some(Temp::Celsius),
        "°F" => Some(Temp::Fahrenheit),
        "K" => Some(Temp::Kelvin),
        "°R" => Some(Temp::Rankine),
        _ => None,
    }
}

/// Affine conversion between pure temperature units. Base reduction loses
/// the offsets, so these pairs never go through the multiplicative path.
fn convert_temperature(from: Temp, to: Temp, x: f64) -> f64 {
    use Temp::*;
    match (from, to) {
        (Celsius, Fahrenheit) => x * 1.8 + 32.0,
        (Fahrenheit, Celsius) => (x - 32.0) / 1.8,
        (Celsius, Kelvin) => x + 273.15,
        (Kelvin, Celsius) => x - 273.15,
        (Fahrenheit, Rankine) => x + 459.67,
        (Rankine, Fahrenheit) => x - 459.67,
        (Kelvin, Rankine) => x * 1.8,
        (Rankine, Kelvin) => x / 1.8,
        (Celsius, Rankine) => (x + 273.15) * 1.8,
        (Rankine, Celsius) => x / 1.8 - 273.15,
        (Fahrenheit, Kelvin) => (x + 459.67) / 1.8,
        (Kelvin, Fahrenheit) => x * 1.8 - 459.67,
        _ => x,
    }
}

fn angular_equivalent(a: &UnitProduct, b: &UnitProduct) -> bool {
    (a.is_dimensionless() && b.is_pure_radian()) || (b.is_dimensionless() && a.is_pure_radian())
}

/// Convert magnitude `x` from `source` to `target`.
///
/// Both operands reduce to base units; the canonical base products must be
/// equal, except that a dimensionless quantity is equivalent to the base
/// angular unit when the other side is angular. Two pure temperature units
/// convert through the affine formulas instead.
pub fn convert(env: &UnitEnv, target: &UnitProduct, source: &UnitProduct, x: f64) -> Result<f64> {
    if let (Some(from), Some(to)) = (source.single_temperature(), target.single_temperature()) {
        return Ok(convert_temperature(from, to, x));
    }
    let (source_factor, source_base) = source.to_base(env)?;
    let (target_factor, target_base) = target.to_base(env)?;
    if source_base != target_base && !angular_equivalent(&source_base, &target_base) {
        return Err(MathError::UnitMismatch {
            left: source.to_string(),
            right: target.to_string(),
        });
    }
    let out = x * source_factor / target_factor;
    if out.is_finite() {
        Ok(out)
    } else if env.huge_on_overflow {
        Ok(HUGE.copysign(out))
    } else {
        Err(MathError::OutOfRange)
    }
}

/// [`convert`] over unit-expression text, for callers that hold unit tags
/// as strings.
pub fn convert_text(env: &UnitEnv, target: &str, source: &str, x: f64) -> Result<f64> {
    let target = parser::parse(target)?;
    let source = parser::parse(source)?;
    convert(env, &target, &source, x)
}

/// Unit of a product of two tagged quantities: pointwise-add the exponents,
/// degenerating to the other tag (or to none at all) when one side is
/// dimensionless or absent.
pub fn compose_unit_texts(a: Option<&str>, b: Option<&str>) -> Result<Option<String>> {
    let mut product = match a {
        Some(text) => parser::parse(text)?,
        None => UnitProduct::new(),
    };
    if let Some(text) = b {
        product.mul(&parser::parse(text)?);
    }
    if product.is_dimensionless() {
        Ok(None)
    } else {
        Ok(Some(product.to_string()))
    }
}
