use nalgebra::DMatrix;
use num_complex::Complex;
use std::rc::Rc;

/// Tagged runtime value traded with the interpreter.
///
/// Matrix and list payloads are shared copy-on-write: cloning a `Value` is
/// cheap, and [`Value::duplicated`] forces a private copy at assignment
/// sites. Everything else is plain owned data.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Complex(Complex<f64>),
    Text(String),
    RealMatrix(Rc<DMatrix<f64>>),
    ComplexMatrix(Rc<DMatrix<Complex<f64>>>),
    List(Rc<Vec<Value>>),
    /// Compiled-equation reference, identified by name.
    Equation(Rc<String>),
    /// A magnitude paired with a unit-expression string.
    PhysicalQuantity { magnitude: f64, unit: String },
    DirectoryRef(String),
    ProgramRef(String),
    VariableRef(String),
}

impl Value {
    pub fn quantity(magnitude: f64, unit: impl Into<String>) -> Self {
        Value::PhysicalQuantity {
            magnitude,
            unit: unit.into(),
        }
    }

    /// A copy whose shared payloads are detached from the original.
    /// Assignment into a variable goes through this so that later in-place
    /// edits never alias the source.
    pub fn duplicated(&self) -> Value {
        match self {
            Value::RealMatrix(m) => Value::RealMatrix(Rc::new((**m).clone())),
            Value::ComplexMatrix(m) => Value::ComplexMatrix(Rc::new((**m).clone())),
            Value::List(items) => {
                Value::List(Rc::new(items.iter().map(Value::duplicated).collect()))
            }
            other => other.clone(),
        }
    }

    /// Magnitude and optional unit text of a real scalar value.
    /// `None` for every non-scalar variant.
    pub fn as_magnitude(&self) -> Option<(f64, Option<&str>)> {
        match self {
            Value::Number(v) => Some((*v, None)),
            Value::PhysicalQuantity { magnitude, unit } => Some((*magnitude, Some(unit))),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Complex(_) => "complex number",
            Value::Text(_) => "text",
            Value::RealMatrix(_) => "real matrix",
            Value::ComplexMatrix(_) => "complex matrix",
            Value::List(_) => "list",
            Value::Equation(_) => "equation",
            Value::PhysicalQuantity { .. } => "unit object",
            Value::DirectoryRef(_) => "directory",
            Value::ProgramRef(_) => "program",
            Value::VariableRef(_) => "variable name",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Value;
    use nalgebra::DMatrix;
    use std::rc::Rc;

    #[test]
    fn duplicated_detaches_matrix_payload() {
        let shared = Rc::new(DMatrix::from_element(2, 2, 1.0));
        let original = Value::RealMatrix(Rc::clone(&shared));
        let copy = original.duplicated();
        match (&original, &copy) {
            (Value::RealMatrix(a), Value::RealMatrix(b)) => {
                assert!(!Rc::ptr_eq(a, b));
                assert_eq!(**a, **b);
            }
            _ => panic!("expected matrices"),
        }
    }

    #[test]
    fn duplicated_detaches_nested_lists() {
        let inner = Value::List(Rc::new(vec![Value::Number(1.0)]));
        let outer = Value::List(Rc::new(vec![inner]));
        let copy = outer.duplicated();
        match (&outer, &copy) {
            (Value::List(a), Value::List(b)) => {
                assert!(!Rc::ptr_eq(a, b));
                match (&a[0], &b[0]) {
                    (Value::List(ai), Value::List(bi)) => assert!(!Rc::ptr_eq(ai, bi)),
                    _ => panic!("expected inner lists"),
                }
            }
            _ => panic!("expected lists"),
        }
    }

    #[test]
    fn as_magnitude_reads_scalars_only() {
        assert_eq!(Value::Number(4.0).as_magnitude(), Some((4.0, None)));
        assert_eq!(
            Value::quantity(9.8, "m/s^2").as_magnitude(),
            Some((9.8, Some("m/s^2")))
        );
        assert_eq!(Value::Text("x".into()).as_magnitude(), None);
    }
}
