use std::collections::HashMap;
use std::sync::OnceLock;

/// One named unit: an optional base-unit expression it expands to, and a
/// scale factor `num/den * 10^exp10`. `expr: None` marks a base dimension.
#[derive(Debug, Clone, Copy)]
pub struct UnitDef {
    pub name: &'static str,
    pub expr: Option<&'static str>,
    pub num: u64,
    pub den: u64,
    pub exp10: i32,
}

impl UnitDef {
    pub fn factor(&self) -> f64 {
        self.num as f64 / self.den as f64 * 10f64.powi(self.exp10)
    }
}

const fn base(name: &'static str) -> UnitDef {
    UnitDef {
        name,
        expr: None,
        num: 1,
        den: 1,
        exp10: 0,
    }
}

const fn derived(name: &'static str, expr: &'static str, num: u64, den: u64, exp10: i32) -> UnitDef {
    UnitDef {
        name,
        expr: Some(expr),
        num,
        den,
        exp10,
    }
}

/// The built-in catalog. Base dimensions use the gram, not the kilogram, so
/// every mass unit takes metric prefixes uniformly; `kg` is parsed as `k`+`g`.
/// The radian `r` is the angular base dimension.
pub const UNITS: &[UnitDef] = &[
    // Base dimensions.
    base("m"),
    base("g"),
    base("s"),
    base("A"),
    base("K"),
    base("cd"),
    base("mol"),
    base("r"),
    // SI derived.
    derived("Hz", "1/s", 1, 1, 0),
    derived("N", "kg*m/s^2", 1, 1, 0),
    derived("Pa", "N/m^2", 1, 1, 0),
    derived("J", "N*m", 1, 1, 0),
    derived("W", "J/s", 1, 1, 0),
    derived("C", "A*s", 1, 1, 0),
    derived("V", "W/A", 1, 1, 0),
    derived("ohm", "V/A", 1, 1, 0),
    derived("S", "A/V", 1, 1, 0),
    derived("F", "C/V", 1, 1, 0),
    derived("Wb", "V*s", 1, 1, 0),
    derived("H", "Wb/A", 1, 1, 0),
    derived("T", "Wb/m^2", 1, 1, 0),
    derived("sr", "r^2", 1, 1, 0),
    derived("lm", "cd*sr", 1, 1, 0),
    derived("lx", "lm/m^2", 1, 1, 0),
    // Angle. The pi-derived factors carry 17 significant decimal digits.
    derived("deg", "r", 17453292519943295, 1_000_000_000_000_000_000, 0),
    derived("grad", "r", 15707963267948966, 1_000_000_000_000_000_000, 0),
    derived("arcmin", "deg", 1, 60, 0),
    derived("arcs", "arcmin", 1, 60, 0),
    // Length.
    derived("in", "m", 254, 1, -4),
    derived("ft", "in", 12, 1, 0),
    derived("yd", "ft", 3, 1, 0),
    derived("mi", "ft", 5280, 1, 0),
    derived("nmi", "m", 1852, 1, 0),
    derived("fath", "ft", 6, 1, 0),
    derived("Å", "m", 1, 1, -10),
    derived("au", "m", 1495978707, 1, 2),
    // Area and volume.
    derived("ha", "m^2", 1, 1, 4),
    derived("acre", "ft^2", 43560, 1, 0),
    derived("l", "m^3", 1, 1, -3),
    derived("gal", "in^3", 231, 1, 0),
    derived("qt", "gal", 1, 4, 0),
    derived("pt", "qt", 1, 2, 0),
    // Mass.
    derived("lb", "g", 45359237, 100_000, 0),
    derived("oz", "lb", 1, 16, 0),
    derived("ton", "lb", 2000, 1, 0),
    derived("t", "g", 1, 1, 6),
    derived("ct", "g", 1, 5, 0),
    // Time.
    derived("min", "s", 60, 1, 0),
    derived("h", "min", 60, 1, 0),
    derived("d", "h", 24, 1, 0),
    derived("yr", "d", 36525, 100, 0),
    // Temperature. Multiplicative factors to Kelvin; offsets live in the
    // affine conversion path, not here.
    derived("°C", "K", 1, 1, 0),
    derived("°F", "K", 5, 9, 0),
    derived("°R", "K", 5, 9, 0),
    // Force, energy, power.
    derived("lbf", "N", 44482216152605, 10_000_000_000_000, 0),
    derived("dyn", "N", 1, 1, -5),
    derived("erg", "J", 1, 1, -7),
    derived("cal", "J", 4184, 1000, 0),
    derived("kcal", "cal", 1, 1, 3),
    derived("Btu", "J", 105505585262, 100_000_000, 0),
    derived("eV", "J", 1602176634, 1_000_000_000, -19),
    derived("Wh", "W*h", 1, 1, 0),
    derived("hp", "ft*lbf/s", 550, 1, 0),
    // Pressure.
    derived("bar", "Pa", 1, 1, 5),
    derived("atm", "Pa", 101325, 1, 0),
    derived("torr", "atm", 1, 760, 0),
    derived("mmHg", "torr", 1, 1, 0),
    derived("inHg", "mmHg", 254, 10, 0),
    derived("psi", "lbf/in^2", 1, 1, 0),
    // Speed.
    derived("knot", "nmi/h", 1, 1, 0),
    derived("kph", "km/h", 1, 1, 0),
    derived("mph", "mi/h", 1, 1, 0),
    derived("c", "m/s", 299792458, 1, 0),
];

pub fn lookup(name: &str) -> Option<&'static UnitDef> {
    static INDEX: OnceLock<HashMap<&'static str, &'static UnitDef>> = OnceLock::new();
    let index = INDEX.get_or_init(|| UNITS.iter().map(|def| (def.name, def)).collect());
    index.get(name).copied()
}

/// Catalog names, in table order; the unit-entry menu layer renders these.
pub fn names() -> impl Iterator<Item = &'static str> {
    UNITS.iter().map(|def| def.name)
}
