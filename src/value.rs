//! The symbolic value lattice.
//!
//! Values are either unreachable, a single symbolic expression, or an
//! interval whose bounds are symbolic expressions. Joining intervals
//! widens a disagreeing right end into a right-open interval, which is
//! what makes the fixpoint terminate on monotonically advancing
//! counters. Losing precision is never an error: the domain degrades to
//! the open interval and logs a warning.

use std::collections::BTreeMap;
use std::fmt;

use log::warn;

/// A symbolic expression over parameters, globals and memory reads.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Sym {
    Const(i64),
    Parameter(u32),
    Global(u32),
    Deref(Box<Sym>),
    Op(SymOp, Box<Sym>, Box<Sym>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SymOp {
    Add,
    Sub,
    Mul,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

impl Sym {
    pub fn op(op: SymOp, a: Sym, b: Sym) -> Sym {
        Sym::Op(op, Box::new(a), Box::new(b))
    }

    pub fn contains_parameter(&self) -> bool {
        match self {
            Sym::Parameter(_) => true,
            Sym::Const(_) | Sym::Global(_) => false,
            Sym::Deref(a) => a.contains_parameter(),
            Sym::Op(_, a, b) => a.contains_parameter() || b.contains_parameter(),
        }
    }

    /// Normalisation: constant folding, `a+0 = a`, `(a−x)+x = a`,
    /// `(a+x)+y = a+(x+y)`, and `(a<b)=0 ⇒ a≥b` (with the analogous
    /// comparison flips).
    pub fn simplify(&self) -> Sym {
        match self {
            Sym::Op(op, a, b) => {
                let a = a.simplify();
                let b = b.simplify();
                // Constant folding first.
                if let (Sym::Const(ca), Sym::Const(cb)) = (&a, &b) {
                    if let Some(c) = fold(*op, *ca, *cb) {
                        return Sym::Const(c);
                    }
                }
                match (*op, &a, &b) {
                    // a + 0 = a, 0 + a = a, a - 0 = a
                    (SymOp::Add, x, Sym::Const(0)) => x.clone(),
                    (SymOp::Add, Sym::Const(0), x) => x.clone(),
                    (SymOp::Sub, x, Sym::Const(0)) => x.clone(),
                    // (a - x) + x = a
                    (SymOp::Add, Sym::Op(SymOp::Sub, inner_a, inner_x), x)
                        if inner_x.as_ref() == x =>
                    {
                        inner_a.as_ref().clone()
                    }
                    // (a + x) + y = a + (x + y) when x and y are constants
                    (SymOp::Add, Sym::Op(SymOp::Add, inner_a, inner_x), Sym::Const(y)) => {
                        match inner_x.as_ref() {
                            Sym::Const(x) => match x.checked_add(*y) {
                                Some(c) => Sym::op(
                                    SymOp::Add,
                                    inner_a.as_ref().clone(),
                                    Sym::Const(c),
                                )
                                .simplify(),
                                None => Sym::op(*op, a.clone(), b.clone()),
                            },
                            _ => Sym::op(*op, a.clone(), b.clone()),
                        }
                    }
                    // (a < b) = 0  ⇒  a ≥ b, and the other comparison flips
                    (SymOp::Eq, Sym::Op(cmp, ca, cb), Sym::Const(0)) => match negate(*cmp) {
                        Some(neg) => Sym::Op(neg, ca.clone(), cb.clone()),
                        None => Sym::op(*op, a.clone(), b.clone()),
                    },
                    _ => Sym::op(*op, a, b),
                }
            }
            Sym::Deref(a) => Sym::Deref(Box::new(a.simplify())),
            other => other.clone(),
        }
    }
}

fn fold(op: SymOp, a: i64, b: i64) -> Option<i64> {
    match op {
        SymOp::Add => a.checked_add(b),
        SymOp::Sub => a.checked_sub(b),
        SymOp::Mul => a.checked_mul(b),
        SymOp::Lt => Some((a < b) as i64),
        SymOp::Le => Some((a <= b) as i64),
        SymOp::Gt => Some((a > b) as i64),
        SymOp::Ge => Some((a >= b) as i64),
        SymOp::Eq => Some((a == b) as i64),
    }
}

fn negate(op: SymOp) -> Option<SymOp> {
    match op {
        SymOp::Lt => Some(SymOp::Ge),
        SymOp::Le => Some(SymOp::Gt),
        SymOp::Gt => Some(SymOp::Le),
        SymOp::Ge => Some(SymOp::Lt),
        _ => None,
    }
}

impl fmt::Display for Sym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sym::Const(c) => write!(f, "{c}"),
            Sym::Parameter(i) => write!(f, "p{i}"),
            Sym::Global(i) => write!(f, "g{i}"),
            Sym::Deref(a) => write!(f, "*({a})"),
            Sym::Op(op, a, b) => {
                let s = match op {
                    SymOp::Add => "+",
                    SymOp::Sub => "-",
                    SymOp::Mul => "*",
                    SymOp::Lt => "<",
                    SymOp::Le => "<=",
                    SymOp::Gt => ">",
                    SymOp::Ge => ">=",
                    SymOp::Eq => "=",
                };
                write!(f, "({a}{s}{b})")
            }
        }
    }
}

/// An element of the value lattice.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    /// Unreachable.
    Bottom,
    Symbolic(Sym),
    /// Closed interval with symbolic bounds.
    Interval(Sym, Sym),
    /// Everything up to and including the bound.
    LeftOpenInterval(Sym),
    /// Everything from the bound upward.
    RightOpenInterval(Sym),
    /// Top.
    OpenInterval,
}

impl Value {
    pub fn constant(c: i64) -> Value {
        Value::Symbolic(Sym::Const(c))
    }

    pub fn parameter(i: u32) -> Value {
        Value::Symbolic(Sym::Parameter(i))
    }

    pub fn global(i: u32) -> Value {
        Value::Symbolic(Sym::Global(i))
    }

    pub fn top() -> Value {
        Value::OpenInterval
    }

    pub fn simplify(&self) -> Value {
        match self {
            Value::Symbolic(s) => Value::Symbolic(s.simplify()),
            Value::Interval(l, u) => Value::Interval(l.simplify(), u.simplify()),
            Value::LeftOpenInterval(u) => Value::LeftOpenInterval(u.simplify()),
            Value::RightOpenInterval(l) => Value::RightOpenInterval(l.simplify()),
            other => other.clone(),
        }
    }

    fn bounds(&self) -> Option<(Option<Sym>, Option<Sym>)> {
        match self {
            Value::Symbolic(s) => Some((Some(s.clone()), Some(s.clone()))),
            Value::Interval(l, u) => Some((Some(l.clone()), Some(u.clone()))),
            Value::LeftOpenInterval(u) => Some((None, Some(u.clone()))),
            Value::RightOpenInterval(l) => Some((Some(l.clone()), None)),
            Value::Bottom | Value::OpenInterval => None,
        }
    }

    fn from_bounds(lower: Option<Sym>, upper: Option<Sym>) -> Value {
        match (lower, upper) {
            (Some(l), Some(u)) if l == u => Value::Symbolic(l),
            (Some(l), Some(u)) => Value::Interval(l, u),
            (None, Some(u)) => Value::LeftOpenInterval(u),
            (Some(l), None) => Value::RightOpenInterval(l),
            (None, None) => Value::OpenInterval,
        }
    }

    /// Least upper bound. A right bound that moves widens to a
    /// right-open interval.
    pub fn join(&self, other: &Value) -> Value {
        let a = self.simplify();
        let b = other.simplify();
        if a == b {
            return a;
        }
        match (&a, &b) {
            (Value::Bottom, x) | (x, Value::Bottom) => x.clone(),
            (Value::OpenInterval, _) | (_, Value::OpenInterval) => Value::OpenInterval,
            // First disagreement between two constants still forms a
            // closed interval; a bound that moves again widens below.
            (Value::Symbolic(Sym::Const(c1)), Value::Symbolic(Sym::Const(c2))) => {
                Value::Interval(Sym::Const(*c1.min(c2)), Sym::Const(*c1.max(c2)))
            }
            _ => {
                let (Some((la, ua)), Some((lb, ub))) = (a.bounds(), b.bounds()) else {
                    return Value::OpenInterval;
                };
                let lower = join_lower(la, lb);
                let upper = match (ua, ub) {
                    (Some(x), Some(y)) if x == y => Some(x),
                    // Disagreeing right ends widen.
                    _ => None,
                };
                if lower.is_none() && upper.is_none() {
                    warn!("value join degraded to top: {a} ⊔ {b}");
                }
                Value::from_bounds(lower, upper)
            }
        }
    }

    /// Greatest lower bound. Disjoint constant intervals meet to
    /// Bottom; when precision is impossible the side carrying a
    /// parameter wins.
    pub fn meet(&self, other: &Value) -> Value {
        let a = self.simplify();
        let b = other.simplify();
        if a == b {
            return a;
        }
        match (&a, &b) {
            (Value::Bottom, _) | (_, Value::Bottom) => Value::Bottom,
            (Value::OpenInterval, x) | (x, Value::OpenInterval) => x.clone(),
            _ => {
                if let (Some((la, ua)), Some((lb, ub))) = (a.bounds(), b.bounds()) {
                    if let (Some(cl), Some(cu)) = (
                        max_const(const_of(&la), const_of(&lb)),
                        min_const(const_of(&ua), const_of(&ub)),
                    ) {
                        if cl > cu {
                            return Value::Bottom;
                        }
                        if all_const(&la, &ua) && all_const(&lb, &ub) {
                            return Value::from_bounds(
                                Some(Sym::Const(cl)),
                                Some(Sym::Const(cu)),
                            );
                        }
                    }
                }
                if a.contains_parameter() {
                    a
                } else {
                    b
                }
            }
        }
    }

    /// Whether `self` covers everything `other` can be.
    pub fn subsumes(&self, other: &Value) -> bool {
        let a = self.simplify();
        let b = other.simplify();
        if a == b || b == Value::Bottom || a == Value::OpenInterval {
            return true;
        }
        if a == Value::Bottom || b == Value::OpenInterval {
            return false;
        }
        let (Some((la, ua)), Some((lb, ub))) = (a.bounds(), b.bounds()) else {
            return false;
        };
        let lower_ok = match (&la, &lb) {
            (None, _) => true,
            (Some(x), Some(y)) if x == y => true,
            _ => match (const_of(&la), const_of(&lb)) {
                (Some(x), Some(y)) => x <= y,
                _ => false,
            },
        };
        let upper_ok = match (&ua, &ub) {
            (None, _) => true,
            (Some(x), Some(y)) if x == y => true,
            _ => match (const_of(&ua), const_of(&ub)) {
                (Some(x), Some(y)) => x >= y,
                _ => false,
            },
        };
        lower_ok && upper_ok
    }

    /// Shift the value by a constant byte offset.
    pub fn add_offset(&self, offset: i64) -> Value {
        if offset == 0 {
            return self.clone();
        }
        let shift = |s: &Sym| Sym::op(SymOp::Add, s.clone(), Sym::Const(offset)).simplify();
        match self {
            Value::Symbolic(s) => Value::Symbolic(shift(s)),
            Value::Interval(l, u) => Value::Interval(shift(l), shift(u)),
            Value::LeftOpenInterval(u) => Value::LeftOpenInterval(shift(u)),
            Value::RightOpenInterval(l) => Value::RightOpenInterval(shift(l)),
            other => other.clone(),
        }
    }

    /// Re-key the value under a substitution from symbolic leaves
    /// (parameters, globals) to caller-side values. A leaf the map
    /// sends to a non-symbolic value degrades the whole expression it
    /// occurs in.
    pub fn adapt(&self, subst: &BTreeMap<Sym, Value>) -> Value {
        let adapt_sym = |s: &Sym| adapt_sym(s, subst);
        match self {
            Value::Bottom => Value::Bottom,
            Value::OpenInterval => Value::OpenInterval,
            Value::Symbolic(s) => match adapt_sym(s) {
                AdaptedSym::Sym(s) => Value::Symbolic(s.simplify()),
                AdaptedSym::Value(v) => v,
                AdaptedSym::Top => Value::OpenInterval,
            },
            Value::Interval(l, u) => match (adapt_sym(l), adapt_sym(u)) {
                (AdaptedSym::Sym(l), AdaptedSym::Sym(u)) => {
                    Value::Interval(l.simplify(), u.simplify())
                }
                _ => Value::OpenInterval,
            },
            Value::LeftOpenInterval(u) => match adapt_sym(u) {
                AdaptedSym::Sym(u) => Value::LeftOpenInterval(u.simplify()),
                _ => Value::OpenInterval,
            },
            Value::RightOpenInterval(l) => match adapt_sym(l) {
                AdaptedSym::Sym(l) => Value::RightOpenInterval(l.simplify()),
                _ => Value::OpenInterval,
            },
        }
    }

    pub fn contains_parameter(&self) -> bool {
        match self {
            Value::Symbolic(s) => s.contains_parameter(),
            Value::Interval(l, u) => l.contains_parameter() || u.contains_parameter(),
            Value::LeftOpenInterval(s) | Value::RightOpenInterval(s) => s.contains_parameter(),
            Value::Bottom | Value::OpenInterval => false,
        }
    }

    /// Definitely zero.
    pub fn is_zero(&self) -> bool {
        matches!(self.simplify(), Value::Symbolic(Sym::Const(0)))
    }

    /// Definitely not zero.
    pub fn is_not_zero(&self) -> bool {
        match self.simplify() {
            Value::Symbolic(Sym::Const(c)) => c != 0,
            Value::Interval(Sym::Const(l), Sym::Const(u)) => l > 0 || u < 0,
            Value::RightOpenInterval(Sym::Const(l)) => l > 0,
            Value::LeftOpenInterval(Sym::Const(u)) => u < 0,
            _ => false,
        }
    }
}

enum AdaptedSym {
    Sym(Sym),
    Value(Value),
    Top,
}

fn adapt_sym(s: &Sym, subst: &BTreeMap<Sym, Value>) -> AdaptedSym {
    if let Some(v) = subst.get(s) {
        return match v {
            Value::Symbolic(sym) => AdaptedSym::Sym(sym.clone()),
            other => AdaptedSym::Value(other.clone()),
        };
    }
    match s {
        Sym::Const(_) => AdaptedSym::Sym(s.clone()),
        // An unmapped parameter or global leaks callee-local naming.
        Sym::Parameter(_) | Sym::Global(_) => AdaptedSym::Top,
        Sym::Deref(a) => match adapt_sym(a, subst) {
            AdaptedSym::Sym(a) => AdaptedSym::Sym(Sym::Deref(Box::new(a))),
            _ => AdaptedSym::Top,
        },
        Sym::Op(op, a, b) => match (adapt_sym(a, subst), adapt_sym(b, subst)) {
            (AdaptedSym::Sym(a), AdaptedSym::Sym(b)) => AdaptedSym::Sym(Sym::op(*op, a, b)),
            _ => AdaptedSym::Top,
        },
    }
}

fn const_of(bound: &Option<Sym>) -> Option<i64> {
    match bound {
        Some(Sym::Const(c)) => Some(*c),
        _ => None,
    }
}

fn all_const(l: &Option<Sym>, u: &Option<Sym>) -> bool {
    const_of(l).is_some() && const_of(u).is_some()
}

fn max_const(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    }
}

fn min_const(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    }
}

fn join_lower(a: Option<Sym>, b: Option<Sym>) -> Option<Sym> {
    match (a, b) {
        (Some(x), Some(y)) if x == y => Some(x),
        (Some(Sym::Const(x)), Some(Sym::Const(y))) => Some(Sym::Const(x.min(y))),
        _ => None,
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bottom => write!(f, "⊥"),
            Value::Symbolic(s) => write!(f, "{s}"),
            Value::Interval(l, u) => write!(f, "[{l},{u}]"),
            Value::LeftOpenInterval(u) => write!(f, "(-inf,{u}]"),
            Value::RightOpenInterval(l) => write!(f, "[{l},+inf)"),
            Value::OpenInterval => write!(f, "⊤"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simplify_cancels_and_reassociates() {
        // (a - x) + x = a
        let a = Sym::Parameter(0);
        let x = Sym::Global(1);
        let e = Sym::op(SymOp::Add, Sym::op(SymOp::Sub, a.clone(), x.clone()), x);
        assert_eq!(e.simplify(), a);

        // (p0 + 1) + 2 = p0 + 3
        let e = Sym::op(
            SymOp::Add,
            Sym::op(SymOp::Add, Sym::Parameter(0), Sym::Const(1)),
            Sym::Const(2),
        );
        assert_eq!(e.simplify(), Sym::op(SymOp::Add, Sym::Parameter(0), Sym::Const(3)));

        // p0 + 0 = p0
        let e = Sym::op(SymOp::Add, Sym::Parameter(0), Sym::Const(0));
        assert_eq!(e.simplify(), Sym::Parameter(0));

        // (p0 < p1) = 0  ⇒  p0 ≥ p1
        let e = Sym::op(
            SymOp::Eq,
            Sym::op(SymOp::Lt, Sym::Parameter(0), Sym::Parameter(1)),
            Sym::Const(0),
        );
        assert_eq!(e.simplify(), Sym::op(SymOp::Ge, Sym::Parameter(0), Sym::Parameter(1)));
    }

    #[test]
    fn join_laws() {
        let vals = [
            Value::Bottom,
            Value::constant(0),
            Value::constant(3),
            Value::parameter(0),
            Value::Interval(Sym::Const(0), Sym::Const(3)),
            Value::RightOpenInterval(Sym::Const(1)),
            Value::OpenInterval,
        ];
        for a in &vals {
            assert_eq!(a.join(a), a.simplify(), "idempotence of {a}");
            for b in &vals {
                assert_eq!(a.join(b), b.join(a), "commutativity of {a} ⊔ {b}");
                for c in &vals {
                    assert_eq!(
                        a.join(b).join(c),
                        a.join(&b.join(c)),
                        "associativity of {a} ⊔ {b} ⊔ {c}"
                    );
                }
            }
        }
    }

    #[test]
    fn join_widens_moving_right_bound() {
        let once = Value::constant(0).join(&Value::constant(1));
        assert_eq!(once, Value::Interval(Sym::Const(0), Sym::Const(1)));
        let twice = once.join(&Value::constant(2));
        assert_eq!(twice, Value::RightOpenInterval(Sym::Const(0)));
        // A further join is stable.
        assert_eq!(twice.join(&Value::constant(100)), twice);
    }

    #[test]
    fn meet_disjoint_constants_is_bottom() {
        let a = Value::Interval(Sym::Const(0), Sym::Const(1));
        let b = Value::Interval(Sym::Const(5), Sym::Const(9));
        assert_eq!(a.meet(&b), Value::Bottom);
        assert_eq!(Value::constant(1).meet(&Value::constant(2)), Value::Bottom);
    }

    #[test]
    fn meet_prefers_parameter() {
        let p = Value::parameter(0);
        let g = Value::global(3);
        assert_eq!(p.meet(&g), p);
        assert_eq!(g.meet(&p), p);
    }

    #[test]
    fn subsumption() {
        let wide = Value::Interval(Sym::Const(0), Sym::Const(10));
        let narrow = Value::Interval(Sym::Const(2), Sym::Const(3));
        assert!(wide.subsumes(&narrow));
        assert!(!narrow.subsumes(&wide));
        assert!(Value::OpenInterval.subsumes(&wide));
        assert!(wide.subsumes(&Value::Bottom));
        assert!(Value::RightOpenInterval(Sym::Const(0)).subsumes(&Value::constant(7)));
    }

    #[test]
    fn adapt_rekeys_parameters() {
        let mut subst = BTreeMap::new();
        subst.insert(Sym::Parameter(0), Value::Symbolic(Sym::Global(2)));
        let v = Value::Symbolic(Sym::op(SymOp::Add, Sym::Parameter(0), Sym::Const(4)));
        assert_eq!(
            v.adapt(&subst),
            Value::Symbolic(Sym::op(SymOp::Add, Sym::Global(2), Sym::Const(4)))
        );
        // Unmapped parameter degrades.
        let w = Value::Symbolic(Sym::Parameter(1));
        assert_eq!(w.adapt(&subst), Value::OpenInterval);
    }

    #[test]
    fn zero_predicates() {
        assert!(Value::constant(0).is_zero());
        assert!(Value::constant(4).is_not_zero());
        assert!(!Value::parameter(0).is_zero());
        assert!(!Value::parameter(0).is_not_zero());
        assert!(Value::Interval(Sym::Const(1), Sym::Const(9)).is_not_zero());
    }
}
