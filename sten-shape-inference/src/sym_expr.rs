//! Symbolic integer expressions used to describe dimension sizes.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub};
use std::sync::Arc;

use rustc_hash::FxHashMap;

/// A named integer variable.
///
/// Symbols compare equal if their names match.
#[derive(Clone, Debug, PartialEq)]
pub struct Symbol {
    pub name: String,

    /// True if the value is assumed to be `>= 0`.
    pub positive: bool,
}

/// Integer expression over named symbols.
#[derive(Clone)]
pub enum SymExpr {
    /// A known value.
    Value(i32),
    /// A named symbol.
    Var(Arc<Symbol>),
    Add(Arc<SymExpr>, Arc<SymExpr>),
    Sub(Arc<SymExpr>, Arc<SymExpr>),
    Mul(Arc<SymExpr>, Arc<SymExpr>),
    /// Flooring division.
    Div(Arc<SymExpr>, Arc<SymExpr>),
    Max(Arc<SymExpr>, Arc<SymExpr>),
    Min(Arc<SymExpr>, Arc<SymExpr>),
    /// Result of broadcasting two dimension sizes together.
    ///
    /// The operands must be equal or one of them must be 1.
    Broadcast(Arc<SymExpr>, Arc<SymExpr>),
    Neg(Arc<SymExpr>),
}

/// Errors when evaluating a [`SymExpr`] with concrete symbol values.
#[derive(Clone, Debug, PartialEq)]
pub enum EvalError {
    /// The expression references a symbol that has no value.
    UnknownSymbol(String),
    DivideByZero,
    Overflow,
    /// Two sizes were broadcast which are different and neither is 1.
    IncompatibleBroadcast(i32, i32),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnknownSymbol(name) => write!(f, "no value for symbol \"{}\"", name),
            Self::DivideByZero => write!(f, "division by zero"),
            Self::Overflow => write!(f, "integer overflow"),
            Self::IncompatibleBroadcast(a, b) => {
                write!(f, "sizes {} and {} cannot be broadcast", a, b)
            }
        }
    }
}

impl std::error::Error for EvalError {}

/// Concrete values for named symbols.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SymbolMap {
    values: FxHashMap<String, i32>,
}

impl SymbolMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the value of a symbol, returning the previous value.
    pub fn insert(&mut self, name: &str, value: i32) -> Option<i32> {
        self.values.insert(name.to_string(), value)
    }

    pub fn get(&self, name: &str) -> Option<i32> {
        self.values.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Return an iterator over `(name, value)` pairs, in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, i32)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl<'a> FromIterator<(&'a str, i32)> for SymbolMap {
    fn from_iter<I: IntoIterator<Item = (&'a str, i32)>>(iter: I) -> Self {
        let mut map = SymbolMap::new();
        for (name, value) in iter {
            map.insert(name, value);
        }
        map
    }
}

fn floor_div(x: i32, y: i32) -> Option<i32> {
    let q = x.checked_div(y)?;
    if x % y != 0 && ((x < 0) != (y < 0)) {
        Some(q - 1)
    } else {
        Some(q)
    }
}

/// Order terms so that symbols come first, sorted by name. Other terms keep
/// their relative order.
fn cmp_terms(a: &SymExpr, b: &SymExpr) -> Ordering {
    match (a, b) {
        (SymExpr::Var(a), SymExpr::Var(b)) => a.name.cmp(&b.name),
        (SymExpr::Var(_), _) => Ordering::Less,
        (_, SymExpr::Var(_)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

fn dedup_terms(terms: &mut Vec<SymExpr>) {
    let mut i = 0;
    while i < terms.len() {
        if terms[..i].contains(&terms[i]) {
            terms.remove(i);
        } else {
            i += 1;
        }
    }
}

/// Binary operators whose operands can be freely re-ordered and regrouped.
#[derive(Copy, Clone, PartialEq)]
enum Assoc {
    Mul,
    Max,
    Min,
    Broadcast,
}

impl Assoc {
    fn operands(self, expr: &SymExpr) -> Option<(&SymExpr, &SymExpr)> {
        match (self, expr) {
            (Assoc::Mul, SymExpr::Mul(a, b))
            | (Assoc::Max, SymExpr::Max(a, b))
            | (Assoc::Min, SymExpr::Min(a, b))
            | (Assoc::Broadcast, SymExpr::Broadcast(a, b)) => Some((a.as_ref(), b.as_ref())),
            _ => None,
        }
    }

    fn apply(self, a: SymExpr, b: SymExpr) -> SymExpr {
        match self {
            Assoc::Mul => a * b,
            Assoc::Max => SymExpr::Max(a.into(), b.into()),
            Assoc::Min => SymExpr::Min(a.into(), b.into()),
            Assoc::Broadcast => SymExpr::Broadcast(a.into(), b.into()),
        }
    }

    /// Collect the simplified operands of a nested chain of `self`.
    fn collect(self, expr: &SymExpr, terms: &mut Vec<SymExpr>) {
        if let Some((a, b)) = self.operands(expr) {
            self.collect(a, terms);
            self.collect(b, terms);
            return;
        }
        let simplified = expr.simplify();
        if self.operands(&simplified).is_some() {
            self.collect_simplified(&simplified, terms);
        } else {
            terms.push(simplified);
        }
    }

    fn collect_simplified(self, expr: &SymExpr, terms: &mut Vec<SymExpr>) {
        if let Some((a, b)) = self.operands(expr) {
            self.collect_simplified(a, terms);
            self.collect_simplified(b, terms);
        } else {
            terms.push(expr.clone());
        }
    }
}

impl SymExpr {
    /// Create a named symbol with no assumptions about its value.
    pub fn var(name: &str) -> Self {
        SymExpr::Var(Arc::new(Symbol {
            name: name.to_string(),
            positive: false,
        }))
    }

    /// Create a named symbol which is assumed to be `>= 0`.
    pub fn pos_var(name: &str) -> Self {
        SymExpr::Var(Arc::new(Symbol {
            name: name.to_string(),
            positive: true,
        }))
    }

    /// Return the value of this expression if it is a constant.
    pub fn as_value(&self) -> Option<i32> {
        match self {
            Self::Value(x) => Some(*x),
            _ => None,
        }
    }

    pub fn max(&self, other: &SymExpr) -> SymExpr {
        Self::Max(self.clone().into(), other.clone().into())
    }

    pub fn min(&self, other: &SymExpr) -> SymExpr {
        Self::Min(self.clone().into(), other.clone().into())
    }

    pub fn broadcast(&self, other: &SymExpr) -> SymExpr {
        Self::Broadcast(self.clone().into(), other.clone().into())
    }

    /// Return the inclusive range of values this expression may take.
    pub fn range(&self) -> (i32, i32) {
        match self {
            Self::Value(x) => (*x, *x),
            Self::Var(sym) if sym.positive => (0, i32::MAX),
            Self::Var(_) => (i32::MIN, i32::MAX),
            Self::Neg(x) => {
                let (lo, hi) = x.range();
                (hi.saturating_neg(), lo.saturating_neg())
            }
            Self::Add(a, b) => {
                let ((a_lo, a_hi), (b_lo, b_hi)) = (a.range(), b.range());
                (a_lo.saturating_add(b_lo), a_hi.saturating_add(b_hi))
            }
            Self::Sub(a, b) => {
                let ((a_lo, a_hi), (b_lo, b_hi)) = (a.range(), b.range());
                (a_lo.saturating_sub(b_hi), a_hi.saturating_sub(b_lo))
            }
            Self::Mul(a, b) => {
                let ((a_lo, a_hi), (b_lo, b_hi)) = (a.range(), b.range());
                if a_lo >= 0 && b_lo >= 0 {
                    (a_lo.saturating_mul(b_lo), a_hi.saturating_mul(b_hi))
                } else {
                    (i32::MIN, i32::MAX)
                }
            }
            Self::Div(a, b) => {
                let ((a_lo, a_hi), (b_lo, _)) = (a.range(), b.range());
                if a_lo >= 0 && b_lo > 0 {
                    (0, a_hi)
                } else {
                    (i32::MIN, i32::MAX)
                }
            }
            Self::Max(a, b) => {
                let ((a_lo, a_hi), (b_lo, b_hi)) = (a.range(), b.range());
                (a_lo.max(b_lo), a_hi.max(b_hi))
            }
            Self::Min(a, b) => {
                let ((a_lo, a_hi), (b_lo, b_hi)) = (a.range(), b.range());
                (a_lo.min(b_lo), a_hi.min(b_hi))
            }
            Self::Broadcast(a, b) => {
                let ((a_lo, a_hi), (b_lo, b_hi)) = (a.range(), b.range());
                (a_lo.max(b_lo).max(0), a_hi.max(b_hi).max(0))
            }
        }
    }

    /// Return true if this expression is known to be `>= 0`.
    pub fn is_positive(&self) -> bool {
        self.range().0 >= 0
    }

    /// Return the names of symbols referenced by this expression, in order of
    /// first appearance.
    pub fn symbols(&self) -> Vec<&str> {
        fn visit<'a>(expr: &'a SymExpr, names: &mut Vec<&'a str>) {
            match expr {
                SymExpr::Value(_) => {}
                SymExpr::Var(sym) => {
                    if !names.contains(&sym.name.as_str()) {
                        names.push(&sym.name);
                    }
                }
                SymExpr::Neg(x) => visit(x, names),
                SymExpr::Add(a, b)
                | SymExpr::Sub(a, b)
                | SymExpr::Mul(a, b)
                | SymExpr::Div(a, b)
                | SymExpr::Max(a, b)
                | SymExpr::Min(a, b)
                | SymExpr::Broadcast(a, b) => {
                    visit(a, names);
                    visit(b, names);
                }
            }
        }
        let mut names = Vec::new();
        visit(self, &mut names);
        names
    }

    /// Evaluate the expression using concrete values for symbols.
    pub fn eval(&self, symbols: &SymbolMap) -> Result<i32, EvalError> {
        let binop = |a: &SymExpr, b: &SymExpr| -> Result<(i32, i32), EvalError> {
            Ok((a.eval(symbols)?, b.eval(symbols)?))
        };
        match self {
            Self::Value(x) => Ok(*x),
            Self::Var(sym) => symbols
                .get(&sym.name)
                .ok_or_else(|| EvalError::UnknownSymbol(sym.name.clone())),
            Self::Neg(x) => x.eval(symbols)?.checked_neg().ok_or(EvalError::Overflow),
            Self::Add(a, b) => {
                let (a, b) = binop(a.as_ref(), b.as_ref())?;
                a.checked_add(b).ok_or(EvalError::Overflow)
            }
            Self::Sub(a, b) => {
                let (a, b) = binop(a.as_ref(), b.as_ref())?;
                a.checked_sub(b).ok_or(EvalError::Overflow)
            }
            Self::Mul(a, b) => {
                let (a, b) = binop(a.as_ref(), b.as_ref())?;
                a.checked_mul(b).ok_or(EvalError::Overflow)
            }
            Self::Div(a, b) => {
                let (a, b) = binop(a.as_ref(), b.as_ref())?;
                if b == 0 {
                    return Err(EvalError::DivideByZero);
                }
                floor_div(a, b).ok_or(EvalError::Overflow)
            }
            Self::Max(a, b) => {
                let (a, b) = binop(a.as_ref(), b.as_ref())?;
                Ok(a.max(b))
            }
            Self::Min(a, b) => {
                let (a, b) = binop(a.as_ref(), b.as_ref())?;
                Ok(a.min(b))
            }
            Self::Broadcast(a, b) => match binop(a.as_ref(), b.as_ref())? {
                (a, b) if a == b => Ok(a),
                (1, b) => Ok(b),
                (a, 1) => Ok(a),
                (a, b) => Err(EvalError::IncompatibleBroadcast(a, b)),
            },
        }
    }

    /// Return an equivalent expression with constants folded, identities
    /// removed and opposite terms cancelled.
    ///
    /// Operands of commutative operators are put in a canonical order, so
    /// that equal expressions built in different ways simplify to the same
    /// result.
    pub fn simplify(&self) -> SymExpr {
        match self {
            Self::Value(_) | Self::Var(_) => self.clone(),
            Self::Neg(x) => match x.simplify() {
                Self::Value(v) => match v.checked_neg() {
                    Some(v) => Self::Value(v),
                    None => Self::Neg(Self::Value(v).into()),
                },
                Self::Neg(inner) => (*inner).clone(),
                x => Self::Neg(x.into()),
            },
            Self::Add(..) | Self::Sub(..) => self.simplify_sum(),
            Self::Mul(..) => self.simplify_product(),
            Self::Div(a, b) => simplify_div(a.simplify(), b.simplify()),
            Self::Max(..) => self.simplify_extremum(Assoc::Max),
            Self::Min(..) => self.simplify_extremum(Assoc::Min),
            Self::Broadcast(..) => self.simplify_broadcast(),
        }
    }

    fn simplify_sum(&self) -> SymExpr {
        /// `sum` becomes `None` if the constant terms overflow.
        fn collect(
            expr: &SymExpr,
            negate: bool,
            terms: &mut Vec<(bool, SymExpr)>,
            sum: &mut Option<i32>,
        ) {
            match expr {
                SymExpr::Add(a, b) => {
                    collect(a, negate, terms, sum);
                    collect(b, negate, terms, sum);
                }
                SymExpr::Sub(a, b) => {
                    collect(a, negate, terms, sum);
                    collect(b, !negate, terms, sum);
                }
                SymExpr::Neg(x) => collect(x, !negate, terms, sum),
                SymExpr::Value(v) => {
                    let v = if negate { v.checked_neg() } else { Some(*v) };
                    *sum = sum.zip(v).and_then(|(sum, v)| sum.checked_add(v));
                }
                other => match other.simplify() {
                    simplified @ (SymExpr::Add(..)
                    | SymExpr::Sub(..)
                    | SymExpr::Neg(_)
                    | SymExpr::Value(_)) => collect(&simplified, negate, terms, sum),
                    simplified => terms.push((negate, simplified)),
                },
            }
        }

        let mut terms = Vec::new();
        let mut constant = Some(0);
        collect(self, false, &mut terms, &mut constant);
        let Some(constant) = constant else {
            return self.clone();
        };

        // Cancel pairs of opposite terms.
        let mut i = 0;
        while i < terms.len() {
            let opposite = {
                let (neg, term) = &terms[i];
                terms[i + 1..]
                    .iter()
                    .position(|(other_neg, other)| other_neg != neg && other == term)
            };
            if let Some(j) = opposite {
                terms.remove(i + 1 + j);
                terms.remove(i);
            } else {
                i += 1;
            }
        }

        let (mut neg_terms, mut pos_terms): (Vec<_>, Vec<_>) =
            terms.into_iter().partition(|(neg, _)| *neg);
        pos_terms.sort_by(|(_, a), (_, b)| cmp_terms(a, b));
        neg_terms.sort_by(|(_, a), (_, b)| cmp_terms(a, b));

        let mut acc = if constant > 0 || (constant < 0 && pos_terms.is_empty()) {
            Some(SymExpr::Value(constant))
        } else {
            None
        };
        for (_, term) in pos_terms.iter().cloned() {
            acc = Some(match acc {
                Some(acc) => acc + term,
                None => term,
            });
        }
        for (_, term) in neg_terms {
            acc = Some(match acc {
                Some(acc) => acc - term,
                None => -term,
            });
        }
        if constant < 0 && !pos_terms.is_empty() {
            acc = acc.map(|acc| match constant.checked_neg() {
                Some(c) => acc - SymExpr::Value(c),
                None => acc + SymExpr::Value(constant),
            });
        }
        acc.unwrap_or(SymExpr::Value(0))
    }

    fn simplify_product(&self) -> SymExpr {
        let mut factors = Vec::new();
        Assoc::Mul.collect(self, &mut factors);

        let mut constant = Some(1i32);
        let mut terms = Vec::new();
        for factor in factors {
            match factor {
                SymExpr::Value(v) => constant = constant.and_then(|c| c.checked_mul(v)),
                SymExpr::Neg(x) => {
                    constant = constant.and_then(|c| c.checked_neg());
                    terms.push((*x).clone());
                }
                term => terms.push(term),
            }
        }
        // Constant factors overflow.
        let Some(constant) = constant else {
            return self.clone();
        };
        if constant == 0 {
            return SymExpr::Value(0);
        }
        terms.sort_by(cmp_terms);

        let product = if constant != 1 && constant != -1 {
            terms
                .into_iter()
                .fold(SymExpr::Value(constant), |acc, x| acc * x)
        } else {
            terms
                .into_iter()
                .reduce(|acc, x| acc * x)
                .unwrap_or(SymExpr::Value(1))
        };
        match (constant, product) {
            (-1, SymExpr::Value(v)) => SymExpr::Value(-v),
            (-1, product) => -product,
            (_, product) => product,
        }
    }

    fn simplify_extremum(&self, op: Assoc) -> SymExpr {
        let mut terms = Vec::new();
        op.collect(self, &mut terms);

        let fold = |a: i32, b: i32| if op == Assoc::Max { a.max(b) } else { a.min(b) };
        let mut constant: Option<i32> = None;
        let mut rest = Vec::new();
        for term in terms {
            match term {
                SymExpr::Value(v) => constant = Some(constant.map(|c| fold(c, v)).unwrap_or(v)),
                term => rest.push(term),
            }
        }
        dedup_terms(&mut rest);
        rest.sort_by(cmp_terms);

        // Drop the constant if another term is known to dominate it.
        if let Some(c) = constant {
            let dominated = rest.iter().any(|term| {
                let (lo, hi) = term.range();
                if op == Assoc::Max {
                    lo >= c
                } else {
                    hi <= c
                }
            });
            if dominated {
                constant = None;
            }
        }

        let init = constant.map(SymExpr::Value);
        rest.into_iter()
            .fold(init, |acc, term| {
                Some(match acc {
                    Some(acc) => op.apply(acc, term),
                    None => term,
                })
            })
            .unwrap_or(SymExpr::Value(0))
    }

    fn simplify_broadcast(&self) -> SymExpr {
        let mut terms = Vec::new();
        Assoc::Broadcast.collect(self, &mut terms);
        terms.retain(|t| *t != SymExpr::Value(1));
        dedup_terms(&mut terms);

        let fixed: Vec<_> = terms.iter().filter(|t| t.as_value().is_some()).collect();
        if fixed.len() == 1 {
            return fixed[0].clone();
        }

        terms.sort_by(cmp_terms);
        terms
            .into_iter()
            .reduce(|acc, t| acc.broadcast(&t))
            .unwrap_or(SymExpr::Value(1))
    }

    fn precedence(&self) -> u8 {
        match self {
            Self::Value(_) | Self::Var(_) | Self::Max(..) | Self::Min(..) | Self::Broadcast(..) => {
                5
            }
            Self::Neg(_) => 4,
            Self::Mul(..) | Self::Div(..) => 3,
            Self::Add(..) | Self::Sub(..) => 2,
        }
    }

    fn write(&self, f: &mut fmt::Formatter<'_>, quote: bool) -> fmt::Result {
        let operand = |f: &mut fmt::Formatter<'_>, expr: &SymExpr, parens: bool| {
            if parens {
                write!(f, "(")?;
                expr.write(f, quote)?;
                write!(f, ")")
            } else {
                expr.write(f, quote)
            }
        };
        let binop = |f: &mut fmt::Formatter<'_>, op: &str, lhs: &SymExpr, rhs: &SymExpr| {
            let prec = self.precedence();
            operand(f, lhs, lhs.precedence() < prec)?;
            write!(f, " {} ", op)?;

            // Only a chain of the same associative operator can omit parens
            // around a right operand of equal precedence.
            let same_assoc = matches!(
                (self, rhs),
                (Self::Add(..), Self::Add(..)) | (Self::Mul(..), Self::Mul(..))
            );
            operand(
                f,
                rhs,
                rhs.precedence() < prec || (rhs.precedence() == prec && !same_assoc),
            )
        };
        let call = |f: &mut fmt::Formatter<'_>, name: &str, lhs: &SymExpr, rhs: &SymExpr| {
            write!(f, "{}(", name)?;
            lhs.write(f, quote)?;
            write!(f, ", ")?;
            rhs.write(f, quote)?;
            write!(f, ")")
        };

        match self {
            Self::Value(x) => write!(f, "{}", x),
            Self::Var(sym) if quote => write!(f, "\"{}\"", sym.name),
            Self::Var(sym) => write!(f, "{}", sym.name),
            Self::Neg(x) => {
                write!(f, "-")?;
                operand(f, x.as_ref(), x.precedence() < 4)
            }
            Self::Add(a, b) => binop(f, "+", a.as_ref(), b.as_ref()),
            Self::Sub(a, b) => binop(f, "-", a.as_ref(), b.as_ref()),
            Self::Mul(a, b) => binop(f, "*", a.as_ref(), b.as_ref()),
            Self::Div(a, b) => binop(f, "/", a.as_ref(), b.as_ref()),
            Self::Max(a, b) => call(f, "max", a.as_ref(), b.as_ref()),
            Self::Min(a, b) => call(f, "min", a.as_ref(), b.as_ref()),
            Self::Broadcast(a, b) => call(f, "broadcast", a.as_ref(), b.as_ref()),
        }
    }
}

fn simplify_div(lhs: SymExpr, rhs: SymExpr) -> SymExpr {
    let const_div = |lhs: &SymExpr, rhs: &SymExpr| match (lhs.as_value(), rhs.as_value()) {
        (Some(x), Some(y)) if y != 0 => floor_div(x, y),
        _ => None,
    };

    if rhs == SymExpr::Value(1) {
        return lhs;
    }
    if let Some(q) = const_div(&lhs, &rhs) {
        return SymExpr::Value(q);
    }
    if lhs.as_value().is_none() && lhs == rhs {
        return SymExpr::Value(1);
    }

    // Cancel factors common to the numerator and denominator.
    let mut lhs_terms = Vec::new();
    Assoc::Mul.collect_simplified(&lhs, &mut lhs_terms);
    let mut rhs_terms = Vec::new();
    Assoc::Mul.collect_simplified(&rhs, &mut rhs_terms);

    let mut cancelled = false;
    let mut i = 0;
    while i < lhs_terms.len() {
        if let Some(j) = rhs_terms.iter().position(|t| *t == lhs_terms[i]) {
            rhs_terms.remove(j);
            lhs_terms.remove(i);
            cancelled = true;
        } else {
            i += 1;
        }
    }
    let product = |terms: Vec<SymExpr>| {
        terms
            .into_iter()
            .reduce(|acc, t| acc * t)
            .unwrap_or(SymExpr::Value(1))
    };
    let (lhs, rhs) = if cancelled {
        (product(lhs_terms).simplify(), product(rhs_terms).simplify())
    } else {
        (lhs, rhs)
    };

    if rhs == SymExpr::Value(1) {
        return lhs;
    }
    if let Some(q) = const_div(&lhs, &rhs) {
        return SymExpr::Value(q);
    }

    // x / a / b => x / (a * b)
    if let (SymExpr::Div(inner, c1), Some(c2)) = (&lhs, rhs.as_value()) {
        if let Some(c1) = c1.as_value() {
            if c1 > 0 && c2 > 0 {
                if let Some(divisor) = c1.checked_mul(c2) {
                    return SymExpr::Div(inner.clone(), SymExpr::Value(divisor).into());
                }
            }
        }
    }

    lhs / rhs
}

impl PartialEq for SymExpr {
    fn eq(&self, other: &SymExpr) -> bool {
        let either_order = |a: &Arc<SymExpr>, b: &Arc<SymExpr>, c: &Arc<SymExpr>, d: &Arc<SymExpr>| {
            (a == c && b == d) || (a == d && b == c)
        };
        match (self, other) {
            (Self::Value(x), Self::Value(y)) => x == y,
            (Self::Var(x), Self::Var(y)) => x.name == y.name,
            (Self::Neg(x), Self::Neg(y)) => x == y,
            (Self::Add(a, b), Self::Add(c, d))
            | (Self::Mul(a, b), Self::Mul(c, d))
            | (Self::Max(a, b), Self::Max(c, d))
            | (Self::Min(a, b), Self::Min(c, d))
            | (Self::Broadcast(a, b), Self::Broadcast(c, d)) => either_order(a, b, c, d),
            (Self::Sub(a, b), Self::Sub(c, d)) | (Self::Div(a, b), Self::Div(c, d)) => {
                a == c && b == d
            }
            _ => false,
        }
    }
}

impl Add for SymExpr {
    type Output = SymExpr;

    fn add(self, rhs: SymExpr) -> SymExpr {
        SymExpr::Add(self.into(), rhs.into())
    }
}

impl AddAssign for SymExpr {
    fn add_assign(&mut self, rhs: SymExpr) {
        *self = self.clone() + rhs;
    }
}

impl Sub for SymExpr {
    type Output = SymExpr;

    fn sub(self, rhs: SymExpr) -> SymExpr {
        SymExpr::Sub(self.into(), rhs.into())
    }
}

impl Mul for SymExpr {
    type Output = SymExpr;

    fn mul(self, rhs: SymExpr) -> SymExpr {
        SymExpr::Mul(self.into(), rhs.into())
    }
}

impl Div for SymExpr {
    type Output = SymExpr;

    fn div(self, rhs: SymExpr) -> SymExpr {
        SymExpr::Div(self.into(), rhs.into())
    }
}

impl Neg for SymExpr {
    type Output = SymExpr;

    fn neg(self) -> SymExpr {
        SymExpr::Neg(self.into())
    }
}

impl From<i32> for SymExpr {
    fn from(val: i32) -> Self {
        SymExpr::Value(val)
    }
}

/// Create a positive symbol. Most symbols describe dimension sizes.
impl<'a> From<&'a str> for SymExpr {
    fn from(name: &'a str) -> Self {
        SymExpr::pos_var(name)
    }
}

impl From<Symbol> for SymExpr {
    fn from(sym: Symbol) -> Self {
        SymExpr::Var(sym.into())
    }
}

impl fmt::Display for SymExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write(f, false)
    }
}

impl fmt::Debug for SymExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write(f, true)
    }
}
