use crate::expr::{BinOp, Expr, Model, Node, UnOp, mask};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, trace};

/// Upper bound on candidate assignments tried by a single [`PathSolver`] query.
pub const DEFAULT_MAX_MODELS: usize = 1 << 16;

/// Upper bound on partial assignments the exhaustive search of a single
/// [`PathSolver`] query visits.
pub const DEFAULT_MAX_DECISIONS: usize = 1 << 16;

/// Constraint-solving capability of one execution path.
///
/// Implementations own the path constraints; cloning a solver forks the path.
pub trait Solver: Clone {
    /// Whether `extra` can hold together with the current path constraints.
    fn satisfiable(&self, extra: &[Expr]) -> bool;

    fn add_constraints(&mut self, constraint: Expr);

    /// Some value `expr` can take on the current path, if the path is feasible.
    fn evaluate(&self, expr: &Expr) -> Option<u128>;

    /// The only value `expr` can take on the current path.
    fn evaluate_unique(&self, expr: &Expr) -> Option<u128> {
        if let Some(value) = expr.as_const() {
            return Some(value);
        }
        let value = self.evaluate(expr)?;
        let other = Expr::ne(expr.clone(), Expr::constant(value, expr.width()));
        if self.satisfiable(&[other]) {
            None
        } else {
            Some(value)
        }
    }

    fn is_path_constrained_concrete(&self, expr: &Expr) -> bool {
        !expr.is_const() && self.evaluate_unique(expr).is_some()
    }

    /// More than one value of `expr` is consistent with the path.
    fn is_symbolic(&self, expr: &Expr) -> bool {
        self.evaluate_unique(expr).is_none()
    }

    /// `expr` is symbolic and nothing on the path mentions its symbols.
    fn is_unconstrained(&self, expr: &Expr) -> bool;

    /// Smallest unsigned value of `expr` on the current path.
    fn min(&self, expr: &Expr) -> Option<u128> {
        let mut lo = 0;
        let mut hi = self.evaluate(expr)?;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let below = Expr::ult(expr.clone(), Expr::constant(mid + 1, expr.width()));
            if self.satisfiable(&[below]) {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Some(lo)
    }

    /// Largest unsigned value of `expr` on the current path.
    fn max(&self, expr: &Expr) -> Option<u128> {
        let mut lo = self.evaluate(expr)?;
        let mut hi = mask(expr.width());
        while lo < hi {
            let mid = lo + (hi - lo) / 2 + 1;
            let above = Expr::not(Expr::ult(expr.clone(), Expr::constant(mid, expr.width())));
            if self.satisfiable(&[above]) {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        Some(lo)
    }
}

/// Result of one [`PathSolver`] query.
#[derive(Debug)]
enum Search {
    Found(Model),
    /// Every assignment was ruled out.
    Exhausted,
    /// The decision budget ran out first.
    GaveUp,
}

/// Reference [`Solver`] over accumulated path constraints.
///
/// Queries are sliced to the constraints sharing symbols with the query. A
/// quick pass then tries candidate models: zero, all-ones, and whatever
/// inverting the equalities of the query yields (plus their neighbours). When
/// no candidate fits, a depth-first search assigns symbol bits one at a time,
/// highest bit first, and abandons every partial assignment under which a
/// formula is already false for all completions. Bits no formula can observe
/// are never branched on.
///
/// Both passes are exact. Only a query that exhausts the decision budget is
/// undecided; it counts as satisfiable but yields no model.
#[derive(Debug, Clone)]
pub struct PathSolver {
    constraints: Vec<Expr>,
    max_models: usize,
    max_decisions: usize,
}

impl Default for PathSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl PathSolver {
    pub fn new() -> Self {
        Self {
            constraints: Vec::new(),
            max_models: DEFAULT_MAX_MODELS,
            max_decisions: DEFAULT_MAX_DECISIONS,
        }
    }

    pub fn with_max_models(max_models: usize) -> Self {
        Self {
            max_models,
            ..Self::new()
        }
    }

    pub fn with_max_decisions(mut self, max_decisions: usize) -> Self {
        self.max_decisions = max_decisions;
        self
    }

    pub fn constraints(&self) -> &[Expr] {
        &self.constraints
    }

    /// A model of the path constraints together with `extra`.
    pub fn model(&self, extra: &[Expr]) -> Option<Model> {
        match self.query(extra) {
            Search::Found(model) => Some(model),
            Search::Exhausted | Search::GaveUp => None,
        }
    }

    fn query(&self, extra: &[Expr]) -> Search {
        let mut formulas = if extra.is_empty() {
            self.constraints.clone()
        } else {
            self.relevant(extra)
        };
        formulas.extend(extra.iter().cloned());
        self.solve(&formulas)
    }

    /// Constraints transitively sharing symbols with `seed`, plus every
    /// symbol-free constraint.
    fn relevant(&self, seed: &[Expr]) -> Vec<Expr> {
        let mut symbols: BTreeSet<Arc<str>> = seed
            .iter()
            .flat_map(|expr| expr.symbols().into_keys())
            .collect();
        let per_constraint: Vec<BTreeSet<Arc<str>>> = self
            .constraints
            .iter()
            .map(|c| c.symbols().into_keys().collect())
            .collect();
        let mut taken = vec![false; self.constraints.len()];

        loop {
            let mut changed = false;
            for (i, used) in per_constraint.iter().enumerate() {
                if taken[i] {
                    continue;
                }
                if used.is_empty() || !used.is_disjoint(&symbols) {
                    taken[i] = true;
                    changed = true;
                    symbols.extend(used.iter().cloned());
                }
            }
            if !changed {
                break;
            }
        }

        self.constraints
            .iter()
            .zip(taken)
            .filter_map(|(c, keep)| keep.then(|| c.clone()))
            .collect()
    }

    fn solve(&self, formulas: &[Expr]) -> Search {
        let mut widths = BTreeMap::new();
        for formula in formulas {
            widths.extend(formula.symbols());
        }
        if let Some(model) = self.guess(formulas, &widths) {
            return Search::Found(model);
        }
        self.bit_search(formulas, &widths)
    }

    /// Try the candidate values of every symbol in turn.
    fn guess(&self, formulas: &[Expr], widths: &BTreeMap<Arc<str>, u32>) -> Option<Model> {
        let mut candidates: BTreeMap<Arc<str>, BTreeSet<u128>> = widths
            .iter()
            .map(|(name, &width)| (name.clone(), BTreeSet::from([0, mask(width)])))
            .collect();
        for formula in formulas {
            collect_candidates(formula, &mut candidates);
        }

        let names: Vec<Arc<str>> = candidates.keys().cloned().collect();
        let values: Vec<Vec<u128>> = candidates
            .into_values()
            .map(|set| set.into_iter().collect())
            .collect();
        let mut cursor = vec![0usize; names.len()];

        for _ in 0..self.max_models {
            let model: Model = names
                .iter()
                .zip(&cursor)
                .zip(&values)
                .map(|((name, &pos), options)| (name.clone(), options[pos]))
                .collect();
            if formulas.iter().all(|f| f.eval(&model) != 0) {
                return Some(model);
            }

            // Advance the odometer; wrapping past the last digit ends the search.
            let mut digit = 0;
            loop {
                if digit == cursor.len() {
                    return None;
                }
                cursor[digit] += 1;
                if cursor[digit] < values[digit].len() {
                    break;
                }
                cursor[digit] = 0;
                digit += 1;
            }
        }

        trace!(
            "candidate search gave up after {} models over {} symbols",
            self.max_models,
            names.len()
        );
        None
    }

    fn bit_search(&self, formulas: &[Expr], widths: &BTreeMap<Arc<str>, u32>) -> Search {
        let demanded = demanded_bits(formulas);
        let order: Vec<(Arc<str>, u32)> = widths
            .keys()
            .flat_map(|name| {
                let wanted = demanded.get(name).copied().unwrap_or(0);
                (0..128)
                    .rev()
                    .filter(move |bit| (wanted >> bit) & 1 == 1)
                    .map(move |bit| (name.clone(), bit))
            })
            .collect();
        let mut partial: BTreeMap<Arc<str>, Bits> = widths
            .iter()
            .map(|(name, &width)| (name.clone(), Bits::unknown(width)))
            .collect();
        // One entry per assigned bit: whether it has moved on to one.
        let mut trail: Vec<bool> = Vec::new();

        for _ in 0..self.max_decisions {
            let mut memo = HashMap::new();
            let mut undecided = false;
            let mut dead = false;
            for formula in formulas {
                match eval_bits(formula, &partial, &mut memo).truth() {
                    Some(true) => {}
                    Some(false) => {
                        dead = true;
                        break;
                    }
                    None => undecided = true,
                }
            }

            if !dead && (!undecided || trail.len() == order.len()) {
                // Bits still unknown do not matter; leave them clear.
                let model: Model = partial
                    .iter()
                    .map(|(name, bits)| (name.clone(), bits.value))
                    .collect();
                if formulas.iter().all(|f| f.eval(&model) != 0) {
                    return Search::Found(model);
                }
                debug_assert!(undecided, "known-bits evaluation disagrees with the model");
                dead = true;
            }
            if !dead && trail.len() < order.len() {
                let (name, bit) = &order[trail.len()];
                if let Some(bits) = partial.get_mut(name) {
                    bits.assign(*bit, false);
                }
                trail.push(false);
                continue;
            }

            // Dead end: flip the deepest bit still at zero, dropping those above it.
            loop {
                let Some(flipped) = trail.pop() else {
                    return Search::Exhausted;
                };
                let (name, bit) = &order[trail.len()];
                let Some(bits) = partial.get_mut(name) else {
                    return Search::Exhausted;
                };
                if flipped {
                    bits.forget(*bit);
                } else {
                    bits.assign(*bit, true);
                    trail.push(true);
                    break;
                }
            }
        }

        debug!(
            "bit search gave up after {} decisions over {} symbols",
            self.max_decisions,
            widths.len()
        );
        Search::GaveUp
    }
}

/// Record candidate values for every symbol an equality pins down.
fn collect_candidates(formula: &Expr, candidates: &mut BTreeMap<Arc<str>, BTreeSet<u128>>) {
    let mut stack = vec![formula];
    while let Some(expr) = stack.pop() {
        if let Node::Binary {
            op: BinOp::Eq | BinOp::Ult,
            lhs,
            rhs,
        } = expr.node()
        {
            let pinned = match (lhs.as_const(), rhs.as_const()) {
                (None, Some(c)) => Some((lhs, c)),
                (Some(c), None) => Some((rhs, c)),
                _ => None,
            };
            if let Some((term, target)) = pinned {
                let width = term.width();
                for delta in [0u128, 1, mask(width)] {
                    let target = target.wrapping_add(delta) & mask(width);
                    if let Some((name, value)) = invert(term, target) {
                        candidates.entry(name).or_default().insert(value);
                    }
                }
            }
        }
        stack.extend(expr.children());
    }
}

/// Solve `term == target` for the single symbol inside `term`, when `term` is
/// built from invertible operations on that symbol and constants. Masking
/// operations pick the solution with every free bit clear.
fn invert(term: &Expr, target: u128) -> Option<(Arc<str>, u128)> {
    let target = target & mask(term.width());
    match term.node() {
        Node::Sym { name } => Some((name.clone(), target)),
        Node::Binary { op, lhs, rhs } => match (op, lhs.as_const(), rhs.as_const()) {
            (BinOp::Add, None, Some(c)) => invert(lhs, target.wrapping_sub(c)),
            (BinOp::Add, Some(c), None) => invert(rhs, target.wrapping_sub(c)),
            (BinOp::Sub, None, Some(c)) => invert(lhs, target.wrapping_add(c)),
            (BinOp::Sub, Some(c), None) => invert(rhs, c.wrapping_sub(target)),
            (BinOp::Xor, None, Some(c)) => invert(lhs, target ^ c),
            (BinOp::Xor, Some(c), None) => invert(rhs, target ^ c),
            (BinOp::And, None, Some(c)) if target & !c == 0 => invert(lhs, target),
            (BinOp::And, Some(c), None) if target & !c == 0 => invert(rhs, target),
            (BinOp::Or, None, Some(c)) if target & c == c => invert(lhs, target & !c),
            (BinOp::Or, Some(c), None) if target & c == c => invert(rhs, target & !c),
            _ => None,
        },
        Node::Extract { lo, arg, .. } => invert(arg, target << lo),
        Node::ZeroExt { arg } => invert(arg, target),
        Node::Concat { hi, lo } => match (hi.as_const(), lo.as_const()) {
            (Some(_), None) => invert(lo, target),
            (None, Some(_)) => invert(hi, target >> lo.width()),
            _ => None,
        },
        Node::Unary { op: UnOp::Not, arg } => invert(arg, !target),
        Node::Unary { op: UnOp::Neg, arg } => invert(arg, target.wrapping_neg()),
        _ => None,
    }
}

/// Bits of each symbol that can change the value of some formula.
fn demanded_bits(formulas: &[Expr]) -> BTreeMap<Arc<str>, u128> {
    let mut demanded = BTreeMap::new();
    let mut seen: HashMap<usize, u128> = HashMap::new();
    let mut stack: Vec<(&Expr, u128)> = formulas.iter().map(|f| (f, 1)).collect();

    while let Some((expr, wanted)) = stack.pop() {
        let wanted = wanted & mask(expr.width());
        let key = expr.node() as *const Node as usize;
        let before = seen.get(&key).copied().unwrap_or(0);
        // Only the bits not already pushed through this node need another pass.
        let wanted = wanted & !before;
        if wanted == 0 {
            continue;
        }
        seen.insert(key, before | wanted);

        // Carries only move upwards, so every bit up to the highest wanted one counts.
        let below = mask(128 - wanted.leading_zeros());
        match expr.node() {
            Node::Const { .. } => {}
            Node::Sym { name } => *demanded.entry(name.clone()).or_insert(0) |= wanted,
            Node::Unary { op: UnOp::Not, arg } => stack.push((arg, wanted)),
            Node::Unary { op: UnOp::Neg, arg } => stack.push((arg, below)),
            Node::Binary { op, lhs, rhs } => match op {
                BinOp::Add | BinOp::Sub => {
                    stack.push((lhs, below));
                    stack.push((rhs, below));
                }
                BinOp::And => {
                    stack.push((lhs, rhs.as_const().map_or(wanted, |c| wanted & c)));
                    stack.push((rhs, lhs.as_const().map_or(wanted, |c| wanted & c)));
                }
                BinOp::Or => {
                    stack.push((lhs, rhs.as_const().map_or(wanted, |c| wanted & !c)));
                    stack.push((rhs, lhs.as_const().map_or(wanted, |c| wanted & !c)));
                }
                BinOp::Xor => {
                    stack.push((lhs, wanted));
                    stack.push((rhs, wanted));
                }
                BinOp::Eq | BinOp::Ult => {
                    stack.push((lhs, mask(lhs.width())));
                    stack.push((rhs, mask(rhs.width())));
                }
            },
            Node::Extract { lo, arg, .. } => stack.push((arg, wanted << lo)),
            Node::Concat { hi, lo } => {
                stack.push((lo, wanted));
                stack.push((hi, wanted >> lo.width()));
            }
            Node::ZeroExt { arg } => stack.push((arg, wanted)),
            Node::Ite { cond, then, els } => {
                stack.push((cond, 1));
                stack.push((then, wanted));
                stack.push((els, wanted));
            }
        }
    }
    demanded
}

/// Partially known bit-vector: bits set in `known` have the value in `value`,
/// the rest may be anything. `value` is clear outside `known`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Bits {
    known: u128,
    value: u128,
    width: u32,
}

impl Bits {
    fn unknown(width: u32) -> Self {
        Self {
            known: 0,
            value: 0,
            width,
        }
    }

    fn constant(value: u128, width: u32) -> Self {
        Self {
            known: mask(width),
            value: value & mask(width),
            width,
        }
    }

    fn with(known: u128, value: u128, width: u32) -> Self {
        let known = known & mask(width);
        Self {
            known,
            value: value & known,
            width,
        }
    }

    fn assign(&mut self, bit: u32, one: bool) {
        self.known |= 1u128 << bit;
        self.value = (self.value & !(1u128 << bit)) | ((one as u128) << bit);
    }

    fn forget(&mut self, bit: u32) {
        self.known &= !(1u128 << bit);
        self.value &= !(1u128 << bit);
    }

    fn bit(&self, bit: u32) -> Option<bool> {
        ((self.known >> bit) & 1 == 1).then_some((self.value >> bit) & 1 == 1)
    }

    fn truth(&self) -> Option<bool> {
        self.bit(0)
    }

    fn is_const(&self) -> bool {
        self.known == mask(self.width)
    }

    /// Smallest and largest unsigned value the known bits allow.
    fn bounds(&self) -> (u128, u128) {
        (self.value, self.value | (!self.known & mask(self.width)))
    }

    fn not(&self) -> Self {
        Self::with(self.known, !self.value, self.width)
    }

    fn and(&self, other: &Self) -> Self {
        let zeros = (self.known & !self.value) | (other.known & !other.value);
        let known = (self.known & other.known) | zeros;
        Self::with(known, self.value & other.value, self.width)
    }

    fn or(&self, other: &Self) -> Self {
        let ones = self.value | other.value;
        let known = (self.known & other.known) | ones;
        Self::with(known, ones, self.width)
    }

    fn xor(&self, other: &Self) -> Self {
        Self::with(self.known & other.known, self.value ^ other.value, self.width)
    }

    /// Addition with a carry into bit zero. Low bits come from rippling the
    /// carry while it is known; high bits from the common prefix of the
    /// smallest and largest sum, when those do not straddle a wrap-around.
    fn add(&self, other: &Self, carry_in: bool) -> Self {
        let rippled = self.ripple(other, carry_in);
        let (lhs_min, lhs_max) = self.bounds();
        let (rhs_min, rhs_max) = other.bounds();
        let (low_wraps, low) = wide_sum(lhs_min, rhs_min, carry_in, self.width);
        let (high_wraps, high) = wide_sum(lhs_max, rhs_max, carry_in, self.width);
        if low_wraps != high_wraps {
            return rippled;
        }
        let prefix = mask(self.width) & !mask(128 - (low ^ high).leading_zeros());
        Self::with(
            rippled.known | prefix,
            rippled.value | (low & prefix),
            self.width,
        )
    }

    fn ripple(&self, other: &Self, carry_in: bool) -> Self {
        let mut known = 0;
        let mut value = 0;
        let mut carry = Some(carry_in);
        for i in 0..self.width {
            let inputs = [self.bit(i), other.bit(i), carry];
            if let [Some(a), Some(b), Some(c)] = inputs {
                known |= 1u128 << i;
                value |= ((a ^ b ^ c) as u128) << i;
            }
            let ones = inputs.iter().filter(|b| **b == Some(true)).count();
            let zeros = inputs.iter().filter(|b| **b == Some(false)).count();
            carry = if ones >= 2 {
                Some(true)
            } else if zeros >= 2 {
                Some(false)
            } else {
                None
            };
        }
        Self::with(known, value, self.width)
    }

    fn equals(&self, other: &Self) -> Self {
        let differ = self.known & other.known & (self.value ^ other.value);
        if differ != 0 {
            Self::constant(0, 1)
        } else if self.is_const() && other.is_const() {
            Self::constant(1, 1)
        } else {
            Self::unknown(1)
        }
    }

    fn less_than(&self, other: &Self) -> Self {
        let (lhs_min, lhs_max) = self.bounds();
        let (rhs_min, rhs_max) = other.bounds();
        if lhs_max < rhs_min {
            Self::constant(1, 1)
        } else if lhs_min >= rhs_max {
            Self::constant(0, 1)
        } else {
            Self::unknown(1)
        }
    }

    /// Bits both sides agree on.
    fn join(&self, other: &Self) -> Self {
        let agree = self.known & other.known & !(self.value ^ other.value);
        Self::with(agree, self.value, self.width)
    }
}

/// `lhs + rhs + carry` as a count of wrap-arounds past `width` bits and the
/// wrapped sum.
fn wide_sum(lhs: u128, rhs: u128, carry: bool, width: u32) -> (u128, u128) {
    let (partial, first) = lhs.overflowing_add(rhs);
    let (sum, second) = partial.overflowing_add(carry as u128);
    if width >= 128 {
        (first as u128 + second as u128, sum)
    } else {
        (sum >> width, sum & mask(width))
    }
}

fn eval_bits(expr: &Expr, partial: &BTreeMap<Arc<str>, Bits>, memo: &mut HashMap<usize, Bits>) -> Bits {
    let key = expr.node() as *const Node as usize;
    if let Some(&bits) = memo.get(&key) {
        return bits;
    }
    let width = expr.width();
    let bits = match expr.node() {
        Node::Const { value } => Bits::constant(*value, width),
        Node::Sym { name } => partial
            .get(name)
            .copied()
            .unwrap_or_else(|| Bits::unknown(width)),
        Node::Unary { op, arg } => {
            let arg = eval_bits(arg, partial, memo);
            match op {
                UnOp::Not => arg.not(),
                UnOp::Neg => arg.not().add(&Bits::constant(0, width), true),
            }
        }
        Node::Binary { op, lhs, rhs } => {
            let lhs = eval_bits(lhs, partial, memo);
            let rhs = eval_bits(rhs, partial, memo);
            match op {
                BinOp::Add => lhs.add(&rhs, false),
                BinOp::Sub => lhs.add(&rhs.not(), true),
                BinOp::And => lhs.and(&rhs),
                BinOp::Or => lhs.or(&rhs),
                BinOp::Xor => lhs.xor(&rhs),
                BinOp::Eq => lhs.equals(&rhs),
                BinOp::Ult => lhs.less_than(&rhs),
            }
        }
        Node::Extract { lo, arg, .. } => {
            let arg = eval_bits(arg, partial, memo);
            Bits::with(arg.known >> lo, arg.value >> lo, width)
        }
        Node::Concat { hi, lo } => {
            let high = eval_bits(hi, partial, memo);
            let low = eval_bits(lo, partial, memo);
            Bits::with(
                (high.known << low.width) | low.known,
                (high.value << low.width) | low.value,
                width,
            )
        }
        Node::ZeroExt { arg } => {
            let arg = eval_bits(arg, partial, memo);
            Bits::with(arg.known | (mask(width) & !mask(arg.width)), arg.value, width)
        }
        Node::Ite { cond, then, els } => match eval_bits(cond, partial, memo).truth() {
            Some(true) => eval_bits(then, partial, memo),
            Some(false) => eval_bits(els, partial, memo),
            None => eval_bits(then, partial, memo).join(&eval_bits(els, partial, memo)),
        },
    };
    memo.insert(key, bits);
    bits
}

impl Solver for PathSolver {
    fn satisfiable(&self, extra: &[Expr]) -> bool {
        match self.query(extra) {
            Search::Found(_) => true,
            Search::Exhausted => false,
            Search::GaveUp => {
                debug!("undecided query counted as satisfiable");
                true
            }
        }
    }

    fn add_constraints(&mut self, constraint: Expr) {
        assert_eq!(constraint.width(), 1, "path constraints must be boolean");
        let constraint = constraint.simplify();
        if !constraint.is_true() {
            self.constraints.push(constraint);
        }
    }

    fn evaluate(&self, expr: &Expr) -> Option<u128> {
        if let Some(value) = expr.as_const() {
            return Some(value);
        }
        let formulas = self.relevant(std::slice::from_ref(expr));
        match self.solve(&formulas) {
            Search::Found(model) => Some(expr.eval(&model)),
            Search::Exhausted | Search::GaveUp => None,
        }
    }

    fn is_unconstrained(&self, expr: &Expr) -> bool {
        let symbols = expr.symbols();
        !symbols.is_empty()
            && self.constraints.iter().all(|constraint| {
                constraint
                    .symbols()
                    .keys()
                    .all(|name| !symbols.contains_key(name))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x() -> Expr {
        Expr::symbol("x", 64)
    }

    fn c64(value: u128) -> Expr {
        Expr::constant(value, 64)
    }

    #[test]
    fn test_empty_path_is_satisfiable() {
        let solver = PathSolver::new();
        assert!(solver.satisfiable(&[]));
        assert!(solver.satisfiable(&[Expr::eq(x(), c64(0x1234))]));
        assert!(!solver.satisfiable(&[Expr::bool(false)]));
    }

    #[test]
    fn test_equality_pins_value() {
        let mut solver = PathSolver::new();
        solver.add_constraints(Expr::eq(x(), c64(0x4000)));
        assert_eq!(solver.evaluate_unique(&x()), Some(0x4000));
        assert!(solver.is_path_constrained_concrete(&x()));
        assert!(!solver.is_symbolic(&x()));
        assert!(!solver.satisfiable(&[Expr::eq(x(), c64(0x5000))]));
    }

    #[test]
    fn test_disjunction_is_not_unique() {
        let mut solver = PathSolver::new();
        solver.add_constraints(Expr::or(
            Expr::eq(x(), c64(0x1000)),
            Expr::eq(x(), c64(0x3000)),
        ));
        assert!(solver.is_symbolic(&x()));
        let page = Expr::extract(63, 12, x());
        assert!(solver.satisfiable(&[Expr::eq(page.clone(), Expr::constant(1, 52))]));
        assert!(solver.satisfiable(&[Expr::eq(page.clone(), Expr::constant(3, 52))]));
        assert!(!solver.satisfiable(&[Expr::eq(page, Expr::constant(2, 52))]));
    }

    #[test]
    fn test_inversion_through_offsets() {
        let mut solver = PathSolver::new();
        let shifted = Expr::add(x(), c64(0x10));
        solver.add_constraints(Expr::eq(
            Expr::extract(63, 12, shifted.clone()),
            Expr::constant(0x7, 52),
        ));
        let value = solver.evaluate(&shifted).unwrap();
        assert_eq!(value >> 12, 0x7);
    }

    #[test]
    fn test_unconstrained_tracks_symbols() {
        let mut solver = PathSolver::new();
        assert!(solver.is_unconstrained(&x()));
        assert!(!solver.is_unconstrained(&c64(5)));

        let y = Expr::symbol("y", 64);
        solver.add_constraints(Expr::ult(y.clone(), c64(10)));
        assert!(solver.is_unconstrained(&x()));
        assert!(!solver.is_unconstrained(&Expr::add(x(), y)));
    }

    #[test]
    fn test_unrelated_constraints_are_sliced_away() {
        let mut solver = PathSolver::new();
        for i in 0..8 {
            let sym = Expr::symbol(format!("s{}", i), 64);
            solver.add_constraints(Expr::or(
                Expr::eq(sym.clone(), c64(i)),
                Expr::eq(sym, c64(i + 100)),
            ));
        }
        solver.add_constraints(Expr::eq(x(), c64(0x2000)));
        assert_eq!(solver.evaluate_unique(&x()), Some(0x2000));
        assert_eq!(solver.model(&[Expr::eq(x(), c64(0x2000))]).unwrap().len(), 1);
    }

    #[test]
    fn test_masked_symbol_reaches_each_page() {
        let solver = PathSolver::new();
        let page = Expr::extract(63, 12, Expr::and(x(), c64(0x3000)));
        for number in 0..4 {
            let model = solver
                .model(&[Expr::eq(page.clone(), Expr::constant(number, 52))])
                .unwrap();
            assert_eq!((model["x"] & 0x3000) >> 12, number);
        }
        assert!(!solver.satisfiable(&[Expr::eq(page, Expr::constant(4, 52))]));
    }

    #[test]
    fn test_or_mask_inverts() {
        let solver = PathSolver::new();
        let flagged = Expr::or(x(), c64(0x1));
        let model = solver.model(&[Expr::eq(flagged.clone(), c64(0x2001))]).unwrap();
        assert_eq!(flagged.eval(&model), 0x2001);
        assert!(!solver.satisfiable(&[Expr::eq(flagged, c64(0x2000))]));
    }

    #[test]
    fn test_bit_search_beyond_candidates() {
        let solver = PathSolver::new();
        let doubled = Expr::add(x(), x());
        let model = solver.model(&[Expr::eq(doubled.clone(), c64(0x30))]).unwrap();
        assert_eq!(doubled.eval(&model), 0x30);
        // Doubling never yields an odd number.
        assert!(!solver.satisfiable(&[Expr::eq(doubled, c64(0x31))]));
    }

    #[test]
    fn test_bit_search_with_two_symbols() {
        let mut solver = PathSolver::new();
        let y = Expr::symbol("y", 64);
        solver.add_constraints(Expr::eq(Expr::and(x(), y.clone()), c64(0x1200)));
        solver.add_constraints(Expr::ult(Expr::xor(x(), y.clone()), c64(0x10)));

        let model = solver.model(&[]).unwrap();
        assert_eq!(model["x"] & model["y"], 0x1200);
        assert!((model["x"] ^ model["y"]) < 0x10);
        assert!(!solver.satisfiable(&[Expr::ult(x(), c64(0x1200))]));
    }

    #[test]
    fn test_min_and_max() {
        let mut solver = PathSolver::new();
        solver.add_constraints(Expr::ult(x(), c64(0x5000)));
        solver.add_constraints(Expr::not(Expr::ult(x(), c64(0x1800))));
        assert_eq!(solver.min(&x()), Some(0x1800));
        assert_eq!(solver.max(&x()), Some(0x4fff));

        let page = Expr::extract(63, 12, x());
        assert_eq!(solver.min(&page), Some(1));
        assert_eq!(solver.max(&page), Some(4));

        solver.add_constraints(Expr::bool(false));
        assert_eq!(solver.min(&x()), None);
    }

    #[test]
    fn test_exhausted_budget_counts_as_satisfiable() {
        let solver = PathSolver::new().with_max_decisions(1);
        let doubled = Expr::add(x(), x());
        let odd = Expr::eq(doubled, c64(0x31));
        assert!(solver.satisfiable(std::slice::from_ref(&odd)));
        assert!(solver.model(&[odd]).is_none());
    }

    #[test]
    fn test_false_constraint_poisons_path() {
        let mut solver = PathSolver::new();
        solver.add_constraints(Expr::or_all(Vec::new()));
        assert!(!solver.satisfiable(&[]));
        assert!(!solver.satisfiable(&[Expr::eq(x(), c64(1))]));
    }
}
