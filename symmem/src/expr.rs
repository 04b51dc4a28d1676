use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Widest bit-vector an [`Expr`] can carry.
pub const MAX_WIDTH: u32 = 128;

/// Constants above this value are treated as plausible pointer bases by
/// [`Expr::heuristic_base`].
pub const MIN_BASE: u128 = 0x10000;

/// Assignment of concrete values to free symbols.
pub type Model = BTreeMap<Arc<str>, u128>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Eq,
    Ult,
}

#[derive(Debug, PartialEq, Eq, Hash)]
pub enum Node {
    Const { value: u128 },
    Sym { name: Arc<str> },
    Unary { op: UnOp, arg: Expr },
    Binary { op: BinOp, lhs: Expr, rhs: Expr },
    Extract { hi: u32, lo: u32, arg: Expr },
    Concat { hi: Expr, lo: Expr },
    ZeroExt { arg: Expr },
    Ite { cond: Expr, then: Expr, els: Expr },
}

/// Immutable, structurally shared bit-vector expression.
///
/// Booleans are width-1 bit-vectors. All constructors fold constants and apply
/// a handful of local rewrites, so building an expression from concrete parts
/// always yields a [`Node::Const`].
#[derive(Clone, Hash)]
pub struct Expr {
    node: Arc<Node>,
    width: u32,
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        self.width == other.width && (Arc::ptr_eq(&self.node, &other.node) || self.node == other.node)
    }
}

impl Eq for Expr {}

pub(crate) fn mask(width: u32) -> u128 {
    if width >= MAX_WIDTH {
        u128::MAX
    } else {
        (1u128 << width) - 1
    }
}

impl Expr {
    fn from_node(node: Node, width: u32) -> Self {
        Self {
            node: Arc::new(node),
            width,
        }
    }

    pub fn constant(value: u128, width: u32) -> Self {
        assert!(
            (1..=MAX_WIDTH).contains(&width),
            "constant width out of range: {}",
            width
        );
        Self::from_node(
            Node::Const {
                value: value & mask(width),
            },
            width,
        )
    }

    pub fn symbol(name: impl Into<Arc<str>>, width: u32) -> Self {
        assert!(
            (1..=MAX_WIDTH).contains(&width),
            "symbol width out of range: {}",
            width
        );
        Self::from_node(Node::Sym { name: name.into() }, width)
    }

    pub fn bool(value: bool) -> Self {
        Self::constant(value as u128, 1)
    }

    /// Big-endian concatenation of `bytes` into a single constant.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        assert!(!bytes.is_empty() && bytes.len() * 8 <= MAX_WIDTH as usize);
        let value = bytes
            .iter()
            .fold(0u128, |acc, &byte| (acc << 8) | byte as u128);
        Self::constant(value, bytes.len() as u32 * 8)
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn as_const(&self) -> Option<u128> {
        match *self.node {
            Node::Const { value } => Some(value),
            _ => None,
        }
    }

    pub fn is_const(&self) -> bool {
        self.as_const().is_some()
    }

    pub fn is_true(&self) -> bool {
        self.width == 1 && self.as_const() == Some(1)
    }

    pub fn is_false(&self) -> bool {
        self.width == 1 && self.as_const() == Some(0)
    }

    fn unary(op: UnOp, arg: Expr) -> Self {
        let width = arg.width;
        if let Some(v) = arg.as_const() {
            let value = match op {
                UnOp::Not => !v,
                UnOp::Neg => v.wrapping_neg(),
            };
            return Self::constant(value, width);
        }
        if op == UnOp::Not {
            if let Node::Unary {
                op: UnOp::Not,
                arg: inner,
            } = &*arg.node
            {
                return inner.clone();
            }
        }
        Self::from_node(Node::Unary { op, arg }, width)
    }

    fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        assert_eq!(
            lhs.width, rhs.width,
            "{:?} operands differ in width: {} vs {}",
            op, lhs.width, rhs.width
        );
        let width = lhs.width;
        let result_width = match op {
            BinOp::Eq | BinOp::Ult => 1,
            _ => width,
        };

        if let (Some(a), Some(b)) = (lhs.as_const(), rhs.as_const()) {
            let value = match op {
                BinOp::Add => a.wrapping_add(b),
                BinOp::Sub => a.wrapping_sub(b),
                BinOp::And => a & b,
                BinOp::Or => a | b,
                BinOp::Xor => a ^ b,
                BinOp::Eq => (a == b) as u128,
                BinOp::Ult => (a < b) as u128,
            };
            return Self::constant(value, result_width);
        }

        // Constants go on the right for the commutative operators.
        let (lhs, rhs) = match op {
            BinOp::Add | BinOp::And | BinOp::Or | BinOp::Xor | BinOp::Eq if lhs.is_const() => {
                (rhs, lhs)
            }
            _ => (lhs, rhs),
        };
        let ones = mask(width);

        match (op, rhs.as_const()) {
            (BinOp::Add | BinOp::Sub | BinOp::Or | BinOp::Xor, Some(0)) => return lhs,
            (BinOp::And, Some(0)) => return Self::constant(0, width),
            (BinOp::And, Some(c)) if c == ones => return lhs,
            (BinOp::Or, Some(c)) if c == ones => return rhs,
            (BinOp::Add, Some(c2)) => {
                // (x + c1) + c2 => x + (c1 + c2)
                if let Node::Binary {
                    op: BinOp::Add,
                    lhs: inner,
                    rhs: c1,
                } = &*lhs.node
                {
                    if let Some(c1) = c1.as_const() {
                        return Self::add(inner.clone(), Self::constant(c1.wrapping_add(c2), width));
                    }
                }
            }
            _ => {}
        }

        if lhs == rhs {
            match op {
                BinOp::And | BinOp::Or => return lhs,
                BinOp::Sub | BinOp::Xor => return Self::constant(0, width),
                BinOp::Eq => return Self::bool(true),
                BinOp::Ult => return Self::bool(false),
                BinOp::Add => {}
            }
        }

        Self::from_node(Node::Binary { op, lhs, rhs }, result_width)
    }

    pub fn not(arg: Expr) -> Self {
        Self::unary(UnOp::Not, arg)
    }

    pub fn neg(arg: Expr) -> Self {
        Self::unary(UnOp::Neg, arg)
    }

    pub fn add(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinOp::Add, lhs, rhs)
    }

    pub fn sub(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinOp::Sub, lhs, rhs)
    }

    pub fn and(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinOp::And, lhs, rhs)
    }

    pub fn or(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinOp::Or, lhs, rhs)
    }

    pub fn xor(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinOp::Xor, lhs, rhs)
    }

    pub fn eq(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinOp::Eq, lhs, rhs)
    }

    pub fn ne(lhs: Expr, rhs: Expr) -> Self {
        Self::not(Self::eq(lhs, rhs))
    }

    pub fn ult(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinOp::Ult, lhs, rhs)
    }

    /// Disjunction of boolean terms. An empty iterator yields `false`.
    pub fn or_all(terms: impl IntoIterator<Item = Expr>) -> Self {
        terms
            .into_iter()
            .fold(Self::bool(false), |acc, term| Self::or(acc, term))
    }

    /// Conjunction of boolean terms. An empty iterator yields `true`.
    pub fn and_all(terms: impl IntoIterator<Item = Expr>) -> Self {
        terms
            .into_iter()
            .fold(Self::bool(true), |acc, term| Self::and(acc, term))
    }

    /// Bits `hi..=lo` of `arg`.
    pub fn extract(hi: u32, lo: u32, arg: Expr) -> Self {
        assert!(
            lo <= hi && hi < arg.width,
            "invalid extract [{}:{}] of {}-bit value",
            hi,
            lo,
            arg.width
        );
        let width = hi - lo + 1;
        if width == arg.width {
            return arg;
        }
        if let Some(v) = arg.as_const() {
            return Self::constant(v >> lo, width);
        }
        match &*arg.node {
            Node::Extract {
                lo: inner_lo,
                arg: inner,
                ..
            } => return Self::extract(hi + inner_lo, lo + inner_lo, inner.clone()),
            Node::Concat {
                hi: upper,
                lo: lower,
            } => {
                if lo >= lower.width {
                    return Self::extract(hi - lower.width, lo - lower.width, upper.clone());
                }
                if hi < lower.width {
                    return Self::extract(hi, lo, lower.clone());
                }
            }
            Node::ZeroExt { arg: inner } => {
                if hi < inner.width {
                    return Self::extract(hi, lo, inner.clone());
                }
                if lo >= inner.width {
                    return Self::constant(0, width);
                }
            }
            _ => {}
        }
        Self::from_node(Node::Extract { hi, lo, arg }, width)
    }

    /// `hi` becomes the most significant part of the result.
    pub fn concat(hi: Expr, lo: Expr) -> Self {
        let width = hi.width + lo.width;
        assert!(
            width <= MAX_WIDTH,
            "concatenation exceeds {} bits: {}",
            MAX_WIDTH,
            width
        );
        if let (Some(h), Some(l)) = (hi.as_const(), lo.as_const()) {
            return Self::constant((h << lo.width) | l, width);
        }
        // Adjacent slices of the same value fuse back together.
        if let (
            Node::Extract {
                hi: h1,
                lo: l1,
                arg: a1,
            },
            Node::Extract {
                hi: h2,
                lo: l2,
                arg: a2,
            },
        ) = (&*hi.node, &*lo.node)
        {
            if *l1 == h2 + 1 && a1 == a2 {
                return Self::extract(*h1, *l2, a1.clone());
            }
        }
        Self::from_node(Node::Concat { hi, lo }, width)
    }

    pub fn zero_ext(width: u32, arg: Expr) -> Self {
        assert!(
            width >= arg.width && width <= MAX_WIDTH,
            "cannot zero-extend {}-bit value to {} bits",
            arg.width,
            width
        );
        if width == arg.width {
            return arg;
        }
        if let Some(v) = arg.as_const() {
            return Self::constant(v, width);
        }
        Self::from_node(Node::ZeroExt { arg }, width)
    }

    pub fn ite(cond: Expr, then: Expr, els: Expr) -> Self {
        assert_eq!(cond.width, 1, "ite condition must be boolean");
        assert_eq!(
            then.width, els.width,
            "ite branches differ in width: {} vs {}",
            then.width, els.width
        );
        match cond.as_const() {
            Some(0) => return els,
            Some(_) => return then,
            None => {}
        }
        if then == els {
            return then;
        }
        let width = then.width;
        Self::from_node(Node::Ite { cond, then, els }, width)
    }

    pub fn children(&self) -> Vec<&Expr> {
        match &*self.node {
            Node::Const { .. } | Node::Sym { .. } => Vec::new(),
            Node::Unary { arg, .. } | Node::Extract { arg, .. } | Node::ZeroExt { arg } => {
                vec![arg]
            }
            Node::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            Node::Concat { hi, lo } => vec![hi, lo],
            Node::Ite { cond, then, els } => vec![cond, then, els],
        }
    }

    /// Rebuild the expression bottom-up through the folding constructors.
    pub fn simplify(&self) -> Expr {
        let mut memo = HashMap::new();
        self.simplify_with(&mut memo)
    }

    fn simplify_with(&self, memo: &mut HashMap<usize, Expr>) -> Expr {
        let key = Arc::as_ptr(&self.node) as usize;
        if let Some(done) = memo.get(&key) {
            return done.clone();
        }
        let result = match &*self.node {
            Node::Const { .. } | Node::Sym { .. } => self.clone(),
            Node::Unary { op, arg } => Self::unary(*op, arg.simplify_with(memo)),
            Node::Binary { op, lhs, rhs } => {
                Self::binary(*op, lhs.simplify_with(memo), rhs.simplify_with(memo))
            }
            Node::Extract { hi, lo, arg } => Self::extract(*hi, *lo, arg.simplify_with(memo)),
            Node::Concat { hi, lo } => Self::concat(hi.simplify_with(memo), lo.simplify_with(memo)),
            Node::ZeroExt { arg } => Self::zero_ext(self.width, arg.simplify_with(memo)),
            Node::Ite { cond, then, els } => Self::ite(
                cond.simplify_with(memo),
                then.simplify_with(memo),
                els.simplify_with(memo),
            ),
        };
        memo.insert(key, result.clone());
        result
    }

    /// Concrete value under `model`. Symbols missing from the model read as zero.
    pub fn eval(&self, model: &Model) -> u128 {
        let mut memo = HashMap::new();
        self.eval_with(model, &mut memo)
    }

    fn eval_with(&self, model: &Model, memo: &mut HashMap<usize, u128>) -> u128 {
        let key = Arc::as_ptr(&self.node) as usize;
        if let Some(&value) = memo.get(&key) {
            return value;
        }
        let value = match &*self.node {
            Node::Const { value } => *value,
            Node::Sym { name } => model.get(name).copied().unwrap_or(0),
            Node::Unary { op, arg } => {
                let v = arg.eval_with(model, memo);
                match op {
                    UnOp::Not => !v,
                    UnOp::Neg => v.wrapping_neg(),
                }
            }
            Node::Binary { op, lhs, rhs } => {
                let a = lhs.eval_with(model, memo);
                let b = rhs.eval_with(model, memo);
                match op {
                    BinOp::Add => a.wrapping_add(b),
                    BinOp::Sub => a.wrapping_sub(b),
                    BinOp::And => a & b,
                    BinOp::Or => a | b,
                    BinOp::Xor => a ^ b,
                    BinOp::Eq => (a == b) as u128,
                    BinOp::Ult => (a < b) as u128,
                }
            }
            Node::Extract { lo, arg, .. } => arg.eval_with(model, memo) >> lo,
            Node::Concat { hi, lo } => {
                (hi.eval_with(model, memo) << lo.width) | lo.eval_with(model, memo)
            }
            Node::ZeroExt { arg } => arg.eval_with(model, memo),
            Node::Ite { cond, then, els } => {
                if cond.eval_with(model, memo) != 0 {
                    then.eval_with(model, memo)
                } else {
                    els.eval_with(model, memo)
                }
            }
        } & mask(self.width);
        memo.insert(key, value);
        value
    }

    /// Free symbols and their widths.
    pub fn symbols(&self) -> BTreeMap<Arc<str>, u32> {
        let mut found = BTreeMap::new();
        let mut seen = HashSet::new();
        let mut stack = vec![self];
        while let Some(expr) = stack.pop() {
            if !seen.insert(Arc::as_ptr(&expr.node) as usize) {
                continue;
            }
            if let Node::Sym { name } = &*expr.node {
                found.insert(name.clone(), expr.width);
            }
            stack.extend(expr.children());
        }
        found
    }

    /// Depth-first scan of the sub-terms for a constant larger than
    /// [`MIN_BASE`], taken as the likely base of a tainted pointer.
    pub fn heuristic_base(&self) -> Option<u128> {
        let mut fringe = self.children();
        while let Some(expr) = fringe.pop() {
            if let Some(value) = expr.as_const() {
                if value > MIN_BASE {
                    return Some(value);
                }
            }
            fringe.extend(expr.children());
        }
        None
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.node {
            Node::Const { value } => write!(f, "{:#x}:{}", value, self.width),
            Node::Sym { name } => write!(f, "{}", name),
            Node::Unary { op, arg } => write!(f, "({:?} {})", op, arg),
            Node::Binary { op, lhs, rhs } => write!(f, "({:?} {} {})", op, lhs, rhs),
            Node::Extract { hi, lo, arg } => write!(f, "{}[{}:{}]", arg, hi, lo),
            Node::Concat { hi, lo } => write!(f, "({} ++ {})", hi, lo),
            Node::ZeroExt { arg } => write!(f, "(zext{} {})", self.width, arg),
            Node::Ite { cond, then, els } => write!(f, "(if {} then {} else {})", cond, then, els),
        }
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
