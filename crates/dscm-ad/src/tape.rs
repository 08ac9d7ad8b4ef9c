//! Tape-based reverse-mode automatic differentiation over dense matrices.
//!
//! Records a computation graph (forward pass), then computes **all** gradients
//! in a single backward sweep. Every node holds one `nalgebra` matrix, so a
//! dense layer costs a single `MatMul` node whose reverse step is two gemm
//! calls, and the tape length grows with the number of layers, not with the
//! number of weights. Scalars are `1 × 1` nodes.
//!
//! Elementwise binary operations broadcast: a `1 × 1`, `1 × d` or `n × 1`
//! operand is repeated to match the other side, and its adjoint is summed back
//! over the repeated axis.
//!
//! # Example
//! ```
//! use dscm_ad::tape::Tape;
//!
//! # fn main() -> dscm_core::Result<()> {
//! let mut tape = Tape::new();
//! let x = tape.var(3.0);
//! let y = tape.var(5.0);
//! let z = tape.mul(x, y)?;      // z = x * y = 15
//! let w = tape.add(z, x)?;      // w = z + x = 18
//! tape.backward(w);
//! assert_eq!(tape.adjoint(x), 6.0);  // dw/dx = y + 1 = 6
//! assert_eq!(tape.adjoint(y), 3.0);  // dw/dy = x = 3
//! # Ok(())
//! # }
//! ```

use dscm_core::{Error, Result};
use nalgebra::DMatrix;

use crate::math::{log1pexp, sigmoid};

/// Handle to a node on the tape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Var(pub(crate) usize);

impl Var {
    /// Position of the node on its tape.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Operation recorded on the tape.
#[derive(Debug, Clone)]
enum Op {
    /// Input variable (leaf).
    Input,
    /// Constant (adjoint never propagated).
    Const,
    // Broadcasting binary ops
    Add(usize, usize),
    Sub(usize, usize),
    Mul(usize, usize),
    Div(usize, usize),
    // Elementwise unary ops
    Neg(usize),
    Ln(usize),
    Exp(usize),
    Powi(usize, i32),
    Sigmoid(usize),
    Softplus(usize),
    /// Leaky ReLU with the given negative slope.
    LeakyRelu(usize, f64),
    Shift(usize),
    Scale(usize, f64),
    // Linear algebra and layout
    MatMul(usize, usize),
    HCat(Vec<usize>),
    SelectRows(usize, Vec<usize>),
    SelectCols(usize, Vec<usize>),
    RowSums(usize),
    Sum(usize),
}

/// Node on the tape: value + operation that produced it.
#[derive(Debug, Clone)]
struct Node {
    val: DMatrix<f64>,
    op: Op,
}

/// Reverse-mode AD tape.
///
/// Build a computation graph by calling methods (var, add, matmul, ln, …),
/// then call [`backward`](Tape::backward) and read gradients with
/// [`adjoint`](Tape::adjoint) or [`gradient`](Tape::gradient).
#[derive(Debug)]
pub struct Tape {
    nodes: Vec<Node>,
    adjoints: Vec<Option<DMatrix<f64>>>,
}

/// Element of `m` at `(i, j)` of a broadcast target.
#[inline]
fn at(m: &DMatrix<f64>, i: usize, j: usize) -> f64 {
    let ii = if m.nrows() == 1 { 0 } else { i };
    let jj = if m.ncols() == 1 { 0 } else { j };
    m[(ii, jj)]
}

/// Common shape of two broadcastable operands.
fn broadcast_shape(a: (usize, usize), b: (usize, usize)) -> Option<(usize, usize)> {
    let dim = |x: usize, y: usize| match (x, y) {
        _ if x == y => Some(x),
        (1, _) => Some(y),
        (_, 1) => Some(x),
        _ => None,
    };
    Some((dim(a.0, b.0)?, dim(a.1, b.1)?))
}

/// Sum `g` over the axes along which an operand of `shape` was broadcast.
fn unbroadcast(g: DMatrix<f64>, shape: (usize, usize)) -> DMatrix<f64> {
    if g.shape() == shape {
        return g;
    }
    let mut out = DMatrix::zeros(shape.0, shape.1);
    for j in 0..g.ncols() {
        let jj = if shape.1 == 1 { 0 } else { j };
        for i in 0..g.nrows() {
            let ii = if shape.0 == 1 { 0 } else { i };
            out[(ii, jj)] += g[(i, j)];
        }
    }
    out
}

fn accumulate(adjoints: &mut [Option<DMatrix<f64>>], idx: usize, g: DMatrix<f64>) {
    if let Some(acc) = adjoints[idx].as_mut() {
        *acc += &g;
    } else {
        adjoints[idx] = Some(g);
    }
}

impl Tape {
    /// Create an empty tape.
    pub fn new() -> Self {
        Self { nodes: Vec::new(), adjoints: Vec::new() }
    }

    /// Create a tape pre-allocated for `capacity` nodes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { nodes: Vec::with_capacity(capacity), adjoints: Vec::with_capacity(capacity) }
    }

    /// Number of nodes on the tape.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tape is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Clear the tape for reuse (avoids reallocation).
    #[inline]
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.adjoints.clear();
    }

    #[inline]
    fn push(&mut self, val: DMatrix<f64>, op: Op) -> Var {
        let idx = self.nodes.len();
        self.nodes.push(Node { val, op });
        Var(idx)
    }

    // --- Leaf constructors ---

    /// Record a scalar input variable.
    #[inline]
    pub fn var(&mut self, val: f64) -> Var {
        self.push(DMatrix::from_element(1, 1, val), Op::Input)
    }

    /// Record a scalar constant (gradient never flows through it).
    #[inline]
    pub fn constant(&mut self, val: f64) -> Var {
        self.push(DMatrix::from_element(1, 1, val), Op::Const)
    }

    /// Record a matrix input variable.
    pub fn input_matrix(&mut self, val: DMatrix<f64>) -> Var {
        self.push(val, Op::Input)
    }

    /// Record a matrix constant.
    pub fn constant_matrix(&mut self, val: DMatrix<f64>) -> Var {
        self.push(val, Op::Const)
    }

    /// Constant copy of `a`: same value, gradient blocked.
    pub fn detach(&mut self, a: Var) -> Var {
        let val = self.nodes[a.0].val.clone();
        self.push(val, Op::Const)
    }

    // --- Value access ---

    /// Value of a scalar node; the `(0, 0)` element of a matrix node.
    #[inline]
    pub fn val(&self, v: Var) -> f64 {
        self.nodes[v.0].val.get((0, 0)).copied().unwrap_or(f64::NAN)
    }

    /// Value of a node.
    #[inline]
    pub fn value(&self, v: Var) -> &DMatrix<f64> {
        &self.nodes[v.0].val
    }

    /// `(nrows, ncols)` of a node.
    #[inline]
    pub fn shape(&self, v: Var) -> (usize, usize) {
        self.nodes[v.0].val.shape()
    }

    // --- Binary operations ---

    fn binary(&mut self, a: Var, b: Var, f: impl Fn(f64, f64) -> f64, op: Op, what: &str) -> Result<Var> {
        let (va, vb) = (&self.nodes[a.0].val, &self.nodes[b.0].val);
        let (r, c) = broadcast_shape(va.shape(), vb.shape()).ok_or_else(|| {
            Error::Validation(format!(
                "{what}: cannot broadcast {}x{} with {}x{}",
                va.nrows(),
                va.ncols(),
                vb.nrows(),
                vb.ncols()
            ))
        })?;
        let val = DMatrix::from_fn(r, c, |i, j| f(at(va, i, j), at(vb, i, j)));
        Ok(self.push(val, op))
    }

    /// `a + b` (broadcasting).
    pub fn add(&mut self, a: Var, b: Var) -> Result<Var> {
        self.binary(a, b, |x, y| x + y, Op::Add(a.0, b.0), "add")
    }

    /// `a - b` (broadcasting).
    pub fn sub(&mut self, a: Var, b: Var) -> Result<Var> {
        self.binary(a, b, |x, y| x - y, Op::Sub(a.0, b.0), "sub")
    }

    /// `a * b` elementwise (broadcasting).
    pub fn mul(&mut self, a: Var, b: Var) -> Result<Var> {
        self.binary(a, b, |x, y| x * y, Op::Mul(a.0, b.0), "mul")
    }

    /// `a / b` elementwise (broadcasting).
    pub fn div(&mut self, a: Var, b: Var) -> Result<Var> {
        self.binary(a, b, |x, y| x / y, Op::Div(a.0, b.0), "div")
    }

    // --- Unary operations ---

    fn unary(&mut self, a: Var, f: impl Fn(f64) -> f64, op: Op) -> Var {
        let val = self.nodes[a.0].val.map(f);
        self.push(val, op)
    }

    /// `-a`
    pub fn neg(&mut self, a: Var) -> Var {
        self.unary(a, |x| -x, Op::Neg(a.0))
    }

    /// `ln(a)`
    pub fn ln(&mut self, a: Var) -> Var {
        self.unary(a, f64::ln, Op::Ln(a.0))
    }

    /// `exp(a)`
    pub fn exp(&mut self, a: Var) -> Var {
        self.unary(a, f64::exp, Op::Exp(a.0))
    }

    /// `a^n` (integer exponent)
    pub fn powi(&mut self, a: Var, n: i32) -> Var {
        self.unary(a, |x| x.powi(n), Op::Powi(a.0, n))
    }

    /// `1 / (1 + exp(-a))`
    pub fn sigmoid(&mut self, a: Var) -> Var {
        self.unary(a, sigmoid, Op::Sigmoid(a.0))
    }

    /// `ln(1 + exp(a))`
    pub fn softplus(&mut self, a: Var) -> Var {
        self.unary(a, log1pexp, Op::Softplus(a.0))
    }

    /// `a` if positive, otherwise `slope * a`.
    pub fn leaky_relu(&mut self, a: Var, slope: f64) -> Var {
        self.unary(a, |x| if x > 0.0 { x } else { slope * x }, Op::LeakyRelu(a.0, slope))
    }

    /// `a + scalar`
    pub fn add_f64(&mut self, a: Var, s: f64) -> Var {
        self.unary(a, |x| x + s, Op::Shift(a.0))
    }

    /// `a * scalar`
    pub fn mul_f64(&mut self, a: Var, s: f64) -> Var {
        self.unary(a, |x| x * s, Op::Scale(a.0, s))
    }

    // --- Linear algebra and layout ---

    /// Matrix product `a · b`.
    pub fn matmul(&mut self, a: Var, b: Var) -> Result<Var> {
        let (va, vb) = (&self.nodes[a.0].val, &self.nodes[b.0].val);
        if va.ncols() != vb.nrows() {
            return Err(Error::Validation(format!(
                "matmul: {}x{} times {}x{}",
                va.nrows(),
                va.ncols(),
                vb.nrows(),
                vb.ncols()
            )));
        }
        let val = va * vb;
        Ok(self.push(val, Op::MatMul(a.0, b.0)))
    }

    /// Concatenate along columns. All parts must have the same number of rows.
    pub fn hcat(&mut self, parts: &[Var]) -> Result<Var> {
        let Some(first) = parts.first() else {
            return Err(Error::Validation("hcat: no matrices given".to_string()));
        };
        let nrows = self.nodes[first.0].val.nrows();
        if let Some(bad) = parts.iter().find(|p| self.nodes[p.0].val.nrows() != nrows) {
            return Err(Error::Validation(format!(
                "hcat: row mismatch ({} vs {nrows})",
                self.nodes[bad.0].val.nrows()
            )));
        }
        let ncols = parts.iter().map(|p| self.nodes[p.0].val.ncols()).sum();
        let mut val = DMatrix::zeros(nrows, ncols);
        let mut offset = 0;
        for p in parts {
            let m = &self.nodes[p.0].val;
            val.columns_mut(offset, m.ncols()).copy_from(m);
            offset += m.ncols();
        }
        Ok(self.push(val, Op::HCat(parts.iter().map(|p| p.0).collect())))
    }

    /// Gather rows by index (rows may repeat).
    pub fn select_rows(&mut self, a: Var, idx: &[usize]) -> Result<Var> {
        let m = &self.nodes[a.0].val;
        if let Some(&bad) = idx.iter().find(|&&i| i >= m.nrows()) {
            return Err(Error::Validation(format!(
                "select_rows: row {bad} out of range for {} rows",
                m.nrows()
            )));
        }
        let val = m.select_rows(idx);
        Ok(self.push(val, Op::SelectRows(a.0, idx.to_vec())))
    }

    /// Gather columns by index (columns may repeat).
    pub fn select_cols(&mut self, a: Var, idx: &[usize]) -> Result<Var> {
        let m = &self.nodes[a.0].val;
        if let Some(&bad) = idx.iter().find(|&&j| j >= m.ncols()) {
            return Err(Error::Validation(format!(
                "select_cols: column {bad} out of range for {} columns",
                m.ncols()
            )));
        }
        let val = m.select_columns(idx);
        Ok(self.push(val, Op::SelectCols(a.0, idx.to_vec())))
    }

    /// Sum of each row, as an `n × 1` column.
    pub fn row_sums(&mut self, a: Var) -> Var {
        let m = &self.nodes[a.0].val;
        let val = DMatrix::from_fn(m.nrows(), 1, |i, _| m.row(i).sum());
        self.push(val, Op::RowSums(a.0))
    }

    /// Sum of all elements, as a scalar.
    pub fn sum_all(&mut self, a: Var) -> Var {
        let val = DMatrix::from_element(1, 1, self.nodes[a.0].val.sum());
        self.push(val, Op::Sum(a.0))
    }

    /// Sum of `terms` (broadcasting); a constant zero when empty.
    pub fn sum(&mut self, terms: &[Var]) -> Result<Var> {
        match terms.split_first() {
            None => Ok(self.constant(0.0)),
            Some((&first, rest)) => rest.iter().try_fold(first, |acc, &t| self.add(acc, t)),
        }
    }

    // --- Backward pass ---

    /// Run reverse-mode AD from output node `out`, seeding its adjoint with ones.
    ///
    /// For a matrix-valued `out` this differentiates the sum of its elements.
    /// After calling this, use [`adjoint`](Tape::adjoint) or
    /// [`gradient`](Tape::gradient) to read ∂out/∂x for any node `x`.
    pub fn backward(&mut self, out: Var) {
        let Tape { nodes, adjoints } = self;
        adjoints.clear();
        adjoints.resize(nodes.len(), None);
        let (r, c) = nodes[out.0].val.shape();
        adjoints[out.0] = Some(DMatrix::from_element(r, c, 1.0));

        for i in (0..=out.0).rev() {
            let Some(adj) = adjoints[i].take() else {
                continue;
            };
            let node = &nodes[i];
            match &node.op {
                Op::Input | Op::Const => {}
                &Op::Add(a, b) => {
                    accumulate(adjoints, a, unbroadcast(adj.clone(), nodes[a].val.shape()));
                    accumulate(adjoints, b, unbroadcast(adj.clone(), nodes[b].val.shape()));
                }
                &Op::Sub(a, b) => {
                    accumulate(adjoints, a, unbroadcast(adj.clone(), nodes[a].val.shape()));
                    accumulate(adjoints, b, unbroadcast(-adj.clone(), nodes[b].val.shape()));
                }
                &Op::Mul(a, b) => {
                    let (va, vb) = (&nodes[a].val, &nodes[b].val);
                    let ga = DMatrix::from_fn(adj.nrows(), adj.ncols(), |p, q| adj[(p, q)] * at(vb, p, q));
                    let gb = DMatrix::from_fn(adj.nrows(), adj.ncols(), |p, q| adj[(p, q)] * at(va, p, q));
                    accumulate(adjoints, a, unbroadcast(ga, va.shape()));
                    accumulate(adjoints, b, unbroadcast(gb, vb.shape()));
                }
                &Op::Div(a, b) => {
                    let (va, vb) = (&nodes[a].val, &nodes[b].val);
                    let ga = DMatrix::from_fn(adj.nrows(), adj.ncols(), |p, q| adj[(p, q)] / at(vb, p, q));
                    let gb = DMatrix::from_fn(adj.nrows(), adj.ncols(), |p, q| {
                        let y = at(vb, p, q);
                        -adj[(p, q)] * at(va, p, q) / (y * y)
                    });
                    accumulate(adjoints, a, unbroadcast(ga, va.shape()));
                    accumulate(adjoints, b, unbroadcast(gb, vb.shape()));
                }
                &Op::Neg(a) => accumulate(adjoints, a, -adj.clone()),
                &Op::Ln(a) => accumulate(adjoints, a, adj.component_div(&nodes[a].val)),
                &Op::Exp(a) => accumulate(adjoints, a, adj.component_mul(&node.val)),
                &Op::Powi(a, n) => {
                    let d = nodes[a].val.map(|x| f64::from(n) * x.powi(n - 1));
                    accumulate(adjoints, a, adj.component_mul(&d));
                }
                &Op::Sigmoid(a) => {
                    let d = node.val.map(|s| s * (1.0 - s));
                    accumulate(adjoints, a, adj.component_mul(&d));
                }
                &Op::Softplus(a) => {
                    let d = nodes[a].val.map(sigmoid);
                    accumulate(adjoints, a, adj.component_mul(&d));
                }
                &Op::LeakyRelu(a, slope) => {
                    let d = nodes[a].val.map(|x| if x > 0.0 { 1.0 } else { slope });
                    accumulate(adjoints, a, adj.component_mul(&d));
                }
                &Op::Shift(a) => accumulate(adjoints, a, adj.clone()),
                &Op::Scale(a, s) => accumulate(adjoints, a, &adj * s),
                &Op::MatMul(a, b) => {
                    // d(AB) = dA B + A dB
                    let ga = &adj * nodes[b].val.transpose();
                    let gb = nodes[a].val.tr_mul(&adj);
                    accumulate(adjoints, a, ga);
                    accumulate(adjoints, b, gb);
                }
                Op::HCat(parts) => {
                    let mut offset = 0;
                    for &p in parts {
                        let w = nodes[p].val.ncols();
                        accumulate(adjoints, p, adj.columns(offset, w).into_owned());
                        offset += w;
                    }
                }
                Op::SelectRows(a, idx) => {
                    let mut g = DMatrix::zeros(nodes[*a].val.nrows(), adj.ncols());
                    for (r, &src) in idx.iter().enumerate() {
                        let mut row = g.row_mut(src);
                        row += adj.row(r);
                    }
                    accumulate(adjoints, *a, g);
                }
                Op::SelectCols(a, idx) => {
                    let mut g = DMatrix::zeros(adj.nrows(), nodes[*a].val.ncols());
                    for (c, &src) in idx.iter().enumerate() {
                        let mut col = g.column_mut(src);
                        col += adj.column(c);
                    }
                    accumulate(adjoints, *a, g);
                }
                &Op::RowSums(a) => {
                    let (r, c) = nodes[a].val.shape();
                    accumulate(adjoints, a, DMatrix::from_fn(r, c, |p, _| adj[(p, 0)]));
                }
                &Op::Sum(a) => {
                    let (r, c) = nodes[a].val.shape();
                    accumulate(adjoints, a, DMatrix::from_element(r, c, adj[(0, 0)]));
                }
            }
            adjoints[i] = Some(adj);
        }
    }

    /// Read ∂output/∂v after calling [`backward`](Tape::backward); the `(0, 0)`
    /// element for matrix nodes.
    #[inline]
    pub fn adjoint(&self, v: Var) -> f64 {
        self.adjoints
            .get(v.0)
            .and_then(Option::as_ref)
            .and_then(|g| g.get((0, 0)).copied())
            .unwrap_or(0.0)
    }

    /// Full adjoint of `v`; zeros when no gradient reached it.
    pub fn gradient(&self, v: Var) -> DMatrix<f64> {
        match self.adjoints.get(v.0).and_then(Option::as_ref) {
            Some(g) => g.clone(),
            None => {
                let (r, c) = self.shape(v);
                DMatrix::zeros(r, c)
            }
        }
    }
}

impl Default for Tape {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Central finite difference of a scalar function built on a fresh tape.
    fn finite_diff(f: impl Fn(&mut Tape, Var) -> Var, x: f64) -> f64 {
        let h = 1e-6;
        let eval = |x: f64| {
            let mut t = Tape::new();
            let v = t.var(x);
            let out = f(&mut t, v);
            t.val(out)
        };
        (eval(x + h) - eval(x - h)) / (2.0 * h)
    }

    fn reverse(f: impl Fn(&mut Tape, Var) -> Var, x: f64) -> f64 {
        let mut t = Tape::new();
        let v = t.var(x);
        let out = f(&mut t, v);
        t.backward(out);
        t.adjoint(v)
    }

    fn mat(r: usize, c: usize, v: &[f64]) -> DMatrix<f64> {
        DMatrix::from_row_slice(r, c, v)
    }

    #[test]
    fn test_binary_ops() {
        let mut t = Tape::new();
        let x = t.var(6.0);
        let y = t.var(3.0);
        let s = t.add(x, y).unwrap();
        let d = t.sub(x, y).unwrap();
        let p = t.mul(s, d).unwrap();
        let q = t.div(p, y).unwrap();
        // q = (x + y)(x - y) / y = (x^2 - y^2) / y
        assert_relative_eq!(t.val(q), 9.0, epsilon = 1e-12);

        t.backward(q);
        assert_relative_eq!(t.adjoint(x), 2.0 * 6.0 / 3.0, epsilon = 1e-12);
        // d/dy (x^2/y - y) = -x^2/y^2 - 1
        assert_relative_eq!(t.adjoint(y), -36.0 / 9.0 - 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_unary_ops_match_finite_differences() {
        let cases: Vec<(&str, Box<dyn Fn(&mut Tape, Var) -> Var>)> = vec![
            ("neg", Box::new(|t: &mut Tape, v| t.neg(v))),
            ("ln", Box::new(|t: &mut Tape, v| t.ln(v))),
            ("exp", Box::new(|t: &mut Tape, v| t.exp(v))),
            ("powi", Box::new(|t: &mut Tape, v| t.powi(v, 3))),
            ("sigmoid", Box::new(|t: &mut Tape, v| t.sigmoid(v))),
            ("softplus", Box::new(|t: &mut Tape, v| t.softplus(v))),
            ("leaky_relu", Box::new(|t: &mut Tape, v| t.leaky_relu(v, 0.1))),
            ("scale", Box::new(|t: &mut Tape, v| t.mul_f64(v, -2.5))),
        ];
        for &x in &[0.4, 1.7] {
            for (name, f) in &cases {
                let fd = finite_diff(f, x);
                let ad = reverse(f, x);
                assert!((fd - ad).abs() < 1e-6, "{name} at {x}: fd={fd}, ad={ad}");
            }
        }
    }

    #[test]
    fn test_leaky_relu_negative_branch() {
        let g = reverse(|t, v| t.leaky_relu(v, 0.1), -2.0);
        assert_relative_eq!(g, 0.1, epsilon = 1e-12);

        let mut t = Tape::new();
        let x = t.var(-2.0);
        let y = t.leaky_relu(x, 0.1);
        assert_relative_eq!(t.val(y), -0.2, epsilon = 1e-12);
    }

    #[test]
    fn test_softplus_large_input_is_finite() {
        let mut t = Tape::new();
        let x = t.var(900.0);
        let y = t.softplus(x);
        assert_relative_eq!(t.val(y), 900.0, epsilon = 1e-9);
        t.backward(y);
        assert_relative_eq!(t.adjoint(x), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_gaussian_log_density_gradient() {
        // f(mu, log_sigma) = -0.5 ((x - mu) / sigma)^2 - log_sigma
        let x = 1.3;
        let mut t = Tape::new();
        let mu = t.var(0.5);
        let log_sigma = t.var(-0.2);
        let sigma = t.exp(log_sigma);
        let neg_mu = t.neg(mu);
        let diff = t.add_f64(neg_mu, x);
        let z = t.div(diff, sigma).unwrap();
        let z2 = t.powi(z, 2);
        let half = t.mul_f64(z2, -0.5);
        let f = t.sub(half, log_sigma).unwrap();

        t.backward(f);
        let s = (-0.2_f64).exp();
        let zv = (x - 0.5) / s;
        assert_relative_eq!(t.adjoint(mu), zv / s, epsilon = 1e-12);
        assert_relative_eq!(t.adjoint(log_sigma), zv * zv - 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_detach_blocks_gradient() {
        let mut t = Tape::new();
        let x = t.var(2.0);
        let d = t.detach(x);
        let y = t.mul(x, d).unwrap();
        assert_relative_eq!(t.val(y), 4.0, epsilon = 1e-12);
        t.backward(y);
        assert_relative_eq!(t.adjoint(x), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_sum() {
        let mut t = Tape::new();
        let empty = t.sum(&[]).unwrap();
        assert_eq!(t.val(empty), 0.0);

        let xs: Vec<Var> = (1..=4).map(|i| t.var(i as f64)).collect();
        let s = t.sum(&xs).unwrap();
        assert_relative_eq!(t.val(s), 10.0, epsilon = 1e-12);
        t.backward(s);
        for &x in &xs {
            assert_relative_eq!(t.adjoint(x), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_broadcast_gradients_sum_over_repeated_axes() {
        let mut t = Tape::new();
        let a = t.input_matrix(mat(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
        let row = t.input_matrix(mat(1, 3, &[1.0, 10.0, 100.0]));
        let col = t.input_matrix(mat(2, 1, &[2.0, -1.0]));
        let ar = t.mul(a, row).unwrap();
        let y = t.add(ar, col).unwrap();
        assert_eq!(t.value(y), &mat(2, 3, &[3.0, 22.0, 302.0, 3.0, 49.0, 599.0]));
        let total = t.sum_all(y);
        t.backward(total);
        assert_eq!(t.gradient(a), mat(2, 3, &[1.0, 10.0, 100.0, 1.0, 10.0, 100.0]));
        assert_eq!(t.gradient(row), mat(1, 3, &[5.0, 7.0, 9.0]));
        assert_eq!(t.gradient(col), mat(2, 1, &[3.0, 3.0]));

        let bad = t.input_matrix(DMatrix::zeros(3, 2));
        assert!(t.add(a, bad).is_err());
    }

    #[test]
    fn test_matmul_is_one_node_with_gemm_gradients() {
        let mut t = Tape::new();
        let a = t.input_matrix(mat(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
        let b = t.input_matrix(mat(3, 2, &[0.5, -1.0, 2.0, 0.0, -0.5, 1.0]));
        let before = t.len();
        let c = t.matmul(a, b).unwrap();
        assert_eq!(t.len(), before + 1);
        assert_eq!(t.value(c), &mat(2, 2, &[3.0, 2.0, 9.0, 2.0]));

        let total = t.sum_all(c);
        t.backward(total);
        // d sum(AB) / dA = 1 Bᵀ, d sum(AB) / dB = Aᵀ 1
        assert_eq!(t.gradient(a), mat(2, 3, &[-0.5, 2.0, 0.5, -0.5, 2.0, 0.5]));
        assert_eq!(t.gradient(b), mat(3, 2, &[5.0, 5.0, 7.0, 7.0, 9.0, 9.0]));
        assert!(t.matmul(a, a).is_err());
    }

    #[test]
    fn test_layout_ops_route_gradients() {
        let mut t = Tape::new();
        let a = t.input_matrix(mat(2, 1, &[1.0, 2.0]));
        let b = t.input_matrix(mat(2, 2, &[3.0, 4.0, 5.0, 6.0]));
        let c = t.hcat(&[a, b]).unwrap();
        assert_eq!(t.value(c), &mat(2, 3, &[1.0, 3.0, 4.0, 2.0, 5.0, 6.0]));
        let rows = t.select_rows(c, &[1, 1, 0]).unwrap();
        let cols = t.select_cols(rows, &[2, 0]).unwrap();
        assert_eq!(t.value(cols), &mat(3, 2, &[6.0, 2.0, 6.0, 2.0, 4.0, 1.0]));
        assert!(t.select_rows(c, &[2]).is_err());
        assert!(t.select_cols(c, &[3]).is_err());

        let sums = t.row_sums(cols);
        assert_eq!(t.value(sums), &mat(3, 1, &[8.0, 8.0, 5.0]));
        let total = t.sum_all(sums);
        t.backward(total);
        assert_eq!(t.gradient(a), mat(2, 1, &[1.0, 2.0]));
        assert_eq!(t.gradient(b), mat(2, 2, &[0.0, 1.0, 0.0, 2.0]));
    }

    #[test]
    fn test_backward_ignores_nodes_after_output() {
        let mut t = Tape::new();
        let x = t.var(3.0);
        let y = t.mul(x, x).unwrap();
        let _later = t.exp(y);
        t.backward(y);
        assert_relative_eq!(t.adjoint(x), 6.0, epsilon = 1e-12);
    }

    #[test]
    fn test_tape_reuse() {
        let mut t = Tape::new();
        let x = t.var(2.0);
        let z = t.mul(x, x).unwrap();
        t.backward(z);
        assert_relative_eq!(t.adjoint(x), 4.0, epsilon = 1e-12);

        t.clear();
        let x = t.var(5.0);
        let z = t.mul(x, x).unwrap();
        t.backward(z);
        assert_relative_eq!(t.adjoint(x), 10.0, epsilon = 1e-12);
        assert_eq!(t.gradient(z), DMatrix::from_element(1, 1, 1.0));
    }
}
