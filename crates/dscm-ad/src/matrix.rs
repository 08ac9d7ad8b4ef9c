//! Shape-tracked matrix handles on the tape.
//!
//! A batch of `n` observations with `d` features is an `n × d` [`VarMatrix`]:
//! one tape node plus its shape, so networks and flows can check shapes
//! without touching the tape. Elementwise binary operations broadcast the
//! right operand when it is a `1 × 1` scalar, a `1 × d` row or an `n × 1`
//! column, which covers the bias, per-feature and per-observation parameters
//! used by the networks and flows.

use dscm_core::{Error, Result};
use nalgebra::DMatrix;

use crate::tape::{Tape, Var};

/// Dense `nrows × ncols` matrix recorded as a single tape node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarMatrix {
    var: Var,
    nrows: usize,
    ncols: usize,
}

impl VarMatrix {
    /// Handle for an existing node, shaped as recorded on `tape`.
    pub fn from_var(tape: &Tape, var: Var) -> Self {
        let (nrows, ncols) = tape.shape(var);
        Self { var, nrows, ncols }
    }

    /// Record `values` as a constant.
    pub fn constant(tape: &mut Tape, values: &DMatrix<f64>) -> Self {
        let var = tape.constant_matrix(values.clone());
        Self::from_var(tape, var)
    }

    /// Record `values` as a differentiable input.
    pub fn input(tape: &mut Tape, values: &DMatrix<f64>) -> Self {
        let var = tape.input_matrix(values.clone());
        Self::from_var(tape, var)
    }

    /// `nrows × ncols` constant matrix filled with `value`.
    pub fn filled(tape: &mut Tape, nrows: usize, ncols: usize, value: f64) -> Self {
        let var = tape.constant_matrix(DMatrix::from_element(nrows, ncols, value));
        Self { var, nrows, ncols }
    }

    /// The underlying tape node.
    pub fn var(&self) -> Var {
        self.var
    }

    /// Number of rows.
    pub fn nrows(&self) -> usize {
        self.nrows
    }

    /// Number of columns.
    pub fn ncols(&self) -> usize {
        self.ncols
    }

    /// `(nrows, ncols)`
    pub fn shape(&self) -> (usize, usize) {
        (self.nrows, self.ncols)
    }

    /// Primal values as an `nalgebra` matrix.
    pub fn value(&self, tape: &Tape) -> DMatrix<f64> {
        tape.value(self.var).clone()
    }

    /// Constant copy with the same values (gradient blocked).
    pub fn detach(&self, tape: &mut Tape) -> Self {
        let var = tape.detach(self.var);
        Self { var, ..*self }
    }

    // --- Elementwise ---

    fn check_broadcast(&self, rhs: &VarMatrix) -> Result<()> {
        let (r, c) = rhs.shape();
        if (r != self.nrows && r != 1) || (c != self.ncols && c != 1) {
            return Err(Error::Validation(format!(
                "cannot broadcast {r}x{c} onto {}x{}",
                self.nrows, self.ncols
            )));
        }
        Ok(())
    }

    fn binary(
        &self,
        tape: &mut Tape,
        rhs: &VarMatrix,
        op: fn(&mut Tape, Var, Var) -> Result<Var>,
    ) -> Result<Self> {
        self.check_broadcast(rhs)?;
        let var = op(tape, self.var, rhs.var)?;
        Ok(Self { var, ..*self })
    }

    fn unary(&self, tape: &mut Tape, op: impl FnOnce(&mut Tape, Var) -> Var) -> Self {
        let var = op(tape, self.var);
        Self { var, ..*self }
    }

    /// `self + rhs` (broadcasting).
    pub fn add(&self, tape: &mut Tape, rhs: &VarMatrix) -> Result<Self> {
        self.binary(tape, rhs, Tape::add)
    }

    /// `self - rhs` (broadcasting).
    pub fn sub(&self, tape: &mut Tape, rhs: &VarMatrix) -> Result<Self> {
        self.binary(tape, rhs, Tape::sub)
    }

    /// `self * rhs` elementwise (broadcasting).
    pub fn mul(&self, tape: &mut Tape, rhs: &VarMatrix) -> Result<Self> {
        self.binary(tape, rhs, Tape::mul)
    }

    /// `self / rhs` elementwise (broadcasting).
    pub fn div(&self, tape: &mut Tape, rhs: &VarMatrix) -> Result<Self> {
        self.binary(tape, rhs, Tape::div)
    }

    /// `s * self`
    pub fn scale(&self, tape: &mut Tape, s: f64) -> Self {
        self.unary(tape, |t, v| t.mul_f64(v, s))
    }

    /// `self + s`
    pub fn shift(&self, tape: &mut Tape, s: f64) -> Self {
        self.unary(tape, |t, v| t.add_f64(v, s))
    }

    /// Elementwise `-x`.
    pub fn neg(&self, tape: &mut Tape) -> Self {
        self.unary(tape, Tape::neg)
    }

    /// Elementwise `exp(x)`.
    pub fn exp(&self, tape: &mut Tape) -> Self {
        self.unary(tape, Tape::exp)
    }

    /// Elementwise `ln(x)`.
    pub fn ln(&self, tape: &mut Tape) -> Self {
        self.unary(tape, Tape::ln)
    }

    /// Elementwise `x^n`.
    pub fn powi(&self, tape: &mut Tape, n: i32) -> Self {
        self.unary(tape, |t, v| t.powi(v, n))
    }

    /// Elementwise sigmoid.
    pub fn sigmoid(&self, tape: &mut Tape) -> Self {
        self.unary(tape, Tape::sigmoid)
    }

    /// Elementwise softplus.
    pub fn softplus(&self, tape: &mut Tape) -> Self {
        self.unary(tape, Tape::softplus)
    }

    /// Elementwise leaky ReLU.
    pub fn leaky_relu(&self, tape: &mut Tape, slope: f64) -> Self {
        self.unary(tape, |t, v| t.leaky_relu(v, slope))
    }

    // --- Linear algebra and reshaping ---

    /// Matrix product `self · rhs`.
    pub fn matmul(&self, tape: &mut Tape, rhs: &VarMatrix) -> Result<Self> {
        let var = tape.matmul(self.var, rhs.var)?;
        Ok(Self { var, nrows: self.nrows, ncols: rhs.ncols })
    }

    /// Concatenate along columns. All parts must have the same number of rows.
    pub fn hcat(tape: &mut Tape, parts: &[&VarMatrix]) -> Result<Self> {
        let vars: Vec<Var> = parts.iter().map(|p| p.var).collect();
        let var = tape.hcat(&vars)?;
        Ok(Self::from_var(tape, var))
    }

    /// Repeat a single-row matrix `n` times.
    pub fn repeat_rows(&self, tape: &mut Tape, n: usize) -> Result<Self> {
        if self.nrows != 1 {
            return Err(Error::Validation(format!(
                "repeat_rows expects a single row, got {}",
                self.nrows
            )));
        }
        self.select_rows(tape, &vec![0; n])
    }

    /// Gather rows by index (rows may repeat).
    pub fn select_rows(&self, tape: &mut Tape, idx: &[usize]) -> Result<Self> {
        let var = tape.select_rows(self.var, idx)?;
        Ok(Self { var, nrows: idx.len(), ncols: self.ncols })
    }

    /// Gather columns by index.
    pub fn select_cols(&self, tape: &mut Tape, idx: &[usize]) -> Result<Self> {
        let var = tape.select_cols(self.var, idx)?;
        Ok(Self { var, nrows: self.nrows, ncols: idx.len() })
    }

    /// Sum of each row, as an `n × 1` column.
    pub fn row_sums(&self, tape: &mut Tape) -> Self {
        let var = tape.row_sums(self.var);
        Self { var, nrows: self.nrows, ncols: 1 }
    }

    /// Sum of all elements.
    pub fn sum(&self, tape: &mut Tape) -> Var {
        tape.sum_all(self.var)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn mat(r: usize, c: usize, v: &[f64]) -> DMatrix<f64> {
        DMatrix::from_row_slice(r, c, v)
    }

    #[test]
    fn test_values_keep_shape() {
        let mut t = Tape::new();
        let m = mat(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let v = VarMatrix::constant(&mut t, &m);
        assert_eq!(v.shape(), (2, 3));
        assert_eq!(v.value(&t), m);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_broadcast_add_row_and_column() {
        let mut t = Tape::new();
        let a = VarMatrix::constant(&mut t, &mat(2, 2, &[1.0, 2.0, 3.0, 4.0]));
        let row = VarMatrix::constant(&mut t, &mat(1, 2, &[10.0, 20.0]));
        let col = VarMatrix::constant(&mut t, &mat(2, 1, &[100.0, 200.0]));
        let s = VarMatrix::constant(&mut t, &mat(1, 1, &[0.5]));

        let r = a.add(&mut t, &row).unwrap();
        assert_eq!(r.value(&t), mat(2, 2, &[11.0, 22.0, 13.0, 24.0]));
        let c = a.add(&mut t, &col).unwrap();
        assert_eq!(c.value(&t), mat(2, 2, &[101.0, 102.0, 203.0, 204.0]));
        let m = a.mul(&mut t, &s).unwrap();
        assert_eq!(m.value(&t), mat(2, 2, &[0.5, 1.0, 1.5, 2.0]));
    }

    #[test]
    fn test_broadcast_rejects_bad_shape() {
        let mut t = Tape::new();
        let a = VarMatrix::filled(&mut t, 2, 3, 1.0);
        let b = VarMatrix::filled(&mut t, 2, 2, 1.0);
        assert!(a.add(&mut t, &b).is_err());
        // only the right operand broadcasts
        let row = VarMatrix::filled(&mut t, 1, 3, 1.0);
        assert!(row.add(&mut t, &a).is_err());
    }

    #[test]
    fn test_matmul_value_and_gradient() {
        let mut t = Tape::new();
        let x = VarMatrix::constant(&mut t, &mat(1, 2, &[2.0, 3.0]));
        let w = VarMatrix::input(&mut t, &mat(2, 1, &[0.5, -1.0]));
        let y = x.matmul(&mut t, &w).unwrap();
        assert_eq!(y.shape(), (1, 1));
        assert_relative_eq!(t.val(y.var()), -2.0, epsilon = 1e-12);

        t.backward(y.var());
        assert_eq!(t.gradient(w.var()), mat(2, 1, &[2.0, 3.0]));
    }

    #[test]
    fn test_dense_layer_tape_length_is_independent_of_width() {
        for width in [4, 256] {
            let mut t = Tape::new();
            let x = VarMatrix::constant(&mut t, &DMatrix::from_element(3, width, 0.1));
            let w = VarMatrix::input(&mut t, &DMatrix::from_element(width, width, 0.01));
            let b = VarMatrix::input(&mut t, &DMatrix::zeros(1, width));
            let h = x.matmul(&mut t, &w).unwrap().add(&mut t, &b).unwrap().leaky_relu(&mut t, 0.1);
            let total = h.sum(&mut t);
            assert_eq!(t.len(), 7);
            t.backward(total);
            assert_eq!(t.gradient(b.var()), DMatrix::from_element(1, width, 3.0));
        }
    }

    #[test]
    fn test_matmul_shape_mismatch() {
        let mut t = Tape::new();
        let a = VarMatrix::filled(&mut t, 2, 3, 1.0);
        assert!(a.matmul(&mut t, &a).is_err());
    }

    #[test]
    fn test_hcat_and_select_rows() {
        let mut t = Tape::new();
        let a = VarMatrix::constant(&mut t, &mat(2, 1, &[1.0, 2.0]));
        let b = VarMatrix::constant(&mut t, &mat(2, 2, &[3.0, 4.0, 5.0, 6.0]));
        let c = VarMatrix::hcat(&mut t, &[&a, &b]).unwrap();
        assert_eq!(c.shape(), (2, 3));
        assert_eq!(c.value(&t), mat(2, 3, &[1.0, 3.0, 4.0, 2.0, 5.0, 6.0]));

        let cols = c.select_cols(&mut t, &[2, 0]).unwrap();
        assert_eq!(cols.value(&t), mat(2, 2, &[4.0, 1.0, 6.0, 2.0]));
        assert!(c.select_cols(&mut t, &[3]).is_err());

        let s = c.select_rows(&mut t, &[1, 1, 0]).unwrap();
        assert_eq!(s.value(&t), mat(3, 3, &[2.0, 5.0, 6.0, 2.0, 5.0, 6.0, 1.0, 3.0, 4.0]));
        assert!(c.select_rows(&mut t, &[2]).is_err());
        let short = VarMatrix::filled(&mut t, 1, 1, 0.0);
        assert!(VarMatrix::hcat(&mut t, &[&a, &short]).is_err());
    }

    #[test]
    fn test_repeat_rows_and_row_sums() {
        let mut t = Tape::new();
        let r = VarMatrix::input(&mut t, &mat(1, 2, &[1.5, 2.5]));
        let m = r.repeat_rows(&mut t, 3).unwrap();
        assert_eq!(m.shape(), (3, 2));
        let sums = m.row_sums(&mut t);
        assert_eq!(sums.shape(), (3, 1));
        assert_relative_eq!(sums.value(&t)[(2, 0)], 4.0, epsilon = 1e-12);
        assert!(m.repeat_rows(&mut t, 2).is_err());

        let total = m.sum(&mut t);
        t.backward(total);
        assert_eq!(t.gradient(r.var()), mat(1, 2, &[3.0, 3.0]));
    }
}
