//! Cubic-spline preparation & O(1) table lookup
//!
//! Two preparation routines build the second-derivative array for a sampled
//! potential column:
//! - [`prepare_uniform`] for equidistant knots (step `h` known, no abscissae
//!   stored),
//! - [`prepare_nonuniform`] for explicitly stored abscissae.
//!
//! Both accept endpoint gradients; a gradient above [`NATURAL_GRAD_MIN`]
//! selects the **natural** boundary (zero curvature) on that side, anything
//! else clamps the first derivative to the given value.
//!
//! Queries never search: the caller supplies a precomputed `(slot, shift,
//! step)` triple (see `SplineSlot` in `model`), so a lookup is a handful of
//! multiplies. [`splint_comb_dir`] returns value **and** derivative from a
//! single pass over the two bracketing knots; the force loops depend on this.
//!
//! ## Invariants
//! - `slot + 1` must index a stored sample and `shift ∈ [0, 1)`. The hot
//!   wrappers only `debug_assert!` this (callers gate by the column cutoff);
//!   the `_r` variants return [`SplineError::OutOfRange`] and are used for
//!   upfront validation.
//! - Value and second-derivative slices always have equal length.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

/// Endpoint gradients at or above this threshold select the natural boundary.
pub const NATURAL_GRAD_MIN: f64 = 0.99e30;

/// Conventional sentinel stored for "no endpoint gradient supplied".
pub const NATURAL_GRAD: f64 = 1e30;

/// Errors surfaced by spline preparation and checked lookups.
#[derive(Debug, thiserror::Error)]
pub enum SplineError {
    #[error("value/derivative slices differ in length ({y} vs {y2})")]
    LengthMismatch { y: usize, y2: usize },
    #[error("need at least two knots (got {0})")]
    TooFewKnots(usize),
    #[error("knot step must be positive (got {0})")]
    BadStep(f64),
    #[error("slot {slot} (+1) out of range for table of length {len}")]
    OutOfRange { slot: usize, len: usize },
    #[error("shift {0} outside [0, 1)")]
    BadShift(f64),
}

/// Second-derivative preparation on **equidistant** knots with spacing `step`.
///
/// `y` holds the sampled values, `yp0`/`ypn` the endpoint gradients (natural
/// boundary when ≥ [`NATURAL_GRAD_MIN`]). The result is written to `y2`,
/// which must have the same length as `y`.
pub fn prepare_uniform(
    step: f64,
    y: &[f64],
    yp0: f64,
    ypn: f64,
    y2: &mut [f64],
) -> Result<(), SplineError> {
    let n = y.len();
    if n < 2 {
        return Err(SplineError::TooFewKnots(n));
    }
    if y2.len() != n {
        return Err(SplineError::LengthMismatch { y: n, y2: y2.len() });
    }
    if !(step > 0.0) {
        return Err(SplineError::BadStep(step));
    }

    let mut u = vec![0.0f64; n];
    if yp0 > NATURAL_GRAD_MIN {
        y2[0] = 0.0;
        u[0] = 0.0;
    } else {
        y2[0] = -0.5;
        u[0] = (3.0 / step) * ((y[1] - y[0]) / step - yp0);
    }
    // Forward sweep of the tridiagonal system; sig = 0.5 on a uniform grid.
    for i in 1..n - 1 {
        let sig = 0.5;
        let p = sig * y2[i - 1] + 2.0;
        y2[i] = (sig - 1.0) / p;
        let d2 = (y[i + 1] - 2.0 * y[i] + y[i - 1]) / step;
        u[i] = (3.0 * d2 / step - sig * u[i - 1]) / p;
    }
    let (qn, un) = if ypn > NATURAL_GRAD_MIN {
        (0.0, 0.0)
    } else {
        (0.5, (3.0 / step) * (ypn - (y[n - 1] - y[n - 2]) / step))
    };
    y2[n - 1] = (un - qn * u[n - 2]) / (qn * y2[n - 2] + 1.0);
    for k in (0..n - 1).rev() {
        y2[k] = y2[k] * y2[k + 1] + u[k];
    }
    Ok(())
}

/// Second-derivative preparation on **explicit** abscissae `x`.
///
/// Same boundary-gradient contract as [`prepare_uniform`]; used by table
/// formats that store their sampling points.
pub fn prepare_nonuniform(
    x: &[f64],
    y: &[f64],
    yp0: f64,
    ypn: f64,
    y2: &mut [f64],
) -> Result<(), SplineError> {
    let n = y.len();
    if n < 2 {
        return Err(SplineError::TooFewKnots(n));
    }
    if x.len() != n {
        return Err(SplineError::LengthMismatch { y: n, y2: x.len() });
    }
    if y2.len() != n {
        return Err(SplineError::LengthMismatch { y: n, y2: y2.len() });
    }

    let mut u = vec![0.0f64; n];
    if yp0 > NATURAL_GRAD_MIN {
        y2[0] = 0.0;
        u[0] = 0.0;
    } else {
        y2[0] = -0.5;
        u[0] = (3.0 / (x[1] - x[0])) * ((y[1] - y[0]) / (x[1] - x[0]) - yp0);
    }
    for i in 1..n - 1 {
        let sig = (x[i] - x[i - 1]) / (x[i + 1] - x[i - 1]);
        let p = sig * y2[i - 1] + 2.0;
        y2[i] = (sig - 1.0) / p;
        let d = (y[i + 1] - y[i]) / (x[i + 1] - x[i]) - (y[i] - y[i - 1]) / (x[i] - x[i - 1]);
        u[i] = (6.0 * d / (x[i + 1] - x[i - 1]) - sig * u[i - 1]) / p;
    }
    let (qn, un) = if ypn > NATURAL_GRAD_MIN {
        (0.0, 0.0)
    } else {
        let h = x[n - 1] - x[n - 2];
        (0.5, (3.0 / h) * (ypn - (y[n - 1] - y[n - 2]) / h))
    };
    y2[n - 1] = (un - qn * u[n - 2]) / (qn * y2[n - 2] + 1.0);
    for k in (0..n - 1).rev() {
        y2[k] = y2[k] * y2[k + 1] + u[k];
    }
    Ok(())
}

/// Value-only lookup from a precomputed `(slot, shift, step)` triple.
#[inline]
pub fn splint_dir(y: &[f64], y2: &[f64], slot: usize, shift: f64, step: f64) -> f64 {
    debug_assert!(slot + 1 < y.len(), "spline slot out of range");
    debug_assert!((0.0..1.0).contains(&shift), "spline shift out of range");
    let b = shift;
    let a = 1.0 - b;
    a * y[slot]
        + b * y[slot + 1]
        + ((a * a * a - a) * y2[slot] + (b * b * b - b) * y2[slot + 1]) * step * step / 6.0
}

/// Combined value/derivative lookup; both come from the same pass over the
/// two bracketing knots.
#[inline]
pub fn splint_comb_dir(
    y: &[f64],
    y2: &[f64],
    slot: usize,
    shift: f64,
    step: f64,
) -> (f64, f64) {
    debug_assert!(slot + 1 < y.len(), "spline slot out of range");
    debug_assert!((0.0..1.0).contains(&shift), "spline shift out of range");
    let b = shift;
    let a = 1.0 - b;
    let val = a * y[slot]
        + b * y[slot + 1]
        + ((a * a * a - a) * y2[slot] + (b * b * b - b) * y2[slot + 1]) * step * step / 6.0;
    let grad = (y[slot + 1] - y[slot]) / step
        + ((3.0 * b * b - 1.0) * y2[slot + 1] - (3.0 * a * a - 1.0) * y2[slot]) * step / 6.0;
    (val, grad)
}

/// Checked variant of [`splint_dir`].
pub fn splint_dir_r(
    y: &[f64],
    y2: &[f64],
    slot: usize,
    shift: f64,
    step: f64,
) -> Result<f64, SplineError> {
    check_slot(y, y2, slot, shift)?;
    Ok(splint_dir(y, y2, slot, shift, step))
}

/// Checked variant of [`splint_comb_dir`].
pub fn splint_comb_dir_r(
    y: &[f64],
    y2: &[f64],
    slot: usize,
    shift: f64,
    step: f64,
) -> Result<(f64, f64), SplineError> {
    check_slot(y, y2, slot, shift)?;
    Ok(splint_comb_dir(y, y2, slot, shift, step))
}

#[inline]
fn check_slot(y: &[f64], y2: &[f64], slot: usize, shift: f64) -> Result<(), SplineError> {
    if y.len() != y2.len() {
        return Err(SplineError::LengthMismatch { y: y.len(), y2: y2.len() });
    }
    if slot + 1 >= y.len() {
        return Err(SplineError::OutOfRange { slot, len: y.len() });
    }
    if !(0.0..1.0).contains(&shift) {
        return Err(SplineError::BadShift(shift));
    }
    Ok(())
}
