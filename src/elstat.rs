//! Damped Coulomb tails & charge resolution
//!
//! The monopole term uses a short-ranged stand-in for the full Ewald sum: an
//! `erfc`-damped Coulomb kernel, cut off at `cutoff` and shifted so the
//! truncation is smooth. Two shifting schemes are supported:
//!
//! - [`elstat_shift`] — shifted potential; value and slope removed at the
//!   cutoff through a quadratic shift term.
//! - [`elstat_dsf`] — damped shifted force; value **and** first derivative
//!   vanish identically at the cutoff, so forces are continuous there.
//!
//! All kernels return a [`Tail`] triple `(V, V'/r, V''-cache)` matching what
//! the accumulators consume; `grad` is the radial derivative divided by `r`
//! so a force is just `dist · grad`.
//!
//! [`resolve_charges`] derives the last species' charge from the neutrality
//! constraint `Σ ratio·q = 0` and preserves the legacy switch-by-zero
//! convention: an optimization variable equal to exactly `0.0` means the
//! species' charge (or κ) is not fitted and is pinned to zero.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use libm::erfc;
use serde::{Deserialize, Serialize};

use crate::table::ParamLayout;

/// Default Coulomb prefactor e²/(4πε₀) in eV·Å per squared elementary charge.
pub const DP_EPS: f64 = 14.399645;

/// Which shifting scheme the monopole term uses.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoulombKind {
    /// Shifted potential (value and slope removed at the cutoff).
    Shift,
    /// Damped shifted force (value and first derivative both zero at the cutoff).
    Dsf,
}

/// Electrostatic configuration carried by the kernel context.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ElstatParams {
    /// Monopole cutoff radius (`dp_cut`).
    pub cutoff: f64,
    /// Coulomb prefactor; [`DP_EPS`] unless the driver works in other units.
    pub epsilon: f64,
    /// Per-species population ratios used by the neutrality constraint.
    pub ratio: Vec<f64>,
    /// True when κ is an optimization variable; the tail caches are then
    /// refreshed by a pre-pass instead of inline per neighbor.
    pub sw_kappa: bool,
}

/// Value, gradient-over-r, and second-derivative cache of a tail kernel.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Tail {
    pub fnval: f64,
    pub grad: f64,
    pub ggrad: f64,
}

/// Raw (unshifted) damped Coulomb tail at radius `r`.
///
/// `fnval = ε·erfc(κr)/r`, `grad = V'(r)/r`, `ggrad` is the cached
/// second-radius-derivative combination used by downstream bookkeeping.
pub fn elstat_value(r: f64, kappa: f64, eps: f64) -> Tail {
    let r2 = r * r;
    let k2 = kappa * kappa;
    let pre = 2.0 * eps * kappa / std::f64::consts::PI.sqrt();
    let damp = (-r2 * k2).exp();
    let fnval = eps * erfc(kappa * r) / r;
    let grad = (-fnval - pre * damp) / r2;
    let ggrad = (2.0 * k2 * pre * damp - 3.0 * grad) / r2;
    Tail { fnval, grad, ggrad }
}

/// Shifted-potential tail: the raw tail minus its value and quadratic slope
/// term at the cutoff `rc`.
pub fn elstat_shift(r: f64, rc: f64, kappa: f64, eps: f64) -> Tail {
    let t = elstat_value(r, kappa, eps);
    let tc = elstat_value(rc, kappa, eps);
    Tail {
        fnval: t.fnval - tc.fnval - (r * r - rc * rc) * tc.grad / 2.0,
        grad: t.grad - tc.grad,
        ggrad: t.ggrad - tc.ggrad,
    }
}

/// Damped-shifted-force tail: value and first derivative both vanish at `rc`.
pub fn elstat_dsf(r: f64, rc: f64, kappa: f64, eps: f64) -> Tail {
    let t = elstat_value(r, kappa, eps);
    let tc = elstat_value(rc, kappa, eps);
    Tail {
        fnval: t.fnval - tc.fnval - (r - rc) * tc.grad * rc,
        grad: t.grad - tc.grad * rc / r,
        ggrad: t.ggrad - tc.ggrad,
    }
}

/// Tail kernel selected by `kind`.
#[inline]
pub fn tail(kind: CoulombKind, r: f64, rc: f64, kappa: f64, eps: f64) -> Tail {
    match kind {
        CoulombKind::Shift => elstat_shift(r, rc, kappa, eps),
        CoulombKind::Dsf => elstat_dsf(r, rc, kappa, eps),
    }
}

/// Per-atom self-energy correction subtracted once per charged atom.
///
/// The DSF variant folds in the raw tail at the cutoff; see the monopole
/// accumulator for where this enters the config energy.
pub fn self_energy(q: f64, kappa: f64, eps: f64, kind: CoulombKind, cutoff: f64) -> f64 {
    let qq = q * q;
    match kind {
        CoulombKind::Shift => eps * kappa * qq / std::f64::consts::PI.sqrt(),
        CoulombKind::Dsf => {
            let tc = elstat_value(cutoff, kappa, eps);
            qq * (eps * kappa / std::f64::consts::PI.sqrt()
                + (tc.fnval - tc.grad * cutoff * cutoff) * 0.5)
        }
    }
}

/// Read the charge block of the optimization vector, enforce neutrality, and
/// return κ.
///
/// `xi_opt[layout.charge_offset() + i]` holds species `i`'s charge for
/// `i < ntypes − 1`; the final slot holds κ. The last species' charge is
/// derived as `−Σ ratio·q / ratio[ntypes−1]`, so
/// `Σ ratio·charge = 0` holds exactly on return.
pub fn resolve_charges(
    xi_opt: &[f64],
    layout: &ParamLayout,
    ratio: &[f64],
    charge: &mut [f64],
) -> f64 {
    let ntypes = layout.ntypes;
    debug_assert_eq!(charge.len(), ntypes);
    debug_assert_eq!(ratio.len(), ntypes);
    let off = layout.charge_offset();

    let mut sum = 0.0;
    for i in 0..ntypes - 1 {
        let v = xi_opt[off + i];
        if v != 0.0 {
            charge[i] = v;
            sum += ratio[i] * v;
        } else {
            charge[i] = 0.0;
        }
    }
    charge[ntypes - 1] = -sum / ratio[ntypes - 1];

    // κ follows the same switch-by-zero convention; a zero slot simply
    // reads back as an undamped kernel.
    xi_opt[layout.kappa_index()]
}
