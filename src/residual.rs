//! Shared per-configuration finalizer
//!
//! Both potential families funnel through these helpers after accumulation:
//! reset at the top of a configuration, then force weighting / contrib
//! masking / squared-residual collection at the bottom. The residual vector
//! holds *deviations* — forces start at `−reference` so the accumulated
//! physical force lands directly on the difference.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use crate::kernel::KernelOptions;
use crate::model::{Atom, Configuration, ResidualLayout};

/// Regularizer added to |F_ref| when force weighting divides by it.
pub const FORCE_EPS: f64 = 0.1;

#[inline]
pub(crate) fn dsquare(x: f64) -> f64 {
    x * x
}

/// Zero configuration `h`'s energy and stress slots and seed its atoms'
/// force slots (`−reference` when forces are in use, zero otherwise).
pub fn reset_config(
    layout: &ResidualLayout,
    conf: &Configuration,
    h: usize,
    force_0: &[f64],
    forces: &mut [f64],
) {
    forces[layout.energy(h)] = 0.0;
    let st = layout.stress(h);
    for s in &mut forces[st..st + 6] {
        *s = 0.0;
    }
    for i in 0..conf.inconf {
        let n_i = layout.force(conf.cnfstart + i);
        if conf.use_forces {
            forces[n_i] = -force_0[n_i];
            forces[n_i + 1] = -force_0[n_i + 1];
            forces[n_i + 2] = -force_0[n_i + 2];
        } else {
            forces[n_i] = 0.0;
            forces[n_i + 1] = 0.0;
            forces[n_i + 2] = 0.0;
        }
    }
}

/// Weight, mask, and square one atom's force residual; returns its
/// contribution to the cost.
///
/// Force weighting rescales the stored residual itself, so it applies even
/// when the atom is masked out of the sum.
pub fn force_residual(
    opts: &KernelOptions,
    conf_weight: f64,
    atom: &Atom,
    n_i: usize,
    forces: &mut [f64],
) -> f64 {
    if opts.force_weighting {
        let w = FORCE_EPS + atom.absforce;
        forces[n_i] /= w;
        forces[n_i + 1] /= w;
        forces[n_i + 2] /= w;
    }
    if opts.contrib_masking && !atom.contrib {
        return 0.0;
    }
    conf_weight
        * (dsquare(forces[n_i]) + dsquare(forces[n_i + 1]) + dsquare(forces[n_i + 2]))
}

/// Normalize configuration `h`'s energy to per-atom, subtract the reference,
/// and return the weighted squared residual.
pub fn energy_residual(
    layout: &ResidualLayout,
    conf: &Configuration,
    h: usize,
    eweight: f64,
    force_0: &[f64],
    forces: &mut [f64],
) -> f64 {
    let e = layout.energy(h);
    forces[e] /= conf.inconf as f64;
    forces[e] -= force_0[e];
    conf.weight * eweight * dsquare(forces[e])
}

/// Normalize configuration `h`'s six stress components to per-volume,
/// subtract the references, and return the weighted squared residual sum.
pub fn stress_residual(
    layout: &ResidualLayout,
    conf: &Configuration,
    h: usize,
    sweight: f64,
    force_0: &[f64],
    forces: &mut [f64],
) -> f64 {
    let st = layout.stress(h);
    let mut sum = 0.0;
    for i in 0..6 {
        forces[st + i] /= conf.volume;
        forces[st + i] -= force_0[st + i];
        sum += conf.weight * sweight * dsquare(forces[st + i]);
    }
    sum
}
