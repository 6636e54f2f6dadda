//! Tersoff-style pair accumulation (Family B)
//!
//! Only the pair portion of the Tersoff kernel: neighbor lists arrive as
//! ordered **half** lists (each unordered pair stored once, on the
//! lower-indexed atom), so the full φ goes into the cohesive energy and the
//! reaction force is applied explicitly. The virial scales the pair force
//! by `r` before the outer product over unit displacements, recovering the
//! full bond moment.
//!
//! With half lists every reaction lands on an atom at or before the owner's
//! position in the sweep, so an atom's force total is complete as soon as
//! its own neighbor loop finishes; the residual collection therefore runs
//! inline, inside the atom loop.

#![forbid(unsafe_code)]

use crate::kernel::KernelContext;
use crate::model::{add_force, sub_force, sub_virial};
use crate::residual;
use crate::table::TableView;

/// Accumulate configuration `h` and return its contribution to the local
/// cost.
pub(crate) fn accumulate_config(
    ctx: &KernelContext,
    view: &TableView<'_>,
    h: usize,
    forces: &mut [f64],
) -> f64 {
    let conf = &ctx.configs[h];
    let layout = &ctx.layout;
    let uf = conf.use_forces;
    let us = ctx.options.use_stress && conf.use_stresses;
    let e_idx = layout.energy(h);
    let st = layout.stress(h);
    let mut tmpsum = 0.0;

    residual::reset_config(layout, conf, h, &ctx.force_0, forces);

    for i in 0..conf.inconf {
        let ai = conf.cnfstart + i;
        let atom = &ctx.atoms[ai];
        let n_i = layout.force(ai);

        for neigh in &atom.neighbors {
            let self_pair = neigh.nr == ai;

            if neigh.r < view.end(neigh.cols[0]) {
                let (mut phi_val, mut phi_grad) = if uf {
                    view.eval_comb(neigh.slots[0])
                } else {
                    (view.eval(neigh.slots[0]), 0.0)
                };
                // Half the bond when an atom pairs with its own periodic image.
                if self_pair {
                    phi_val *= 0.5;
                    phi_grad *= 0.5;
                }
                // Cohesive energy: the full bond, not the half-bond split.
                forces[e_idx] += phi_val;

                if uf {
                    let tmp = neigh.dist_r.scale(phi_grad);
                    add_force(forces, n_i, tmp);
                    sub_force(forces, layout.force(neigh.nr), tmp);
                    if us {
                        sub_virial(&mut forces[st..st + 6], 1.0, neigh.dist_r, tmp.scale(neigh.r));
                    }
                }
            }
        }

        if uf {
            tmpsum +=
                residual::force_residual(&ctx.options, conf.weight, atom, n_i, forces);
        }
    }

    tmpsum += residual::energy_residual(layout, conf, h, ctx.options.eweight, &ctx.force_0, forces);
    if ctx.options.use_stress && conf.use_forces && conf.use_stresses {
        tmpsum +=
            residual::stress_residual(layout, conf, h, ctx.options.sweight, &ctx.force_0, forces);
    }
    tmpsum
}
