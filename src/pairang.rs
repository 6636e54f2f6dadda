//! Pair + angular + monopole accumulation (Family A)
//!
//! Per configuration, three sweeps over the owning atoms:
//!
//! 1. **Pair & monopole.** Ordered neighbors contribute the half-bond pair
//!    energy `0.5·φ` and the force `dist_r·φ'` on the central atom (the
//!    reaction is implicit in the ordered iteration). The damped Coulomb
//!    tail is cached per neighbor and the monopole term applies the
//!    core-shell cancellation and self-image halving rules before adding an
//!    explicit action/reaction force pair. Transfer values `(f, f')` are
//!    cached for the angular sweeps.
//! 2. **Angular energy, then forces.** Every unordered in-range neighbor
//!    pair `(j < k)` evaluates the angular column once, accumulates
//!    `f_j·f_k·g`, and — when forces are in use — decomposes the
//!    three-body gradient into radial and tangential parts applied to all
//!    three atoms. The angle-record cursor advances in lockstep with the
//!    gated double loop, mirroring how the records were laid out.
//! 3. **Self-energy & residuals.** Charged atoms subtract their monopole
//!    self-energy before the shared finalizer normalizes and squares.
//!
//! Newton's third law holds by construction: pair reactions cancel across
//! the ordered iteration, monopole and angular reactions are written
//! explicitly, so `Σ F = 0` for an isolated configuration up to round-off.

#![forbid(unsafe_code)]

use crate::elstat::{self, CoulombKind, ElstatParams, Tail};
use crate::kernel::KernelContext;
use crate::model::{add_force, sub_force, sub_virial, AngleVal, Transfer};
use crate::residual;
use crate::table::TableView;

/// Resolved electrostatic state for one force call.
pub(crate) struct ElstatCtx<'a> {
    pub params: &'a ElstatParams,
    pub kind: CoulombKind,
    /// Per-species charges, neutrality already enforced.
    pub charge: &'a [f64],
    pub kappa: f64,
}

/// Refresh the tail caches of every neighbor owned by the configurations in
/// `confs`; used when κ is an optimization variable and the inline
/// per-neighbor update is skipped.
pub(crate) fn refresh_tails(
    ctx: &KernelContext,
    es: &ElstatCtx<'_>,
    tails: &mut [Tail],
    confs: std::ops::Range<usize>,
) {
    for conf in &ctx.configs[confs] {
        for i in 0..conf.inconf {
            let ai = conf.cnfstart + i;
            let off = ctx.neigh_offset[ai];
            for (j, neigh) in ctx.atoms[ai].neighbors.iter().enumerate() {
                tails[off + j] =
                    elstat::tail(es.kind, neigh.r, es.params.cutoff, es.kappa, es.params.epsilon);
            }
        }
    }
}

/// Accumulate configuration `h`'s pair, monopole, and angular contributions
/// into `forces`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn accumulate_config(
    ctx: &KernelContext,
    view: &TableView<'_>,
    es: &ElstatCtx<'_>,
    tails: &mut [Tail],
    transfer: &mut [Transfer],
    angle_vals: &mut [AngleVal],
    h: usize,
    forces: &mut [f64],
) {
    let conf = &ctx.configs[h];
    let layout = &ctx.layout;
    let uf = conf.use_forces;
    let us = ctx.options.use_stress && conf.use_stresses;
    let e_idx = layout.energy(h);
    let st = layout.stress(h);

    residual::reset_config(layout, conf, h, &ctx.force_0, forces);

    for i in 0..conf.inconf {
        let ai = conf.cnfstart + i;
        let atom = &ctx.atoms[ai];
        let type1 = atom.ty;
        let n_i = layout.force(ai);
        let noff = ctx.neigh_offset[ai];

        for (j, neigh) in atom.neighbors.iter().enumerate() {
            let type2 = neigh.ty;

            // Pair potential, gated strictly by the φ-column cutoff.
            if neigh.r < view.end(neigh.cols[0]) {
                if uf {
                    let (phi_val, phi_grad) = view.eval_comb(neigh.slots[0]);
                    forces[e_idx] += 0.5 * phi_val;
                    let tmp = neigh.dist_r.scale(phi_grad);
                    add_force(forces, n_i, tmp);
                    if us {
                        sub_virial(&mut forces[st..st + 6], 0.5, neigh.dist, tmp);
                    }
                } else {
                    forces[e_idx] += 0.5 * view.eval(neigh.slots[0]);
                }
            }

            // Tail cache; with a fixed κ this is refreshed inline every call.
            if !es.params.sw_kappa {
                tails[noff + j] =
                    elstat::tail(es.kind, neigh.r, es.params.cutoff, es.kappa, es.params.epsilon);
            }

            let self_pair = neigh.nr == ai;

            if neigh.r < es.params.cutoff
                && (es.charge[type1] != 0.0 || es.charge[type2] != 0.0)
            {
                let t = tails[noff + j];
                let grad_i = es.charge[type2] * t.grad;
                let mut fnval = es.charge[type1] * es.charge[type2] * t.fnval;
                let mut grad = es.charge[type1] * grad_i;

                // Core-shell pair: cancel the bare 1/r inside the φ cutoff,
                // leaving only the damping residue; no force from it.
                if view.weight(neigh.cols[0]) == 0.0 && neigh.r <= view.end(neigh.cols[0]) {
                    fnval -= es.params.epsilon
                        * es.charge[type1]
                        * es.charge[type2]
                        * neigh.inv_r;
                    grad = 0.0;
                }

                // A periodic self-image is visited once but counts half.
                if self_pair {
                    fnval *= 0.5;
                    grad *= 0.5;
                }

                forces[e_idx] += 0.5 * fnval;

                if uf {
                    let tmp = neigh.dist.scale(0.5 * grad);
                    add_force(forces, n_i, tmp);
                    sub_force(forces, layout.force(neigh.nr), tmp);
                    if us {
                        sub_virial(&mut forces[st..st + 6], 1.0, neigh.dist, tmp);
                    }
                }
            }

            // Transfer cache for the angular sweeps; zero outside the
            // f-column cutoff so out-of-range neighbors drop out.
            transfer[noff + j] = if neigh.r < view.end(neigh.cols[1]) {
                let (f, df) = view.eval_comb(neigh.slots[1]);
                Transfer { f, df }
            } else {
                Transfer::default()
            };
        }

        // Angular energy over unordered in-range pairs (j < k).
        let aoff = ctx.angle_offset[ai];
        let nn = atom.neighbors.len();
        let mut la = 0usize;
        let mut angener_sum = 0.0;
        for j in 0..nn.saturating_sub(1) {
            let nj = &atom.neighbors[j];
            if nj.r < view.end(nj.cols[1]) {
                for (k, nk) in atom.neighbors.iter().enumerate().skip(j + 1) {
                    if nk.r < view.end(nk.cols[1]) {
                        let angle = &atom.angles[la];
                        let (g, dg) = view.eval_comb(angle.slot);
                        angle_vals[aoff + la] = AngleVal { g, dg };
                        angener_sum += transfer[noff + j].f * transfer[noff + k].f * g;
                        la += 1;
                    }
                }
            }
        }
        forces[e_idx] += angener_sum;

        // Angular forces: radial + tangential split per triple.
        if uf {
            let mut la = 0usize;
            for j in 0..nn.saturating_sub(1) {
                let nj = &atom.neighbors[j];
                if nj.r < view.end(nj.cols[1]) {
                    let n_j = layout.force(nj.nr);
                    for (k, nk) in atom.neighbors.iter().enumerate().skip(j + 1) {
                        if nk.r < view.end(nk.cols[1]) {
                            let n_k = layout.force(nk.nr);
                            let angle = &atom.angles[la];
                            let av = angle_vals[aoff + la];
                            let tj = transfer[noff + j];
                            let tk = transfer[noff + k];

                            let dv3j = av.g * tj.df * tk.f;
                            let dv3k = av.g * tj.f * tk.df;
                            let v3 = tj.f * tk.f * av.dg;

                            let vlj = v3 * nj.inv_r;
                            let vlk = v3 * nk.inv_r;
                            let vv3j = dv3j - vlj * angle.cos_theta;
                            let vv3k = dv3k - vlk * angle.cos_theta;

                            let dfj = nj.dist_r.scale(vv3j) + nk.dist_r.scale(vlj);
                            let dfk = nk.dist_r.scale(vv3k) + nj.dist_r.scale(vlk);

                            add_force(forces, n_i, dfj + dfk);
                            sub_force(forces, n_j, dfj);
                            sub_force(forces, n_k, dfk);

                            if us {
                                let s = &mut forces[st..st + 6];
                                sub_virial(s, 1.0, nj.dist, dfj);
                                sub_virial(s, 1.0, nk.dist, dfk);
                            }
                            la += 1;
                        }
                    }
                }
            }
        }
    }
}

/// Third sweep: monopole self-energies, then the shared residual collection.
/// Returns configuration `h`'s contribution to the local cost.
pub(crate) fn finalize_config(
    ctx: &KernelContext,
    es: &ElstatCtx<'_>,
    h: usize,
    forces: &mut [f64],
) -> f64 {
    let conf = &ctx.configs[h];
    let layout = &ctx.layout;
    let e_idx = layout.energy(h);
    let mut tmpsum = 0.0;

    for i in 0..conf.inconf {
        let ai = conf.cnfstart + i;
        let atom = &ctx.atoms[ai];
        let q = es.charge[atom.ty];
        if q != 0.0 {
            forces[e_idx] -=
                elstat::self_energy(q, es.kappa, es.params.epsilon, es.kind, es.params.cutoff);
        }
        tmpsum += residual::force_residual(
            &ctx.options,
            conf.weight,
            atom,
            layout.force(ai),
            forces,
        );
    }

    tmpsum += residual::energy_residual(layout, conf, h, ctx.options.eweight, &ctx.force_0, forces);
    if ctx.options.use_stress {
        tmpsum +=
            residual::stress_residual(layout, conf, h, ctx.options.sweight, &ctx.force_0, forces);
    }
    tmpsum
}
