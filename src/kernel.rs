//! Service loop, kernel context & family dispatch
//!
//! [`calc_forces`] is the single entry point every rank calls. The root
//! drives: it broadcasts the parameter vector together with a control flag,
//! computes its own configuration slice, reduces the cost and gathers the
//! residual slices, then returns. Workers block on the broadcast, run the
//! identical compute path, feed the collectives, and loop — they only leave
//! the function on the shutdown flag, returning [`SHUTDOWN`].
//!
//! ## Flag ABI
//! - `0` — compute.
//! - `1` — shutdown; every rank returns [`SHUTDOWN`].
//! - `2` — synchronize the calc table from the root, then compute. Used
//!   after a structural change to the sampling points.
//! - anything else — compute, for compatibility with legacy drivers.
//!
//! ## State discipline
//! All per-call inputs are bundled in the immutable [`KernelContext`]; the
//! only mutation during a call goes into the caller-owned [`Workspace`]
//! (live calc table, second derivatives, tail/transfer/angle caches, call
//! counter) and the `forces` residual vector. Collaborator seams —
//! parameter sanity checks, analytic table refresh, the bounds penalty —
//! enter through [`KernelHooks`].

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::elstat::{self, CoulombKind, ElstatParams, Tail};
use crate::model::{AngleVal, Atom, Configuration, ResidualLayout, Transfer};
use crate::pairang::{self, ElstatCtx};
use crate::spmd::{Collective, Partition, SpmdError, ROOT};
use crate::table::{ParamLayout, PotTable, TableError, TableView};
use crate::tersoff;

/// Cost returned when the reduced residual sum is NaN.
pub const NAN_COST: f64 = 1e11;

/// Value every rank returns on the shutdown flag.
pub const SHUTDOWN: f64 = -1.0;

/// Which per-configuration pipeline the kernel assembles.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Family {
    /// Pair + angular three-body + damped monopole with core-shell
    /// suppression.
    PairAngular,
    /// Tersoff-style pair term on half neighbor lists.
    Tersoff,
}

/// Runtime options; the build-time switches of the original, folded into
/// one struct that does not change the hot-loop shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KernelOptions {
    /// Accumulate and fit stresses.
    pub use_stress: bool,
    /// Divide each force residual by `FORCE_EPS + |F_ref|`.
    pub force_weighting: bool,
    /// Honor the per-atom contrib mask in the residual sum.
    pub contrib_masking: bool,
    /// Coulomb shifting scheme (Family A).
    pub coulomb: CoulombKind,
    /// The broadcast carries optimization variables rather than table
    /// samples; enables the parameter-check and table-update hooks.
    pub analytic_params: bool,
    /// Global energy residual weight.
    pub eweight: f64,
    /// Global stress residual weight.
    pub sweight: f64,
}

impl Default for KernelOptions {
    fn default() -> Self {
        KernelOptions {
            use_stress: false,
            force_weighting: false,
            contrib_masking: false,
            coulomb: CoulombKind::Shift,
            analytic_params: false,
            eweight: 1.0,
            sweight: 1.0,
        }
    }
}

type CheckFn = dyn Fn(&mut [f64]) + Send + Sync;
type UpdateFn = dyn Fn(&[f64], &mut [f64]) + Send + Sync;
type PunishFn = dyn Fn(&[f64], &mut [f64]) -> f64 + Send + Sync;

/// Collaborator seams invoked by the service loop. All optional; a missing
/// hook is a no-op (and a missing `punish` contributes zero).
#[derive(Default)]
pub struct KernelHooks {
    /// Clamp/repair the optimization variables on the root before the
    /// broadcast (analytic parameter flow only).
    pub check_params: Option<Box<CheckFn>>,
    /// Refresh the calc table from the optimization variables; runs on
    /// every rank when the format keeps a separate calc table.
    pub update_table: Option<Box<UpdateFn>>,
    /// Bounds penalty added to the root's local cost before the reduce.
    pub punish: Option<Box<PunishFn>>,
}

/// Errors that can escape the service loop. During normal operation none
/// do; these indicate a broken rank channel or a violated table invariant.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Spmd(#[from] SpmdError),
    #[error("pair/angular family requires electrostatic parameters")]
    MissingElstat,
}

/// Immutable per-call bundle: everything the kernel reads.
pub struct KernelContext {
    pub family: Family,
    pub options: KernelOptions,
    pub table: PotTable,
    pub params: ParamLayout,
    /// Electrostatic configuration; required for [`Family::PairAngular`].
    pub elstat: Option<ElstatParams>,
    pub atoms: Vec<Atom>,
    pub configs: Vec<Configuration>,
    /// Reference data, laid out exactly like the residual vector.
    pub force_0: Vec<f64>,
    pub layout: ResidualLayout,
    /// Number of unordered species pairs (φ and f column count each).
    pub paircol: usize,
    pub ntypes: usize,
    pub hooks: KernelHooks,
    /// Flat cache offsets: position of each atom's first neighbor/angle in
    /// the workspace arrays.
    pub(crate) neigh_offset: Vec<usize>,
    pub(crate) angle_offset: Vec<usize>,
}

impl KernelContext {
    /// Bundle the parts and precompute the flat cache offsets. Prefer the
    /// `api::KernelBuilder`, which validates invariants before assembling.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        family: Family,
        options: KernelOptions,
        table: PotTable,
        params: ParamLayout,
        elstat: Option<ElstatParams>,
        atoms: Vec<Atom>,
        configs: Vec<Configuration>,
        force_0: Vec<f64>,
        paircol: usize,
        hooks: KernelHooks,
    ) -> Self {
        let natoms: usize = configs.iter().map(|c| c.inconf).sum();
        let layout = ResidualLayout { natoms, nconf: configs.len() };
        let mut neigh_offset = Vec::with_capacity(atoms.len());
        let mut angle_offset = Vec::with_capacity(atoms.len());
        let (mut n, mut a) = (0usize, 0usize);
        for atom in &atoms {
            neigh_offset.push(n);
            angle_offset.push(a);
            n += atom.neighbors.len();
            a += atom.angles.len();
        }
        let ntypes = params.ntypes;
        KernelContext {
            family,
            options,
            table,
            params,
            elstat,
            atoms,
            configs,
            force_0,
            layout,
            paircol,
            ntypes,
            hooks,
            neigh_offset,
            angle_offset,
        }
    }

    /// Total neighbor records across all atoms.
    pub(crate) fn total_neighbors(&self) -> usize {
        self.atoms.iter().map(|a| a.neighbors.len()).sum()
    }

    /// Total angle records across all atoms.
    pub(crate) fn total_angles(&self) -> usize {
        self.atoms.iter().map(|a| a.angles.len()).sum()
    }
}

/// Per-rank mutable state, reset or overwritten every call.
pub struct Workspace {
    /// Live calc-table samples (seeded from the context's table).
    pub calc: Vec<f64>,
    /// Second derivatives, parallel to the sample buffer.
    pub d2: Vec<f64>,
    pub(crate) tails: Vec<Tail>,
    pub(crate) transfer: Vec<Transfer>,
    pub(crate) angle_vals: Vec<AngleVal>,
    /// Completed force evaluations (root only).
    pub fcalls: u64,
}

impl Workspace {
    pub fn new(ctx: &KernelContext) -> Self {
        Workspace {
            calc: ctx.table.samples.clone(),
            d2: vec![0.0; ctx.table.len],
            tails: vec![Tail::default(); ctx.total_neighbors()],
            transfer: vec![Transfer::default(); ctx.total_neighbors()],
            angle_vals: vec![AngleVal::default(); ctx.total_angles()],
            fcalls: 0,
        }
    }
}

/// The blocking SPMD service loop; see the module docs for the protocol.
///
/// On the root this returns the global cost of one evaluation (or
/// [`NAN_COST`] if the sum went NaN). Workers stay inside until the
/// shutdown flag arrives and then return [`SHUTDOWN`].
pub fn calc_forces<C: Collective>(
    ctx: &KernelContext,
    ws: &mut Workspace,
    comm: &mut C,
    xi_opt: &mut [f64],
    forces: &mut [f64],
    mut flag: i32,
) -> Result<f64, KernelError> {
    loop {
        if comm.rank() == ROOT && ctx.options.analytic_params {
            if let Some(check) = &ctx.hooks.check_params {
                check(xi_opt);
            }
        }

        comm.broadcast(xi_opt, &mut flag)?;
        if flag == 1 {
            return Ok(SHUTDOWN);
        }
        if flag == 2 && !ctx.options.analytic_params {
            // The sampling points changed; resync the live table.
            comm.broadcast_table(&mut ws.calc)?;
        }
        if ctx.table.format.needs_update() {
            if let Some(update) = &ctx.hooks.update_table {
                update(xi_opt, &mut ws.calc);
            }
        }

        let mut tmpsum = compute_local(ctx, ws, comm.partition(), xi_opt, forces)?;

        if comm.rank() == ROOT {
            if let Some(punish) = &ctx.hooks.punish {
                tmpsum += punish(xi_opt, forces);
            }
        }

        let sum = comm.reduce_sum(tmpsum)?;
        comm.gather(&ctx.layout, forces)?;

        if comm.rank() == ROOT {
            ws.fcalls += 1;
            if sum.is_nan() {
                warn!(fcalls = ws.fcalls, "residual sum is NaN, returning the guard cost");
                return Ok(NAN_COST);
            }
            debug!(fcalls = ws.fcalls, cost = sum, "force evaluation finished");
            return Ok(sum);
        }
        // Workers loop back to the next broadcast.
    }
}

/// Spline preparation plus accumulation and finalization over this rank's
/// configuration slice. Returns the rank-local cost.
fn compute_local(
    ctx: &KernelContext,
    ws: &mut Workspace,
    part: Partition,
    xi_opt: &[f64],
    forces: &mut [f64],
) -> Result<f64, KernelError> {
    let Workspace { calc, d2, tails, transfer, angle_vals, .. } = ws;
    let xi: &[f64] = if ctx.table.format.uses_calc_buffer() { calc } else { xi_opt };
    let mut tmpsum = 0.0;

    match ctx.family {
        Family::Tersoff => {
            ctx.table.prepare(0..ctx.paircol, xi, d2)?;
            let view = TableView { cols: &ctx.table.cols, xi, d2 };
            for h in part.confs() {
                tmpsum += tersoff::accumulate_config(ctx, &view, h, forces);
            }
        }
        Family::PairAngular => {
            let params = ctx.elstat.as_ref().ok_or(KernelError::MissingElstat)?;
            let mut charge = vec![0.0; ctx.ntypes];
            let kappa = elstat::resolve_charges(xi_opt, &ctx.params, &params.ratio, &mut charge);
            let es = ElstatCtx { params, kind: ctx.options.coulomb, charge: &charge, kappa };

            // φ, f, and g columns all need fresh second derivatives.
            ctx.table.prepare(0..2 * ctx.paircol + ctx.ntypes, xi, d2)?;
            let view = TableView { cols: &ctx.table.cols, xi, d2 };

            if params.sw_kappa {
                pairang::refresh_tails(ctx, &es, tails, part.confs());
            }
            for h in part.confs() {
                pairang::accumulate_config(ctx, &view, &es, tails, transfer, angle_vals, h, forces);
                tmpsum += pairang::finalize_config(ctx, &es, h, forces);
            }
        }
    }
    Ok(tmpsum)
}
