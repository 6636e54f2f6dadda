//! Happy-path crate API
//!
//! This module wraps the kernel core with a small, ergonomic surface:
//! - [`KernelBuilder`] hides the context wiring, applies defaults, and
//!   validates every cross-record invariant **once, up front** — after
//!   `build()` succeeds the hot loops run unchecked.
//! - [`Kernel`] is the one-process driver: `evaluate()` runs a full force
//!   call on a [`SingleRank`] grid.
//! - [`Kernel::into_grid`] spawns worker threads that park inside the
//!   service loop; the returned [`GridHandle`] is the root-side client
//!   (`evaluate` / `sync` / `shutdown`).
//!
//! Everything delegates to `kernel::calc_forces`; no protocol lives here.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::debug;

use crate::elstat::ElstatParams;
use crate::kernel::{
    calc_forces, Family, KernelContext, KernelError, KernelHooks, KernelOptions, Workspace,
    SHUTDOWN,
};
use crate::model::{Atom, Configuration};
use crate::spmd::{Partition, SingleRank, SpmdError, ThreadComm};
use crate::table::{ParamLayout, PotTable, TableError};

/// Errors reported by [`KernelBuilder::build`].
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("no potential table supplied")]
    MissingTable,
    #[error("no parameter layout supplied")]
    MissingParams,
    #[error("pair/angular family requires electrostatic parameters")]
    MissingElstat,
    #[error("ratio length {got} does not match ntypes {want}")]
    RatioLen { got: usize, want: usize },
    #[error("reference vector length {got} does not match residual layout {want}")]
    ReferenceLen { got: usize, want: usize },
    #[error("atom count {got} does not match configuration total {want}")]
    AtomCount { got: usize, want: usize },
    #[error("configuration {conf} does not start where the previous one ended")]
    NonContiguous { conf: usize },
    #[error("atom {atom}, neighbor {neigh}: partner index {nr} out of range")]
    NeighborIndex { atom: usize, neigh: usize, nr: usize },
    #[error("atom {atom}, neighbor {neigh}: spline slot outside its column")]
    BadSlot { atom: usize, neigh: usize },
    #[error("atom {atom}, angle {angle}: cos(theta) = {cos} outside [-1, 1]")]
    BadCos { atom: usize, angle: usize, cos: f64 },
    #[error("atom {atom}: {got} angle records, expected {want} in-range pairs")]
    AngleCount { atom: usize, got: usize, want: usize },
    #[error("parameter vector length {got} too short (need at least {want})")]
    ShortParamVector { got: usize, want: usize },
}

/// Assembles and validates a [`KernelContext`].
pub struct KernelBuilder {
    family: Family,
    options: KernelOptions,
    table: Option<PotTable>,
    params: Option<ParamLayout>,
    elstat: Option<ElstatParams>,
    atoms: Vec<Atom>,
    configs: Vec<Configuration>,
    force_0: Vec<f64>,
    paircol: usize,
    hooks: KernelHooks,
}

impl KernelBuilder {
    pub fn new(family: Family) -> Self {
        KernelBuilder {
            family,
            options: KernelOptions::default(),
            table: None,
            params: None,
            elstat: None,
            atoms: Vec::new(),
            configs: Vec::new(),
            force_0: Vec::new(),
            paircol: 1,
            hooks: KernelHooks::default(),
        }
    }

    pub fn options(mut self, options: KernelOptions) -> Self {
        self.options = options;
        self
    }

    pub fn table(mut self, table: PotTable) -> Self {
        self.table = Some(table);
        self
    }

    pub fn params(mut self, params: ParamLayout) -> Self {
        self.params = Some(params);
        self
    }

    pub fn elstat(mut self, elstat: ElstatParams) -> Self {
        self.elstat = Some(elstat);
        self
    }

    /// Number of unordered species pairs (the φ/f column count each).
    pub fn paircol(mut self, paircol: usize) -> Self {
        self.paircol = paircol;
        self
    }

    /// Reference set: atoms with their neighbor/angle records, the
    /// configuration ranges, and the reference data in residual layout.
    pub fn reference(
        mut self,
        atoms: Vec<Atom>,
        configs: Vec<Configuration>,
        force_0: Vec<f64>,
    ) -> Self {
        self.atoms = atoms;
        self.configs = configs;
        self.force_0 = force_0;
        self
    }

    pub fn hooks(mut self, hooks: KernelHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Validate every invariant the hot loops rely on and assemble the
    /// single-rank kernel.
    pub fn build(self) -> Result<Kernel, BuildError> {
        let table = self.table.ok_or(BuildError::MissingTable)?;
        let params = self.params.ok_or(BuildError::MissingParams)?;
        table.validate()?;

        let natoms: usize = self.configs.iter().map(|c| c.inconf).sum();
        if self.atoms.len() != natoms {
            return Err(BuildError::AtomCount { got: self.atoms.len(), want: natoms });
        }
        let mut expect_start = 0usize;
        for (h, conf) in self.configs.iter().enumerate() {
            if conf.cnfstart != expect_start {
                return Err(BuildError::NonContiguous { conf: h });
            }
            expect_start += conf.inconf;
        }
        let want_len = 3 * natoms + 7 * self.configs.len();
        if self.force_0.len() != want_len {
            return Err(BuildError::ReferenceLen { got: self.force_0.len(), want: want_len });
        }

        if self.family == Family::PairAngular {
            let es = self.elstat.as_ref().ok_or(BuildError::MissingElstat)?;
            if es.ratio.len() != params.ntypes {
                return Err(BuildError::RatioLen { got: es.ratio.len(), want: params.ntypes });
            }
            let need = params.kappa_index() + 1;
            if params.ndimtot < need {
                return Err(BuildError::ShortParamVector { got: params.ndimtot, want: need });
            }
        }
        if !table.format.uses_calc_buffer() && params.ndimtot < table.len {
            return Err(BuildError::ShortParamVector { got: params.ndimtot, want: table.len });
        }

        for (ai, atom) in self.atoms.iter().enumerate() {
            for (ni, neigh) in atom.neighbors.iter().enumerate() {
                if neigh.nr >= natoms {
                    return Err(BuildError::NeighborIndex { atom: ai, neigh: ni, nr: neigh.nr });
                }
                // Precomputed slots must bracket a stored interval whenever
                // the neighbor is inside the column cutoff.
                for c in 0..2 {
                    let col = &table.cols[neigh.cols[c]];
                    if neigh.r < col.end {
                        let s = &neigh.slots[c];
                        if s.slot < col.first
                            || s.slot >= col.last
                            || !(0.0..1.0).contains(&s.shift)
                        {
                            return Err(BuildError::BadSlot { atom: ai, neigh: ni });
                        }
                    }
                }
            }
            for (gi, angle) in atom.angles.iter().enumerate() {
                if !(-1.0..=1.0).contains(&angle.cos_theta) {
                    return Err(BuildError::BadCos { atom: ai, angle: gi, cos: angle.cos_theta });
                }
            }
            if self.family == Family::PairAngular {
                // The angle cursor walks the gated (j < k) double loop; the
                // record count must line up exactly.
                let nn = atom.neighbors.len();
                let mut want = 0usize;
                for j in 0..nn.saturating_sub(1) {
                    let nj = &atom.neighbors[j];
                    if nj.r < table.cols[nj.cols[1]].end {
                        for nk in &atom.neighbors[j + 1..] {
                            if nk.r < table.cols[nk.cols[1]].end {
                                want += 1;
                            }
                        }
                    }
                }
                if atom.angles.len() != want {
                    return Err(BuildError::AngleCount { atom: ai, got: atom.angles.len(), want });
                }
            }
        }

        let ctx = KernelContext::assemble(
            self.family,
            self.options,
            table,
            params,
            self.elstat,
            self.atoms,
            self.configs,
            self.force_0,
            self.paircol,
            self.hooks,
        );
        let ws = Workspace::new(&ctx);
        let forces = vec![0.0; ctx.layout.len()];
        debug!(
            natoms = ctx.layout.natoms,
            nconf = ctx.layout.nconf,
            family = ?ctx.family,
            "kernel assembled"
        );
        let comm = SingleRank::new(ctx.layout.nconf, ctx.layout.natoms);
        Ok(Kernel { ctx: Arc::new(ctx), ws, comm, forces })
    }
}

/// One-process kernel driver.
pub struct Kernel {
    ctx: Arc<KernelContext>,
    ws: Workspace,
    comm: SingleRank,
    forces: Vec<f64>,
}

impl Kernel {
    /// Run one force evaluation (flag 0) and return the cost.
    pub fn evaluate(&mut self, xi_opt: &mut [f64]) -> Result<f64, KernelError> {
        self.evaluate_flag(xi_opt, 0)
    }

    /// Run one evaluation with an explicit control flag.
    pub fn evaluate_flag(&mut self, xi_opt: &mut [f64], flag: i32) -> Result<f64, KernelError> {
        calc_forces(&self.ctx, &mut self.ws, &mut self.comm, xi_opt, &mut self.forces, flag)
    }

    /// The residual vector of the last evaluation.
    pub fn residuals(&self) -> &[f64] {
        &self.forces
    }

    /// Completed force evaluations.
    pub fn fcalls(&self) -> u64 {
        self.ws.fcalls
    }

    pub fn context(&self) -> &KernelContext {
        &self.ctx
    }

    /// Split the configurations over `size` ranks and park `size − 1`
    /// workers in the service loop on their own threads.
    pub fn into_grid(self, size: usize) -> GridHandle {
        let parts = Partition::split(&self.ctx.configs, size);
        let mut endpoints = ThreadComm::grid(parts);
        let mut joins = Vec::with_capacity(size - 1);
        for mut comm in endpoints.drain(1..) {
            let ctx = Arc::clone(&self.ctx);
            joins.push(std::thread::spawn(move || {
                let mut ws = Workspace::new(&ctx);
                let mut xi = vec![0.0; ctx.params.ndimtot];
                let mut forces = vec![0.0; ctx.layout.len()];
                calc_forces(&ctx, &mut ws, &mut comm, &mut xi, &mut forces, 0)
            }));
        }
        let root = endpoints.pop().expect("root endpoint");
        GridHandle { ctx: self.ctx, ws: self.ws, comm: root, forces: self.forces, joins }
    }
}

/// Root-side client of a threaded SPMD grid.
pub struct GridHandle {
    ctx: Arc<KernelContext>,
    ws: Workspace,
    comm: ThreadComm,
    forces: Vec<f64>,
    joins: Vec<JoinHandle<Result<f64, KernelError>>>,
}

impl GridHandle {
    /// One distributed force evaluation.
    pub fn evaluate(&mut self, xi_opt: &mut [f64]) -> Result<f64, KernelError> {
        self.call(xi_opt, 0)
    }

    /// Resynchronize the calc table, then evaluate (flag 2).
    pub fn sync(&mut self, xi_opt: &mut [f64]) -> Result<f64, KernelError> {
        self.call(xi_opt, 2)
    }

    fn call(&mut self, xi_opt: &mut [f64], flag: i32) -> Result<f64, KernelError> {
        if xi_opt.len() != self.ctx.params.ndimtot {
            return Err(KernelError::Spmd(SpmdError::Shape {
                got: xi_opt.len(),
                want: self.ctx.params.ndimtot,
            }));
        }
        calc_forces(&self.ctx, &mut self.ws, &mut self.comm, xi_opt, &mut self.forces, flag)
    }

    /// Residual vector after the last evaluation (gathered from all ranks).
    pub fn residuals(&self) -> &[f64] {
        &self.forces
    }

    pub fn fcalls(&self) -> u64 {
        self.ws.fcalls
    }

    /// Broadcast the shutdown flag and join every worker. Each worker's
    /// exit value is checked against the protocol sentinel.
    pub fn shutdown(mut self) -> Result<(), KernelError> {
        let mut xi = vec![0.0; self.ctx.params.ndimtot];
        let mut forces = vec![0.0; self.ctx.layout.len()];
        let out = calc_forces(&self.ctx, &mut self.ws, &mut self.comm, &mut xi, &mut forces, 1)?;
        debug_assert_eq!(out, SHUTDOWN);
        for join in self.joins.drain(..) {
            match join.join() {
                Ok(res) => {
                    if res? != SHUTDOWN {
                        return Err(KernelError::Spmd(SpmdError::Disconnected));
                    }
                }
                Err(_) => return Err(KernelError::Spmd(SpmdError::Disconnected)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elstat::{self, CoulombKind, DP_EPS};
    use crate::kernel::NAN_COST;
    use crate::model::{Angle, Neighbor, SplineSlot, Vec3};
    use crate::spline::NATURAL_GRAD;
    use crate::table::{PotColumn, TableFormat};
    use approx::assert_relative_eq;

    struct ColSpec {
        begin: f64,
        step: f64,
        values: Vec<f64>,
        left_bc: f64,
        right_bc: f64,
        weight: f64,
    }

    impl ColSpec {
        fn from_fn(begin: f64, step: f64, n: usize, f: impl Fn(f64) -> f64) -> Self {
            ColSpec {
                begin,
                step,
                values: (0..n).map(|i| f(begin + step * i as f64)).collect(),
                left_bc: NATURAL_GRAD,
                right_bc: 0.0,
                weight: 1.0,
            }
        }
        fn zeros(begin: f64, step: f64, n: usize) -> Self {
            Self::from_fn(begin, step, n, |_| 0.0)
        }
        fn clamped(mut self, left: f64, right: f64) -> Self {
            self.left_bc = left;
            self.right_bc = right;
            self
        }
        fn weight(mut self, w: f64) -> Self {
            self.weight = w;
            self
        }
    }

    fn assemble_table(specs: Vec<ColSpec>, format: TableFormat) -> PotTable {
        let mut cols = Vec::new();
        let mut samples = Vec::new();
        for s in specs {
            let first = samples.len();
            let n = s.values.len();
            cols.push(PotColumn {
                first,
                last: first + n - 1,
                begin: s.begin,
                end: s.begin + s.step * (n - 1) as f64,
                step: s.step,
                left_bc: s.left_bc,
                right_bc: s.right_bc,
                weight: s.weight,
            });
            samples.extend(s.values);
        }
        let len = samples.len();
        PotTable { format, len, cols, xcoord: Vec::new(), samples }
    }

    fn neighbor(table: &PotTable, nr: usize, ty: usize, delta: Vec3, cols: [usize; 2]) -> Neighbor {
        let r = delta.norm();
        let slot_for = |c: usize| {
            table.cols[c].locate(r).unwrap_or(SplineSlot {
                slot: table.cols[c].first,
                shift: 0.0,
                step: table.cols[c].step,
            })
        };
        Neighbor {
            nr,
            ty,
            r,
            inv_r: 1.0 / r,
            dist: delta,
            dist_r: delta.scale(1.0 / r),
            cols,
            slots: [slot_for(cols[0]), slot_for(cols[1])],
        }
    }

    fn angle(table: &PotTable, gcol: usize, cos: f64) -> Angle {
        let col = &table.cols[gcol];
        let raw = (cos - col.begin) / col.step;
        let slot = raw as usize;
        Angle {
            cos_theta: cos,
            slot: SplineSlot { slot: col.first + slot, shift: raw - slot as f64, step: col.step },
        }
    }

    fn atom(ty: usize, neighbors: Vec<Neighbor>, angles: Vec<Angle>) -> Atom {
        Atom { ty, absforce: 0.0, contrib: true, neighbors, angles }
    }

    fn conf(cnfstart: usize, inconf: usize) -> Configuration {
        Configuration {
            cnfstart,
            inconf,
            volume: 1.0,
            weight: 1.0,
            use_forces: true,
            use_stresses: false,
        }
    }

    /// Two argon-like atoms 3 Å apart; φ is the exact linear ramp with
    /// φ(3) = −0.01 and φ' = 0.02, f and g are identically zero.
    fn argon_kernel() -> (Kernel, Vec<f64>) {
        let table = assemble_table(
            vec![
                ColSpec::from_fn(2.0, 0.25, 9, |x| 0.02 * (x - 3.0) - 0.01).clamped(0.02, 0.02),
                ColSpec::zeros(2.0, 0.25, 9),
                ColSpec::zeros(-1.0, 0.25, 9),
            ],
            TableFormat::EqDist,
        );
        let len = table.len;
        let params = ParamLayout { number: 0, total_ne_par: len, ntypes: 1, ndimtot: len + 1 };
        let atoms = vec![
            atom(0, vec![neighbor(&table, 1, 0, Vec3::new(3.0, 0.0, 0.0), [0, 1])], vec![]),
            atom(0, vec![neighbor(&table, 0, 0, Vec3::new(-3.0, 0.0, 0.0), [0, 1])], vec![]),
        ];
        let configs = vec![conf(0, 2)];
        let force_0 = vec![0.0; 3 * 2 + 7];
        let mut xi = table.samples.clone();
        xi.push(0.0); // kappa slot (switched off)
        let kernel = KernelBuilder::new(Family::PairAngular)
            .table(table)
            .params(params)
            .paircol(1)
            .elstat(ElstatParams { cutoff: 8.0, epsilon: DP_EPS, ratio: vec![1.0], sw_kappa: false })
            .reference(atoms, configs, force_0)
            .build()
            .unwrap();
        (kernel, xi)
    }

    #[test]
    fn argon_pair_energy_and_forces() {
        let (mut kernel, mut xi) = argon_kernel();
        let cost = kernel.evaluate(&mut xi).unwrap();
        let r = kernel.residuals();
        // Per-atom energy: two half-bonds of −0.01, over two atoms.
        assert_relative_eq!(r[6], -0.005, epsilon = 1e-14);
        // Forces are antisymmetric along x with magnitude φ'.
        assert_relative_eq!(r[0], 0.02, epsilon = 1e-14);
        assert_relative_eq!(r[3], -0.02, epsilon = 1e-14);
        assert_eq!(r[1], 0.0);
        assert_eq!(r[4], 0.0);
        assert_relative_eq!(cost, 2.0 * 4e-4 + 2.5e-5, epsilon = 1e-15);
        assert_eq!(kernel.fcalls(), 1);
    }

    #[test]
    fn repeat_evaluation_is_bit_exact() {
        let (mut kernel, mut xi) = argon_kernel();
        let a = kernel.evaluate(&mut xi).unwrap();
        let b = kernel.evaluate(&mut xi).unwrap();
        assert_eq!(a.to_bits(), b.to_bits());
        assert_eq!(kernel.fcalls(), 2);
    }

    #[test]
    fn sync_flag_is_equivalent_when_nothing_changed() {
        let (mut kernel, mut xi) = argon_kernel();
        let a = kernel.evaluate(&mut xi).unwrap();
        let b = kernel.evaluate_flag(&mut xi, 2).unwrap();
        assert_eq!(a.to_bits(), b.to_bits());
    }

    #[test]
    fn nan_parameters_hit_the_guard_but_count_the_call() {
        let (mut kernel, mut xi) = argon_kernel();
        xi[4] = f64::NAN;
        let cost = kernel.evaluate(&mut xi).unwrap();
        assert_eq!(cost, NAN_COST);
        assert_eq!(kernel.fcalls(), 1);
    }

    #[test]
    fn punish_hook_inflates_the_root_cost() {
        let (kernel, mut xi) = argon_kernel();
        let ctx = kernel.context();
        // Rebuild with a constant bounds penalty.
        let mut hooks = KernelHooks::default();
        hooks.punish = Some(Box::new(|_xi: &[f64], _res: &mut [f64]| 5.0));
        let mut kernel2 = KernelBuilder::new(Family::PairAngular)
            .table(ctx.table.clone())
            .params(ctx.params.clone())
            .paircol(1)
            .elstat(ctx.elstat.clone().unwrap())
            .reference(ctx.atoms.clone(), ctx.configs.clone(), ctx.force_0.clone())
            .hooks(hooks)
            .build()
            .unwrap();
        let (mut kernel, mut xi2) = argon_kernel();
        let base = kernel.evaluate(&mut xi2).unwrap();
        let inflated = kernel2.evaluate(&mut xi).unwrap();
        assert_relative_eq!(inflated, base + 5.0, epsilon = 1e-12);
    }

    /// Equilateral triangle of +1 charges, κ = 0.3, cutoff 8 Å; every pair
    /// at r = 2. φ and f contribute nothing.
    fn triangle_kernel() -> (Kernel, Vec<f64>) {
        let phi = || ColSpec::zeros(0.5, 0.5, 8);
        let f_short = || ColSpec::zeros(0.5, 0.5, 3); // end 1.5 < r: no angles
        let g = || ColSpec::zeros(-1.0, 0.25, 9);
        let table = assemble_table(
            vec![phi(), phi(), phi(), f_short(), f_short(), f_short(), g(), g()],
            TableFormat::EqDist,
        );
        let len = table.len;
        let params = ParamLayout { number: 0, total_ne_par: len, ntypes: 2, ndimtot: len + 2 };
        let s3 = 3f64.sqrt();
        let pos = [Vec3::new(0.0, 0.0, 0.0), Vec3::new(2.0, 0.0, 0.0), Vec3::new(1.0, s3, 0.0)];
        let mut atoms = Vec::new();
        for i in 0..3 {
            let mut neighbors = Vec::new();
            for j in 0..3 {
                if i != j {
                    neighbors.push(neighbor(&table, j, 0, pos[j] - pos[i], [0, 3]));
                }
            }
            atoms.push(atom(0, neighbors, vec![]));
        }
        let configs = vec![conf(0, 3)];
        let force_0 = vec![0.0; 3 * 3 + 7];
        let mut xi = table.samples.clone();
        xi.push(1.0); // q0
        xi.push(0.3); // kappa
        let kernel = KernelBuilder::new(Family::PairAngular)
            .table(table)
            .params(params)
            .paircol(3)
            .elstat(ElstatParams {
                cutoff: 8.0,
                epsilon: DP_EPS,
                ratio: vec![1.0, 1.0],
                sw_kappa: false,
            })
            .reference(atoms, configs, force_0)
            .build()
            .unwrap();
        (kernel, xi)
    }

    #[test]
    fn charged_triangle_energy_and_force_balance() {
        let (mut kernel, mut xi) = triangle_kernel();
        kernel.evaluate(&mut xi).unwrap();
        let r = kernel.residuals();
        // Six ordered bonds at half weight: 3·q²·V_tail(2), minus three
        // self-energies, normalized per atom.
        let v = elstat::elstat_shift(2.0, 8.0, 0.3, DP_EPS).fnval;
        let se = elstat::self_energy(1.0, 0.3, DP_EPS, CoulombKind::Shift, 8.0);
        assert_relative_eq!(r[9], v - se, max_relative = 1e-12);
        // Newton's third law over the isolated configuration.
        let mut sum = [0.0; 3];
        let mut maxf = 0.0f64;
        for i in 0..3 {
            for c in 0..3 {
                sum[c] += r[3 * i + c];
                maxf = maxf.max(r[3 * i + c].abs());
            }
        }
        assert!(maxf > 0.0, "repulsive charges must push the triangle apart");
        for c in 0..3 {
            assert!(sum[c].abs() <= 1e-10 * maxf.max(1.0));
        }
    }

    #[test]
    fn swapping_atom_indices_preserves_energy_and_magnitudes() {
        let (mut kernel, mut xi) = triangle_kernel();
        kernel.evaluate(&mut xi).unwrap();
        let base_energy = kernel.residuals()[9];
        let base_mags: Vec<f64> = (0..3)
            .map(|i| {
                Vec3::new(
                    kernel.residuals()[3 * i],
                    kernel.residuals()[3 * i + 1],
                    kernel.residuals()[3 * i + 2],
                )
                .norm()
            })
            .collect();

        // Rebuild with atoms 1 and 2 swapped (neighbor lists regenerated).
        let ctx = kernel.context();
        let mut atoms = ctx.atoms.clone();
        atoms.swap(1, 2);
        for a in &mut atoms {
            for n in &mut a.neighbors {
                n.nr = match n.nr {
                    1 => 2,
                    2 => 1,
                    other => other,
                };
            }
        }
        let mut swapped = KernelBuilder::new(Family::PairAngular)
            .table(ctx.table.clone())
            .params(ctx.params.clone())
            .paircol(3)
            .elstat(ctx.elstat.clone().unwrap())
            .reference(atoms, ctx.configs.clone(), ctx.force_0.clone())
            .build()
            .unwrap();
        swapped.evaluate(&mut xi).unwrap();
        assert_relative_eq!(swapped.residuals()[9], base_energy, max_relative = 1e-14);
        let mut mags: Vec<f64> = (0..3)
            .map(|i| {
                Vec3::new(
                    swapped.residuals()[3 * i],
                    swapped.residuals()[3 * i + 1],
                    swapped.residuals()[3 * i + 2],
                )
                .norm()
            })
            .collect();
        mags.swap(1, 2);
        for (a, b) in base_mags.iter().zip(&mags) {
            assert_relative_eq!(*a, *b, max_relative = 1e-12);
        }
    }

    /// Core + shell 1 Å apart: the φ-column for the pair has zero weight,
    /// so only the damping residue of the Coulomb term survives.
    #[test]
    fn core_shell_pair_keeps_only_the_damping_residue() {
        let phi_aa = ColSpec::zeros(0.5, 0.25, 7);
        let phi_ab = ColSpec::zeros(0.5, 0.25, 7).weight(0.0); // end = 2.0 ≥ r
        let phi_bb = ColSpec::zeros(0.5, 0.25, 7);
        let f_short = || ColSpec::zeros(0.5, 0.5, 3);
        let g = || ColSpec::zeros(-1.0, 0.25, 9);
        let table = assemble_table(
            vec![phi_aa, phi_ab, phi_bb, f_short(), f_short(), f_short(), g(), g()],
            TableFormat::EqDist,
        );
        let len = table.len;
        let params = ParamLayout { number: 0, total_ne_par: len, ntypes: 2, ndimtot: len + 2 };
        let atoms = vec![
            atom(0, vec![neighbor(&table, 1, 1, Vec3::new(1.0, 0.0, 0.0), [1, 4])], vec![]),
            atom(1, vec![neighbor(&table, 0, 0, Vec3::new(-1.0, 0.0, 0.0), [1, 4])], vec![]),
        ];
        let configs = vec![conf(0, 2)];
        let force_0 = vec![0.0; 3 * 2 + 7];
        let mut xi = table.samples.clone();
        xi.push(1.0); // q0 = +1 → q1 = −1 by neutrality
        xi.push(0.3);
        let mut kernel = KernelBuilder::new(Family::PairAngular)
            .table(table)
            .params(params)
            .paircol(3)
            .elstat(ElstatParams {
                cutoff: 8.0,
                epsilon: DP_EPS,
                ratio: vec![1.0, 1.0],
                sw_kappa: false,
            })
            .reference(atoms, configs, force_0)
            .build()
            .unwrap();
        kernel.evaluate(&mut xi).unwrap();
        let r = kernel.residuals();
        // Bare 1/r cancels exactly; the gradient is zeroed.
        let v = elstat::elstat_shift(1.0, 8.0, 0.3, DP_EPS).fnval;
        let se = elstat::self_energy(1.0, 0.3, DP_EPS, CoulombKind::Shift, 8.0);
        let want = (-(v - DP_EPS) - 2.0 * se) / 2.0;
        assert_relative_eq!(r[6], want, max_relative = 1e-12);
        for c in 0..6 {
            assert_eq!(r[c], 0.0, "core-shell pair must exert no Coulomb force");
        }
    }

    /// One central atom with two unit-transfer neighbors at 60°; g is the
    /// exact linear ramp with g(0.5) = 2, g'(0.5) = 1.
    #[test]
    fn angular_triple_energy_and_force_decomposition() {
        let s3 = 3f64.sqrt();
        let table = assemble_table(
            vec![
                ColSpec::zeros(0.5, 0.5, 8),
                ColSpec::from_fn(0.5, 0.5, 8, |_| 1.0).clamped(0.0, 0.0),
                ColSpec::from_fn(-1.0, 0.25, 9, |x| x + 1.5).clamped(1.0, 1.0),
            ],
            TableFormat::EqDist,
        );
        let len = table.len;
        let params = ParamLayout { number: 0, total_ne_par: len, ntypes: 1, ndimtot: len + 1 };
        let nj = neighbor(&table, 1, 0, Vec3::new(2.0, 0.0, 0.0), [0, 1]);
        let nk = neighbor(&table, 2, 0, Vec3::new(1.0, s3, 0.0), [0, 1]);
        let atoms = vec![
            atom(0, vec![nj, nk], vec![angle(&table, 2, 0.5)]),
            atom(0, vec![], vec![]),
            atom(0, vec![], vec![]),
        ];
        let configs = vec![conf(0, 3)];
        let force_0 = vec![0.0; 3 * 3 + 7];
        let mut xi = table.samples.clone();
        xi.push(0.0);
        let mut kernel = KernelBuilder::new(Family::PairAngular)
            .table(table)
            .params(params)
            .paircol(1)
            .elstat(ElstatParams { cutoff: 8.0, epsilon: DP_EPS, ratio: vec![1.0], sw_kappa: false })
            .reference(atoms, configs, force_0)
            .build()
            .unwrap();
        kernel.evaluate(&mut xi).unwrap();
        let r = kernel.residuals();

        // f_j·f_k·g(0.5) = 2, spread over three atoms.
        assert_relative_eq!(r[9], 2.0 / 3.0, max_relative = 1e-12);

        // With f' = 0: dV3 terms vanish; V3 = dg = 1, vl = 1/r = 0.5,
        // vv3 = −vl·cosθ = −0.25.
        let rj = Vec3::new(1.0, 0.0, 0.0);
        let rk = Vec3::new(0.5, s3 / 2.0, 0.0);
        let dfj = rj.scale(-0.25) + rk.scale(0.5);
        let dfk = rk.scale(-0.25) + rj.scale(0.5);
        let fi = dfj + dfk;
        assert_relative_eq!(r[0], fi.x, max_relative = 1e-12);
        assert_relative_eq!(r[1], fi.y, max_relative = 1e-12);
        assert_relative_eq!(r[3], -dfj.x, epsilon = 1e-12);
        assert_relative_eq!(r[4], -dfj.y, max_relative = 1e-12);
        assert_relative_eq!(r[6], -dfk.x, max_relative = 1e-12);
        assert_relative_eq!(r[7], -dfk.y, max_relative = 1e-12);
        // Σ F = 0 over the isolated triple.
        for c in 0..3 {
            let s: f64 = (0..3).map(|i| r[3 * i + c]).sum();
            assert!(s.abs() < 1e-12);
        }
    }

    /// Periodic self-image: the monopole term is halved exactly once and
    /// the action/reaction pair cancels on the same atom.
    #[test]
    fn self_interaction_is_halved_once() {
        let phi = || ColSpec::zeros(0.5, 0.5, 8);
        let f_short = || ColSpec::zeros(0.5, 0.5, 3);
        let g = || ColSpec::zeros(-1.0, 0.25, 9);
        let table = assemble_table(
            vec![phi(), phi(), phi(), f_short(), f_short(), f_short(), g(), g()],
            TableFormat::EqDist,
        );
        let len = table.len;
        let params = ParamLayout { number: 0, total_ne_par: len, ntypes: 2, ndimtot: len + 2 };
        let atoms =
            vec![atom(0, vec![neighbor(&table, 0, 0, Vec3::new(2.0, 0.0, 0.0), [0, 3])], vec![])];
        let configs = vec![conf(0, 1)];
        let force_0 = vec![0.0; 3 + 7];
        let mut xi = table.samples.clone();
        xi.push(1.0);
        xi.push(0.3);
        let mut kernel = KernelBuilder::new(Family::PairAngular)
            .table(table)
            .params(params)
            .paircol(3)
            .elstat(ElstatParams {
                cutoff: 8.0,
                epsilon: DP_EPS,
                ratio: vec![1.0, 1.0],
                sw_kappa: false,
            })
            .reference(atoms, configs, force_0)
            .build()
            .unwrap();
        kernel.evaluate(&mut xi).unwrap();
        let r = kernel.residuals();
        let v = elstat::elstat_shift(2.0, 8.0, 0.3, DP_EPS).fnval;
        let se = elstat::self_energy(1.0, 0.3, DP_EPS, CoulombKind::Shift, 8.0);
        assert_relative_eq!(r[3], 0.25 * v - se, max_relative = 1e-12);
        for c in 0..3 {
            assert_eq!(r[c], 0.0);
        }
    }

    fn three_argon_configs() -> (Kernel, Vec<f64>) {
        let table = assemble_table(
            vec![
                ColSpec::from_fn(2.0, 0.25, 9, |x| 0.02 * (x - 3.0) - 0.01).clamped(0.02, 0.02),
                ColSpec::zeros(2.0, 0.25, 9),
                ColSpec::zeros(-1.0, 0.25, 9),
            ],
            TableFormat::EqDist,
        );
        let len = table.len;
        let params = ParamLayout { number: 0, total_ne_par: len, ntypes: 1, ndimtot: len + 1 };
        let mut atoms = Vec::new();
        let mut configs = Vec::new();
        for h in 0..3 {
            let base = 2 * h;
            atoms.push(atom(
                0,
                vec![neighbor(&table, base + 1, 0, Vec3::new(3.0, 0.0, 0.0), [0, 1])],
                vec![],
            ));
            atoms.push(atom(
                0,
                vec![neighbor(&table, base, 0, Vec3::new(-3.0, 0.0, 0.0), [0, 1])],
                vec![],
            ));
            configs.push(conf(base, 2));
        }
        let force_0 = vec![0.0; 3 * 6 + 7 * 3];
        let mut xi = table.samples.clone();
        xi.push(0.0);
        let kernel = KernelBuilder::new(Family::PairAngular)
            .table(table)
            .params(params)
            .paircol(1)
            .elstat(ElstatParams { cutoff: 8.0, epsilon: DP_EPS, ratio: vec![1.0], sw_kappa: false })
            .reference(atoms, configs, force_0)
            .build()
            .unwrap();
        (kernel, xi)
    }

    #[test]
    fn thread_grid_matches_the_single_rank_cost() {
        tracing_subscriber::fmt().with_test_writer().try_init().ok();
        let (mut single, mut xi) = three_argon_configs();
        let want = single.evaluate(&mut xi).unwrap();
        let energy_slot = single.residuals()[6 * 3 + 1];

        let (kernel, mut xi) = three_argon_configs();
        let mut grid = kernel.into_grid(3);
        let got = grid.evaluate(&mut xi).unwrap();
        assert_relative_eq!(got, want, max_relative = 1e-12);
        // Worker slices were gathered back into the root buffer.
        assert_relative_eq!(grid.residuals()[6 * 3 + 1], energy_slot, max_relative = 1e-14);
        assert_eq!(grid.fcalls(), 1);
        // A sync round with unchanged sampling points must reproduce the cost.
        let resync = grid.sync(&mut xi).unwrap();
        assert_relative_eq!(resync, want, max_relative = 1e-12);
        grid.shutdown().unwrap();
    }

    #[test]
    fn shutdown_returns_the_sentinel_on_every_worker() {
        let (kernel, _xi) = three_argon_configs();
        let grid = kernel.into_grid(3);
        // One broadcast round; each worker leaves the loop with −1.
        grid.shutdown().unwrap();
    }

    #[test]
    fn analytic_update_hook_feeds_the_calc_table() {
        // Same physics as the EqDist argon kernel, but routed through the
        // analytic flow: the broadcast carries only [kappa], and the hook
        // rebuilds the calc table.
        let (mut reference, mut xi_ref) = argon_kernel();
        let want = reference.evaluate(&mut xi_ref).unwrap();

        let mut table = assemble_table(
            vec![
                ColSpec::from_fn(2.0, 0.25, 9, |x| 0.02 * (x - 3.0) - 0.01).clamped(0.02, 0.02),
                ColSpec::zeros(2.0, 0.25, 9),
                ColSpec::zeros(-1.0, 0.25, 9),
            ],
            TableFormat::Analytic,
        );
        // Seed with garbage: the hook must overwrite it.
        let good = table.samples.clone();
        table.samples.iter_mut().for_each(|v| *v = 99.0);
        let params = ParamLayout { number: 0, total_ne_par: 0, ntypes: 1, ndimtot: 1 };
        let atoms = vec![
            atom(0, vec![neighbor(&table, 1, 0, Vec3::new(3.0, 0.0, 0.0), [0, 1])], vec![]),
            atom(0, vec![neighbor(&table, 0, 0, Vec3::new(-3.0, 0.0, 0.0), [0, 1])], vec![]),
        ];
        let configs = vec![conf(0, 2)];
        let force_0 = vec![0.0; 3 * 2 + 7];
        let mut hooks = KernelHooks::default();
        hooks.update_table = Some(Box::new(move |_xi: &[f64], calc: &mut [f64]| {
            calc.copy_from_slice(&good);
        }));
        let mut kernel = KernelBuilder::new(Family::PairAngular)
            .options(KernelOptions { analytic_params: true, ..KernelOptions::default() })
            .table(table)
            .params(params)
            .paircol(1)
            .elstat(ElstatParams { cutoff: 8.0, epsilon: DP_EPS, ratio: vec![1.0], sw_kappa: false })
            .reference(atoms, configs, force_0)
            .hooks(hooks)
            .build()
            .unwrap();
        let mut xi = vec![0.0]; // kappa only
        let got = kernel.evaluate(&mut xi).unwrap();
        assert_relative_eq!(got, want, max_relative = 1e-14);
    }

    #[test]
    fn builder_rejects_malformed_references() {
        let (kernel, _xi) = argon_kernel();
        let ctx = kernel.context();

        let bad = KernelBuilder::new(Family::PairAngular)
            .table(ctx.table.clone())
            .params(ctx.params.clone())
            .paircol(1)
            .elstat(ctx.elstat.clone().unwrap())
            .reference(ctx.atoms.clone(), ctx.configs.clone(), vec![0.0; 3])
            .build();
        assert!(matches!(bad, Err(BuildError::ReferenceLen { .. })));

        let mut atoms = ctx.atoms.clone();
        atoms[0].neighbors[0].nr = 99;
        let bad = KernelBuilder::new(Family::PairAngular)
            .table(ctx.table.clone())
            .params(ctx.params.clone())
            .paircol(1)
            .elstat(ctx.elstat.clone().unwrap())
            .reference(atoms, ctx.configs.clone(), ctx.force_0.clone())
            .build();
        assert!(matches!(bad, Err(BuildError::NeighborIndex { .. })));

        let mut atoms = ctx.atoms.clone();
        atoms[0].neighbors[0].slots[0].shift = 1.5;
        let bad = KernelBuilder::new(Family::PairAngular)
            .table(ctx.table.clone())
            .params(ctx.params.clone())
            .paircol(1)
            .elstat(ctx.elstat.clone().unwrap())
            .reference(atoms, ctx.configs.clone(), ctx.force_0.clone())
            .build();
        assert!(matches!(bad, Err(BuildError::BadSlot { .. })));
    }

    #[test]
    fn kernel_configuration_round_trips_through_serde() {
        let (kernel, _xi) = argon_kernel();
        let opts = KernelOptions { use_stress: true, ..KernelOptions::default() };
        let json = serde_json::to_string(&opts).unwrap();
        let back: KernelOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back.use_stress, true);
        assert_eq!(back.coulomb, CoulombKind::Shift);

        let json = serde_json::to_string(&kernel.context().table).unwrap();
        let back: PotTable = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len, kernel.context().table.len);
        assert_eq!(back.cols.len(), 3);
        assert_eq!(back.format, TableFormat::EqDist);
    }

    /// Family A pair virial: symmetric half-weighted outer product,
    /// normalized per cell volume.
    #[test]
    fn pair_stress_virial_is_accumulated_and_normalized() {
        let table = assemble_table(
            vec![
                ColSpec::from_fn(2.0, 0.25, 9, |x| 0.02 * (x - 3.0) - 0.01).clamped(0.02, 0.02),
                ColSpec::zeros(2.0, 0.25, 9),
                ColSpec::zeros(-1.0, 0.25, 9),
            ],
            TableFormat::EqDist,
        );
        let len = table.len;
        let params = ParamLayout { number: 0, total_ne_par: len, ntypes: 1, ndimtot: len + 1 };
        let atoms = vec![
            atom(0, vec![neighbor(&table, 1, 0, Vec3::new(3.0, 0.0, 0.0), [0, 1])], vec![]),
            atom(0, vec![neighbor(&table, 0, 0, Vec3::new(-3.0, 0.0, 0.0), [0, 1])], vec![]),
        ];
        let configs = vec![Configuration {
            cnfstart: 0,
            inconf: 2,
            volume: 2.0,
            weight: 1.0,
            use_forces: true,
            use_stresses: true,
        }];
        let force_0 = vec![0.0; 3 * 2 + 7];
        let mut xi = table.samples.clone();
        xi.push(0.0);
        let mut kernel = KernelBuilder::new(Family::PairAngular)
            .options(KernelOptions { use_stress: true, ..KernelOptions::default() })
            .table(table)
            .params(params)
            .paircol(1)
            .elstat(ElstatParams { cutoff: 8.0, epsilon: DP_EPS, ratio: vec![1.0], sw_kappa: false })
            .reference(atoms, configs, force_0)
            .build()
            .unwrap();
        kernel.evaluate(&mut xi).unwrap();
        let r = kernel.residuals();
        // Each ordered bond adds -0.5 * dist_x * (dist_r_x * phi') = -0.03.
        assert_relative_eq!(r[7], -0.06 / 2.0, epsilon = 1e-14);
        for c in 8..13 {
            assert_eq!(r[c], 0.0);
        }
    }

    /// Family B: cohesive pair energy on a half neighbor list, explicit
    /// reaction, r-scaled virial.
    #[test]
    fn tersoff_pair_energy_forces_and_stress() {
        let table = assemble_table(
            vec![ColSpec::from_fn(2.0, 0.25, 9, |x| 0.02 * (x - 3.0) - 0.01).clamped(0.02, 0.02)],
            TableFormat::EqDist,
        );
        let len = table.len;
        let params = ParamLayout { number: 0, total_ne_par: 0, ntypes: 1, ndimtot: len };
        // Half list: the bond lives on the lower-indexed atom only.
        let atoms = vec![
            atom(0, vec![neighbor(&table, 1, 0, Vec3::new(3.0, 0.0, 0.0), [0, 0])], vec![]),
            atom(0, vec![], vec![]),
        ];
        let configs = vec![Configuration {
            cnfstart: 0,
            inconf: 2,
            volume: 2.0,
            weight: 1.0,
            use_forces: true,
            use_stresses: true,
        }];
        let force_0 = vec![0.0; 3 * 2 + 7];
        let mut xi = table.samples.clone();
        let mut kernel = KernelBuilder::new(Family::Tersoff)
            .options(KernelOptions { use_stress: true, ..KernelOptions::default() })
            .table(table)
            .params(params)
            .paircol(1)
            .reference(atoms, configs, force_0)
            .build()
            .unwrap();
        let cost = kernel.evaluate(&mut xi).unwrap();
        let r = kernel.residuals();
        // Cohesive energy: the full bond over two atoms.
        assert_relative_eq!(r[6], -0.005, epsilon = 1e-14);
        assert_relative_eq!(r[0], 0.02, epsilon = 1e-14);
        assert_relative_eq!(r[3], -0.02, epsilon = 1e-14);
        // Virial: -phi' * r along xx, then divided by the cell volume.
        assert_relative_eq!(r[7], -0.06 / 2.0, epsilon = 1e-14);
        for c in 8..13 {
            assert_eq!(r[c], 0.0);
        }
        assert_relative_eq!(cost, 8e-4 + 2.5e-5 + 9e-4, epsilon = 1e-14);
    }

    /// Family B self-image: the bond is halved and the reaction cancels on
    /// the same atom.
    #[test]
    fn tersoff_self_image_halves_the_bond() {
        let table = assemble_table(
            vec![ColSpec::from_fn(2.0, 0.25, 9, |x| 0.02 * (x - 3.0) - 0.01).clamped(0.02, 0.02)],
            TableFormat::EqDist,
        );
        let len = table.len;
        let params = ParamLayout { number: 0, total_ne_par: 0, ntypes: 1, ndimtot: len };
        let atoms =
            vec![atom(0, vec![neighbor(&table, 0, 0, Vec3::new(3.0, 0.0, 0.0), [0, 0])], vec![])];
        let configs = vec![conf(0, 1)];
        let force_0 = vec![0.0; 3 + 7];
        let mut xi = table.samples.clone();
        let mut kernel = KernelBuilder::new(Family::Tersoff)
            .table(table)
            .params(params)
            .paircol(1)
            .reference(atoms, configs, force_0)
            .build()
            .unwrap();
        kernel.evaluate(&mut xi).unwrap();
        let r = kernel.residuals();
        assert_relative_eq!(r[3], -0.005, epsilon = 1e-14);
        for c in 0..3 {
            assert_eq!(r[c], 0.0);
        }
    }
}
