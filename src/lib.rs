//! Crate root: public surface, canonical re-exports, and kernel-wide invariants
//!
//! `forcematch` is the force-evaluation kernel of an interatomic-potential
//! fitting engine: given a trial parameterization and a reference set of
//! atomic configurations, it computes per-configuration forces, energies,
//! and stresses, and returns the weighted sum of squared deviations that an
//! outer optimizer minimizes.
//!
//! ## Invariants the kernel relies on
//!
//! - **Tables.** Every potential column satisfies `last ≥ first`,
//!   `step > 0`, and carries second derivatives of identical length after
//!   preparation. Neighbors inside a column's cutoff carry a precomputed
//!   `(slot, shift, step)` with `slot` bracketing a stored interval and
//!   `shift ∈ [0, 1)`; the builder checks this once so the hot loops can
//!   run unchecked.
//! - **Neutrality.** After charge resolution, `Σ ratio·charge = 0` holds
//!   exactly; the last species is always derived.
//! - **Newton's third law.** Pair reactions cancel through the ordered
//!   neighbor iteration, monopole and angular reactions are written
//!   explicitly; an isolated configuration sums to zero net force up to
//!   round-off.
//! - **SPMD.** All ranks observe the same parameter vector before any
//!   spline evaluation; per-atom writes stay inside the owning rank's
//!   residual buffer and the gather merges slices by owner.
//!
//! Failure modes are **precise errors** (`thiserror` enums per module) —
//! except the NaN guard, which deliberately returns the large sentinel
//! [`NAN_COST`] so the optimizer treats the point as infeasible.

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

/// Cubic-spline preparation and O(1) slot/shift lookups.
pub mod spline;
/// Damped Coulomb tails, self-energies, and the neutrality charge resolver.
pub mod elstat;
/// Potential-table model: columns, formats, parameter layout.
pub mod table;
/// Atoms, neighbors, angles, configurations, residual layout.
pub mod model;
/// Shared per-configuration finalizer (weighting, masking, normalization).
pub mod residual;
/// SPMD collectives: broadcast / reduce / gather over rank grids.
pub mod spmd;
/// Service loop, kernel context, family dispatch.
pub mod kernel;
/// Happy-path builder and drivers.
pub mod api;

mod pairang;
mod tersoff;

// ============================================================================
// Canonical re-exports (centralization)
// ============================================================================

pub use crate::api::{BuildError, GridHandle, Kernel, KernelBuilder};
pub use crate::elstat::{CoulombKind, ElstatParams, DP_EPS};
pub use crate::kernel::{
    calc_forces, Family, KernelContext, KernelError, KernelHooks, KernelOptions, Workspace,
    NAN_COST, SHUTDOWN,
};
pub use crate::model::{
    Angle, Atom, Configuration, Neighbor, ResidualLayout, SplineSlot, Vec3,
};
pub use crate::residual::FORCE_EPS;
pub use crate::spmd::{Collective, Partition, SingleRank, SpmdError, ThreadComm, ROOT};
pub use crate::table::{ParamLayout, PotColumn, PotTable, TableError, TableFormat};
