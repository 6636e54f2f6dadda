//! Potential-table model
//!
//! A potential table is an ordered sequence of *columns*, each a sampled 1-D
//! function: pair columns φ (one per unordered species pair), transfer
//! columns f (same count), angular columns g (one per central species), and
//! — for the pair/angular family — auxiliary parameter slots for charges and
//! κ that live in the optimization vector rather than the sample buffer.
//!
//! Column records carry their boundary gradients explicitly (`left_bc`,
//! `right_bc`); a value at or above the conventional `1e30` sentinel selects
//! the natural boundary, so legacy tables translate one to one.
//!
//! The [`TableFormat`] decides two things per call:
//! - which buffer holds the **live** sample values (the calc table owned by
//!   the workspace, or the broadcast parameter vector itself), and
//! - whether spline preparation runs on uniform knots or on the stored
//!   abscissae.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use serde::{Deserialize, Serialize};

use crate::spline::{self, SplineError};

/// Storage/flow variant of the potential table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableFormat {
    /// Format 0: analytic potentials; the calc table is refreshed from the
    /// optimization variables each call.
    Analytic,
    /// Format 3: tabulated on equidistant knots; the parameter vector is the
    /// live sample buffer.
    EqDist,
    /// Format 4: tabulated on stored abscissae; the parameter vector is the
    /// live sample buffer.
    Sampled,
    /// Format 5: tabulated on stored abscissae with a separate calc table
    /// that must be refreshed from the parameter vector.
    SampledUpdate,
}

impl TableFormat {
    /// Legacy integer code.
    pub fn code(self) -> u32 {
        match self {
            TableFormat::Analytic => 0,
            TableFormat::EqDist => 3,
            TableFormat::Sampled => 4,
            TableFormat::SampledUpdate => 5,
        }
    }

    /// Parse a legacy format code.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(TableFormat::Analytic),
            3 => Some(TableFormat::EqDist),
            4 => Some(TableFormat::Sampled),
            5 => Some(TableFormat::SampledUpdate),
            _ => None,
        }
    }

    /// Whether the calc table (workspace buffer) is the live one during a
    /// call. Otherwise the broadcast parameter vector is read directly.
    #[inline]
    pub fn uses_calc_buffer(self) -> bool {
        matches!(self, TableFormat::Analytic | TableFormat::SampledUpdate)
    }

    /// Whether the calc table must be refreshed from the optimization
    /// variables before evaluating.
    #[inline]
    pub fn needs_update(self) -> bool {
        self.uses_calc_buffer()
    }

    /// Uniform-knot spline preparation (no stored abscissae).
    #[inline]
    pub fn uniform_prep(self) -> bool {
        matches!(self, TableFormat::Analytic | TableFormat::EqDist)
    }
}

/// One sampled 1-D function inside the table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PotColumn {
    /// First sample index in the shared value buffer (inclusive).
    pub first: usize,
    /// Last sample index (inclusive).
    pub last: usize,
    /// Radius of the first knot.
    pub begin: f64,
    /// Cutoff radius; a neighbor contributes only for `r < end` (strict).
    pub end: f64,
    /// Knot spacing for uniform formats.
    pub step: f64,
    /// Endpoint gradient at `begin`; ≥ `0.99e30` means natural boundary.
    pub left_bc: f64,
    /// Endpoint gradient at `end`.
    pub right_bc: f64,
    /// Fit weight; `0.0` marks a core-shell φ-column whose bare Coulomb
    /// interaction is cancelled inside the cutoff.
    pub weight: f64,
}

impl PotColumn {
    /// Number of stored samples.
    #[inline]
    pub fn len(&self) -> usize {
        self.last - self.first + 1
    }

    /// Precompute the O(1) lookup triple for radius `r` on uniform knots.
    ///
    /// Returns `None` at or beyond the cutoff. Used when assembling neighbor
    /// and angle records; the hot loops only ever consume the result.
    pub fn locate(&self, r: f64) -> Option<crate::model::SplineSlot> {
        if r >= self.end {
            return None;
        }
        let raw = (r - self.begin) / self.step;
        let mut slot = raw as usize;
        let mut shift = raw - slot as f64;
        // A radius exactly on the final knot still needs a valid bracket.
        if slot >= self.len() - 1 {
            slot = self.len() - 2;
            shift = 1.0 - f64::EPSILON;
        }
        Some(crate::model::SplineSlot {
            slot: self.first + slot,
            shift,
            step: self.step,
        })
    }
}

/// Layout of the optimization vector.
///
/// The potential samples (or analytic parameters) come first; the auxiliary
/// charge block sits at `2·number + total_ne_par`, with κ in its final slot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParamLayout {
    /// Number of potential functions in the analytic table.
    pub number: usize,
    /// Count of non-potential auxiliary parameters preceding the charges.
    pub total_ne_par: usize,
    /// Number of atomic species.
    pub ntypes: usize,
    /// Total length of the optimization vector.
    pub ndimtot: usize,
}

impl ParamLayout {
    /// Offset of species 0's charge in the optimization vector.
    #[inline]
    pub fn charge_offset(&self) -> usize {
        2 * self.number + self.total_ne_par
    }

    /// Index of κ (the slot after the `ntypes − 1` fitted charges).
    #[inline]
    pub fn kappa_index(&self) -> usize {
        self.charge_offset() + self.ntypes - 1
    }
}

/// Errors raised by table validation and preparation.
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("column {col}: sample range {first}..={last} invalid or outside buffer of length {len}")]
    BadRange { col: usize, first: usize, last: usize, len: usize },
    #[error("column {col}: knot step must be positive (got {step})")]
    BadStep { col: usize, step: f64 },
    #[error("column {col}: cutoff {end} not beyond first knot {begin}")]
    BadCutoff { col: usize, begin: f64, end: f64 },
    #[error("format stores abscissae but xcoord has length {got} (need {need})")]
    MissingAbscissae { got: usize, need: usize },
    #[error("spline preparation failed on column {col}: {source}")]
    Prep {
        col: usize,
        #[source]
        source: SplineError,
    },
}

/// The full potential table: column records plus the initial sample buffer.
///
/// The per-call mutable buffers (live calc table and second derivatives)
/// live in the workspace; this struct is read-only during evaluation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PotTable {
    pub format: TableFormat,
    /// Length of the shared sample buffer.
    pub len: usize,
    pub cols: Vec<PotColumn>,
    /// Stored abscissae, parallel to the sample buffer; empty for uniform
    /// formats.
    pub xcoord: Vec<f64>,
    /// Initial calc-table samples (seed for the workspace copy).
    pub samples: Vec<f64>,
}

impl PotTable {
    /// Check the column invariants once, up front.
    pub fn validate(&self) -> Result<(), TableError> {
        for (c, col) in self.cols.iter().enumerate() {
            if col.last < col.first || col.last >= self.len {
                return Err(TableError::BadRange {
                    col: c,
                    first: col.first,
                    last: col.last,
                    len: self.len,
                });
            }
            if !(col.step > 0.0) {
                return Err(TableError::BadStep { col: c, step: col.step });
            }
            if !(col.end > col.begin) {
                return Err(TableError::BadCutoff { col: c, begin: col.begin, end: col.end });
            }
        }
        if !self.format.uniform_prep() && self.xcoord.len() != self.len {
            return Err(TableError::MissingAbscissae {
                got: self.xcoord.len(),
                need: self.len,
            });
        }
        Ok(())
    }

    /// Run second-derivative preparation for columns `cols` of the live
    /// buffer `xi` into `d2` (parallel to `xi`).
    pub fn prepare(
        &self,
        cols: std::ops::Range<usize>,
        xi: &[f64],
        d2: &mut [f64],
    ) -> Result<(), TableError> {
        for c in cols {
            let col = &self.cols[c];
            let (first, last) = (col.first, col.last);
            let y = &xi[first..=last];
            let y2 = &mut d2[first..=last];
            let res = if self.format.uniform_prep() {
                spline::prepare_uniform(col.step, y, col.left_bc, col.right_bc, y2)
            } else {
                spline::prepare_nonuniform(&self.xcoord[first..=last], y, col.left_bc, col.right_bc, y2)
            };
            res.map_err(|source| TableError::Prep { col: c, source })?;
        }
        Ok(())
    }
}

/// Borrowed view over the live sample buffer, its second derivatives, and
/// the column records — everything the accumulators need for a lookup.
#[derive(Copy, Clone)]
pub struct TableView<'a> {
    pub cols: &'a [PotColumn],
    pub xi: &'a [f64],
    pub d2: &'a [f64],
}

impl<'a> TableView<'a> {
    /// Cutoff of column `c`.
    #[inline]
    pub fn end(&self, c: usize) -> f64 {
        self.cols[c].end
    }

    /// Fit weight of column `c` (`0.0` = core-shell column).
    #[inline]
    pub fn weight(&self, c: usize) -> f64 {
        self.cols[c].weight
    }

    /// Value-only spline lookup.
    #[inline]
    pub fn eval(&self, s: crate::model::SplineSlot) -> f64 {
        spline::splint_dir(self.xi, self.d2, s.slot, s.shift, s.step)
    }

    /// Combined value/derivative lookup.
    #[inline]
    pub fn eval_comb(&self, s: crate::model::SplineSlot) -> (f64, f64) {
        spline::splint_comb_dir(self.xi, self.d2, s.slot, s.shift, s.step)
    }
}
