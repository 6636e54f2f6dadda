//! SPMD collectives: broadcast, reduce, gather
//!
//! The kernel is single-program-multiple-data: every rank runs the same
//! service loop over a disjoint slice of configurations and synchronizes
//! through three collectives. [`Collective`] is the seam; two
//! implementations ship:
//!
//! - [`SingleRank`] — the degenerate one-process grid; every collective is
//!   a no-op and the reduce returns the local sum unchanged.
//! - [`ThreadComm`] — a channel-backed rank grid for in-process workers.
//!   The root clones the parameter vector to every worker per round;
//!   workers ship their residual slices back and the root merges them into
//!   its own buffer in place, exactly like a gather-with-displacements.
//!
//! Message ordering per worker is FIFO, but workers drain at their own
//! pace, so a fast worker's gather payload can arrive while the root is
//! still collecting reduce messages. The root endpoint buffers
//! out-of-phase messages instead of treating them as protocol errors.
//!
//! Stress slices ride along in every gather; when stresses are disabled
//! they are zero-filled slots and cost nothing to merge.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::VecDeque;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::model::{Configuration, ResidualLayout};

/// The driving rank.
pub const ROOT: usize = 0;

/// Errors surfaced by the channel-backed collectives.
#[derive(Debug, thiserror::Error)]
pub enum SpmdError {
    #[error("rank channel disconnected")]
    Disconnected,
    #[error("broadcast length mismatch (got {got}, expected {want})")]
    Shape { got: usize, want: usize },
}

/// One rank's share of the configuration and atom sequences, plus the
/// displacement data the gather needs.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub firstconf: usize,
    pub nconf: usize,
    pub firstatom: usize,
    pub natoms: usize,
}

impl Partition {
    /// Everything on one rank.
    pub fn full(nconf: usize, natoms: usize) -> Self {
        Partition { firstconf: 0, nconf, firstatom: 0, natoms }
    }

    /// Contiguous block decomposition of whole configurations across
    /// `size` ranks. Configurations are never split; trailing ranks may
    /// come up empty when there are more ranks than configurations.
    pub fn split(configs: &[Configuration], size: usize) -> Vec<Partition> {
        let nconf = configs.len();
        let base = nconf / size;
        let rem = nconf % size;
        let mut parts = Vec::with_capacity(size);
        let mut firstconf = 0usize;
        for r in 0..size {
            let n = base + usize::from(r < rem);
            let firstatom = if firstconf < nconf {
                configs[firstconf].cnfstart
            } else {
                configs.last().map(|c| c.cnfstart + c.inconf).unwrap_or(0)
            };
            let natoms: usize = configs[firstconf..firstconf + n].iter().map(|c| c.inconf).sum();
            parts.push(Partition { firstconf, nconf: n, firstatom, natoms });
            firstconf += n;
        }
        parts
    }

    /// Range of configuration indices owned by this rank.
    #[inline]
    pub fn confs(&self) -> std::ops::Range<usize> {
        self.firstconf..self.firstconf + self.nconf
    }
}

/// The three blocking collectives the service loop suspends on.
pub trait Collective {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    fn partition(&self) -> Partition;

    /// Root sends its parameter vector and flag; workers overwrite theirs.
    fn broadcast(&mut self, xi: &mut [f64], flag: &mut i32) -> Result<(), SpmdError>;

    /// Root sends the live calc-table samples; workers overwrite theirs.
    /// Used by the flag-2 synchronization round.
    fn broadcast_table(&mut self, calc: &mut [f64]) -> Result<(), SpmdError>;

    /// Sum the local cost onto the root. The root receives the global sum;
    /// workers get their local value echoed back.
    fn reduce_sum(&mut self, local: f64) -> Result<f64, SpmdError>;

    /// Merge every rank's residual slices into the root's buffer (in
    /// place on the root). Workers send, the root receives.
    fn gather(&mut self, layout: &ResidualLayout, forces: &mut [f64]) -> Result<(), SpmdError>;
}

/// The one-rank grid: no communication at all.
#[derive(Debug, Clone)]
pub struct SingleRank {
    part: Partition,
}

impl SingleRank {
    pub fn new(nconf: usize, natoms: usize) -> Self {
        SingleRank { part: Partition::full(nconf, natoms) }
    }
}

impl Collective for SingleRank {
    fn rank(&self) -> usize {
        ROOT
    }
    fn size(&self) -> usize {
        1
    }
    fn partition(&self) -> Partition {
        self.part
    }
    fn broadcast(&mut self, _xi: &mut [f64], _flag: &mut i32) -> Result<(), SpmdError> {
        Ok(())
    }
    fn broadcast_table(&mut self, _calc: &mut [f64]) -> Result<(), SpmdError> {
        Ok(())
    }
    fn reduce_sum(&mut self, local: f64) -> Result<f64, SpmdError> {
        Ok(local)
    }
    fn gather(&mut self, _layout: &ResidualLayout, _forces: &mut [f64]) -> Result<(), SpmdError> {
        Ok(())
    }
}

enum Down {
    Bcast { xi: Vec<f64>, flag: i32 },
    Table(Vec<f64>),
}

enum Up {
    Sum { value: f64 },
    Slices { rank: usize, atoms: Vec<f64>, energies: Vec<f64>, stresses: Vec<f64> },
}

/// Channel-backed rank grid for in-process SPMD.
pub struct ThreadComm {
    rank: usize,
    parts: Arc<Vec<Partition>>,
    // Root side.
    downs: Vec<Sender<Down>>,
    up_rx: Option<Receiver<Up>>,
    pending_sums: VecDeque<f64>,
    pending_slices: VecDeque<(usize, Vec<f64>, Vec<f64>, Vec<f64>)>,
    // Worker side.
    down_rx: Option<Receiver<Down>>,
    up_tx: Option<Sender<Up>>,
}

impl ThreadComm {
    /// Build one endpoint per rank; endpoint `0` is the root. Hand the
    /// others to worker threads.
    pub fn grid(parts: Vec<Partition>) -> Vec<ThreadComm> {
        let size = parts.len();
        let parts = Arc::new(parts);
        let (up_tx, up_rx) = unbounded();
        let mut downs = Vec::with_capacity(size - 1);
        let mut workers = Vec::with_capacity(size - 1);
        for rank in 1..size {
            let (tx, rx) = unbounded();
            downs.push(tx);
            workers.push(ThreadComm {
                rank,
                parts: Arc::clone(&parts),
                downs: Vec::new(),
                up_rx: None,
                pending_sums: VecDeque::new(),
                pending_slices: VecDeque::new(),
                down_rx: Some(rx),
                up_tx: Some(up_tx.clone()),
            });
        }
        let root = ThreadComm {
            rank: ROOT,
            parts,
            downs,
            up_rx: Some(up_rx),
            pending_sums: VecDeque::new(),
            pending_slices: VecDeque::new(),
            down_rx: None,
            up_tx: None,
        };
        let mut all = vec![root];
        all.extend(workers);
        all
    }

    fn recv_down(&self) -> Result<Down, SpmdError> {
        self.down_rx
            .as_ref()
            .expect("worker endpoint")
            .recv()
            .map_err(|_| SpmdError::Disconnected)
    }

    /// Pop the next reduce message, buffering gather payloads that arrived
    /// early from fast workers.
    fn next_sum(&mut self) -> Result<f64, SpmdError> {
        loop {
            if let Some(v) = self.pending_sums.pop_front() {
                return Ok(v);
            }
            match self.up_rx.as_ref().expect("root endpoint").recv() {
                Ok(Up::Sum { value }) => return Ok(value),
                Ok(Up::Slices { rank, atoms, energies, stresses }) => {
                    self.pending_slices.push_back((rank, atoms, energies, stresses));
                }
                Err(_) => return Err(SpmdError::Disconnected),
            }
        }
    }

    fn next_slices(&mut self) -> Result<(usize, Vec<f64>, Vec<f64>, Vec<f64>), SpmdError> {
        loop {
            if let Some(s) = self.pending_slices.pop_front() {
                return Ok(s);
            }
            match self.up_rx.as_ref().expect("root endpoint").recv() {
                Ok(Up::Slices { rank, atoms, energies, stresses }) => {
                    return Ok((rank, atoms, energies, stresses));
                }
                Ok(Up::Sum { value }) => self.pending_sums.push_back(value),
                Err(_) => return Err(SpmdError::Disconnected),
            }
        }
    }
}

impl Collective for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.parts.len()
    }

    fn partition(&self) -> Partition {
        self.parts[self.rank]
    }

    fn broadcast(&mut self, xi: &mut [f64], flag: &mut i32) -> Result<(), SpmdError> {
        if self.rank == ROOT {
            trace!(flag = *flag, len = xi.len(), "broadcast parameters");
            for tx in &self.downs {
                tx.send(Down::Bcast { xi: xi.to_vec(), flag: *flag })
                    .map_err(|_| SpmdError::Disconnected)?;
            }
            Ok(())
        } else {
            match self.recv_down()? {
                Down::Bcast { xi: v, flag: f } => {
                    if v.len() != xi.len() {
                        return Err(SpmdError::Shape { got: v.len(), want: xi.len() });
                    }
                    xi.copy_from_slice(&v);
                    *flag = f;
                    Ok(())
                }
                Down::Table(_) => Err(SpmdError::Shape { got: 0, want: xi.len() }),
            }
        }
    }

    fn broadcast_table(&mut self, calc: &mut [f64]) -> Result<(), SpmdError> {
        if self.rank == ROOT {
            trace!(len = calc.len(), "broadcast calc table");
            for tx in &self.downs {
                tx.send(Down::Table(calc.to_vec())).map_err(|_| SpmdError::Disconnected)?;
            }
            Ok(())
        } else {
            match self.recv_down()? {
                Down::Table(v) => {
                    if v.len() != calc.len() {
                        return Err(SpmdError::Shape { got: v.len(), want: calc.len() });
                    }
                    calc.copy_from_slice(&v);
                    Ok(())
                }
                Down::Bcast { xi, .. } => Err(SpmdError::Shape { got: xi.len(), want: calc.len() }),
            }
        }
    }

    fn reduce_sum(&mut self, local: f64) -> Result<f64, SpmdError> {
        if self.rank == ROOT {
            let mut sum = local;
            for _ in 1..self.size() {
                sum += self.next_sum()?;
            }
            Ok(sum)
        } else {
            self.up_tx
                .as_ref()
                .expect("worker endpoint")
                .send(Up::Sum { value: local })
                .map_err(|_| SpmdError::Disconnected)?;
            Ok(local)
        }
    }

    fn gather(&mut self, layout: &ResidualLayout, forces: &mut [f64]) -> Result<(), SpmdError> {
        if self.rank == ROOT {
            for _ in 1..self.size() {
                let (rank, atoms, energies, stresses) = self.next_slices()?;
                let p = self.parts[rank];
                if atoms.len() != 3 * p.natoms
                    || energies.len() != p.nconf
                    || stresses.len() != 6 * p.nconf
                {
                    return Err(SpmdError::Shape { got: atoms.len(), want: 3 * p.natoms });
                }
                forces[3 * p.firstatom..3 * (p.firstatom + p.natoms)].copy_from_slice(&atoms);
                let e = layout.energy_p() + p.firstconf;
                forces[e..e + p.nconf].copy_from_slice(&energies);
                let s = layout.stress_p() + 6 * p.firstconf;
                forces[s..s + 6 * p.nconf].copy_from_slice(&stresses);
            }
            Ok(())
        } else {
            let p = self.partition();
            let atoms = forces[3 * p.firstatom..3 * (p.firstatom + p.natoms)].to_vec();
            let e = layout.energy_p() + p.firstconf;
            let energies = forces[e..e + p.nconf].to_vec();
            let s = layout.stress_p() + 6 * p.firstconf;
            let stresses = forces[s..s + 6 * p.nconf].to_vec();
            self.up_tx
                .as_ref()
                .expect("worker endpoint")
                .send(Up::Slices { rank: self.rank, atoms, energies, stresses })
                .map_err(|_| SpmdError::Disconnected)?;
            Ok(())
        }
    }
}
