//! Communication scheduler: per-rule send/receive lists derived from the
//! entity-ownership table, and their two-stage execution.
//!
//! Precommunication fills clone-region (ghost) inputs a rule needs before
//! executing; postcommunication scatters produced values back to their
//! owning rank. Both are ordered lists of [`CommInfo`], derived identically
//! on every rank from the same `DistributeInfo`, so no negotiation happens
//! at runtime.
//!
//! Execution follows a fixed discipline: exchange byte counts first, post
//! all data receives before any send, and drain every handle before
//! unpacking — even on error paths.

use crate::entity::{EntitySet, VarId};
use crate::exec::comm::{Communicator, Wait};
use crate::facts::store::{DistributeInfo, FactStore};
use crate::rule_error::RuleMeshError;
use serde::{Deserialize, Serialize};

/// The unit of inter-process data exchange for one variable and one peer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CommInfo {
    pub var: VarId,
    /// Peer rank.
    pub proc: usize,
    /// Entities whose values this rank sends to `proc`.
    pub send_set: EntitySet,
    /// Entities whose values this rank receives from `proc`, in canonical
    /// (ascending) unpack order.
    pub recv_seq: EntitySet,
}

impl CommInfo {
    pub fn is_empty(&self) -> bool {
        self.send_set.is_empty() && self.recv_seq.is_empty()
    }
}

/// Precommunication: pull requested ghost entities from their owners.
///
/// Receives are the intersection of each owner's ghost list with the
/// variable's aggregated request; sends are the mirror image through the
/// xmit table. Requests are computed from global existence, so both sides
/// derive matching sets.
pub fn precomm_plan(dist: &DistributeInfo, var: VarId, requests: &EntitySet) -> Vec<CommInfo> {
    let mut plan: Vec<CommInfo> = Vec::new();
    for (r, ghost) in &dist.copy {
        let recv = ghost.intersect(requests);
        if !recv.is_empty() {
            entry(&mut plan, var, *r).recv_seq.union_with(&recv);
        }
    }
    for (r, xm) in &dist.xmit {
        let send = xm.intersect(requests);
        if !send.is_empty() {
            entry(&mut plan, var, *r).send_set.union_with(&send);
        }
    }
    plan
}

/// Postcommunication: scatter produced ghost-entity values to their owners.
///
/// `produced` is the rule's global target image; each rank sends the ghost
/// part it computed and owners receive over their xmit mirror.
pub fn postcomm_plan(dist: &DistributeInfo, var: VarId, produced: &EntitySet) -> Vec<CommInfo> {
    let mut plan: Vec<CommInfo> = Vec::new();
    for (r, ghost) in &dist.copy {
        let send = ghost.intersect(produced);
        if !send.is_empty() {
            entry(&mut plan, var, *r).send_set.union_with(&send);
        }
    }
    for (r, xm) in &dist.xmit {
        let recv = xm.intersect(produced);
        if !recv.is_empty() {
            entry(&mut plan, var, *r).recv_seq.union_with(&recv);
        }
    }
    plan
}

fn entry<'a>(plan: &'a mut Vec<CommInfo>, var: VarId, proc: usize) -> &'a mut CommInfo {
    if let Some(i) = plan.iter().position(|c| c.proc == proc) {
        &mut plan[i]
    } else {
        plan.push(CommInfo {
            var,
            proc,
            send_set: EntitySet::new(),
            recv_seq: EntitySet::new(),
        });
        plan.last_mut().unwrap()
    }
}

/// Execute one comm-info list: stage 1 exchanges byte counts, stage 2 moves
/// packed payloads. `tag` must differ between plan instances that may be in
/// flight together (the compiler allocates tags per plan node).
pub fn execute_comm<C: Communicator>(
    facts: &mut dyn FactStore,
    plan: &[CommInfo],
    comm: &C,
    tag: u16,
) -> Result<(), RuleMeshError> {
    if plan.is_empty() {
        return Ok(());
    }
    let data_tag = tag.wrapping_add(1);

    // --- Stage 1: sizes ---
    let mut size_rx = Vec::new();
    for ci in plan.iter().filter(|c| !c.recv_seq.is_empty()) {
        let mut hdr = [0u8; 8];
        size_rx.push((ci, comm.irecv(ci.proc, tag, &mut hdr)));
    }
    let mut size_tx = Vec::new();
    for ci in plan.iter().filter(|c| !c.send_set.is_empty()) {
        let bytes = facts.get_variable(ci.var)?.pack_size(&ci.send_set) as u64;
        size_tx.push(comm.isend(ci.proc, tag, &bytes.to_le_bytes()));
    }

    let mut incoming: Vec<(&CommInfo, usize)> = Vec::new();
    let mut maybe_err = None;
    for (ci, h) in size_rx {
        match h.wait() {
            Some(data) if data.len() == 8 => {
                incoming.push((ci, u64::from_le_bytes(data.try_into().unwrap()) as usize));
            }
            Some(data) if maybe_err.is_none() => {
                maybe_err = Some(RuleMeshError::comm(
                    ci.proc,
                    format!("expected 8-byte size header, got {}", data.len()),
                ));
            }
            None if maybe_err.is_none() => {
                maybe_err = Some(RuleMeshError::comm(ci.proc, "failed to receive size"));
            }
            _ => {} // already failing; just drain
        }
    }
    for h in size_tx {
        let _ = h.wait();
    }
    if let Some(err) = maybe_err {
        return Err(err);
    }

    // --- Stage 2: data ---
    let mut data_rx = Vec::with_capacity(incoming.len());
    for &(ci, len) in &incoming {
        let mut buf = vec![0u8; len];
        let h = comm.irecv(ci.proc, data_tag, &mut buf);
        data_rx.push((ci, len, h));
    }
    let mut data_tx = Vec::new();
    for ci in plan.iter().filter(|c| !c.send_set.is_empty()) {
        let c = facts.get_variable(ci.var)?;
        let mut buf = vec![0u8; c.pack_size(&ci.send_set)];
        let mut pos = 0;
        c.pack(&mut buf, &mut pos, &ci.send_set)?;
        if pos != buf.len() {
            return Err(RuleMeshError::PackSizeMismatch {
                var: format!("{:?}", ci.var),
                declared: buf.len(),
                moved: pos,
            });
        }
        data_tx.push(comm.isend(ci.proc, data_tag, &buf));
    }

    let mut received: Vec<(&CommInfo, Vec<u8>)> = Vec::new();
    let mut maybe_err = None;
    for (ci, len, h) in data_rx {
        match h.wait() {
            Some(data) if data.len() == len => received.push((ci, data)),
            Some(data) if maybe_err.is_none() => {
                maybe_err = Some(RuleMeshError::comm(
                    ci.proc,
                    format!("expected {len} payload bytes, got {}", data.len()),
                ));
            }
            None if maybe_err.is_none() => {
                maybe_err = Some(RuleMeshError::comm(ci.proc, "failed to receive payload"));
            }
            _ => {}
        }
    }
    for h in data_tx {
        let _ = h.wait();
    }
    if let Some(err) = maybe_err {
        return Err(err);
    }

    for (ci, data) in received {
        let c = facts.get_variable_mut(ci.var)?;
        let mut pos = 0;
        c.unpack(&data, &mut pos, &ci.recv_seq)?;
    }
    Ok(())
}
