//! Reduction engine: associative folds across ranks.
//!
//! Two strategies, per the reduction rule's shape:
//! - [`execute_comm_reduce`]: point-to-point exchange of partial per-entity
//!   results for shared (ghost) entities, with fixed-size probe buffers and
//!   a bounded one-shot resend for oversized messages (tag 1 control,
//!   tag 2 payload).
//! - [`group_all_reduce`]: a recursive-doubling hypercube all-reduce
//!   generalized to non-power-of-two rank counts and variable-length,
//!   type-erased payloads, repacked after every round.
//!
//! Correctness of both requires the join operator to be commutative and
//! associative.

use crate::entity::{EntitySet, VarId};
use crate::exec::comm::{Communicator, Wait};
use crate::facts::store::FactStore;
use crate::rule_error::RuleMeshError;
use bytemuck::Pod;
use log::debug;
use std::marker::PhantomData;

/// First-phase / control message tag.
pub const TAG_CONTROL: u16 = 1;
/// Second-phase / resend payload tag.
pub const TAG_RESEND: u16 = 2;
/// Base tag for hypercube all-reduce rounds.
const TAG_HYPERCUBE: u16 = 0x0100;

/// User-supplied commutative-associative combine over packed payloads.
///
/// `acc` holds this rank's packed partial value and is replaced in place by
/// the packed combination; serialized size may change.
pub trait JoinOp: Send + Sync {
    fn join(&self, acc: &mut Vec<u8>, other: &[u8]) -> Result<(), RuleMeshError>;
}

/// Join over a fixed-size POD element type, applied elementwise to packed
/// arrays of equal length.
pub struct PodJoin<T, F> {
    f: F,
    _marker: PhantomData<fn(T)>,
}

impl<T, F> PodJoin<T, F>
where
    T: Pod,
    F: Fn(&mut T, &T) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

impl<T, F> JoinOp for PodJoin<T, F>
where
    T: Pod + Send + Sync,
    F: Fn(&mut T, &T) + Send + Sync,
{
    fn join(&self, acc: &mut Vec<u8>, other: &[u8]) -> Result<(), RuleMeshError> {
        if acc.len() != other.len() || acc.len() % std::mem::size_of::<T>() != 0 {
            return Err(RuleMeshError::PackSizeMismatch {
                var: "join payload".into(),
                declared: acc.len(),
                moved: other.len(),
            });
        }
        let n = acc.len() / std::mem::size_of::<T>();
        for k in 0..n {
            let w = std::mem::size_of::<T>();
            let mut a: T = bytemuck::pod_read_unaligned(&acc[k * w..(k + 1) * w]);
            let b: T = bytemuck::pod_read_unaligned(&other[k * w..(k + 1) * w]);
            (self.f)(&mut a, &b);
            acc[k * w..(k + 1) * w].copy_from_slice(bytemuck::bytes_of(&a));
        }
        Ok(())
    }
}

/// Exchange one variable-length payload with `peer` in both directions.
/// The receive is posted before the send to overlap transfer with packing.
fn exchange_blob<C: Communicator>(
    comm: &C,
    peer: usize,
    tag: u16,
    payload: &[u8],
) -> Result<Vec<u8>, RuleMeshError> {
    let mut probe = vec![0u8; payload.len().max(64)];
    let rx = comm.irecv(peer, tag, &mut probe);
    comm.isend(peer, tag, payload).wait();
    rx.wait()
        .ok_or_else(|| RuleMeshError::comm(peer, "exchange produced no payload"))
}

/// Send-only / receive-only halves for the non-participating fringe.
fn send_blob<C: Communicator>(comm: &C, peer: usize, tag: u16, payload: &[u8]) {
    comm.isend(peer, tag, payload).wait();
}

fn recv_blob<C: Communicator>(comm: &C, peer: usize, tag: u16) -> Result<Vec<u8>, RuleMeshError> {
    let mut probe = vec![0u8; 64];
    comm.irecv(peer, tag, &mut probe)
        .wait()
        .ok_or_else(|| RuleMeshError::comm(peer, "receive produced no payload"))
}

/// Generalized hypercube all-reduce over packed values.
///
/// Let `p` be the rank count and `dim` the bit count of the largest power
/// of two ≤ `p`. Ranks ≥ `2^dim` send their packed value to partner
/// `rank ^ 2^dim` and receive the final combined result from that partner
/// afterwards. Participating ranks fold in any paired fringe contribution,
/// then run `dim` rounds of pairwise exchange-and-join with partner
/// `rank ^ 2^i`, repacking after every round because serialized size may
/// change. Every rank returns the identical combined payload.
pub fn group_all_reduce<C: Communicator>(
    comm: &C,
    join: &dyn JoinOp,
    packed: Vec<u8>,
) -> Result<Vec<u8>, RuleMeshError> {
    let p = comm.size();
    let rank = comm.rank();
    if p <= 1 {
        return Ok(packed);
    }
    let dim = usize::BITS as usize - 1 - p.leading_zeros() as usize; // ⌊log2 p⌋
    let half = 1usize << dim;

    if rank >= half {
        // Fringe rank: contribute, then collect the final result.
        let partner = rank ^ half;
        send_blob(comm, partner, TAG_HYPERCUBE, &packed);
        return recv_blob(comm, partner, TAG_HYPERCUBE + 1);
    }

    let mut acc = packed;
    if rank + half < p {
        let contrib = recv_blob(comm, rank + half, TAG_HYPERCUBE)?;
        join.join(&mut acc, &contrib)?;
    }

    for i in 0..dim {
        let mut partner = rank ^ (1 << i);
        if partner >= p {
            // p need not be a power of two; stand in an existing rank.
            partner ^= half;
        }
        let round_tag = TAG_HYPERCUBE + 2 + i as u16;
        let other = exchange_blob(comm, partner, round_tag, &acc)?;
        join.join(&mut acc, &other)?;
    }

    if rank + half < p {
        send_blob(comm, rank + half, TAG_HYPERCUBE + 1, &acc);
    }
    Ok(acc)
}

/// Point-to-point local reduction for shared entities.
///
/// For each neighbor we both send our partial contributions for the
/// entities in its send set and fold the neighbor's contributions into our
/// copy over the receive sequence. Receivers post fixed-size probe buffers
/// sized by `probe_size` (the largest previously observed message); a
/// sender whose payload would not fit first sends only its required size as
/// a control message (tag 1), the receiver grows its buffer, and one resend
/// (tag 2) transmits the real payload. At most one resend per peer.
pub fn execute_comm_reduce<C: Communicator>(
    facts: &mut dyn FactStore,
    var: VarId,
    join: &dyn JoinOp,
    sends: &[(usize, EntitySet)],
    recvs: &[(usize, EntitySet)],
    comm: &C,
    probe_size: &mut usize,
) -> Result<(), RuleMeshError> {
    // Post all probe receives first.
    let mut pending: Vec<(usize, _)> = Vec::with_capacity(recvs.len());
    let mut probes: Vec<Vec<u8>> = Vec::with_capacity(recvs.len());
    for &(peer, _) in recvs {
        let mut buf = vec![0u8; (*probe_size).max(16)];
        let h = comm.irecv(peer, TAG_CONTROL, &mut buf);
        pending.push((peer, h));
        probes.push(buf);
    }

    // Pack and send. An exactly-8-byte payload is indistinguishable from a
    // size control message, so it always takes the two-phase path.
    let mut send_bufs: Vec<Vec<u8>> = Vec::with_capacity(sends.len());
    for (peer, set) in sends {
        let c = facts.get_variable(var)?;
        let mut buf = vec![0u8; c.pack_size(set)];
        let mut pos = 0;
        c.pack(&mut buf, &mut pos, set)?;
        if buf.len() > *probe_size || buf.len() == 8 {
            debug!(
                "reduce payload to rank {peer} is {} bytes (> probe {}); two-phase send",
                buf.len(),
                probe_size
            );
            send_blob(comm, *peer, TAG_CONTROL, &(buf.len() as u64).to_le_bytes());
            send_blob(comm, *peer, TAG_RESEND, &buf);
        } else {
            send_blob(comm, *peer, TAG_CONTROL, &buf);
        }
        send_bufs.push(buf);
    }

    // Drain receives, handling at most one resend per peer.
    let mut observed = *probe_size;
    for ((peer, h), _) in pending.into_iter().zip(probes) {
        let first = h
            .wait()
            .ok_or_else(|| RuleMeshError::comm(peer, "reduction receive failed"))?;
        let payload = if first.len() == 8 {
            let need = u64::from_le_bytes(first[..8].try_into().unwrap()) as usize;
            let mut grown = vec![0u8; need];
            let data = comm
                .irecv(peer, TAG_RESEND, &mut grown)
                .wait()
                .ok_or_else(|| RuleMeshError::comm(peer, "reduction resend failed"))?;
            data
        } else {
            first
        };
        observed = observed.max(payload.len());

        let seq = recvs
            .iter()
            .find(|(r, _)| *r == peer)
            .map(|(_, s)| s)
            .expect("pending receive has a recv set");
        // Fold: pack our current values, join, write back.
        let c = facts.get_variable(var)?;
        let mut acc = vec![0u8; c.pack_size(seq)];
        let mut pos = 0;
        c.pack(&mut acc, &mut pos, seq)?;
        join.join(&mut acc, &payload)?;
        let c = facts.get_variable_mut(var)?;
        let mut pos = 0;
        c.unpack(&acc, &mut pos, seq)?;
    }
    *probe_size = observed;
    Ok(())
}
