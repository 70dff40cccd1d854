//! Container contract for per-entity values, plus the two implementations
//! the engine itself needs: dense POD stores and entity-relation maps.
//!
//! Containers own the wire layout of their values. Communication and
//! reduction treat payloads as opaque packed bytes; `pack_size`/`pack`/
//! `unpack` are the only contract (see the communication scheduler).

use crate::entity::{Entity, EntitySet};
use crate::rule_error::RuleMeshError;
use bytemuck::Pod;
use std::any::Any;
use std::collections::HashMap;

/// Per-entity value storage as seen by the engine.
pub trait Container: Send + Sync {
    /// Entities this container currently holds values for.
    fn domain(&self) -> EntitySet;

    /// Ensure storage exists for every entity in `set`.
    fn allocate(&mut self, set: &EntitySet);

    /// Release storage; after this the container's domain is empty.
    fn deallocate(&mut self);

    /// Exact number of bytes `pack` will write for `set`.
    fn pack_size(&self, set: &EntitySet) -> usize;

    /// Append values for `set` (ascending entity order) into `buf` at `*pos`.
    fn pack(
        &self,
        buf: &mut [u8],
        pos: &mut usize,
        set: &EntitySet,
    ) -> Result<(), RuleMeshError>;

    /// Read values for `seq` (ascending entity order) from `buf` at `*pos`.
    fn unpack(
        &mut self,
        buf: &[u8],
        pos: &mut usize,
        seq: &EntitySet,
    ) -> Result<(), RuleMeshError>;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Dense per-entity store of a fixed-size POD value.
#[derive(Clone, Debug, Default)]
pub struct SliceContainer<T> {
    data: HashMap<Entity, T>,
}

impl<T: Pod + Default + Send + Sync> SliceContainer<T> {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
        }
    }

    pub fn from_fn(set: &EntitySet, mut f: impl FnMut(Entity) -> T) -> Self {
        let mut c = Self::new();
        for e in set.iter() {
            c.data.insert(e, f(e));
        }
        c
    }

    pub fn get(&self, e: Entity) -> Option<&T> {
        self.data.get(&e)
    }

    pub fn set(&mut self, e: Entity, v: T) {
        self.data.insert(e, v);
    }
}

impl<T: Pod + Default + Send + Sync + 'static> Container for SliceContainer<T> {
    fn domain(&self) -> EntitySet {
        self.data.keys().copied().collect()
    }

    fn allocate(&mut self, set: &EntitySet) {
        for e in set.iter() {
            self.data.entry(e).or_default();
        }
    }

    fn deallocate(&mut self) {
        self.data.clear();
        self.data.shrink_to_fit();
    }

    fn pack_size(&self, set: &EntitySet) -> usize {
        set.size() * std::mem::size_of::<T>()
    }

    fn pack(
        &self,
        buf: &mut [u8],
        pos: &mut usize,
        set: &EntitySet,
    ) -> Result<(), RuleMeshError> {
        let width = std::mem::size_of::<T>();
        for e in set.iter() {
            let v = self.data.get(&e).ok_or_else(|| {
                RuleMeshError::InvariantViolation(format!("pack of unallocated entity {e}"))
            })?;
            buf[*pos..*pos + width].copy_from_slice(bytemuck::bytes_of(v));
            *pos += width;
        }
        Ok(())
    }

    fn unpack(
        &mut self,
        buf: &[u8],
        pos: &mut usize,
        seq: &EntitySet,
    ) -> Result<(), RuleMeshError> {
        let width = std::mem::size_of::<T>();
        for e in seq.iter() {
            if *pos + width > buf.len() {
                return Err(RuleMeshError::PackSizeMismatch {
                    var: format!("entity {e}"),
                    declared: width,
                    moved: buf.len() - *pos,
                });
            }
            let v: T = bytemuck::pod_read_unaligned(&buf[*pos..*pos + width]);
            self.data.insert(e, v);
            *pos += width;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Entity-relation container: a possibly multi-valued map from entities to
/// entities, used as the levels of clause mapping chains.
#[derive(Clone, Debug, Default)]
pub struct MapContainer {
    rel: HashMap<Entity, Vec<Entity>>,
}

impl MapContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I: IntoIterator<Item = (Entity, Entity)>>(pairs: I) -> Self {
        let mut m = Self::new();
        for (src, dst) in pairs {
            m.rel.entry(src).or_default().push(dst);
        }
        m
    }

    pub fn add(&mut self, src: Entity, dst: Entity) {
        self.rel.entry(src).or_default().push(dst);
    }

    /// Forward image of `set` through this relation.
    pub fn image(&self, set: &EntitySet) -> EntitySet {
        let mut out = Vec::new();
        for e in set.iter() {
            if let Some(ts) = self.rel.get(&e) {
                out.extend(ts.iter().map(|&t| (t, t)));
            }
        }
        EntitySet::from_intervals(out)
    }

    /// Pre-image of `set`: domain entities whose images land in `set`.
    ///
    /// `intersection` requires *all* of an entity's images to be in `set`;
    /// `union` requires at least one. They coincide for single-valued maps.
    pub fn preimage(&self, set: &EntitySet) -> (EntitySet, EntitySet) {
        let mut all = Vec::new();
        let mut any = Vec::new();
        for (&src, dsts) in &self.rel {
            let hit = dsts.iter().filter(|&&d| set.contains(d)).count();
            if hit > 0 {
                any.push((src, src));
                if hit == dsts.len() {
                    all.push((src, src));
                }
            }
        }
        (
            EntitySet::from_intervals(all),
            EntitySet::from_intervals(any),
        )
    }
}

impl Container for MapContainer {
    fn domain(&self) -> EntitySet {
        self.rel.keys().copied().collect()
    }

    fn allocate(&mut self, set: &EntitySet) {
        for e in set.iter() {
            self.rel.entry(e).or_default();
        }
    }

    fn deallocate(&mut self) {
        self.rel.clear();
    }

    fn pack_size(&self, set: &EntitySet) -> usize {
        // u32 arity header + 4 bytes per image entity.
        set.iter()
            .map(|e| 4 + 4 * self.rel.get(&e).map_or(0, |v| v.len()))
            .sum()
    }

    fn pack(
        &self,
        buf: &mut [u8],
        pos: &mut usize,
        set: &EntitySet,
    ) -> Result<(), RuleMeshError> {
        for e in set.iter() {
            let dsts = self.rel.get(&e).map(Vec::as_slice).unwrap_or(&[]);
            buf[*pos..*pos + 4].copy_from_slice(&(dsts.len() as u32).to_le_bytes());
            *pos += 4;
            for &d in dsts {
                buf[*pos..*pos + 4].copy_from_slice(&d.to_le_bytes());
                *pos += 4;
            }
        }
        Ok(())
    }

    fn unpack(
        &mut self,
        buf: &[u8],
        pos: &mut usize,
        seq: &EntitySet,
    ) -> Result<(), RuleMeshError> {
        for e in seq.iter() {
            if *pos + 4 > buf.len() {
                return Err(RuleMeshError::PackSizeMismatch {
                    var: format!("map entity {e}"),
                    declared: 4,
                    moved: buf.len() - *pos,
                });
            }
            let n = u32::from_le_bytes(buf[*pos..*pos + 4].try_into().unwrap()) as usize;
            *pos += 4;
            let mut dsts = Vec::with_capacity(n);
            for _ in 0..n {
                let d = i32::from_le_bytes(buf[*pos..*pos + 4].try_into().unwrap());
                dsts.push(d);
                *pos += 4;
            }
            self.rel.insert(e, dsts);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
