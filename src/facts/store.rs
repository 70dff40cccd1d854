//! Fact store: named containers plus the partition/ownership table.

use crate::entity::{EntitySet, VarId};
use crate::facts::container::{Container, MapContainer};
use crate::rule_error::RuleMeshError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Result of pulling a set back through a relation.
///
/// `intersection` contains entities *all* of whose images are in the query
/// set; `union` contains entities with *any* image in it. Source-clause
/// existence uses `intersection` (a rule needs every accessed value to
/// exist); request propagation uses `union`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Preimage {
    pub intersection: EntitySet,
    pub union: EntitySet,
}

/// Per-rank entity ownership and ghosting metadata.
///
/// `my_entities` are the entities this rank owns. `copy[r]` lists the ghost
/// entities this rank keeps copies of that rank `r` owns; `xmit[r]` lists
/// this rank's own entities that rank `r` ghosts. Both tables are derived
/// from the same global partition on every rank, so they are mutually
/// consistent without negotiation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DistributeInfo {
    pub rank: usize,
    pub size: usize,
    pub my_entities: EntitySet,
    pub copy: Vec<(usize, EntitySet)>,
    pub xmit: Vec<(usize, EntitySet)>,
}

impl DistributeInfo {
    /// All ghost entities held locally (union over `copy`).
    pub fn clone_region(&self) -> EntitySet {
        let mut out = EntitySet::new();
        for (_, s) in &self.copy {
            out.union_with(s);
        }
        out
    }

    /// Entities in `set` not owned by this rank.
    pub fn not_owned(&self, set: &EntitySet) -> EntitySet {
        set.difference(&self.my_entities)
    }
}

/// Interface the scheduler uses to query facts and relations.
pub trait FactStore: Send {
    fn get_variable(&self, var: VarId) -> Result<&dyn Container, RuleMeshError>;
    fn get_variable_mut(&mut self, var: VarId)
    -> Result<&mut (dyn Container + '_), RuleMeshError>;

    /// Install (or replace) the container backing `var`.
    fn create_fact(&mut self, var: VarId, c: Box<dyn Container>);

    /// Drop the container backing `var`, if present.
    fn delete_fact(&mut self, var: VarId);

    /// Exchange the containers backing `a` and `b` (loop buffer rotation).
    fn swap_facts(&mut self, a: VarId, b: VarId) -> Result<(), RuleMeshError>;

    /// Move the container backing `from` to `to` (recurrence aliasing:
    /// rename/promote chains share one storage location over time). `from`
    /// loses its storage; any previous container at `to` is dropped.
    fn rename_fact(&mut self, from: VarId, to: VarId) -> Result<(), RuleMeshError>;

    fn is_a_map(&self, var: VarId) -> bool;

    /// Forward image of `set` through the relation stored at `var`.
    fn image(&self, var: VarId, set: &EntitySet) -> Result<EntitySet, RuleMeshError>;

    /// Pre-image of `set` through the relation stored at `var`.
    fn preimage(&self, var: VarId, set: &EntitySet) -> Result<Preimage, RuleMeshError>;

    /// Ownership table; `None` for a purely local run.
    fn distribute_info(&self) -> Option<&DistributeInfo>;
}

/// In-memory fact store used by the engine's own tests and by serial hosts.
#[derive(Default)]
pub struct InMemoryFacts {
    facts: HashMap<VarId, Box<dyn Container>>,
    dist: Option<DistributeInfo>,
}

impl InMemoryFacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn distributed(dist: DistributeInfo) -> Self {
        Self {
            facts: HashMap::new(),
            dist: Some(dist),
        }
    }

    fn map_at(&self, var: VarId) -> Result<&MapContainer, RuleMeshError> {
        self.get_variable(var)?
            .as_any()
            .downcast_ref::<MapContainer>()
            .ok_or_else(|| RuleMeshError::NotAMap(format!("{var:?}")))
    }
}

impl FactStore for InMemoryFacts {
    fn get_variable(&self, var: VarId) -> Result<&dyn Container, RuleMeshError> {
        self.facts
            .get(&var)
            .map(|b| b.as_ref())
            .ok_or_else(|| RuleMeshError::MissingFact(format!("{var:?}")))
    }

    fn get_variable_mut(
        &mut self,
        var: VarId,
    ) -> Result<&mut (dyn Container + '_), RuleMeshError> {
        match self.facts.get_mut(&var) {
            Some(b) => Ok(b.as_mut()),
            None => Err(RuleMeshError::MissingFact(format!("{var:?}"))),
        }
    }

    fn create_fact(&mut self, var: VarId, c: Box<dyn Container>) {
        self.facts.insert(var, c);
    }

    fn delete_fact(&mut self, var: VarId) {
        self.facts.remove(&var);
    }

    fn swap_facts(&mut self, a: VarId, b: VarId) -> Result<(), RuleMeshError> {
        if !self.facts.contains_key(&a) {
            return Err(RuleMeshError::MissingFact(format!("{a:?}")));
        }
        if !self.facts.contains_key(&b) {
            return Err(RuleMeshError::MissingFact(format!("{b:?}")));
        }
        if a != b {
            let ca = self.facts.remove(&a).unwrap();
            let cb = self.facts.insert(b, ca).unwrap();
            self.facts.insert(a, cb);
        }
        Ok(())
    }

    fn rename_fact(&mut self, from: VarId, to: VarId) -> Result<(), RuleMeshError> {
        if from == to {
            return Ok(());
        }
        let c = self
            .facts
            .remove(&from)
            .ok_or_else(|| RuleMeshError::MissingFact(format!("{from:?}")))?;
        self.facts.insert(to, c);
        Ok(())
    }

    fn is_a_map(&self, var: VarId) -> bool {
        self.facts
            .get(&var)
            .is_some_and(|c| c.as_any().is::<MapContainer>())
    }

    fn image(&self, var: VarId, set: &EntitySet) -> Result<EntitySet, RuleMeshError> {
        Ok(self.map_at(var)?.image(set))
    }

    fn preimage(&self, var: VarId, set: &EntitySet) -> Result<Preimage, RuleMeshError> {
        let (intersection, union) = self.map_at(var)?.preimage(set);
        Ok(Preimage {
            intersection,
            union,
        })
    }

    fn distribute_info(&self) -> Option<&DistributeInfo> {
        self.dist.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::container::SliceContainer;

    #[test]
    fn fact_lookup_and_delete() {
        let mut db = InMemoryFacts::new();
        let v = VarId(0);
        assert!(matches!(
            db.get_variable(v),
            Err(RuleMeshError::MissingFact(_))
        ));
        db.create_fact(v, Box::new(SliceContainer::<f64>::new()));
        assert!(db.get_variable(v).is_ok());
        assert!(!db.is_a_map(v));
        db.delete_fact(v);
        assert!(db.get_variable(v).is_err());
    }

    #[test]
    fn swap_exchanges_backing_containers() {
        let mut db = InMemoryFacts::new();
        let (a, b) = (VarId(0), VarId(1));
        let dom = EntitySet::from_interval(0, 3);
        db.create_fact(a, Box::new(SliceContainer::from_fn(&dom, |e| e)));
        db.create_fact(b, Box::new(SliceContainer::from_fn(&dom, |e| -e)));
        db.swap_facts(a, b).unwrap();
        let ca = db
            .get_variable(a)
            .unwrap()
            .as_any()
            .downcast_ref::<SliceContainer<i32>>()
            .unwrap();
        assert_eq!(ca.get(2), Some(&-2));
        assert!(db.swap_facts(a, VarId(9)).is_err());
    }

    #[test]
    fn image_requires_a_map() {
        let mut db = InMemoryFacts::new();
        let v = VarId(1);
        db.create_fact(v, Box::new(SliceContainer::<i32>::new()));
        assert!(matches!(
            db.image(v, &EntitySet::universe()),
            Err(RuleMeshError::NotAMap(_))
        ));
    }

    #[test]
    fn distribute_info_clone_region() {
        let dist = DistributeInfo {
            rank: 0,
            size: 2,
            my_entities: EntitySet::from_interval(0, 49),
            copy: vec![(1, EntitySet::from_interval(50, 59))],
            xmit: vec![(1, EntitySet::from_interval(40, 49))],
        };
        assert_eq!(dist.clone_region(), EntitySet::from_interval(50, 59));
        assert_eq!(
            dist.not_owned(&EntitySet::from_interval(45, 55)),
            EntitySet::from_interval(50, 55)
        );
    }
}
