//! Rule descriptors and the rule database.
//!
//! A rule is a pure function over named variables, with set-relational
//! source/target/constraint clauses describing how entities are transformed
//! through relation chains before reaching the rule body. Internal rules
//! (rename/promote/generalize/priority, supernode markers) are structural:
//! they carry no body and exist only to shape the dependency graph.

use crate::entity::{EntitySet, VarId};
use crate::exec::reduce::JoinOp;
use crate::facts::container::Container;
use crate::facts::store::FactStore;
use crate::rule_error::RuleMeshError;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Dense handle for a rule in the [`RuleDatabase`]. Encoded as a negative
/// vertex id in the dependency graph.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(pub u32);

impl fmt::Debug for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// One source/target/constraint clause: a variable set reached through an
/// ordered mapping chain. The chain is applied outermost-first: entities
/// pass through `mapping[0]`, then `mapping[1]`, ... before indexing `vars`.
/// Each mapping level is itself a set of map variables whose images union.
#[derive(Clone, Debug, Default)]
pub struct Clause {
    pub vars: Vec<VarId>,
    pub mapping: Vec<Vec<VarId>>,
}

impl Clause {
    /// Clause with no mapping chain.
    pub fn direct<I: IntoIterator<Item = VarId>>(vars: I) -> Self {
        Clause {
            vars: vars.into_iter().collect(),
            mapping: Vec::new(),
        }
    }

    /// Clause whose variables are reached through `chain`.
    pub fn mapped<I, C, L>(vars: I, chain: C) -> Self
    where
        I: IntoIterator<Item = VarId>,
        C: IntoIterator<Item = L>,
        L: IntoIterator<Item = VarId>,
    {
        Clause {
            vars: vars.into_iter().collect(),
            mapping: chain
                .into_iter()
                .map(|l| l.into_iter().collect())
                .collect(),
        }
    }
}

/// Classification of a concrete rule's evaluation semantics.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RuleClass {
    /// One output entity per input entity.
    Pointwise,
    /// Produces a single parameter-like value.
    Singleton,
    /// Produces over the whole universe (no source narrowing).
    Unit,
    /// Associative reduction; carries a join operator.
    Apply,
    /// Fallback producer, overridden by priority synonyms.
    Default,
    /// Executes only when its condition variable tests true.
    Optional,
    /// Pure constraint; produces no values.
    Constraint,
    /// Opaque body; the engine makes no structural assumptions.
    Blackbox,
}

/// Structural qualifier distinguishing internal rules from concrete ones.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Qualifier {
    /// Ordinary user rule.
    Concrete,
    /// Target is a new name for the source's storage.
    Rename,
    /// Source at an outer time level feeds an inner one (loop entry).
    Promote,
    /// Specific variable stands in for a general one.
    Generalize,
    /// Priority synonym resolution.
    Priority,
    /// Marker vertex standing for a nested schedulable sub-graph.
    Supernode(usize),
}

impl Qualifier {
    /// Rename/promote/generalize/priority rules alias storage rather than
    /// computing values; lifetime analysis collapses their chains.
    pub fn is_recurrence(&self) -> bool {
        matches!(
            self,
            Qualifier::Rename | Qualifier::Promote | Qualifier::Generalize | Qualifier::Priority
        )
    }
}

/// Callable body of a concrete rule.
///
/// The entity set to compute over is rebound on every invocation by
/// argument; rules needing scratch state across invocations should keep it
/// behind a `parking_lot::Mutex`.
pub trait RuleImpl: Send + Sync {
    fn compute(&self, facts: &mut dyn FactStore, seq: &EntitySet) -> Result<(), RuleMeshError>;

    /// Whether independent entity-set partitions of one invocation may run
    /// on separate threads.
    fn thread_safe(&self) -> bool {
        false
    }
}

/// Adapter turning a closure into a [`RuleImpl`].
pub struct FnRule<F> {
    f: F,
    thread_safe: bool,
}

impl<F> FnRule<F>
where
    F: Fn(&mut dyn FactStore, &EntitySet) -> Result<(), RuleMeshError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            thread_safe: false,
        }
    }

    pub fn thread_safe(mut self) -> Self {
        self.thread_safe = true;
        self
    }
}

impl<F> RuleImpl for FnRule<F>
where
    F: Fn(&mut dyn FactStore, &EntitySet) -> Result<(), RuleMeshError> + Send + Sync,
{
    fn compute(&self, facts: &mut dyn FactStore, seq: &EntitySet) -> Result<(), RuleMeshError> {
        (self.f)(facts, seq)
    }

    fn thread_safe(&self) -> bool {
        self.thread_safe
    }
}

/// Factory producing a fresh container for a target variable, used by
/// allocation exec nodes.
pub type ContainerFactory = Arc<dyn Fn() -> Box<dyn Container> + Send + Sync>;

/// Fully described rule: clauses, class, qualifier, body, and per-target
/// container factories.
#[derive(Clone)]
pub struct RuleDescriptor {
    pub name: String,
    pub sources: Vec<Clause>,
    pub targets: Vec<Clause>,
    pub constraints: Vec<Clause>,
    pub class: RuleClass,
    pub qualifier: Qualifier,
    /// Condition variable guarding an `Optional` rule.
    pub condition: Option<VarId>,
    pub imp: Option<Arc<dyn RuleImpl>>,
    /// Join operator for `Apply` (reduction) rules.
    pub join: Option<Arc<dyn JoinOp>>,
    pub factories: Vec<(VarId, ContainerFactory)>,
}

impl fmt::Debug for RuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleDescriptor")
            .field("name", &self.name)
            .field("class", &self.class)
            .field("qualifier", &self.qualifier)
            .field("sources", &self.sources)
            .field("targets", &self.targets)
            .field("constraints", &self.constraints)
            .finish_non_exhaustive()
    }
}

impl RuleDescriptor {
    pub fn concrete(name: impl Into<String>, class: RuleClass) -> Self {
        RuleDescriptor {
            name: name.into(),
            sources: Vec::new(),
            targets: Vec::new(),
            constraints: Vec::new(),
            class,
            qualifier: Qualifier::Concrete,
            condition: None,
            imp: None,
            join: None,
            factories: Vec::new(),
        }
    }

    pub fn internal(name: impl Into<String>, qualifier: Qualifier) -> Self {
        RuleDescriptor {
            name: name.into(),
            sources: Vec::new(),
            targets: Vec::new(),
            constraints: Vec::new(),
            class: RuleClass::Pointwise,
            qualifier,
            condition: None,
            imp: None,
            join: None,
            factories: Vec::new(),
        }
    }

    pub fn source(mut self, c: Clause) -> Self {
        self.sources.push(c);
        self
    }

    pub fn target(mut self, c: Clause) -> Self {
        self.targets.push(c);
        self
    }

    pub fn constraint(mut self, c: Clause) -> Self {
        self.constraints.push(c);
        self
    }

    pub fn body(mut self, imp: Arc<dyn RuleImpl>) -> Self {
        self.imp = Some(imp);
        self
    }

    pub fn joined_by(mut self, join: Arc<dyn JoinOp>) -> Self {
        self.join = Some(join);
        self
    }

    pub fn conditional_on(mut self, var: VarId) -> Self {
        self.condition = Some(var);
        self
    }

    pub fn factory(
        mut self,
        var: VarId,
        f: impl Fn() -> Box<dyn Container> + Send + Sync + 'static,
    ) -> Self {
        self.factories.push((var, Arc::new(f)));
        self
    }

    /// All variables read by this rule (sources, constraints, mapping
    /// levels, condition), deduplicated.
    pub fn input_vars(&self) -> BTreeSet<VarId> {
        let mut out = BTreeSet::new();
        for c in self.sources.iter().chain(self.constraints.iter()) {
            out.extend(c.vars.iter().copied());
            for level in &c.mapping {
                out.extend(level.iter().copied());
            }
        }
        // Target mapping chains are also read (they are relations).
        for c in &self.targets {
            for level in &c.mapping {
                out.extend(level.iter().copied());
            }
        }
        out.extend(self.condition);
        out
    }

    /// All variables written by this rule.
    pub fn output_vars(&self) -> BTreeSet<VarId> {
        self.targets
            .iter()
            .flat_map(|c| c.vars.iter().copied())
            .collect()
    }

    pub fn container_factory(&self, var: VarId) -> Option<&ContainerFactory> {
        self.factories.iter().find(|(v, _)| *v == var).map(|(_, f)| f)
    }
}

/// Registry of rule descriptors with deterministic dense ids.
#[derive(Default)]
pub struct RuleDatabase {
    rules: Vec<RuleDescriptor>,
}

impl RuleDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, r: RuleDescriptor) -> RuleId {
        let id = RuleId(self.rules.len() as u32);
        self.rules.push(r);
        id
    }

    pub fn get(&self, id: RuleId) -> Result<&RuleDescriptor, RuleMeshError> {
        self.rules
            .get(id.0 as usize)
            .ok_or(RuleMeshError::UnknownRule(id.0 as i32))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RuleId, &RuleDescriptor)> {
        self.rules
            .iter()
            .enumerate()
            .map(|(i, r)| (RuleId(i as u32), r))
    }

    /// Rules with `var` among their targets, in id order.
    pub fn rules_producing(&self, var: VarId) -> Vec<RuleId> {
        self.iter()
            .filter(|(_, r)| r.output_vars().contains(&var))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn name_of(&self, id: RuleId) -> String {
        self.rules
            .get(id.0 as usize)
            .map(|r| r.name.clone())
            .unwrap_or_else(|| format!("{id:?}"))
    }
}
