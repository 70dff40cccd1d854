//! Symbolic variables and their interning registry.
//!
//! A [`Variable`] is a structured identity, not a value: base name plus an
//! optional per-iteration time reference (`x{n}`, `x{n+1}`), an optional
//! namespace path, and an ordered priority-qualifier list. Two variables
//! that differ only in priority or namespace are *synonyms* of one storage
//! location; the scheduling database records that relationship instead of
//! ever duplicating storage.
//!
//! Variables are interned to dense [`VarId`]s so the dependency graph can
//! refer to them with plain integers (non-negative vertex ids).

use crate::rule_error::RuleMeshError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Dense handle for an interned variable. Doubles as a non-negative vertex
/// id in the dependency graph.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VarId(pub u32);

impl fmt::Debug for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Reference to a loop's iteration counter, with a relative offset.
///
/// `x{n}` is `TimeRef { level: "n", offset: 0 }`; `x{n+1}` has `offset: 1`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Debug)]
pub struct TimeRef {
    pub level: String,
    pub offset: i32,
}

/// Structured symbolic variable identity.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Variable {
    pub name: String,
    pub time: Option<TimeRef>,
    pub namespace: Vec<String>,
    pub priority: Vec<String>,
}

impl Variable {
    pub fn named(name: impl Into<String>) -> Self {
        Variable {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Attach a time reference: `Variable::named("x").at("n", 1)` is `x{n+1}`.
    pub fn at(mut self, level: impl Into<String>, offset: i32) -> Self {
        self.time = Some(TimeRef {
            level: level.into(),
            offset,
        });
        self
    }

    pub fn in_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace.push(ns.into());
        self
    }

    pub fn with_priority(mut self, p: impl Into<String>) -> Self {
        self.priority.push(p.into());
        self
    }

    /// The underlying storage identity: priority and namespace stripped.
    /// Synonyms share a `base()`.
    pub fn base(&self) -> Variable {
        Variable {
            name: self.name.clone(),
            time: self.time.clone(),
            namespace: Vec::new(),
            priority: Vec::new(),
        }
    }

    /// Same variable shifted by `delta` loop iterations; identity for
    /// time-independent variables.
    pub fn with_offset(&self, delta: i32) -> Variable {
        let mut v = self.clone();
        if let Some(t) = v.time.as_mut() {
            t.offset += delta;
        }
        v
    }

    /// Strip the leading priority qualifier, if any.
    pub fn drop_priority(&self) -> Variable {
        let mut v = self.clone();
        if !v.priority.is_empty() {
            v.priority.remove(0);
        }
        v
    }

    pub fn is_time_dependent(&self) -> bool {
        self.time.is_some()
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for p in &self.priority {
            write!(f, "{p}::")?;
        }
        for ns in &self.namespace {
            write!(f, "{ns}@")?;
        }
        write!(f, "{}", self.name)?;
        if let Some(t) = &self.time {
            match t.offset {
                0 => write!(f, "{{{}}}", t.level)?,
                o if o > 0 => write!(f, "{{{}+{}}}", t.level, o)?,
                o => write!(f, "{{{}{}}}", t.level, o)?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Interning table mapping [`Variable`] identities to dense [`VarId`]s.
///
/// Interning is append-only and deterministic in first-reference order, so
/// every rank building the same rule database derives identical ids.
#[derive(Default, Debug)]
pub struct VariableRegistry {
    vars: Vec<Variable>,
    ids: HashMap<Variable, VarId>,
}

impl VariableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `v`, returning its existing id when already present.
    pub fn intern(&mut self, v: Variable) -> VarId {
        if let Some(&id) = self.ids.get(&v) {
            return id;
        }
        let id = VarId(self.vars.len() as u32);
        self.vars.push(v.clone());
        self.ids.insert(v, id);
        id
    }

    pub fn lookup(&self, v: &Variable) -> Option<VarId> {
        self.ids.get(v).copied()
    }

    pub fn get(&self, id: VarId) -> Result<&Variable, RuleMeshError> {
        self.vars
            .get(id.0 as usize)
            .ok_or_else(|| RuleMeshError::UnknownVariable(format!("{id:?}")))
    }

    /// Display name for diagnostics; falls back to the raw id.
    pub fn name_of(&self, id: VarId) -> String {
        self.vars
            .get(id.0 as usize)
            .map(|v| v.to_string())
            .unwrap_or_else(|| format!("{id:?}"))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (VarId, &Variable)> {
        self.vars
            .iter()
            .enumerate()
            .map(|(i, v)| (VarId(i as u32), v))
    }
}
