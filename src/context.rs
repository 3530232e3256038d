//! Explicit simulation context: field registry and time integration parameters.
//!
//! The context replaces ambient global state: it is constructed once at
//! startup and threaded by reference through every assembly call. Fields are
//! registered by name exactly once and referred to by their [`FieldId`]
//! afterwards, so hot loops never touch string keys.
use crate::error::{Error, Result};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Handle to a registered nodal field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldId(pub(crate) usize);

impl FieldId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Number of components a field stores per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Scalar,
    Vector,
}

/// Name → slot mapping for nodal fields.
#[derive(Debug, Default)]
pub struct FieldRegistry {
    names: Vec<String>,
    kinds: Vec<FieldKind>,
    lookup: FxHashMap<String, usize>,
}

impl FieldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a field name, returning its id. Registering the same name
    /// twice is a configuration error.
    pub fn register(&mut self, name: &str, kind: FieldKind) -> Result<FieldId> {
        if self.lookup.contains_key(name) {
            return Err(Error::Configuration(format!(
                "field '{name}' is already registered"
            )));
        }
        let id = self.names.len();
        self.names.push(name.to_string());
        self.kinds.push(kind);
        self.lookup.insert(name.to_string(), id);
        Ok(FieldId(id))
    }

    pub fn get(&self, name: &str) -> Option<FieldId> {
        self.lookup.get(name).copied().map(FieldId)
    }

    pub fn kind(&self, id: FieldId) -> FieldKind {
        self.kinds[id.0]
    }

    pub fn name(&self, id: FieldId) -> &str {
        &self.names[id.0]
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Bossak/Newmark time integration parameters shared by the primal and
/// adjoint assembly paths.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeIntegration {
    pub delta_time: f64,
    pub bossak_alpha: f64,
    pub newmark_gamma: f64,
}

impl TimeIntegration {
    /// Reaction coefficient augmented by the transient contribution of the
    /// Bossak scheme, `s + (1 - alpha) / (gamma dt)`.
    pub fn dynamic_reaction(&self, reaction: f64) -> f64 {
        reaction + (1.0 - self.bossak_alpha) / (self.newmark_gamma * self.delta_time)
    }

    /// Relaxed rate `(1 - alpha) rate_new + alpha rate_old`.
    pub fn relax_rate(&self, rate_new: f64, rate_old: f64) -> f64 {
        (1.0 - self.bossak_alpha) * rate_new + self.bossak_alpha * rate_old
    }
}

impl Default for TimeIntegration {
    fn default() -> Self {
        Self {
            delta_time: 1.0,
            bossak_alpha: -0.3,
            newmark_gamma: 0.5,
        }
    }
}

/// Everything the assembly kernels need besides the mesh and nodal data.
#[derive(Debug, Default)]
pub struct SimulationContext {
    pub fields: FieldRegistry,
    pub time: TimeIntegration,
}

impl SimulationContext {
    pub fn new(time: TimeIntegration) -> Self {
        Self {
            fields: FieldRegistry::new(),
            time,
        }
    }
}
