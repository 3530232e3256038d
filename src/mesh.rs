//! Node arena, cell connectivity and per-node field history.
//!
//! Nodes live in a flat arena; cells reference nodes by arena index. Every
//! node carries a globally unique id and an owning partition rank, so that a
//! partition's local mesh can reference nodes whose rows are assembled and
//! finalized elsewhere (ghost nodes). Cross-references between cells and
//! nodes are plain indices, never shared pointers.
use crate::context::{FieldId, FieldKind, FieldRegistry};
use crate::element::CellKind;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// A single element or boundary condition: a reference element kind plus an
/// ordered list of node indices into the owning mesh's arena.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cell {
    pub kind: CellKind,
    pub nodes: Vec<usize>,
    /// Inactive cells are skipped by every build loop.
    pub active: bool,
}

impl Cell {
    pub fn new(kind: CellKind, nodes: Vec<usize>) -> Self {
        Self {
            kind,
            nodes,
            active: true,
        }
    }
}

/// A partition-local mesh: the nodes visible to this partition (owned and
/// ghost) and the cells this partition owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mesh {
    dim: usize,
    /// Globally unique node ids, one per arena slot.
    node_ids: Vec<usize>,
    /// Rank of the partition that owns each node.
    node_owner: Vec<usize>,
    /// Interleaved coordinates, `dim` entries per node.
    coordinates: Vec<f64>,
    cells: Vec<Cell>,
    conditions: Vec<Cell>,
}

impl Mesh {
    pub fn new(
        dim: usize,
        node_ids: Vec<usize>,
        node_owner: Vec<usize>,
        coordinates: Vec<f64>,
    ) -> Result<Self> {
        if node_ids.len() != node_owner.len() || coordinates.len() != dim * node_ids.len() {
            return Err(Error::Configuration(format!(
                "inconsistent node arrays: {} ids, {} owners, {} coordinates for dim {}",
                node_ids.len(),
                node_owner.len(),
                coordinates.len(),
                dim
            )));
        }
        Ok(Self {
            dim,
            node_ids,
            node_owner,
            coordinates,
            cells: Vec::new(),
            conditions: Vec::new(),
        })
    }

    /// Convenience constructor for single-partition meshes: node ids are the
    /// arena indices and every node is owned by rank 0.
    pub fn new_serial(dim: usize, coordinates: Vec<f64>) -> Result<Self> {
        let num_nodes = coordinates.len() / dim;
        Self::new(
            dim,
            (0..num_nodes).collect(),
            vec![0; num_nodes],
            coordinates,
        )
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn num_nodes(&self) -> usize {
        self.node_ids.len()
    }

    pub fn node_id(&self, node: usize) -> usize {
        self.node_ids[node]
    }

    pub fn node_owner(&self, node: usize) -> usize {
        self.node_owner[node]
    }

    pub fn node_position(&self, node: usize) -> &[f64] {
        &self.coordinates[self.dim * node..self.dim * (node + 1)]
    }

    pub fn node_position_mut(&mut self, node: usize) -> &mut [f64] {
        &mut self.coordinates[self.dim * node..self.dim * (node + 1)]
    }

    pub fn push_cell(&mut self, cell: Cell) -> Result<usize> {
        self.validate_cell(&cell)?;
        self.cells.push(cell);
        Ok(self.cells.len() - 1)
    }

    pub fn push_condition(&mut self, cell: Cell) -> Result<usize> {
        self.validate_cell(&cell)?;
        self.conditions.push(cell);
        Ok(self.conditions.len() - 1)
    }

    fn validate_cell(&self, cell: &Cell) -> Result<()> {
        if cell.nodes.len() != cell.kind.num_nodes() {
            return Err(Error::Configuration(format!(
                "{:?} cell must reference {} nodes, got {}",
                cell.kind,
                cell.kind.num_nodes(),
                cell.nodes.len()
            )));
        }
        if let Some(&node) = cell.nodes.iter().find(|&&n| n >= self.num_nodes()) {
            return Err(Error::Configuration(format!(
                "cell references node {node}, but the mesh has only {} nodes",
                self.num_nodes()
            )));
        }
        Ok(())
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cells_mut(&mut self) -> &mut [Cell] {
        &mut self.cells
    }

    pub fn conditions(&self) -> &[Cell] {
        &self.conditions
    }
}

#[derive(Debug, Clone)]
struct FieldData {
    components: usize,
    steps: usize,
    /// Layout: `values[(step * num_nodes + node) * components + c]`.
    values: Vec<f64>,
}

/// Time-indexed nodal field storage.
///
/// Step 0 is the current solution step, step 1 the previous one, and so on.
/// Values are mutated every solution step; the storage itself is allocated
/// once per run.
#[derive(Debug, Clone, Default)]
pub struct FieldStore {
    num_nodes: usize,
    dim: usize,
    fields: Vec<Option<FieldData>>,
}

impl FieldStore {
    /// Allocates zero-initialized history buffers (`steps` time levels) for
    /// every field in the registry.
    pub fn with_registry(registry: &FieldRegistry, mesh: &Mesh, steps: usize) -> Self {
        let mut store = Self {
            num_nodes: mesh.num_nodes(),
            dim: mesh.dim(),
            fields: Vec::new(),
        };
        for slot in 0..registry.len() {
            let id = FieldId(slot);
            let components = match registry.kind(id) {
                FieldKind::Scalar => 1,
                FieldKind::Vector => mesh.dim(),
            };
            store.fields.push(Some(FieldData {
                components,
                steps,
                values: vec![0.0; steps * mesh.num_nodes() * components],
            }));
        }
        store
    }

    fn data(&self, id: FieldId) -> &FieldData {
        self.fields[id.0]
            .as_ref()
            .expect("field has no allocated storage")
    }

    fn data_mut(&mut self, id: FieldId) -> &mut FieldData {
        self.fields[id.0]
            .as_mut()
            .expect("field has no allocated storage")
    }

    fn offset(data: &FieldData, num_nodes: usize, node: usize, step: usize) -> usize {
        debug_assert!(step < data.steps, "history step out of range");
        (step * num_nodes + node) * data.components
    }

    pub fn scalar(&self, id: FieldId, node: usize, step: usize) -> f64 {
        let data = self.data(id);
        debug_assert_eq!(data.components, 1);
        data.values[Self::offset(data, self.num_nodes, node, step)]
    }

    pub fn set_scalar(&mut self, id: FieldId, node: usize, step: usize, value: f64) {
        let num_nodes = self.num_nodes;
        let data = self.data_mut(id);
        debug_assert_eq!(data.components, 1);
        let at = Self::offset(data, num_nodes, node, step);
        data.values[at] = value;
    }

    pub fn vector(&self, id: FieldId, node: usize, step: usize) -> &[f64] {
        let data = self.data(id);
        let at = Self::offset(data, self.num_nodes, node, step);
        &data.values[at..at + data.components]
    }

    pub fn set_vector(&mut self, id: FieldId, node: usize, step: usize, value: &[f64]) {
        let num_nodes = self.num_nodes;
        let data = self.data_mut(id);
        assert_eq!(value.len(), data.components);
        let at = Self::offset(data, num_nodes, node, step);
        data.values[at..at + data.components].copy_from_slice(value);
    }

    /// Shifts every field's history one step back (step 0 → step 1, etc.),
    /// leaving step 0 unchanged as the starting guess for the new step.
    pub fn advance_step(&mut self) {
        let num_nodes = self.num_nodes;
        for data in self.fields.iter_mut().flatten() {
            let stride = num_nodes * data.components;
            for step in (1..data.steps).rev() {
                let (front, back) = data.values.split_at_mut(step * stride);
                back[..stride].copy_from_slice(&front[(step - 1) * stride..step * stride]);
            }
        }
    }

    /// Number of components the field stores per node, if it has allocated
    /// storage.
    pub fn components(&self, id: FieldId) -> Option<usize> {
        self.fields
            .get(id.0)
            .and_then(|data| data.as_ref())
            .map(|data| data.components)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }
}
