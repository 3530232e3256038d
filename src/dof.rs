//! Degrees of freedom and their partition-global numbering.
//!
//! A dof is a (node, field) pair. Collection gathers every dof referenced by
//! the cells and conditions of the partition-local mesh; numbering assigns
//! globally unique, per-partition contiguous equation ids to owned dofs via
//! an exclusive prefix sum over partitions, then learns the ids of ghost
//! dofs from their owners. Ids are immutable once assigned; re-collection
//! after a mesh change requires an explicit [`DofSet::reset`].
use crate::comm::Communicator;
use crate::context::FieldId;
use crate::error::{Error, Result};
use crate::mesh::Mesh;
use log::debug;
use rustc_hash::FxHashMap;

/// A single degree of freedom attached to a node.
#[derive(Debug, Clone)]
pub struct Dof {
    /// Arena index of the node in the partition-local mesh.
    pub node: usize,
    /// Globally unique node identity.
    pub node_id: usize,
    pub field: FieldId,
    /// Rank of the partition that owns (numbers and finalizes) this dof.
    pub owner: usize,
    pub fixed: bool,
    equation_id: Option<usize>,
}

impl Dof {
    pub fn equation_id(&self) -> Option<usize> {
        self.equation_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DofSetState {
    Uninitialized,
    Collected,
    Numbered,
}

/// The dof container of one partition.
#[derive(Debug, Default)]
pub struct DofSet {
    state: Option<DofSetState>,
    dofs: Vec<Dof>,
    /// Lookup by (arena node index, field).
    by_node: FxHashMap<(usize, usize), usize>,
    owned_count: usize,
    first_owned_id: usize,
    global_size: usize,
}

impl DofSet {
    pub fn new() -> Self {
        Self {
            state: Some(DofSetState::Uninitialized),
            ..Default::default()
        }
    }

    pub fn state(&self) -> DofSetState {
        self.state.unwrap_or(DofSetState::Uninitialized)
    }

    /// Gathers every (node, field) pair referenced by the mesh's cells and
    /// conditions, deduplicated by identity and sorted by (global node id,
    /// field) so that numbering order is independent of element order.
    pub fn collect(&mut self, mesh: &Mesh, fields: &[FieldId]) -> Result<()> {
        if self.state() != DofSetState::Uninitialized {
            return Err(Error::Configuration(
                "dof collection requires an uninitialized dof set; call reset() first".to_string(),
            ));
        }

        let mut seen: FxHashMap<(usize, usize), ()> = FxHashMap::default();
        let mut keys: Vec<(usize, usize)> = Vec::new();
        for cell in mesh.cells().iter().chain(mesh.conditions()) {
            for &node in &cell.nodes {
                for field in fields {
                    if seen.insert((node, field.index()), ()).is_none() {
                        keys.push((node, field.index()));
                    }
                }
            }
        }
        keys.sort_unstable_by_key(|&(node, field)| (mesh.node_id(node), field));

        self.dofs = keys
            .iter()
            .map(|&(node, field)| Dof {
                node,
                node_id: mesh.node_id(node),
                field: FieldId(field),
                owner: mesh.node_owner(node),
                fixed: false,
                equation_id: None,
            })
            .collect();
        self.by_node = keys
            .iter()
            .enumerate()
            .map(|(index, &key)| (key, index))
            .collect();
        self.state = Some(DofSetState::Collected);
        Ok(())
    }

    pub fn set_fixed(&mut self, node: usize, field: FieldId, fixed: bool) -> Result<()> {
        let index = self.lookup(node, field)?;
        self.dofs[index].fixed = fixed;
        Ok(())
    }

    pub fn is_fixed(&self, node: usize, field: FieldId) -> Result<bool> {
        Ok(self.dofs[self.lookup(node, field)?].fixed)
    }

    fn lookup(&self, node: usize, field: FieldId) -> Result<usize> {
        self.by_node
            .get(&(node, field.index()))
            .copied()
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "no dof collected for node {node}, field slot {}",
                    field.index()
                ))
            })
    }

    /// Assigns equation ids: owned dofs receive sequential ids starting at
    /// this partition's offset from an exclusive prefix sum; ghost dof ids
    /// are imported from their owners. Valid only in the `Collected` state.
    pub fn assign_equation_ids(&mut self, comm: &dyn Communicator) -> Result<()> {
        if self.state() != DofSetState::Collected {
            return Err(Error::Configuration(format!(
                "equation ids can only be assigned from the Collected state, not {:?}",
                self.state()
            )));
        }

        let rank = comm.rank();
        self.owned_count = self.dofs.iter().filter(|dof| dof.owner == rank).count();
        self.first_owned_id = comm.scan_sum_exclusive(self.owned_count);
        self.global_size = comm.sum_all_usize(self.owned_count);
        if self.global_size == 0 {
            return Err(Error::Configuration("no degrees of freedom".to_string()));
        }

        let mut next_id = self.first_owned_id;
        for dof in self.dofs.iter_mut().filter(|dof| dof.owner == rank) {
            dof.equation_id = Some(next_id);
            next_id += 1;
        }
        debug!(
            "rank {rank}: {} owned dofs, equation ids [{}, {}), global size {}",
            self.owned_count, self.first_owned_id, next_id, self.global_size
        );

        self.synchronize_ghost_ids(comm)?;
        self.state = Some(DofSetState::Numbered);
        Ok(())
    }

    fn synchronize_ghost_ids(&mut self, comm: &dyn Communicator) -> Result<()> {
        let rank = comm.rank();
        let size = comm.size();

        // Ask each owner for the ids of its dofs that we only see as ghosts.
        let mut requests: Vec<Vec<u64>> = vec![Vec::new(); size];
        let mut requested: Vec<Vec<usize>> = vec![Vec::new(); size];
        for (index, dof) in self.dofs.iter().enumerate() {
            if dof.owner != rank {
                requests[dof.owner].push(dof.node_id as u64);
                requests[dof.owner].push(dof.field.index() as u64);
                requested[dof.owner].push(index);
            }
        }
        let incoming = comm.all_to_all_u64(&requests);

        let by_identity: FxHashMap<(usize, usize), usize> = self
            .dofs
            .iter()
            .enumerate()
            .map(|(index, dof)| ((dof.node_id, dof.field.index()), index))
            .collect();

        let mut replies: Vec<Vec<u64>> = vec![Vec::new(); size];
        for (src, request) in incoming.iter().enumerate() {
            for pair in request.chunks_exact(2) {
                let key = (pair[0] as usize, pair[1] as usize);
                let index = by_identity.get(&key).copied().ok_or_else(|| {
                    Error::Consistency(format!(
                        "rank {src} requested the equation id of node {} field {} which rank {rank} does not own",
                        key.0, key.1
                    ))
                })?;
                let dof = &self.dofs[index];
                let id = dof.equation_id.ok_or_else(|| {
                    Error::Consistency(format!(
                        "dof of node {} has no equation id on its owner",
                        key.0
                    ))
                })?;
                replies[src].push(id as u64);
            }
        }
        let answers = comm.all_to_all_u64(&replies);

        for (owner, indices) in requested.iter().enumerate() {
            let answer = &answers[owner];
            if answer.len() != indices.len() {
                return Err(Error::Consistency(format!(
                    "rank {owner} answered {} equation ids, {} were requested",
                    answer.len(),
                    indices.len()
                )));
            }
            for (&index, &id) in indices.iter().zip(answer) {
                self.dofs[index].equation_id = Some(id as usize);
            }
        }
        Ok(())
    }

    /// Forgets collection and numbering, e.g. after a mesh change.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn equation_id(&self, node: usize, field: FieldId) -> Option<usize> {
        self.by_node
            .get(&(node, field.index()))
            .and_then(|&index| self.dofs[index].equation_id)
    }

    pub fn dofs(&self) -> &[Dof] {
        &self.dofs
    }

    pub fn len(&self) -> usize {
        self.dofs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dofs.is_empty()
    }

    /// Number of dofs owned (numbered) by this partition.
    pub fn owned_count(&self) -> usize {
        self.owned_count
    }

    pub fn first_owned_id(&self) -> usize {
        self.first_owned_id
    }

    pub fn global_size(&self) -> usize {
        self.global_size
    }
}
