use crate::unit_tests::fixtures::{two_triangles_partition, two_triangles_serial};
use garm::comm::{ChannelComm, Communicator, SerialComm};
use garm::dof::{DofSet, DofSetState};
use garm::error::Error;
use std::thread;

#[test]
fn serial_numbering_is_contiguous_and_sorted_by_node_id() {
    let setup = two_triangles_serial();
    let mut dofs = DofSet::new();
    dofs.collect(&setup.mesh, &[setup.fields.scalar]).unwrap();
    assert_eq!(dofs.state(), DofSetState::Collected);
    dofs.assign_equation_ids(&SerialComm).unwrap();
    assert_eq!(dofs.state(), DofSetState::Numbered);

    assert_eq!(dofs.global_size(), 4);
    assert_eq!(dofs.owned_count(), 4);
    for node in 0..4 {
        assert_eq!(dofs.equation_id(node, setup.fields.scalar), Some(node));
    }
}

#[test]
fn numbering_before_collection_is_a_configuration_error() {
    let mut dofs = DofSet::new();
    assert!(matches!(
        dofs.assign_equation_ids(&SerialComm),
        Err(Error::Configuration(_))
    ));
}

#[test]
fn recollection_requires_reset() {
    let setup = two_triangles_serial();
    let mut dofs = DofSet::new();
    dofs.collect(&setup.mesh, &[setup.fields.scalar]).unwrap();
    assert!(matches!(
        dofs.collect(&setup.mesh, &[setup.fields.scalar]),
        Err(Error::Configuration(_))
    ));
    dofs.reset();
    dofs.collect(&setup.mesh, &[setup.fields.scalar]).unwrap();
}

#[test]
fn empty_mesh_numbering_is_a_configuration_error() {
    let setup = two_triangles_serial();
    let empty = garm::mesh::Mesh::new_serial(2, vec![]).unwrap();
    let mut dofs = DofSet::new();
    dofs.collect(&empty, &[setup.fields.scalar]).unwrap();
    assert!(matches!(
        dofs.assign_equation_ids(&SerialComm),
        Err(Error::Configuration(_))
    ));
}

/// Equation ids across all partitions must form exactly {0, ..., n - 1},
/// each owned by exactly one partition, and ghost copies must agree with
/// their owner.
#[test]
fn partitioned_numbering_is_globally_unique_and_consistent() {
    let group = ChannelComm::create_group(2);
    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = group
            .into_iter()
            .map(|comm| {
                scope.spawn(move || {
                    let setup = two_triangles_partition(comm.rank());
                    let mut dofs = DofSet::new();
                    dofs.collect(&setup.mesh, &[setup.fields.scalar]).unwrap();
                    dofs.assign_equation_ids(&comm).unwrap();

                    let owned: Vec<usize> = dofs
                        .dofs()
                        .iter()
                        .filter(|dof| dof.owner == comm.rank())
                        .map(|dof| dof.equation_id().unwrap())
                        .collect();
                    let all: Vec<(usize, usize)> = dofs
                        .dofs()
                        .iter()
                        .map(|dof| (dof.node_id, dof.equation_id().unwrap()))
                        .collect();
                    (dofs.global_size(), owned, all)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let (global_size_0, owned_0, all_0) = &results[0];
    let (global_size_1, owned_1, all_1) = &results[1];
    assert_eq!(*global_size_0, 4);
    assert_eq!(*global_size_1, 4);

    let mut union: Vec<usize> = owned_0.iter().chain(owned_1).copied().collect();
    union.sort_unstable();
    assert_eq!(union, vec![0, 1, 2, 3]);

    // Ghost copies carry the owner's id: the mapping node id -> equation id
    // must agree between the partitions wherever both see the node.
    for &(node_id, equation_id) in all_0 {
        for &(other_node_id, other_equation_id) in all_1 {
            if node_id == other_node_id {
                assert_eq!(equation_id, other_equation_id);
            }
        }
    }
}
