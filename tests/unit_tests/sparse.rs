use garm::comm::{ChannelComm, Communicator, SerialComm};
use garm::error::Error;
use garm::sparse::{ColumnImporter, DistributedCsr, DistributedVector, GraphBuilder, RowLayout};
use std::thread;

fn serial_layout(size: usize) -> RowLayout {
    RowLayout::gather(&SerialComm, size)
}

fn serial_matrix_from_blocks(blocks: &[&[usize]]) -> DistributedCsr {
    let size = 1 + blocks
        .iter()
        .flat_map(|ids| ids.iter())
        .copied()
        .max()
        .unwrap();
    let mut graph = GraphBuilder::new(serial_layout(size), 0);
    for ids in blocks {
        graph.insert_connectivity(ids);
    }
    graph.global_assemble(&SerialComm)
}

#[test]
fn row_layout_owner_lookup() {
    let offsets_by_rank = [3usize, 0, 2];
    // Simulate the gather result without a communicator round.
    let group = ChannelComm::create_group(3);
    let layouts: Vec<RowLayout> = thread::scope(|scope| {
        let handles: Vec<_> = group
            .into_iter()
            .map(|comm| {
                let local = offsets_by_rank[comm.rank()];
                scope.spawn(move || RowLayout::gather(&comm, local))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    let layout = &layouts[0];
    assert_eq!(layout.global_size(), 5);
    assert_eq!(layout.owner(0), 0);
    assert_eq!(layout.owner(2), 0);
    assert_eq!(layout.owner(3), 2);
    assert_eq!(layout.owner(4), 2);
    assert_eq!(layout.local_size(1), 0);
    assert_eq!(layout.first_row(2), 3);
}

#[test]
fn graph_builds_the_union_of_element_blocks() {
    let matrix = serial_matrix_from_blocks(&[&[0, 1, 2], &[1, 3, 2]]);
    let csr = matrix.to_csr();
    assert_eq!(csr.nrows(), 4);
    // Row 0 couples only to the first block, row 3 only to the second.
    let row0: Vec<usize> = csr.row(0).col_indices().to_vec();
    assert_eq!(row0, vec![0, 1, 2]);
    let row3: Vec<usize> = csr.row(3).col_indices().to_vec();
    assert_eq!(row3, vec![1, 2, 3]);
    // Shared rows couple to everything.
    let row1: Vec<usize> = csr.row(1).col_indices().to_vec();
    assert_eq!(row1, vec![0, 1, 2, 3]);
}

#[test]
fn adding_outside_the_pattern_is_a_consistency_error() {
    let mut matrix = serial_matrix_from_blocks(&[&[0, 1, 2]]);
    assert!(matrix.add(0, 1, 1.0).is_ok());
    assert!(matches!(
        matrix.add(0, 3, 1.0),
        Err(Error::Consistency(_))
    ));
}

#[test]
fn vector_ghost_contributions_are_summed_not_overwritten() {
    let group = ChannelComm::create_group(2);
    let results: Vec<Vec<f64>> = thread::scope(|scope| {
        let handles: Vec<_> = group
            .into_iter()
            .map(|comm| {
                scope.spawn(move || {
                    // Two rows per rank; every rank contributes to row 0.
                    let layout = RowLayout::gather(&comm, 2);
                    let mut vector = DistributedVector::new(layout, comm.rank());
                    vector.add(0, 1.0 + comm.rank() as f64);
                    if comm.rank() == 1 {
                        vector.add(3, 10.0);
                    }
                    vector.global_assemble(&comm);
                    vector.owned().to_vec()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(results[0], vec![3.0, 0.0]);
    assert_eq!(results[1], vec![0.0, 10.0]);
}

#[test]
fn matrix_ghost_contributions_reach_their_owner() {
    let group = ChannelComm::create_group(2);
    let results: Vec<(usize, Vec<f64>)> = thread::scope(|scope| {
        let handles: Vec<_> = group
            .into_iter()
            .map(|comm| {
                scope.spawn(move || {
                    let layout = RowLayout::gather(&comm, 1);
                    let mut graph = GraphBuilder::new(layout, comm.rank());
                    // Both ranks insert the same 2x2 block.
                    graph.insert_connectivity(&[0, 1]);
                    let mut matrix = graph.global_assemble(&comm);
                    matrix.add(0, 0, 1.0).unwrap();
                    matrix.add(0, 1, 2.0).unwrap();
                    matrix.add(1, 0, 3.0).unwrap();
                    matrix.add(1, 1, 4.0).unwrap();
                    matrix.global_assemble(&comm).unwrap();
                    let (_, values) = matrix.row(0);
                    (matrix.first_row(), values.to_vec())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    // Each owner sees the sum of both ranks' contributions.
    assert_eq!(results[0], (0, vec![2.0, 4.0]));
    assert_eq!(results[1], (1, vec![6.0, 8.0]));
}

#[test]
fn vector_import_fetches_values_by_global_row() {
    let group = ChannelComm::create_group(2);
    let results: Vec<Vec<f64>> = thread::scope(|scope| {
        let handles: Vec<_> = group
            .into_iter()
            .map(|comm| {
                scope.spawn(move || {
                    let layout = RowLayout::gather(&comm, 2);
                    let mut vector = DistributedVector::new(layout, comm.rank());
                    let first = vector.first_row();
                    for (local, value) in vector.owned_mut().iter_mut().enumerate() {
                        *value = (first + local) as f64 * 10.0;
                    }
                    // Every rank asks for the other's rows, out of order.
                    let wanted = if comm.rank() == 0 {
                        vec![3, 2]
                    } else {
                        vec![0, 1, 0]
                    };
                    vector.import(&wanted, &comm).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(results[0], vec![30.0, 20.0]);
    assert_eq!(results[1], vec![0.0, 10.0, 0.0]);
}

#[test]
fn column_importer_lists_only_foreign_columns() {
    let group = ChannelComm::create_group(2);
    let results: Vec<Vec<usize>> = thread::scope(|scope| {
        let handles: Vec<_> = group
            .into_iter()
            .map(|comm| {
                scope.spawn(move || {
                    let layout = RowLayout::gather(&comm, 2);
                    let mut graph = GraphBuilder::new(layout, comm.rank());
                    graph.insert_connectivity(&[1, 2]);
                    let matrix = graph.global_assemble(&comm);
                    ColumnImporter::from_matrix(&matrix).ghost_columns().to_vec()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(results[0], vec![2]);
    assert_eq!(results[1], vec![1]);
}

#[test]
fn two_norm_matches_the_serial_norm() {
    let layout = serial_layout(3);
    let mut vector = DistributedVector::new(layout, 0);
    vector.owned_mut().copy_from_slice(&[3.0, 0.0, 4.0]);
    assert!((vector.two_norm(&SerialComm) - 5.0).abs() < 1e-14);
}
