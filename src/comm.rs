//! Partition communication primitives.
//!
//! The distributed assembly code is written against the [`Communicator`]
//! trait rather than a concrete message passing backend. All collectives
//! are expressed on top of a typed all-to-all exchange, which keeps the
//! trait object-safe and the set of primitives a real backend must supply
//! minimal. [`SerialComm`] is the single-partition identity;
//! [`ChannelComm`] runs a partition group on threads of one process over
//! standard channels, which is what the distributed tests use. An MPI-backed
//! implementation would slot in behind the same trait.
//!
//! The collectives are the only blocking points of the whole crate: every
//! rank must enter the same sequence of collective calls. A rank observing a
//! message of the wrong collective type panics, since diverged control flow
//! across partitions is not recoverable.
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver, Sender};

/// Collective communication between the partitions of a distributed run.
pub trait Communicator {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Sends `outgoing[j]` to rank `j` and returns the buffers received from
    /// every rank, indexed by source rank. `outgoing` must have length
    /// `size()`.
    fn all_to_all_u64(&self, outgoing: &[Vec<u64>]) -> Vec<Vec<u64>>;

    fn all_to_all_f64(&self, outgoing: &[Vec<f64>]) -> Vec<Vec<f64>>;

    fn all_gather_usize(&self, value: usize) -> Vec<usize> {
        let outgoing = vec![vec![value as u64]; self.size()];
        self.all_to_all_u64(&outgoing)
            .into_iter()
            .map(|buffer| buffer[0] as usize)
            .collect()
    }

    /// Exclusive prefix sum over ranks: the sum of `value` on all ranks with
    /// a strictly smaller rank than the caller.
    fn scan_sum_exclusive(&self, value: usize) -> usize {
        self.all_gather_usize(value)[..self.rank()].iter().sum()
    }

    fn sum_all_usize(&self, value: usize) -> usize {
        self.all_gather_usize(value).iter().sum()
    }

    /// Sum of a floating point value over all ranks, accumulated in rank
    /// order so every rank computes bit-identical results.
    fn sum_all_f64(&self, value: f64) -> f64 {
        let outgoing = vec![vec![value]; self.size()];
        self.all_to_all_f64(&outgoing)
            .into_iter()
            .map(|buffer| buffer[0])
            .sum()
    }
}

/// The identity communicator of a single-partition run.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialComm;

impl Communicator for SerialComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_to_all_u64(&self, outgoing: &[Vec<u64>]) -> Vec<Vec<u64>> {
        assert_eq!(outgoing.len(), 1);
        outgoing.to_vec()
    }

    fn all_to_all_f64(&self, outgoing: &[Vec<f64>]) -> Vec<Vec<f64>> {
        assert_eq!(outgoing.len(), 1);
        outgoing.to_vec()
    }
}

enum Message {
    U64 { src: usize, data: Vec<u64> },
    F64 { src: usize, data: Vec<f64> },
}

impl Message {
    fn src(&self) -> usize {
        match self {
            Message::U64 { src, .. } | Message::F64 { src, .. } => *src,
        }
    }
}

/// An in-process partition group communicating over channels, one member
/// per thread.
///
/// Ranks proceed in loosely coupled lockstep: a rank may run at most one
/// collective ahead of its peers, so at most one out-of-round message per
/// source can be in flight. Such messages are parked until their round
/// comes up.
pub struct ChannelComm {
    rank: usize,
    senders: Vec<Sender<Message>>,
    receiver: Receiver<Message>,
    parked: RefCell<VecDeque<Message>>,
}

impl ChannelComm {
    /// Creates a fully connected group of `size` communicators. Each entry
    /// is meant to be moved onto its own thread.
    pub fn create_group(size: usize) -> Vec<ChannelComm> {
        assert!(size > 0);
        let mut senders = Vec::with_capacity(size);
        let mut receivers = Vec::with_capacity(size);
        for _ in 0..size {
            let (tx, rx) = channel();
            senders.push(tx);
            receivers.push(rx);
        }
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| ChannelComm {
                rank,
                senders: senders.clone(),
                receiver,
                parked: RefCell::new(VecDeque::new()),
            })
            .collect()
    }

    /// Receives exactly one message from every rank, parking messages that
    /// belong to a later collective round.
    fn receive_round(&self) -> Vec<Message> {
        let size = self.senders.len();
        let mut received: Vec<Option<Message>> = (0..size).map(|_| None).collect();
        let mut remaining = size;
        let mut parked_now = VecDeque::new();

        while remaining > 0 {
            let message = match self.parked.borrow_mut().pop_front() {
                Some(message) => message,
                None => self
                    .receiver
                    .recv()
                    .expect("partition group member disconnected during collective"),
            };
            let src = message.src();
            if received[src].is_none() {
                received[src] = Some(message);
                remaining -= 1;
            } else {
                parked_now.push_back(message);
            }
        }

        // Messages set aside in this round precede whatever was already
        // parked for later rounds.
        let mut parked = self.parked.borrow_mut();
        while let Some(message) = parked.pop_front() {
            parked_now.push_back(message);
        }
        *parked = parked_now;

        received
            .into_iter()
            .map(|message| message.expect("collective round incomplete"))
            .collect()
    }
}

impl Communicator for ChannelComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.senders.len()
    }

    fn all_to_all_u64(&self, outgoing: &[Vec<u64>]) -> Vec<Vec<u64>> {
        assert_eq!(outgoing.len(), self.size(), "one buffer per rank required");
        for (dest, buffer) in outgoing.iter().enumerate() {
            self.senders[dest]
                .send(Message::U64 {
                    src: self.rank,
                    data: buffer.clone(),
                })
                .expect("partition group member disconnected");
        }
        self.receive_round()
            .into_iter()
            .map(|message| match message {
                Message::U64 { data, .. } => data,
                Message::F64 { .. } => {
                    panic!("collective type mismatch: partitions have diverged")
                }
            })
            .collect()
    }

    fn all_to_all_f64(&self, outgoing: &[Vec<f64>]) -> Vec<Vec<f64>> {
        assert_eq!(outgoing.len(), self.size(), "one buffer per rank required");
        for (dest, buffer) in outgoing.iter().enumerate() {
            self.senders[dest]
                .send(Message::F64 {
                    src: self.rank,
                    data: buffer.clone(),
                })
                .expect("partition group member disconnected");
        }
        self.receive_round()
            .into_iter()
            .map(|message| match message {
                Message::F64 { data, .. } => data,
                Message::U64 { .. } => {
                    panic!("collective type mismatch: partitions have diverged")
                }
            })
            .collect()
    }
}
