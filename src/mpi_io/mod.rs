use std::ops::{Range, Add, Sub, Mul, Div, AddAssign, SubAssign, MulAssign, DivAssign};
use mpi::collective::SystemOperation;
use mpi::environment::Universe;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;
use num_traits::Zero;
use std::fmt::Debug;

/// Process-wide MPI context with an explicit init/teardown lifecycle: it is
/// created once, passed by reference into the components that need it (the
/// distributed tensor backend), and torn down when dropped. Nothing here is
/// ambient global state.
pub struct MPIOperator {
    pub universe: Universe,
    pub world: SimpleCommunicator,
    pub size: usize,
    pub rank: usize,
}

impl MPIOperator {
    /// Returns None when launched on a single process; callers then stay on
    /// the shared-memory path.
    pub fn initialization() -> Option<MPIOperator> {
        let universe = mpi::initialize().unwrap();
        let world = universe.world();
        let size = world.size() as usize;
        let rank = world.rank() as usize;

        if size >= 2 {
            Some(MPIOperator {
                universe,
                world,
                size,
                rank,
            })
        } else {
            None
        }
    }
}

pub fn mpi_reduce<Q>(world: &SimpleCommunicator, data: &[Q], root_rank: usize, op: &SystemOperation) -> Vec<Q>
where Q: Add<Output=Q> + AddAssign +
         Sub<Output=Q> + SubAssign +
         Mul<Output=Q> + MulAssign +
         Div<Output=Q> + DivAssign +
         Zero + Send + Sync + Copy + Debug + Buffer + 'static,
      [Q]: Buffer,
      Vec<Q>: BufferMut

{
    let rank = world.rank() as usize;
    let root_process = world.process_at_rank(root_rank as i32);

    let mut result: Vec<Q> = vec![Q::zero(); data.len()];

    if rank == root_rank {
        root_process.reduce_into_root(&data[..], &mut result, op);
    } else {
        root_process.reduce_into(&data[..], op);
    }

    world.barrier();

    result
}

pub fn mpi_broadcast<Q>(world: &SimpleCommunicator, data: &mut Q, root_rank: usize)
where Q: Send + Sync + Buffer + Debug + BufferMut + 'static,
{
    let root_process = world.process_at_rank(root_rank as i32);
    root_process.broadcast_into(data);
}

pub fn mpi_broadcast_vector<Q>(world: &SimpleCommunicator, data: &mut Vec<Q>, root_rank: usize)
where Q: Zero + Send + Sync + Copy + Buffer + Equivalence + Debug + 'static,
      Vec<Q>: BufferMut
{
    world.barrier();
    let rank = world.rank() as usize;
    let mut data_len = data.len();
    mpi_broadcast::<usize>(world, &mut data_len, root_rank);
    if data_len != 0 {
        if rank != root_rank {
            data.resize(data_len, Q::zero());
        }
        mpi_broadcast::<Vec<Q>>(world, data, root_rank);
    }
}

pub fn average_distribution(num_tasks: usize, size: usize) -> Vec<Range<usize>> {
    let mut distribute_vec: Vec<Range<usize>> = vec![0..num_tasks;size];

    let chunk_size = num_tasks/size;
    let chunk_rest = num_tasks%size;

    let mut start = 0_usize;
    let mut count = chunk_rest  as i32;
    distribute_vec.iter_mut().enumerate().for_each(|(i,data)| {
        if count >0 {
            *data = start..start + chunk_size+1;
            start += chunk_size+1;
            count -= 1;
        } else {
            *data = start..start + chunk_size;
            start += chunk_size;
        }
    });

    distribute_vec
}
