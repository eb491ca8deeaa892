// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! MPI channel
//!
//! rsmpi has no high-level API for in-place reductions over untyped
//! buffers, for allgatherv with explicit displacements or for shared
//! memory windows, so the primitives go through mpi-sys directly.
//!
//! # Safety
//!
//! - Communicator and window handles are created in this module and freed
//!   only by it
//! - Window reads and writes are bounds checked against the size queried
//!   from MPI
//! - All MPI calls check return codes

use std::mem::MaybeUninit;
use std::os::raw::{c_int, c_void};
use std::sync::{Arc, Mutex, MutexGuard};

use mpi::environment::Universe;
use mpi::traits::*;

use crate::data_types::DataType;
use crate::error::{Code, CollectiveError, CollectiveResult};
use crate::net::channel::{
    check_allgatherv_layout, check_window_range, checked_byte_len, no_window, Channel, Communicator,
};

/// One communicator with this process's place in it
struct Scope {
    comm: mpi_sys::MPI_Comm,
    rank: i32,
    size: i32,
}

/// Shared memory window; `base` points at the segment of rank 0
struct Window {
    win: mpi_sys::MPI_Win,
    base: *mut u8,
    len: usize,
}

pub struct MpiChannel {
    global: Scope,
    local: Scope,
    cross: Scope,
    window: Mutex<Option<Window>>,
    // Dropping the universe finalizes MPI
    universe: Arc<Mutex<Option<Universe>>>,
}

// SAFETY: MPI handles are opaque values managed by the MPI library, which
// is initialized with thread support by rsmpi. The window pointer is only
// dereferenced under the window lock, inside bounds queried from MPI.
unsafe impl Send for MpiChannel {}
unsafe impl Sync for MpiChannel {}

impl MpiChannel {
    /// Initialize MPI, bind to the world communicator and split it into
    /// host-local and cross-host communicators
    pub fn make() -> CollectiveResult<Arc<Self>> {
        let universe = mpi::initialize().ok_or_else(|| {
            CollectiveError::Transport(
                "Failed to initialize MPI (already initialized or MPI library not found)".to_string(),
            )
        })?;

        let world = universe.world();
        let rank = world.rank();
        let size = world.size();
        if rank < 0 || size < 1 || rank >= size {
            return Err(CollectiveError::InvalidArgument(format!(
                "Malformed rank: {} or group size: {}",
                rank, size
            )));
        }
        let world_comm = world.as_communicator().as_raw();

        let local_comm = unsafe {
            let mut comm = MaybeUninit::<mpi_sys::MPI_Comm>::uninit();
            check_mpi(
                mpi_sys::MPI_Comm_split_type(
                    world_comm,
                    mpi_sys::MPI_COMM_TYPE_SHARED as c_int,
                    rank,
                    mpi_sys::RSMPI_INFO_NULL,
                    comm.as_mut_ptr(),
                ),
                "MPI_Comm_split_type",
            )?;
            comm.assume_init()
        };
        let local = Scope::of(local_comm)?;

        let cross_comm = unsafe {
            let mut comm = MaybeUninit::<mpi_sys::MPI_Comm>::uninit();
            check_mpi(
                mpi_sys::MPI_Comm_split(world_comm, local.rank, rank, comm.as_mut_ptr()),
                "MPI_Comm_split",
            )?;
            comm.assume_init()
        };
        let cross = Scope::of(cross_comm)?;

        log::info!(
            "MPI channel up: rank {} of {}, local {} of {}, cross {} of {}",
            rank,
            size,
            local.rank,
            local.size,
            cross.rank,
            cross.size
        );
        Ok(Arc::new(Self {
            global: Scope {
                comm: world_comm,
                rank,
                size,
            },
            local,
            cross,
            window: Mutex::new(None),
            universe: Arc::new(Mutex::new(Some(universe))),
        }))
    }

    /// Free the split communicators and drop the universe; further calls fail
    pub fn finalize(&self) -> CollectiveResult<()> {
        let mut universe = self
            .universe
            .lock()
            .map_err(|_| CollectiveError::new(Code::Aborted, "MPI universe lock poisoned"))?;
        if universe.is_none() {
            return Ok(());
        }
        if self.lock_window()?.is_some() {
            self.free_shared_buffer()?;
        }
        for scope in [&self.local, &self.cross] {
            let mut comm = scope.comm;
            check_mpi(unsafe { mpi_sys::MPI_Comm_free(&mut comm) }, "MPI_Comm_free")?;
        }
        *universe = None;
        Ok(())
    }

    fn scope(&self, communicator: Communicator) -> CollectiveResult<&Scope> {
        let universe = self
            .universe
            .lock()
            .map_err(|_| CollectiveError::new(Code::Aborted, "MPI universe lock poisoned"))?;
        if universe.is_none() {
            return Err(CollectiveError::Transport("MPI not initialized".to_string()));
        }
        Ok(match communicator {
            Communicator::Global => &self.global,
            Communicator::Local => &self.local,
            Communicator::Cross => &self.cross,
        })
    }

    fn lock_window(&self) -> CollectiveResult<MutexGuard<'_, Option<Window>>> {
        self.window
            .lock()
            .map_err(|_| CollectiveError::new(Code::Aborted, "MPI window lock poisoned"))
    }
}

impl Scope {
    fn of(comm: mpi_sys::MPI_Comm) -> CollectiveResult<Self> {
        let (mut rank, mut size): (c_int, c_int) = (0, 0);
        unsafe {
            check_mpi(mpi_sys::MPI_Comm_rank(comm, &mut rank), "MPI_Comm_rank")?;
            check_mpi(mpi_sys::MPI_Comm_size(comm, &mut size), "MPI_Comm_size")?;
        }
        Ok(Self { comm, rank, size })
    }
}

fn mpi_datatype(dtype: DataType) -> CollectiveResult<mpi_sys::MPI_Datatype> {
    // The RSMPI_* handles are link-time constants exported by mpi-sys
    let datatype = unsafe {
        match dtype {
            DataType::UInt8 => mpi_sys::RSMPI_UINT8_T,
            DataType::Int8 => mpi_sys::RSMPI_INT8_T,
            DataType::UInt16 => mpi_sys::RSMPI_UINT16_T,
            DataType::Int16 => mpi_sys::RSMPI_INT16_T,
            DataType::Int32 => mpi_sys::RSMPI_INT32_T,
            DataType::Int64 => mpi_sys::RSMPI_INT64_T,
            DataType::Float32 => mpi_sys::RSMPI_FLOAT,
            DataType::Float64 => mpi_sys::RSMPI_DOUBLE,
            DataType::Bool => mpi_sys::RSMPI_C_BOOL,
            // Moved as raw 16-bit words; reductions are rejected in allreduce
            DataType::Float16 => mpi_sys::RSMPI_UINT16_T,
        }
    };
    Ok(datatype)
}

fn to_c_int(value: usize, what: &str) -> CollectiveResult<c_int> {
    c_int::try_from(value).map_err(|_| {
        CollectiveError::InvalidArgument(format!("{} {} exceeds the MPI count range", what, value))
    })
}

fn check_mpi(status: c_int, call: &str) -> CollectiveResult<()> {
    if status != mpi_sys::MPI_SUCCESS as c_int {
        return Err(CollectiveError::Transport(format!("{} failed with code {}", call, status)));
    }
    Ok(())
}

impl Channel for MpiChannel {
    fn rank(&self) -> i32 {
        self.global.rank
    }

    fn size(&self) -> i32 {
        self.global.size
    }

    fn rank_in(&self, communicator: Communicator) -> CollectiveResult<i32> {
        Ok(self.scope(communicator)?.rank)
    }

    fn size_in(&self, communicator: Communicator) -> CollectiveResult<i32> {
        Ok(self.scope(communicator)?.size)
    }

    fn allreduce(
        &self,
        buffer: &mut [u8],
        num_elements: usize,
        dtype: DataType,
        communicator: Communicator,
    ) -> CollectiveResult<()> {
        checked_byte_len(buffer.len(), num_elements, dtype, "allreduce")?;
        if dtype == DataType::Float16 {
            return Err(CollectiveError::NotImplemented(
                "MPI allreduce over float16".to_string(),
            ));
        }
        let datatype = mpi_datatype(dtype)?;
        let count = to_c_int(num_elements, "allreduce count")?;
        let comm = self.scope(communicator)?.comm;

        let status = unsafe {
            let op = if dtype == DataType::Bool {
                mpi_sys::RSMPI_LOR
            } else {
                mpi_sys::RSMPI_SUM
            };
            mpi_sys::MPI_Allreduce(
                mpi_sys::RSMPI_IN_PLACE,
                buffer.as_mut_ptr() as *mut c_void,
                count,
                datatype,
                op,
                comm,
            )
        };
        check_mpi(status, "MPI_Allreduce")
    }

    fn allgatherv(
        &self,
        send: &[u8],
        recv: &mut [u8],
        recvcounts: &[usize],
        displacements: &[usize],
        dtype: DataType,
        communicator: Communicator,
    ) -> CollectiveResult<()> {
        let scope = self.scope(communicator)?;
        check_allgatherv_layout(scope.size as usize, recv.len(), recvcounts, displacements, dtype)?;
        let own = recvcounts[scope.rank as usize];
        checked_byte_len(send.len(), own, dtype, "allgatherv send")?;

        let datatype = mpi_datatype(dtype)?;
        let send_count = to_c_int(own, "allgatherv send count")?;
        let counts = recvcounts
            .iter()
            .map(|c| to_c_int(*c, "allgatherv receive count"))
            .collect::<CollectiveResult<Vec<_>>>()?;
        let displs = displacements
            .iter()
            .map(|d| to_c_int(*d, "allgatherv displacement"))
            .collect::<CollectiveResult<Vec<_>>>()?;

        let status = unsafe {
            let send_ptr = if own > 0 { send.as_ptr() } else { std::ptr::null() };
            let recv_ptr = if recv.is_empty() { std::ptr::null_mut() } else { recv.as_mut_ptr() };
            mpi_sys::MPI_Allgatherv(
                send_ptr as *const c_void,
                send_count,
                datatype,
                recv_ptr as *mut c_void,
                counts.as_ptr(),
                displs.as_ptr(),
                datatype,
                scope.comm,
            )
        };
        check_mpi(status, "MPI_Allgatherv")
    }

    fn broadcast(
        &self,
        buffer: &mut [u8],
        num_elements: usize,
        dtype: DataType,
        root_rank: i32,
        communicator: Communicator,
    ) -> CollectiveResult<()> {
        let scope = self.scope(communicator)?;
        checked_byte_len(buffer.len(), num_elements, dtype, "broadcast")?;
        if root_rank < 0 || root_rank >= scope.size {
            return Err(CollectiveError::InvalidArgument(format!("invalid root rank {}", root_rank)));
        }
        let datatype = mpi_datatype(dtype)?;
        let count = to_c_int(num_elements, "broadcast count")?;

        let status = unsafe {
            mpi_sys::MPI_Bcast(
                buffer.as_mut_ptr() as *mut c_void,
                count,
                datatype,
                root_rank,
                scope.comm,
            )
        };
        check_mpi(status, "MPI_Bcast")
    }

    fn barrier(&self, communicator: Communicator) -> CollectiveResult<()> {
        let comm = self.scope(communicator)?.comm;
        let status = unsafe { mpi_sys::MPI_Barrier(comm) };
        check_mpi(status, "MPI_Barrier")
    }

    fn allocate_shared_buffer(&self, window_bytes: usize, communicator: Communicator) -> CollectiveResult<()> {
        let scope = self.scope(communicator)?;
        let mut window = self.lock_window()?;
        if window.is_some() {
            return Err(CollectiveError::Precondition(
                "a shared buffer is already allocated".to_string(),
            ));
        }

        // Rank 0 owns the whole region, the others attach to it
        let own_bytes = if scope.rank == 0 { window_bytes } else { 0 };
        let own_bytes = mpi_sys::MPI_Aint::try_from(own_bytes).map_err(|_| {
            CollectiveError::InvalidArgument(format!("shared buffer of {} bytes is too large", window_bytes))
        })?;

        let opened = unsafe {
            let mut own_base = MaybeUninit::<*mut c_void>::uninit();
            let mut win = MaybeUninit::<mpi_sys::MPI_Win>::uninit();
            check_mpi(
                mpi_sys::MPI_Win_allocate_shared(
                    own_bytes,
                    1,
                    mpi_sys::RSMPI_INFO_NULL,
                    scope.comm,
                    own_base.as_mut_ptr() as *mut c_void,
                    win.as_mut_ptr(),
                ),
                "MPI_Win_allocate_shared",
            )?;
            let win = win.assume_init();

            let mut len: mpi_sys::MPI_Aint = 0;
            let mut disp_unit: c_int = 0;
            let mut base = MaybeUninit::<*mut c_void>::uninit();
            check_mpi(
                mpi_sys::MPI_Win_shared_query(
                    win,
                    0,
                    &mut len,
                    &mut disp_unit,
                    base.as_mut_ptr() as *mut c_void,
                ),
                "MPI_Win_shared_query",
            )?;
            Window {
                win,
                base: base.assume_init() as *mut u8,
                len: usize::try_from(len).unwrap_or(0),
            }
        };
        *window = Some(opened);
        Ok(())
    }

    fn write_shared_buffer(&self, offset: usize, data: &[u8]) -> CollectiveResult<()> {
        let window = self.lock_window()?;
        let open = window.as_ref().ok_or_else(no_window)?;
        check_window_range(open.len, offset, data.len())?;
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), open.base.add(offset), data.len()) };
        Ok(())
    }

    fn query_shared_buffer(&self, offset: usize, out: &mut [u8]) -> CollectiveResult<()> {
        let window = self.lock_window()?;
        let open = window.as_ref().ok_or_else(no_window)?;
        check_window_range(open.len, offset, out.len())?;
        unsafe { std::ptr::copy_nonoverlapping(open.base.add(offset), out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    fn free_shared_buffer(&self) -> CollectiveResult<()> {
        let mut window = self.lock_window()?;
        let mut open = window.take().ok_or_else(no_window)?;
        check_mpi(unsafe { mpi_sys::MPI_Win_free(&mut open.win) }, "MPI_Win_free")
    }
}
