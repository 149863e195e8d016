//! Fixed array of socket slots, each behind its own timeout-capable lock.
//!
//! A slot is held for exactly one request/response exchange. Threads that entered a
//! request are pinned to one slot (tracked in a thread-local map keyed by pool id) and
//! always lock that slot; everyone else takes the least-loaded free slot, falling back to
//! a timed wait on the least-loaded one.
use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    net::TcpStream,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use log::{debug, trace};
use parking_lot::{Mutex, MutexGuard};
use rand::seq::SliceRandom;

use crate::{
    error::{Error, Result},
    protocol::ProtocolTransport,
};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// pool id -> slot index this thread is pinned to
    static PINNED: RefCell<HashMap<u64, usize>> = RefCell::new(HashMap::new());
}

pub(crate) type Transport = ProtocolTransport<TcpStream>;

/// Socket held by one slot, plus the databases it has authenticated against.
#[derive(Default)]
pub(crate) struct SlotState {
    pub transport: Option<Transport>,
    pub authenticated: HashSet<String>,
}

impl SlotState {
    /// Drops the socket; the next user reconnects.
    pub fn close(&mut self) {
        if let Some(transport) = self.transport.take() {
            let _ = transport.get_ref().shutdown(std::net::Shutdown::Both);
        }
        self.authenticated.clear();
    }
}

struct Slot {
    state: Mutex<SlotState>,
    /// Pinned threads plus threads holding or waiting for the lock.
    load: AtomicUsize,
}

pub(crate) struct SocketPool {
    id: u64,
    slots: Vec<Slot>,
    acquire_timeout: Option<Duration>,
}

/// Exclusive access to one slot for the duration of an exchange.
pub(crate) struct SlotGuard<'a> {
    index: usize,
    state: MutexGuard<'a, SlotState>,
    load: &'a AtomicUsize,
}

impl SlotGuard<'_> {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Deref for SlotGuard<'_> {
    type Target = SlotState;

    fn deref(&self) -> &Self::Target {
        &self.state
    }
}

impl DerefMut for SlotGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.state
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.load.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SocketPool {
    pub fn new(size: usize, acquire_timeout: Option<Duration>) -> Self {
        let slots = (0..size)
            .map(|_| Slot {
                state: Mutex::new(SlotState::default()),
                load: AtomicUsize::new(0),
            })
            .collect();
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            slots,
            acquire_timeout,
        }
    }

    /// Slot the calling thread is pinned to, if it entered a request.
    pub fn pinned(&self) -> Option<usize> {
        PINNED.with(|pinned| pinned.borrow().get(&self.id).copied())
    }

    /// Pins the calling thread to the least-loaded slot. Pinning twice keeps the first
    /// slot.
    pub fn pin(&self) -> usize {
        if let Some(index) = self.pinned() {
            return index;
        }
        let index = self.by_load()[0];
        self.slots[index].load.fetch_add(1, Ordering::SeqCst);
        PINNED.with(|pinned| pinned.borrow_mut().insert(self.id, index));
        debug!("thread pinned to slot {index}");
        index
    }

    /// Releases the calling thread's pin; false if it had none.
    pub fn unpin(&self) -> bool {
        match PINNED.with(|pinned| pinned.borrow_mut().remove(&self.id)) {
            Some(index) => {
                self.slots[index].load.fetch_sub(1, Ordering::SeqCst);
                debug!("thread unpinned from slot {index}");
                true
            }
            None => false,
        }
    }

    /// Locks a slot for one exchange.
    pub fn acquire(&self) -> Result<SlotGuard<'_>> {
        if let Some(index) = self.pinned() {
            return self.acquire_slot(index);
        }

        let order = self.by_load();
        for &index in &order {
            let slot = &self.slots[index];
            if let Some(state) = slot.state.try_lock() {
                slot.load.fetch_add(1, Ordering::SeqCst);
                trace!("acquired free slot {index}");
                return Ok(SlotGuard {
                    index,
                    state,
                    load: &slot.load,
                });
            }
        }
        debug!("all {} slots busy, waiting on slot {}", self.slots.len(), order[0]);
        self.acquire_slot(order[0])
    }

    /// Locks a specific slot, waiting up to the acquire timeout.
    pub fn acquire_slot(&self, index: usize) -> Result<SlotGuard<'_>> {
        let slot = self.slots.get(index).ok_or_else(|| {
            Error::InvalidOperation(format!("slot {index} does not exist"))
        })?;
        slot.load.fetch_add(1, Ordering::SeqCst);

        let state = match self.acquire_timeout {
            Some(timeout) => match slot.state.try_lock_for(timeout) {
                Some(state) => state,
                None => {
                    slot.load.fetch_sub(1, Ordering::SeqCst);
                    return Err(Error::PoolExhausted {
                        slot: index,
                        timeout,
                    });
                }
            },
            None => slot.state.lock(),
        };
        Ok(SlotGuard {
            index,
            state,
            load: &slot.load,
        })
    }

    /// Locks every slot in index order; fails without holding anything if one cannot be
    /// locked in time.
    pub fn acquire_all(&self) -> Result<Vec<SlotGuard<'_>>> {
        (0..self.slots.len())
            .map(|index| self.acquire_slot(index))
            .collect()
    }

    /// Slot indices ordered by load, ties in random order.
    fn by_load(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.slots.len()).collect();
        order.shuffle(&mut rand::thread_rng());
        order.sort_by_key(|index| self.slots[*index].load.load(Ordering::SeqCst));
        order
    }

    #[cfg(test)]
    pub fn load(&self, index: usize) -> usize {
        self.slots[index].load.load(Ordering::SeqCst)
    }
}
