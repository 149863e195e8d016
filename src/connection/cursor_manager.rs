//! Policies for releasing server-side cursors.
//!
//! A [`Cursor`](crate::cursor::Cursor) never sends kill-cursors on its own; it hands the
//! handle to the connection's [`CursorManager`], together with the slot that opened the
//! cursor when the owning thread was inside a request.
use std::collections::BTreeMap;

use log::debug;
use parking_lot::Mutex;

use crate::error::Result;

use super::Connection;

/// Decides when a dead cursor's handle is sent to the server.
pub trait CursorManager: Send + Sync {
    /// Called once per abandoned or closed cursor.
    fn close(&self, connection: &Connection, cursor_id: i64, slot: Option<usize>) -> Result<()>;

    /// Sends anything still held back.
    fn flush(&self, _connection: &Connection) -> Result<()> {
        Ok(())
    }
}

/// Kills every cursor as soon as it is closed.
#[derive(Debug, Default)]
pub struct ImmediateCursorManager;

impl CursorManager for ImmediateCursorManager {
    fn close(&self, connection: &Connection, cursor_id: i64, slot: Option<usize>) -> Result<()> {
        connection.kill_cursors(&[cursor_id], slot)
    }
}

/// Collects handles and kills them in one message per slot once `threshold` are pending.
#[derive(Debug)]
pub struct BatchCursorManager {
    threshold: usize,
    pending: Mutex<Vec<(Option<usize>, i64)>>,
}

impl BatchCursorManager {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    fn send(connection: &Connection, batch: Vec<(Option<usize>, i64)>) -> Result<()> {
        let mut by_slot: BTreeMap<Option<usize>, Vec<i64>> = BTreeMap::new();
        for (slot, cursor_id) in batch {
            by_slot.entry(slot).or_default().push(cursor_id);
        }
        for (slot, ids) in by_slot {
            debug!("killing {} batched cursors", ids.len());
            connection.kill_cursors(&ids, slot)?;
        }
        Ok(())
    }
}

impl CursorManager for BatchCursorManager {
    fn close(&self, connection: &Connection, cursor_id: i64, slot: Option<usize>) -> Result<()> {
        let batch = {
            let mut pending = self.pending.lock();
            pending.push((slot, cursor_id));
            if pending.len() < self.threshold {
                return Ok(());
            }
            std::mem::take(&mut *pending)
        };
        Self::send(connection, batch)
    }

    fn flush(&self, connection: &Connection) -> Result<()> {
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return Ok(());
        }
        Self::send(connection, batch)
    }
}
