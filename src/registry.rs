use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tracing::info;

use crate::error::{Error, Result};
use crate::model::{Operation, OperationArgs, OperationId, OperationState, OperationStatus};

#[derive(Default)]
struct Table {
    operations: Vec<Operation>,
    index: HashMap<OperationId, usize>,
}

impl Table {
    fn get_mut(&mut self, id: OperationId) -> Result<&mut Operation> {
        let slot = *self.index.get(&id).ok_or(Error::NotFound(id))?;
        Ok(&mut self.operations[slot])
    }
}

/// Daemon-side table of every operation created during this run.
///
/// Each method takes the lock once and never calls out while holding it.
/// Readers always receive owned copies.
#[derive(Default)]
pub struct OperationRegistry {
    table: RwLock<Table>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new `Pending` operation under a never-issued id.
    pub fn create(&self, args: OperationArgs) -> Operation {
        let mut table = self.write();
        let mut id = OperationId::new();
        while table.index.contains_key(&id) {
            id = OperationId::new();
        }
        let operation = Operation {
            id,
            args,
            state: OperationState::Pending,
            status: OperationStatus::pending(),
            created_at: Utc::now(),
        };
        let slot = table.operations.len();
        table.operations.push(operation.clone());
        table.index.insert(id, slot);
        info!(operation = %id, kind = %operation.kind(), "operation created");
        operation
    }

    pub fn get(&self, id: OperationId) -> Option<Operation> {
        let table = self.read();
        table.index.get(&id).map(|&slot| table.operations[slot].clone())
    }

    /// Snapshot of all operations in creation order.
    pub fn list(&self) -> Vec<Operation> {
        self.read().operations.clone()
    }

    /// Replace the stored status wholesale.
    pub fn update_status(&self, id: OperationId, status: OperationStatus) -> Result<()> {
        self.write().get_mut(id)?.status = status;
        Ok(())
    }

    /// Move an operation to `next`, rejecting edges the lifecycle forbids.
    pub fn transition(&self, id: OperationId, next: OperationState) -> Result<Operation> {
        let mut table = self.write();
        let operation = table.get_mut(id)?;
        let from = operation.state;
        if !from.can_transition_to(next) {
            return Err(Error::InvalidTransition { id, from, to: next });
        }
        operation.state = next;
        let snapshot = operation.clone();
        drop(table);
        info!(operation = %id, %from, to = %next, "state changed");
        Ok(snapshot)
    }

    fn read(&self) -> RwLockReadGuard<'_, Table> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Table> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }
}
