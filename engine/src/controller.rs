//! Operation orchestration.
//!
//! `OperationController` owns the single operation slot. It provides the
//! lifecycle entry points:
//! - Starting an operation (validate, plan destination, launch, estimate size)
//! - Querying progress by operation id
//! - Cancelling the active operation
//!
//! The controller is a cheap handle; clones share the same slot.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::fs_ops;
use crate::model::{OperationId, OperationRecord, OperationStatus, StartRequest};
use crate::supervisor::{self, Supervision, STAGE_SIZING};

/// The single in-flight-operation slot.
#[derive(Debug, Default)]
pub(crate) struct Slot {
    pub record: OperationRecord,
    /// Id of the most recent operation, kept after it ends so a final poll finds it
    pub last_id: Option<OperationId>,
    /// Present while a child process is running
    pub cancel: Option<CancellationToken>,
    pub cancel_requested: bool,
    /// Distinct warnings appended to the current record
    pub warnings: usize,
}

pub(crate) type SharedSlot = Arc<Mutex<Slot>>;

pub(crate) fn lock_slot(slot: &SharedSlot) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs at most one transfer operation at a time.
#[derive(Debug, Clone)]
pub struct OperationController {
    slot: SharedSlot,
    config: Arc<EngineConfig>,
}

impl Default for OperationController {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

/// Moves a reserved operation to `error` unless it is handed to a supervisor.
struct PendingStart<'a> {
    controller: &'a OperationController,
    id: OperationId,
    handed_off: bool,
}

impl Drop for PendingStart<'_> {
    fn drop(&mut self) {
        if !self.handed_off {
            self.controller
                .fail(self.id, "Start was interrupted before the transfer launched".to_string());
        }
    }
}

impl OperationController {
    pub fn new(config: EngineConfig) -> Self {
        OperationController {
            slot: Arc::new(Mutex::new(Slot::default())),
            config: Arc::new(config),
        }
    }

    /// Start an operation and return its id.
    ///
    /// Rejects the request with `Conflict` while another operation is active,
    /// `Validation` for missing fields and `PathNotFound` for absent paths;
    /// none of these touch the slot. Planning and launch failures leave the
    /// record in `error` and are also returned. The call does not wait on
    /// the size estimate or the transfer; everything after the launch is
    /// observed through [`progress`](Self::progress).
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(&self, request: StartRequest) -> Result<OperationId, EngineError> {
        let id = self.reserve(&request)?;
        let mut pending = PendingStart {
            controller: self,
            id,
            handed_off: false,
        };
        info!(
            operation = %id,
            mode = %request.mode,
            source = %request.source.display(),
            destination = %request.destination.display(),
            "operation accepted"
        );

        let destination = fs_ops::plan_destination(
            &request.destination,
            request.mode,
            request.copy_date,
            request.label.as_deref(),
            &self.config.default_label,
        )
        .inspect_err(|e| self.fail(id, format!("Failed to prepare destination folders: {}", e)))?;

        let child = supervisor::spawn_transfer(
            &self.config.transfer_tool,
            &request.source,
            &destination,
            request.mode,
        )
        .inspect_err(|e| self.fail(id, e.to_string()))?;

        let cancel = CancellationToken::new();
        {
            let mut slot = lock_slot(&self.slot);
            slot.cancel = Some(cancel.clone());
            let record = &mut slot.record;
            record.destination = Some(destination.clone());
            record.status = OperationStatus::Running;
            record.current_stage = STAGE_SIZING.to_string();
            record.message = "Operation in progress...".to_string();
        }
        info!(operation = %id, destination = %destination.display(), "transfer running");

        tokio::spawn(supervisor::supervise(
            child,
            Supervision {
                id,
                slot: self.slot.clone(),
                cancel,
                program: self.config.transfer_tool.program.clone(),
                size_tool: self.config.size_tool.clone(),
                source: request.source,
                grace_period: self.config.grace_period,
                warning_excerpt_len: self.config.warning_excerpt_len,
                max_warnings: self.config.max_warnings,
            },
        ));
        pending.handed_off = true;

        Ok(id)
    }

    /// Snapshot of the record for `id`, which must be the active or the most
    /// recent operation.
    pub fn progress(&self, id: OperationId) -> Result<OperationRecord, EngineError> {
        let slot = lock_slot(&self.slot);
        if slot.record.id == Some(id) || slot.last_id == Some(id) {
            Ok(slot.record.clone())
        } else {
            Err(EngineError::OperationNotFound { id: id.to_string() })
        }
    }

    /// Snapshot of the slot regardless of id.
    pub fn current(&self) -> OperationRecord {
        lock_slot(&self.slot).record.clone()
    }

    /// Request cancellation of the active operation.
    ///
    /// Only accepted while the transfer process is running. Returns once the
    /// request is recorded; the `cancelled` state shows up in later polls.
    pub fn cancel(&self, id: OperationId) -> Result<(), EngineError> {
        let token = {
            let mut slot = lock_slot(&self.slot);
            let token = match (&slot.cancel, slot.record.id) {
                (Some(token), Some(active)) if active == id => token.clone(),
                _ => return Err(EngineError::OperationNotFound { id: id.to_string() }),
            };
            slot.cancel_requested = true;
            slot.record.status = OperationStatus::Cancelling;
            slot.record.current_stage = "Cancelling...".to_string();
            slot.record.message = "Cancelling operation...".to_string();
            token
        };
        info!(operation = %id, "cancellation requested");
        token.cancel();
        Ok(())
    }

    /// Check and claim the slot in one critical section.
    fn reserve(&self, request: &StartRequest) -> Result<OperationId, EngineError> {
        let mut slot = lock_slot(&self.slot);
        if let Some(active) = slot.record.id {
            warn!(active = %active, "start rejected, operation already in progress");
            return Err(EngineError::Conflict { active });
        }
        request.validate()?;
        fs_ops::require_existing(&request.source)?;
        fs_ops::require_existing(&request.destination)?;

        let id = OperationId::new();
        slot.record = OperationRecord::preparing(id, request.mode);
        slot.last_id = Some(id);
        slot.cancel = None;
        slot.cancel_requested = false;
        slot.warnings = 0;
        Ok(id)
    }

    /// Move a not-yet-running operation straight to `error`. No-op once the
    /// operation has ended.
    fn fail(&self, id: OperationId, message: String) {
        let mut slot = lock_slot(&self.slot);
        if slot.record.id != Some(id) {
            return;
        }
        error!(operation = %id, %message, "operation failed before launch");
        slot.record.status = OperationStatus::Error;
        slot.record.current_stage = "Error".to_string();
        slot.record.message = message;
        slot.record.id = None;
        slot.cancel = None;
    }
}
