//! Trigger lifecycle registry.
//!
//! Single source of truth for the state of every acquisition trigger,
//! queried independently of the (possibly slow) device exchange. A record is
//! created as `Busy` before the channel exchange starts and mutated exactly
//! once to a terminal state when the reply (or channel fault) arrives.
//!
//! Retention is bounded: when the registry is at capacity the oldest
//! terminal records are evicted first. Busy records are only evicted when
//! every retained record is Busy, which is logged as a warning.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::ErrorFlags;

/// Lifecycle state of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Busy,
    Finished,
    Error,
}

impl TriggerState {
    /// Status word used by the REST surface.
    pub fn as_status_str(self) -> &'static str {
        match self {
            TriggerState::Busy => "busy",
            TriggerState::Finished => "finished",
            TriggerState::Error => "error",
        }
    }
}

/// Channel-level fault recorded alongside the reserved error flag, so logs
/// can distinguish a timeout from a malformed reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelFault {
    Timeout,
    Protocol,
    Transport,
}

/// One retained trigger record.
#[derive(Debug, Clone)]
pub struct TriggerRecord {
    pub trigger_id: String,
    pub plant_id: String,
    pub state: TriggerState,
    pub error_flags: ErrorFlags,
    pub image_directory: Option<String>,
    pub fault: Option<ChannelFault>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TriggerRecord {
    /// Image identifier, available only for finished triggers.
    pub fn image_id(&self) -> Option<String> {
        if self.state != TriggerState::Finished {
            return None;
        }
        self.image_directory
            .as_ref()
            .map(|dir| format!("{}_{}", self.plant_id, dir))
    }
}

/// Result of a status query; `Invalid` covers unknown identifiers so callers
/// never see an error for an id the registry simply does not know.
#[derive(Debug, Clone)]
pub enum TriggerView {
    Known(TriggerRecord),
    Invalid,
}

impl TriggerView {
    /// Status word used by the REST surface.
    pub fn status_str(&self) -> &'static str {
        match self {
            TriggerView::Known(record) => record.state.as_status_str(),
            TriggerView::Invalid => "invalid",
        }
    }
}

struct RegistryInner {
    records: HashMap<String, TriggerRecord>,
    /// Insertion order, used for eviction.
    order: VecDeque<String>,
}

/// Bounded registry of trigger records.
///
/// All mutation goes through `create`/`complete`; reads never block on the
/// device. The single interior mutex is never held across an await point.
pub struct TriggerRegistry {
    inner: Mutex<RegistryInner>,
    retention_cap: usize,
}

impl TriggerRegistry {
    pub fn new(retention_cap: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                records: HashMap::new(),
                order: VecDeque::new(),
            }),
            retention_cap: retention_cap.max(1),
        }
    }

    /// Allocate a fresh trigger id and store a Busy record.
    ///
    /// Returns immediately; the device exchange happens elsewhere.
    pub fn create(&self, plant_id: &str) -> String {
        let trigger_id = Uuid::new_v4().to_string();
        let record = TriggerRecord {
            trigger_id: trigger_id.clone(),
            plant_id: plant_id.to_string(),
            state: TriggerState::Busy,
            error_flags: ErrorFlags::SUCCESS,
            image_directory: None,
            fault: None,
            created_at: Utc::now(),
            completed_at: None,
        };

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::evict_if_full(&mut inner, self.retention_cap);
        inner.order.push_back(trigger_id.clone());
        inner.records.insert(trigger_id.clone(), record);
        trigger_id
    }

    /// Mark a trigger terminal from a device reply or channel fault.
    ///
    /// Finished when `error_flags` is the success value, Error otherwise.
    /// Calling twice with the same outcome is a no-op; a second call with a
    /// *different* outcome is reported as `CompletionConflict` and the first
    /// outcome stands.
    pub fn complete(
        &self,
        trigger_id: &str,
        error_flags: ErrorFlags,
        image_directory: Option<String>,
        fault: Option<ChannelFault>,
    ) -> BridgeResult<TriggerRecord> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let record = inner
            .records
            .get_mut(trigger_id)
            .ok_or_else(|| BridgeError::UnknownTrigger(trigger_id.to_string()))?;

        let new_state = if error_flags.is_success() {
            TriggerState::Finished
        } else {
            TriggerState::Error
        };

        if record.state != TriggerState::Busy {
            let same_outcome = record.state == new_state
                && record.error_flags == error_flags
                && record.image_directory == image_directory;
            if same_outcome {
                return Ok(record.clone());
            }
            error!(
                trigger_id,
                existing = record.state.as_status_str(),
                attempted = new_state.as_status_str(),
                "Conflicting second completion rejected"
            );
            return Err(BridgeError::CompletionConflict {
                trigger_id: trigger_id.to_string(),
            });
        }

        record.state = new_state;
        record.error_flags = error_flags;
        record.image_directory = image_directory;
        record.fault = fault;
        record.completed_at = Some(Utc::now());
        Ok(record.clone())
    }

    /// Look up a trigger. Unknown identifiers yield `Invalid`, never an
    /// error.
    pub fn get(&self, trigger_id: &str) -> TriggerView {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.records.get(trigger_id) {
            Some(record) => TriggerView::Known(record.clone()),
            None => TriggerView::Invalid,
        }
    }

    /// Id of one currently-busy trigger, if any. Used by the overall status
    /// endpoint.
    pub fn any_busy(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .order
            .iter()
            .find(|id| {
                inner
                    .records
                    .get(*id)
                    .is_some_and(|r| r.state == TriggerState::Busy)
            })
            .cloned()
    }

    /// Number of retained records.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_if_full(inner: &mut RegistryInner, cap: usize) {
        if inner.records.len() < cap {
            return;
        }

        // Oldest terminal record first.
        let victim = inner
            .order
            .iter()
            .position(|id| {
                inner
                    .records
                    .get(id)
                    .is_some_and(|r| r.state != TriggerState::Busy)
            })
            .or_else(|| {
                // Every retained record is still Busy.
                warn!(cap, "Trigger registry full of busy records, evicting oldest");
                (!inner.order.is_empty()).then_some(0)
            });

        if let Some(idx) = victim {
            if let Some(id) = inner.order.remove(idx) {
                inner.records.remove(&id);
            }
        }
    }
}
