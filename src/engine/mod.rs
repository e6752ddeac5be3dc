mod availability;
mod booking;
mod capacity;
mod error;
mod promotion;
mod queries;
mod schedule;
mod setup;
mod store;
mod waitlist;

pub use availability::{merge_overlapping, slot_spans, subtract_intervals, working_intervals};
pub use booking::{BookingRequest, Cancellation};
pub use capacity::{Dimension, Load};
pub use error::EngineError;
pub use promotion::{FreedSlot, PromotionOutcome, SweepOutcome, WaitlistPlacement, WaitlistRequest};
pub use queries::{SessionFilter, SlotQuery, WaitlistFilter};
pub use setup::{apply_setting, setting_values};
pub use store::{CoachState, InMemoryStore, StudioState, Wallet};
pub use waitlist::{SlotKey, WaitlistLedger};

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::clock::{Clock, SystemClock};
use crate::model::*;
use crate::notify::{Notifier, NotifyHub};
use crate::plan::{PlanUsage, QuotaResource, UnlimitedPlan};
use crate::wal::{Wal, WalWriter};

/// Collaborators an engine talks to. Everything here is outside the
/// tenant's own state.
#[derive(Clone)]
pub struct EngineDeps {
    pub notifier: Arc<dyn Notifier>,
    pub plan: Arc<dyn PlanUsage>,
    pub clock: Arc<dyn Clock>,
}

impl Default for EngineDeps {
    fn default() -> Self {
        Self {
            notifier: Arc::new(NotifyHub::new()),
            plan: Arc::new(UnlimitedPlan),
            clock: Arc::new(SystemClock),
        }
    }
}

// ── Tenant state (replay + snapshot) ─────────────────────

/// Everything a tenant's log rebuilds. Used for startup replay and, on a
/// scratch copy, for compaction.
pub struct TenantState {
    /// `None` until the tenant changes its settings.
    pub settings: Option<TenantSettings>,
    pub store: InMemoryStore,
    pub waitlist: WaitlistLedger,
}

impl TenantState {
    pub fn replay(events: &[Event]) -> Self {
        let mut state = Self {
            settings: None,
            store: InMemoryStore::new(),
            waitlist: WaitlistLedger::new(),
        };
        for event in events {
            state.apply(event);
        }
        state
    }

    fn apply(&mut self, event: &Event) {
        match event {
            Event::SettingsUpdated { settings } => self.settings = Some(settings.clone()),
            Event::WaitlistJoined { .. }
            | Event::WaitlistTransitioned { .. }
            | Event::WaitlistPassedOver { .. } => self.waitlist.apply(event),
            Event::WaitlistBooked { .. } => {
                self.store.apply_event(event);
                self.waitlist.apply(event);
            }
            other => self.store.apply_event(other),
        }
    }

    pub fn snapshot(&self) -> Vec<Event> {
        let mut events = Vec::new();
        if let Some(settings) = &self.settings {
            events.push(Event::SettingsUpdated { settings: settings.clone() });
        }
        events.extend(self.store.snapshot());
        events.extend(self.waitlist.snapshot());
        events
    }
}

/// WAL compactor: fold a full history into its snapshot.
pub fn compact_events(events: &[Event]) -> Vec<Event> {
    TenantState::replay(events).snapshot()
}

// ── Engine ───────────────────────────────────────────────

/// One tenant's booking engine.
///
/// Lock order, outermost first: waitlist, studio, coach, wallet. Settings
/// are read on their own and never held across another lock. Creates,
/// grants and time-off submissions hold `setup` from their duplicate check
/// through the insert; it is taken before any other lock.
pub struct Engine {
    tenant: String,
    pub(super) settings: RwLock<TenantSettings>,
    pub(super) store: InMemoryStore,
    pub(super) waitlist: Mutex<WaitlistLedger>,
    pub(super) setup: Mutex<()>,
    wal: WalWriter,
    notifier: Arc<dyn Notifier>,
    plan: Arc<dyn PlanUsage>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    /// Replay `wal_path` and start its group-commit writer. `defaults` apply
    /// until the tenant stores settings of its own.
    pub fn new(
        tenant: &str,
        wal_path: &Path,
        defaults: TenantSettings,
        deps: EngineDeps,
    ) -> std::io::Result<Self> {
        let (wal, events) = Wal::recover(wal_path)?;
        let state = TenantState::replay(&events);
        let wal = WalWriter::spawn(wal, compact_events);

        Ok(Self {
            tenant: tenant.to_string(),
            settings: RwLock::new(state.settings.unwrap_or(defaults)),
            store: state.store,
            waitlist: Mutex::new(state.waitlist),
            setup: Mutex::new(()),
            wal,
            notifier: deps.notifier,
            plan: deps.plan,
            clock: deps.clock,
        })
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub(super) fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    pub async fn settings(&self) -> TenantSettings {
        self.settings.read().await.clone()
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.wal
            .append(event)
            .await
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn compact(&self) -> Result<(), EngineError> {
        self.wal
            .compact()
            .await
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }

    /// Deliver events after the state change is durable. Delivery failures
    /// are logged and never undo anything.
    pub(super) async fn emit(&self, events: Vec<DomainEvent>) {
        for event in events {
            if let Err(e) = self.notifier.notify(&event).await {
                metrics::counter!(crate::observability::NOTIFY_FAILURES_TOTAL, "event" => event.name())
                    .increment(1);
                warn!("tenant {}: {} notification failed: {e}", self.tenant, event.name());
            }
        }
    }

    /// The outermost booking gate. An unreachable plan service blocks.
    pub(super) async fn check_quota(&self) -> Result<(), EngineError> {
        match self.plan.check_quota(&self.tenant, QuotaResource::SessionsPerMonth).await {
            Ok(decision) if decision.allowed => Ok(()),
            Ok(decision) => Err(EngineError::QuotaExceeded {
                reason: decision.reason.unwrap_or_else(|| "plan limit reached".into()),
                usage: decision.usage,
            }),
            Err(e) => {
                warn!("tenant {}: quota check failed: {e}", self.tenant);
                Err(EngineError::QuotaExceeded {
                    reason: "plan usage service unavailable".into(),
                    usage: None,
                })
            }
        }
    }

    /// Studio a request applies to: the room's studio, the named studio,
    /// the tenant default, or the only studio there is.
    pub(super) fn resolve_studio(
        &self,
        studio_id: Option<ulid::Ulid>,
        room_id: Option<ulid::Ulid>,
        settings: &TenantSettings,
    ) -> Result<ulid::Ulid, EngineError> {
        if let Some(room_id) = room_id {
            let owner = self
                .store
                .studio_for_room(&room_id)
                .ok_or(EngineError::NotFound("room", room_id))?;
            if studio_id.is_some_and(|s| s != owner) {
                return Err(EngineError::NotFound("room", room_id));
            }
            return Ok(owner);
        }
        if let Some(id) = studio_id.or(settings.default_studio) {
            return match self.store.studio(&id) {
                Some(_) => Ok(id),
                None => Err(EngineError::NotFound("studio", id)),
            };
        }
        match self.store.studio_ids().as_slice() {
            [only] => Ok(*only),
            ids => Err(EngineError::StudioRequired(ids.len())),
        }
    }
}

pub(crate) fn require_admin(actor: Actor, what: &str) -> Result<(), EngineError> {
    match actor {
        Actor::Admin => Ok(()),
        Actor::Coach(_) => Err(EngineError::Forbidden(format!("{what} requires an admin"))),
    }
}

pub(crate) fn check_len(value: Option<&str>, max: usize, what: &'static str) -> Result<(), EngineError> {
    match value {
        Some(v) if v.len() > max => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

/// Shape checks shared by every span a caller supplies.
pub(crate) fn validate_span(span: &Span, max_duration: Ms) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(EngineError::InvalidTimeRange("end must be after start".into()));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > max_duration {
        return Err(EngineError::InvalidTimeRange("span too long".into()));
    }
    Ok(())
}
