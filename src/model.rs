use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// The overlapping part of two spans, if any.
    pub fn intersect(&self, other: &Span) -> Option<Span> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then(|| Span::new(start, end))
    }
}

/// Minutes since local midnight, `0..=1440`. 1440 is only meaningful as an
/// exclusive end ("24:00").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub const MIDNIGHT: TimeOfDay = TimeOfDay(0);
    pub const END_OF_DAY: TimeOfDay = TimeOfDay(1440);

    pub fn from_hm(hour: u16, minute: u16) -> Option<Self> {
        let total = hour.checked_mul(60)?.checked_add(minute)?;
        (minute < 60 && total <= 1440).then_some(TimeOfDay(total))
    }

    pub fn from_minutes(minutes: u16) -> Option<Self> {
        (minutes <= 1440).then_some(TimeOfDay(minutes))
    }

    pub fn minutes(self) -> u16 {
        self.0
    }

    pub fn offset_ms(self) -> Ms {
        self.0 as Ms * MINUTE_MS
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl FromStr for TimeOfDay {
    type Err = String;

    /// Accepts `HH:MM` and `HH:MM:SS` (seconds must be zero).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split(':');
        let (Some(h), Some(m)) = (parts.next(), parts.next()) else {
            return Err(format!("expected HH:MM, got {s:?}"));
        };
        if let Some(sec) = parts.next()
            && sec != "00"
        {
            return Err(format!("slot times have minute precision, got {s:?}"));
        }
        let hour: u16 = h.parse().map_err(|_| format!("bad hour in {s:?}"))?;
        let minute: u16 = m.parse().map_err(|_| format!("bad minute in {s:?}"))?;
        TimeOfDay::from_hm(hour, minute).ok_or_else(|| format!("time out of range: {s:?}"))
    }
}

// ── Tenant configuration ─────────────────────────────────────────

/// What happens to the session credit when a booking is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundPolicy {
    /// Every cancellation returns the credit.
    Always,
    /// Cancellations later than `start - min_notice_ms` forfeit the credit.
    NoticeWindow { min_notice_ms: Ms },
}

impl RefundPolicy {
    pub fn refunds(&self, cancelled_at: Ms, session_start: Ms) -> bool {
        match self {
            RefundPolicy::Always => true,
            RefundPolicy::NoticeWindow { min_notice_ms } => {
                cancelled_at <= session_start.saturating_sub(*min_notice_ms)
            }
        }
    }
}

/// How a freed slot is handed to the head of the waitlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromotionPolicy {
    /// Book the first eligible entry immediately.
    AutoBook,
    /// Offer the slot and wait up to `response_window_ms` for confirmation.
    NotifyFirst { response_window_ms: Ms },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSettings {
    pub session_length_ms: Ms,
    pub timezone: Tz,
    pub allow_coach_self_edit_availability: bool,
    pub refund_policy: RefundPolicy,
    pub promotion_policy: PromotionPolicy,
    /// Studio used when a request names none.
    pub default_studio: Option<Ulid>,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            session_length_ms: 20 * MINUTE_MS,
            timezone: Tz::UTC,
            allow_coach_self_edit_availability: false,
            refund_policy: RefundPolicy::Always,
            promotion_policy: PromotionPolicy::AutoBook,
            default_studio: None,
        }
    }
}

// ── Capacity resources ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Studio {
    pub id: Ulid,
    pub name: Option<String>,
    /// Max concurrent sessions across the whole studio.
    pub capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub studio_id: Ulid,
    pub name: Option<String>,
    pub capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coach {
    pub id: Ulid,
    pub name: Option<String>,
}

/// Whose weekly schedule a rule belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScheduleOwner {
    Studio(Ulid),
    Coach(Ulid),
}

impl ScheduleOwner {
    pub fn id(&self) -> Ulid {
        match self {
            ScheduleOwner::Studio(id) | ScheduleOwner::Coach(id) => *id,
        }
    }
}

/// Weekly recurring availability. `day_of_week` is 0 = Sunday … 6 = Saturday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRule {
    pub owner: ScheduleOwner,
    pub day_of_week: u8,
    pub start_time: TimeOfDay,
    pub end_time: TimeOfDay,
    pub available: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeOffStatus {
    Pending,
    Approved,
    Rejected,
}

impl TimeOffStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeOffStatus::Pending => "pending",
            TimeOffStatus::Approved => "approved",
            TimeOffStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOffRequest {
    pub id: Ulid,
    pub tenant_id: String,
    pub coach_id: Ulid,
    pub span: Span,
    pub notes: Option<String>,
    pub status: TimeOffStatus,
    pub requested_at: Ms,
    pub reviewed_at: Option<Ms>,
}

// ── Sessions & credit ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Scheduled,
    Completed,
    Cancelled,
    NoShow,
}

impl SessionStatus {
    /// Whether a session in this state still occupies its slot.
    pub fn consumes_capacity(self) -> bool {
        match self {
            SessionStatus::Scheduled | SessionStatus::Completed | SessionStatus::NoShow => true,
            SessionStatus::Cancelled => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Scheduled => "scheduled",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::NoShow => "no_show",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(SessionStatus::Scheduled),
            "completed" => Ok(SessionStatus::Completed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            "no_show" => Ok(SessionStatus::NoShow),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Ulid,
    pub tenant_id: String,
    pub studio_id: Ulid,
    pub room_id: Option<Ulid>,
    pub coach_id: Option<Ulid>,
    pub client_id: Ulid,
    /// Package debited for this session.
    pub package_id: Ulid,
    pub span: Span,
    pub status: SessionStatus,
    pub cancellation_reason: Option<String>,
    pub created_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackageStatus {
    Active,
    Expired,
    Depleted,
    Cancelled,
}

impl PackageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PackageStatus::Active => "active",
            PackageStatus::Expired => "expired",
            PackageStatus::Depleted => "depleted",
            PackageStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientPackage {
    pub id: Ulid,
    pub client_id: Ulid,
    /// Catalog package this purchase was made from.
    pub package_id: Option<Ulid>,
    pub sessions_used: u32,
    pub sessions_remaining: u32,
    pub expiry_date: Option<Ms>,
    pub status: PackageStatus,
}

impl ClientPackage {
    /// Status as observed at `now`; expiry is applied lazily.
    pub fn status_at(&self, now: Ms) -> PackageStatus {
        match self.status {
            PackageStatus::Active | PackageStatus::Depleted
                if self.expiry_date.is_some_and(|exp| exp <= now) =>
            {
                PackageStatus::Expired
            }
            status => status,
        }
    }

    pub fn is_usable(&self, now: Ms) -> bool {
        self.status_at(now) == PackageStatus::Active && self.sessions_remaining > 0
    }

    pub(crate) fn debit(&mut self) {
        debug_assert!(self.sessions_remaining > 0);
        self.sessions_remaining -= 1;
        self.sessions_used += 1;
        if self.sessions_remaining == 0 && self.status == PackageStatus::Active {
            self.status = PackageStatus::Depleted;
        }
    }

    pub(crate) fn refund(&mut self) {
        if self.sessions_used == 0 {
            return;
        }
        self.sessions_used -= 1;
        self.sessions_remaining += 1;
        if self.status == PackageStatus::Depleted {
            self.status = PackageStatus::Active;
        }
    }
}

// ── Waitlist ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitlistStatus {
    Pending,
    Notified,
    /// Offer accepted; the booking commit is in flight.
    Approved,
    Booked,
    Cancelled,
    Expired,
}

impl WaitlistStatus {
    /// Active entries hold the client's place in a queue.
    pub fn is_active(self) -> bool {
        match self {
            WaitlistStatus::Pending | WaitlistStatus::Notified | WaitlistStatus::Approved => true,
            WaitlistStatus::Booked | WaitlistStatus::Cancelled | WaitlistStatus::Expired => false,
        }
    }

    pub fn can_transition_to(self, to: WaitlistStatus) -> bool {
        use WaitlistStatus::*;
        matches!(
            (self, to),
            (Pending, Notified)
                | (Pending, Cancelled)
                | (Pending, Expired)
                | (Notified, Approved)
                | (Notified, Booked)
                | (Notified, Pending)
                | (Notified, Expired)
                | (Approved, Booked)
                | (Approved, Pending)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WaitlistStatus::Pending => "pending",
            WaitlistStatus::Notified => "notified",
            WaitlistStatus::Approved => "approved",
            WaitlistStatus::Booked => "booked",
            WaitlistStatus::Cancelled => "cancelled",
            WaitlistStatus::Expired => "expired",
        }
    }
}

/// A slot that was offered to a waitlisted client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    /// Identifies the capacity release the offer came from.
    pub release: Ulid,
    pub studio_id: Ulid,
    pub room_id: Option<Ulid>,
    pub coach_id: Option<Ulid>,
    pub span: Span,
    pub respond_by: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Ulid,
    pub tenant_id: String,
    pub client_id: Ulid,
    /// `None` waits on any studio of the tenant.
    pub studio_id: Option<Ulid>,
    pub preferred_date: NaiveDate,
    pub preferred_time_slot: TimeOfDay,
    pub notes: Option<String>,
    pub status: WaitlistStatus,
    pub created_at: Ms,
    pub notified_at: Option<Ms>,
    pub offer: Option<Offer>,
    /// Release under which this entry was already tried and passed over.
    pub passed_over: Option<Ulid>,
    pub session_id: Option<Ulid>,
}

impl WaitlistEntry {
    pub fn matches_studio(&self, studio_id: Ulid) -> bool {
        self.studio_id.is_none_or(|s| s == studio_id)
    }
}

// ── Slots ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    Available,
    Full,
}

impl SlotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SlotStatus::Available => "available",
            SlotStatus::Full => "full",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub time: TimeOfDay,
    pub span: Span,
    pub status: SlotStatus,
}

/// Who is performing a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Admin,
    Coach(Ulid),
}

// ── WAL records ──────────────────────────────────────────────────

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SettingsUpdated {
        settings: TenantSettings,
    },
    StudioCreated {
        studio: Studio,
    },
    RoomCreated {
        room: Room,
    },
    CoachCreated {
        coach: Coach,
    },
    AvailabilityReplaced {
        owner: ScheduleOwner,
        rules: Vec<AvailabilityRule>,
    },
    TimeOffSubmitted {
        request: TimeOffRequest,
    },
    TimeOffReviewed {
        id: Ulid,
        coach_id: Ulid,
        status: TimeOffStatus,
        reviewed_at: Ms,
    },
    PackageGranted {
        package: ClientPackage,
    },
    /// A new booking: inserts the session and debits its package.
    SessionBooked {
        session: Session,
    },
    /// A waitlist entry booked into a session. Carries the booking and the
    /// entry's move to `booked` in one record. `offer` is set when the entry
    /// came straight from pending.
    WaitlistBooked {
        session: Session,
        entry_id: Ulid,
        offer: Option<Offer>,
    },
    /// Snapshot form of a session; never touches package balances.
    SessionRestored {
        session: Session,
    },
    SessionCancelled {
        id: Ulid,
        studio_id: Ulid,
        reason: Option<String>,
        refunded: bool,
    },
    SessionStatusChanged {
        id: Ulid,
        studio_id: Ulid,
        status: SessionStatus,
    },
    /// Also used as the snapshot form of an entry in any state.
    WaitlistJoined {
        entry: WaitlistEntry,
    },
    WaitlistTransitioned {
        id: Ulid,
        to: WaitlistStatus,
        at: Ms,
        offer: Option<Offer>,
        session_id: Option<Ulid>,
    },
    WaitlistPassedOver {
        id: Ulid,
        release: Ulid,
    },
}

// ── Notifications ────────────────────────────────────────────────

/// Outbound events for the notification collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    SessionBooked {
        session: Session,
    },
    SessionCancelled {
        session: Session,
        refunded: bool,
    },
    WaitlistPromoted {
        entry: WaitlistEntry,
        session_id: Option<Ulid>,
        respond_by: Option<Ms>,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::SessionBooked { .. } => "session_booked",
            DomainEvent::SessionCancelled { .. } => "session_cancelled",
            DomainEvent::WaitlistPromoted { .. } => "waitlist_promoted",
        }
    }

    pub fn studio_id(&self) -> Option<Ulid> {
        match self {
            DomainEvent::SessionBooked { session } | DomainEvent::SessionCancelled { session, .. } => {
                Some(session.studio_id)
            }
            DomainEvent::WaitlistPromoted { entry, .. } => entry
                .offer
                .as_ref()
                .map(|o| o.studio_id)
                .or(entry.studio_id),
        }
    }

    pub fn payload(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
    }
}
