use ulid::Ulid;

use crate::plan::QuotaUsage;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("plan quota exceeded: {reason}{}", usage_suffix(.usage))]
    QuotaExceeded {
        reason: String,
        usage: Option<QuotaUsage>,
    },
    #[error("no session credit: {remaining} credit(s) on unusable packages")]
    NoSessionCredit { remaining: u32 },
    #[error("slot full: {booked} of {capacity} booked")]
    SlotFull { capacity: u32, booked: u32 },
    #[error("coach {coach_id} already has session {session_id} at that time")]
    CoachConflict { coach_id: Ulid, session_id: Ulid },
    #[error("invalid time range: {0}")]
    InvalidTimeRange(String),
    #[error("{0} not found: {1}")]
    NotFound(&'static str, Ulid),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("client already waiting for this slot: entry {0}")]
    DuplicateWaitlistEntry(Ulid),
    #[error("studio_id required: tenant has {0} studios and no default")]
    StudioRequired(usize),
    #[error("offer for waitlist entry {0} has lapsed")]
    OfferLapsed(Ulid),
    #[error("invalid transition from {from} to {to}")]
    InvalidState { from: &'static str, to: &'static str },
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

fn usage_suffix(usage: &Option<QuotaUsage>) -> String {
    match usage {
        Some(u) => format!(" ({} of {} used)", u.used, u.limit),
        None => String::new(),
    }
}

impl EngineError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::QuotaExceeded { .. } => "quota_exceeded",
            EngineError::NoSessionCredit { .. } => "no_session_credit",
            EngineError::SlotFull { .. } => "slot_full",
            EngineError::CoachConflict { .. } => "coach_conflict",
            EngineError::InvalidTimeRange(_) => "invalid_time_range",
            EngineError::NotFound(..) => "not_found",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::DuplicateWaitlistEntry(_) => "duplicate_waitlist_entry",
            EngineError::StudioRequired(_) => "studio_required",
            EngineError::OfferLapsed(_) => "offer_lapsed",
            EngineError::InvalidState { .. } => "invalid_state",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_message_includes_usage() {
        let e = EngineError::QuotaExceeded {
            reason: "monthly session cap reached".into(),
            usage: Some(QuotaUsage { used: 50, limit: 50 }),
        };
        assert_eq!(
            e.to_string(),
            "plan quota exceeded: monthly session cap reached (50 of 50 used)"
        );
    }

    #[test]
    fn quota_message_without_usage() {
        let e = EngineError::QuotaExceeded { reason: "blocked".into(), usage: None };
        assert_eq!(e.to_string(), "plan quota exceeded: blocked");
    }

    #[test]
    fn not_found_names_entity() {
        let id = Ulid::nil();
        let e = EngineError::NotFound("session", id);
        assert_eq!(e.to_string(), format!("session not found: {id}"));
        assert_eq!(e.kind(), "not_found");
    }
}
