use std::time::Instant;

use tracing::{debug, info};
use ulid::Ulid;

use crate::calendar::local_date;
use crate::limits::*;
use crate::model::*;
use crate::observability::{BOOKINGS_TOTAL, BOOKING_LOCK_WAIT_SECONDS, CANCELLATIONS_TOTAL};

use super::capacity;
use super::promotion::{FreedSlot, PromotionOutcome};
use super::store::{apply_booked, apply_cancelled, apply_status_changed, CoachState, StudioState, Wallet};
use super::waitlist::WaitlistLedger;
use super::{check_len, validate_span, Engine, EngineError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub client_id: Ulid,
    pub studio_id: Option<Ulid>,
    pub room_id: Option<Ulid>,
    pub coach_id: Option<Ulid>,
    pub span: Span,
}

impl BookingRequest {
    pub fn new(client_id: Ulid, span: Span) -> Self {
        Self { id: Ulid::new(), client_id, studio_id: None, room_id: None, coach_id: None, span }
    }

    pub fn with_studio(mut self, studio_id: Ulid) -> Self {
        self.studio_id = Some(studio_id);
        self
    }

    pub fn with_room(mut self, room_id: Ulid) -> Self {
        self.room_id = Some(room_id);
        self
    }

    pub fn with_coach(mut self, coach_id: Ulid) -> Self {
        self.coach_id = Some(coach_id);
        self
    }
}

/// Result of a cancellation, including what the waitlist did with the freed slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancellation {
    pub session: Session,
    pub refunded: bool,
    pub promotion: PromotionOutcome,
}

/// Credit, capacity, then coach exclusivity. Returns the package to debit.
fn check_booking(
    studio: &StudioState,
    coach: Option<&CoachState>,
    wallet: &Wallet,
    req: &BookingRequest,
    now: Ms,
) -> Result<Ulid, EngineError> {
    let package_id = wallet.choose_package(now)?;
    let loads = capacity::place_loads(studio, req.room_id.as_ref(), &req.span)?;
    capacity::check_place(&loads)?;
    if let Some(coach) = coach {
        capacity::check_coach(coach, &req.span)?;
    }
    Ok(package_id)
}

impl Engine {
    /// Book one session. Quota is asked first and nothing else runs when it
    /// refuses; credit, capacity and coach checks then run under the studio,
    /// coach and wallet locks together with the insert and the debit.
    pub async fn create_booking(&self, req: BookingRequest) -> Result<Session, EngineError> {
        let result = self.create_booking_inner(&req).await;
        let outcome = match &result {
            Ok(_) => "created",
            Err(e) => e.kind(),
        };
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        let session = result?;
        self.emit(vec![DomainEvent::SessionBooked { session: session.clone() }]).await;
        Ok(session)
    }

    async fn create_booking_inner(&self, req: &BookingRequest) -> Result<Session, EngineError> {
        let now = self.now();
        let settings = self.settings().await;
        validate_booking_span(&req.span, now, &settings)?;
        self.check_quota().await?;
        let studio_id = self.resolve_studio(req.studio_id, req.room_id, &settings)?;
        self.commit_booking(req, studio_id, now, None).await.map(|(session, _)| session)
    }

    /// Quota-checked commit used by waitlist promotion. The session and the
    /// entry's move to `booked` are persisted as one record. `offer` is given
    /// when the entry is booked straight from pending.
    pub(super) async fn book_for_waitlist(
        &self,
        ledger: &mut WaitlistLedger,
        entry_id: Ulid,
        offer: Option<Offer>,
        req: &BookingRequest,
        studio_id: Ulid,
        now: Ms,
    ) -> Result<Session, EngineError> {
        let from = ledger
            .get(&entry_id)
            .map(|e| e.status)
            .ok_or(EngineError::NotFound("waitlist entry", entry_id))?;
        let legal = match from {
            WaitlistStatus::Pending => offer.is_some(),
            WaitlistStatus::Notified | WaitlistStatus::Approved => true,
            _ => false,
        };
        if !legal {
            return Err(EngineError::InvalidState {
                from: from.as_str(),
                to: WaitlistStatus::Booked.as_str(),
            });
        }
        self.check_quota().await?;
        let (session, event) = self
            .commit_booking(req, studio_id, now, Some((entry_id, offer)))
            .await?;
        ledger.apply(&event);
        Ok(session)
    }

    /// The atomic unit: re-check against live state, persist, then debit and insert.
    /// Returns the session and the record written for it.
    pub(super) async fn commit_booking(
        &self,
        req: &BookingRequest,
        studio_id: Ulid,
        now: Ms,
        waitlist_entry: Option<(Ulid, Option<Offer>)>,
    ) -> Result<(Session, Event), EngineError> {
        let studio_arc = self
            .store
            .studio(&studio_id)
            .ok_or(EngineError::NotFound("studio", studio_id))?;
        let coach_arc = match req.coach_id {
            Some(id) => Some(self.store.coach(&id).ok_or(EngineError::NotFound("coach", id))?),
            None => None,
        };
        let wallet_arc = self
            .store
            .wallet(&req.client_id)
            .ok_or(EngineError::NoSessionCredit { remaining: 0 })?;
        if self.store.studio_for_session(&req.id).is_some() {
            return Err(EngineError::AlreadyExists(req.id));
        }

        let wait = Instant::now();
        let mut studio = studio_arc.write().await;
        let mut coach = match &coach_arc {
            Some(c) => Some(c.write().await),
            None => None,
        };
        let mut wallet = wallet_arc.lock().await;
        metrics::histogram!(BOOKING_LOCK_WAIT_SECONDS).record(wait.elapsed().as_secs_f64());

        let package_id = check_booking(&studio, coach.as_deref(), &wallet, req, now)?;
        if studio.sessions.len() >= MAX_SESSIONS_PER_STUDIO {
            return Err(EngineError::LimitExceeded("too many sessions in studio"));
        }

        let session = Session {
            id: req.id,
            tenant_id: self.tenant().to_string(),
            studio_id,
            room_id: req.room_id,
            coach_id: req.coach_id,
            client_id: req.client_id,
            package_id,
            span: req.span,
            status: SessionStatus::Scheduled,
            cancellation_reason: None,
            created_at: now,
        };
        let event = match waitlist_entry {
            Some((entry_id, offer)) => Event::WaitlistBooked { session: session.clone(), entry_id, offer },
            None => Event::SessionBooked { session: session.clone() },
        };
        self.wal_append(&event).await?;
        apply_booked(&mut studio, coach.as_deref_mut(), Some(&mut *wallet), &session);
        self.store.index_session(session.id, studio_id);
        debug!("tenant {}: booked session {} for client {}", self.tenant(), session.id, session.client_id);
        Ok((session, event))
    }

    /// Run every booking check without committing anything.
    pub(super) async fn preflight(
        &self,
        req: &BookingRequest,
        studio_id: Ulid,
        now: Ms,
    ) -> Result<(), EngineError> {
        let studio_arc = self
            .store
            .studio(&studio_id)
            .ok_or(EngineError::NotFound("studio", studio_id))?;
        let coach_arc = match req.coach_id {
            Some(id) => Some(self.store.coach(&id).ok_or(EngineError::NotFound("coach", id))?),
            None => None,
        };
        let wallet_arc = self
            .store
            .wallet(&req.client_id)
            .ok_or(EngineError::NoSessionCredit { remaining: 0 })?;

        let studio = studio_arc.read().await;
        let coach = match &coach_arc {
            Some(c) => Some(c.read().await),
            None => None,
        };
        let wallet = wallet_arc.lock().await;
        check_booking(&studio, coach.as_deref(), &wallet, req, now).map(|_| ())
    }

    /// Cancel a scheduled session, refund per policy, then hand the freed
    /// slot to the waitlist.
    pub async fn cancel_booking(
        &self,
        session_id: Ulid,
        reason: Option<String>,
    ) -> Result<Cancellation, EngineError> {
        check_len(reason.as_deref(), MAX_REASON_LEN, "cancellation reason too long")?;
        let studio_id = self
            .store
            .studio_for_session(&session_id)
            .ok_or(EngineError::NotFound("session", session_id))?;
        let studio_arc = self
            .store
            .studio(&studio_id)
            .ok_or(EngineError::NotFound("studio", studio_id))?;
        let now = self.now();
        let policy = self.settings.read().await.refund_policy;

        let (session, refunded) = {
            let mut studio = studio_arc.write().await;
            let session = studio
                .session(&session_id)
                .cloned()
                .ok_or(EngineError::NotFound("session", session_id))?;
            if session.status != SessionStatus::Scheduled {
                return Err(EngineError::InvalidState {
                    from: session.status.as_str(),
                    to: SessionStatus::Cancelled.as_str(),
                });
            }
            let coach_arc = session.coach_id.and_then(|c| self.store.coach(&c));
            let mut coach = match &coach_arc {
                Some(c) => Some(c.write().await),
                None => None,
            };
            let refunded = policy.refunds(now, session.span.start);
            let wallet_arc = if refunded { self.store.wallet(&session.client_id) } else { None };
            let mut wallet = match &wallet_arc {
                Some(w) => Some(w.lock().await),
                None => None,
            };

            self.wal_append(&Event::SessionCancelled {
                id: session_id,
                studio_id,
                reason: reason.clone(),
                refunded,
            })
            .await?;
            apply_cancelled(&mut studio, coach.as_deref_mut(), wallet.as_deref_mut(), &session_id, reason);
            let session = studio.session(&session_id).cloned().unwrap_or(session);
            (session, refunded)
        };

        metrics::counter!(CANCELLATIONS_TOTAL, "refunded" => if refunded { "true" } else { "false" })
            .increment(1);
        info!("tenant {}: session {session_id} cancelled (refunded: {refunded})", self.tenant());
        self.emit(vec![DomainEvent::SessionCancelled { session: session.clone(), refunded }]).await;

        let promotion = self.promote(FreedSlot::of(&session), session.id).await;
        Ok(Cancellation { session, refunded, promotion })
    }

    /// `scheduled → completed | no_show`. Neither frees the slot nor refunds.
    pub async fn mark_attendance(
        &self,
        actor: Actor,
        session_id: Ulid,
        status: SessionStatus,
    ) -> Result<Session, EngineError> {
        if !matches!(status, SessionStatus::Completed | SessionStatus::NoShow) {
            return Err(EngineError::InvalidState {
                from: SessionStatus::Scheduled.as_str(),
                to: status.as_str(),
            });
        }
        let studio_id = self
            .store
            .studio_for_session(&session_id)
            .ok_or(EngineError::NotFound("session", session_id))?;
        let studio_arc = self
            .store
            .studio(&studio_id)
            .ok_or(EngineError::NotFound("studio", studio_id))?;
        let mut studio = studio_arc.write().await;
        let session = studio
            .session(&session_id)
            .ok_or(EngineError::NotFound("session", session_id))?;
        if let Actor::Coach(me) = actor
            && session.coach_id != Some(me)
        {
            return Err(EngineError::Forbidden("coaches may only mark their own sessions".into()));
        }
        if session.status != SessionStatus::Scheduled {
            return Err(EngineError::InvalidState { from: session.status.as_str(), to: status.as_str() });
        }

        self.wal_append(&Event::SessionStatusChanged { id: session_id, studio_id, status }).await?;
        apply_status_changed(&mut studio, &session_id, status);
        studio
            .session(&session_id)
            .cloned()
            .ok_or(EngineError::NotFound("session", session_id))
    }
}

/// Bookings must be in the future and stay within one local day.
fn validate_booking_span(span: &Span, now: Ms, settings: &TenantSettings) -> Result<(), EngineError> {
    validate_span(span, MAX_SESSION_DURATION_MS)?;
    if span.start < now {
        return Err(EngineError::InvalidTimeRange("cannot book in the past".into()));
    }
    let tz = settings.timezone;
    // The end instant is exclusive: a session ending at midnight stays on its day.
    if local_date(span.start, tz) != local_date(span.end - 1, tz) {
        return Err(EngineError::InvalidTimeRange("session crosses a day boundary".into()));
    }
    Ok(())
}
