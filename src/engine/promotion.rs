use chrono::NaiveDate;
use chrono_tz::Tz;
use tracing::{debug, error, info};
use ulid::Ulid;

use crate::calendar::{local_date, local_instant, local_time_of_day};
use crate::limits::*;
use crate::model::*;
use crate::observability::{PROMOTIONS_TOTAL, WAITLIST_JOINS_TOTAL, WAITLIST_SWEEP_TOTAL};

use super::booking::BookingRequest;
use super::capacity;
use super::waitlist::{SlotKey, WaitlistLedger};
use super::{check_len, Engine, EngineError};

/// A place and time where capacity was just released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreedSlot {
    pub studio_id: Ulid,
    pub room_id: Option<Ulid>,
    pub coach_id: Option<Ulid>,
    pub span: Span,
}

impl FreedSlot {
    pub fn of(session: &Session) -> Self {
        Self {
            studio_id: session.studio_id,
            room_id: session.room_id,
            coach_id: session.coach_id,
            span: session.span,
        }
    }

    fn from_offer(offer: &Offer) -> Self {
        Self {
            studio_id: offer.studio_id,
            room_id: offer.room_id,
            coach_id: offer.coach_id,
            span: offer.span,
        }
    }

    fn key(&self, tz: Tz) -> Option<SlotKey> {
        Some(SlotKey {
            date: local_date(self.span.start, tz)?,
            time: local_time_of_day(self.span.start, tz)?,
        })
    }

    fn offer(&self, release: Ulid, respond_by: Option<Ms>) -> Offer {
        Offer {
            release,
            studio_id: self.studio_id,
            room_id: self.room_id,
            coach_id: self.coach_id,
            span: self.span,
            respond_by,
        }
    }

    fn booking_for(&self, client_id: Ulid) -> BookingRequest {
        BookingRequest {
            id: Ulid::new(),
            client_id,
            studio_id: Some(self.studio_id),
            room_id: self.room_id,
            coach_id: self.coach_id,
            span: self.span,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PromotionOutcome {
    /// `(entry, session)` pairs booked straight away.
    pub booked: Vec<(Ulid, Ulid)>,
    /// Entries offered the slot and awaiting confirmation.
    pub notified: Vec<Ulid>,
    /// Entries passed over for this release.
    pub skipped: Vec<Ulid>,
}

impl PromotionOutcome {
    pub fn is_empty(&self) -> bool {
        self.booked.is_empty() && self.notified.is_empty() && self.skipped.is_empty()
    }

    fn merge(&mut self, other: PromotionOutcome) {
        self.booked.extend(other.booked);
        self.notified.extend(other.notified);
        self.skipped.extend(other.skipped);
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepOutcome {
    pub expired: Vec<Ulid>,
    /// Lapsed offers returned to pending.
    pub reverted: Vec<Ulid>,
    pub promotion: PromotionOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitlistRequest {
    pub id: Ulid,
    pub client_id: Ulid,
    pub studio_id: Option<Ulid>,
    pub preferred_date: NaiveDate,
    pub preferred_time_slot: TimeOfDay,
    pub notes: Option<String>,
}

/// A new entry and its place in line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitlistPlacement {
    pub entry: WaitlistEntry,
    pub position: usize,
}

enum Promoted {
    Booked(Session),
    Notified,
}

impl Engine {
    // ── Waitlist operations ──────────────────────────────

    pub async fn join_waitlist(&self, req: WaitlistRequest) -> Result<WaitlistPlacement, EngineError> {
        check_len(req.notes.as_deref(), MAX_NOTES_LEN, "notes too long")?;
        if let Some(studio_id) = req.studio_id
            && self.store.studio(&studio_id).is_none()
        {
            return Err(EngineError::NotFound("studio", studio_id));
        }
        if req.preferred_time_slot >= TimeOfDay::END_OF_DAY {
            return Err(EngineError::InvalidTimeRange("preferred time must be before 24:00".into()));
        }
        let now = self.now();
        let tz = self.settings.read().await.timezone;
        if local_instant(req.preferred_date, req.preferred_time_slot, tz) <= now {
            return Err(EngineError::InvalidTimeRange("preferred slot is in the past".into()));
        }

        let mut ledger = self.waitlist.lock().await;
        if ledger.active_len() >= MAX_WAITLIST_ENTRIES {
            return Err(EngineError::LimitExceeded("too many waitlist entries"));
        }
        let key = SlotKey { date: req.preferred_date, time: req.preferred_time_slot };
        if let Some(existing) = ledger.find_active(req.client_id, key) {
            return Err(EngineError::DuplicateWaitlistEntry(existing.id));
        }
        if ledger.get(&req.id).is_some() {
            return Err(EngineError::AlreadyExists(req.id));
        }

        let entry = WaitlistEntry {
            id: req.id,
            tenant_id: self.tenant().to_string(),
            client_id: req.client_id,
            studio_id: req.studio_id,
            preferred_date: req.preferred_date,
            preferred_time_slot: req.preferred_time_slot,
            notes: req.notes,
            status: WaitlistStatus::Pending,
            created_at: now,
            notified_at: None,
            offer: None,
            passed_over: None,
            session_id: None,
        };
        let event = Event::WaitlistJoined { entry: entry.clone() };
        self.wal_append(&event).await?;
        ledger.apply(&event);
        let position = ledger.position(&entry.id).unwrap_or(1);
        metrics::counter!(WAITLIST_JOINS_TOTAL).increment(1);
        Ok(WaitlistPlacement { entry, position })
    }

    /// Client withdraws. Only a pending entry can be withdrawn.
    pub async fn cancel_waitlist_entry(&self, entry_id: Ulid) -> Result<WaitlistEntry, EngineError> {
        let mut ledger = self.waitlist.lock().await;
        let entry = ledger
            .get(&entry_id)
            .ok_or(EngineError::NotFound("waitlist entry", entry_id))?;
        if entry.status != WaitlistStatus::Pending {
            return Err(EngineError::InvalidState {
                from: entry.status.as_str(),
                to: WaitlistStatus::Cancelled.as_str(),
            });
        }
        let now = self.now();
        self.transition(&mut ledger, entry_id, WaitlistStatus::Cancelled, now, None, None)
            .await
    }

    /// Accept an outstanding offer: `notified → approved → booked`. If the
    /// booking fails the entry goes back to pending and the slot moves on.
    pub async fn confirm_waitlist_offer(&self, entry_id: Ulid) -> Result<Session, EngineError> {
        let now = self.now();
        let mut ledger = self.waitlist.lock().await;
        let entry = ledger
            .get(&entry_id)
            .cloned()
            .ok_or(EngineError::NotFound("waitlist entry", entry_id))?;
        let offer = match (&entry.status, &entry.offer) {
            (WaitlistStatus::Notified, Some(offer)) => offer.clone(),
            _ => {
                return Err(EngineError::InvalidState {
                    from: entry.status.as_str(),
                    to: WaitlistStatus::Approved.as_str(),
                });
            }
        };
        let slot = FreedSlot::from_offer(&offer);
        let mut events = Vec::new();

        if offer.respond_by.is_some_and(|deadline| deadline <= now) {
            self.revert(&mut ledger, entry_id, offer.release, now).await?;
            self.promote_locked(&mut ledger, &slot, offer.release, now, &mut events).await;
            drop(ledger);
            self.emit(events).await;
            return Err(EngineError::OfferLapsed(entry_id));
        }

        self.transition(&mut ledger, entry_id, WaitlistStatus::Approved, now, None, None).await?;
        let req = slot.booking_for(entry.client_id);
        match self.book_for_waitlist(&mut ledger, entry_id, None, &req, slot.studio_id, now).await {
            Ok(session) => {
                metrics::counter!(PROMOTIONS_TOTAL, "outcome" => "confirmed").increment(1);
                drop(ledger);
                self.emit(vec![DomainEvent::SessionBooked { session: session.clone() }]).await;
                Ok(session)
            }
            Err(e) => {
                debug!("tenant {}: offer {entry_id} could not be booked: {e}", self.tenant());
                self.revert(&mut ledger, entry_id, offer.release, now).await?;
                self.promote_locked(&mut ledger, &slot, offer.release, now, &mut events).await;
                drop(ledger);
                self.emit(events).await;
                Err(e)
            }
        }
    }

    /// Expire entries whose slot has started, return lapsed offers to
    /// pending and re-offer the slots they held.
    pub async fn sweep_waitlist(&self) -> SweepOutcome {
        let now = self.now();
        let tz = self.settings.read().await.timezone;
        let mut ledger = self.waitlist.lock().await;
        let mut events = Vec::new();
        let mut outcome = SweepOutcome::default();

        let freed = self.expire_and_lapse(&mut ledger, None, now, tz, &mut outcome).await;
        for (slot, release) in freed {
            let p = self.promote_locked(&mut ledger, &slot, release, now, &mut events).await;
            outcome.promotion.merge(p);
        }
        drop(ledger);

        if !outcome.expired.is_empty() || !outcome.reverted.is_empty() {
            info!(
                "tenant {}: waitlist sweep expired {} reverted {}",
                self.tenant(),
                outcome.expired.len(),
                outcome.reverted.len()
            );
        }
        self.emit(events).await;
        outcome
    }

    // ── Promotion ────────────────────────────────────────

    /// Hand a freed slot to the head of its queue. Failures for individual
    /// entries only move on to the next one.
    pub async fn promote(&self, slot: FreedSlot, release: Ulid) -> PromotionOutcome {
        let now = self.now();
        let tz = self.settings.read().await.timezone;
        let mut ledger = self.waitlist.lock().await;
        let mut events = Vec::new();
        let mut outcome = PromotionOutcome::default();

        let mut lazily = SweepOutcome::default();
        let freed = match slot.key(tz) {
            Some(key) => self.expire_and_lapse(&mut ledger, Some(key), now, tz, &mut lazily).await,
            None => Vec::new(),
        };
        outcome.merge(self.promote_locked(&mut ledger, &slot, release, now, &mut events).await);
        for (lapsed, lapsed_release) in freed {
            outcome.merge(self.promote_locked(&mut ledger, &lapsed, lapsed_release, now, &mut events).await);
        }
        drop(ledger);

        self.emit(events).await;
        outcome
    }

    async fn promote_locked(
        &self,
        ledger: &mut WaitlistLedger,
        slot: &FreedSlot,
        release: Ulid,
        now: Ms,
        events: &mut Vec<DomainEvent>,
    ) -> PromotionOutcome {
        let mut outcome = PromotionOutcome::default();
        let settings = self.settings().await;
        let Some(key) = slot.key(settings.timezone) else { return outcome };
        if slot.span.start <= now {
            return outcome;
        }

        let free = match self.free_capacity(slot).await {
            Ok(free) => free,
            Err(e) => {
                debug!("tenant {}: no promotion for release {release}: {e}", self.tenant());
                return outcome;
            }
        };
        let mut free = free.saturating_sub(ledger.outstanding_offers(slot.studio_id, &slot.span));
        if free == 0 {
            return outcome;
        }

        let candidates: Vec<WaitlistEntry> = ledger
            .queue(key)
            .filter(|e| e.status == WaitlistStatus::Pending)
            .filter(|e| e.matches_studio(slot.studio_id))
            .filter(|e| e.passed_over != Some(release))
            .cloned()
            .collect();

        for entry in candidates {
            if free == 0 {
                break;
            }
            let attempt = match settings.promotion_policy {
                PromotionPolicy::AutoBook => self.auto_book(ledger, &entry, slot, release, now).await,
                PromotionPolicy::NotifyFirst { response_window_ms } => {
                    self.offer(ledger, &entry, slot, release, now.saturating_add(response_window_ms)).await
                }
            };
            match attempt {
                Ok(promoted) => {
                    free -= 1;
                    let updated = ledger.get(&entry.id).cloned().unwrap_or(entry);
                    match promoted {
                        Promoted::Booked(session) => {
                            metrics::counter!(PROMOTIONS_TOTAL, "outcome" => "booked").increment(1);
                            info!("tenant {}: waitlist entry {} booked into {}", self.tenant(), updated.id, session.id);
                            outcome.booked.push((updated.id, session.id));
                            events.push(DomainEvent::SessionBooked { session: session.clone() });
                            events.push(DomainEvent::WaitlistPromoted {
                                entry: updated,
                                session_id: Some(session.id),
                                respond_by: None,
                            });
                        }
                        Promoted::Notified => {
                            metrics::counter!(PROMOTIONS_TOTAL, "outcome" => "notified").increment(1);
                            info!("tenant {}: waitlist entry {} offered slot", self.tenant(), updated.id);
                            outcome.notified.push(updated.id);
                            let respond_by = updated.offer.as_ref().and_then(|o| o.respond_by);
                            events.push(DomainEvent::WaitlistPromoted { entry: updated, session_id: None, respond_by });
                        }
                    }
                }
                // The slot itself is gone; nobody further down can have it either.
                Err(e @ (EngineError::SlotFull { .. } | EngineError::CoachConflict { .. })) => {
                    debug!("tenant {}: release {release} no longer free: {e}", self.tenant());
                    break;
                }
                Err(e @ EngineError::WalError(_)) => {
                    error!("tenant {}: promotion aborted: {e}", self.tenant());
                    break;
                }
                Err(e) => {
                    debug!("tenant {}: waitlist entry {} skipped: {e}", self.tenant(), entry.id);
                    metrics::counter!(PROMOTIONS_TOTAL, "outcome" => "skipped").increment(1);
                    if let Err(e) = self.pass_over(ledger, entry.id, release).await {
                        error!("tenant {}: promotion aborted: {e}", self.tenant());
                        break;
                    }
                    outcome.skipped.push(entry.id);
                }
            }
        }
        outcome
    }

    /// `pending → notified → booked` in one go, persisted with the booking.
    async fn auto_book(
        &self,
        ledger: &mut WaitlistLedger,
        entry: &WaitlistEntry,
        slot: &FreedSlot,
        release: Ulid,
        now: Ms,
    ) -> Result<Promoted, EngineError> {
        let req = slot.booking_for(entry.client_id);
        let offer = Some(slot.offer(release, None));
        let session = self
            .book_for_waitlist(ledger, entry.id, offer, &req, slot.studio_id, now)
            .await?;
        Ok(Promoted::Booked(session))
    }

    /// `pending → notified` once every booking check would pass.
    async fn offer(
        &self,
        ledger: &mut WaitlistLedger,
        entry: &WaitlistEntry,
        slot: &FreedSlot,
        release: Ulid,
        respond_by: Ms,
    ) -> Result<Promoted, EngineError> {
        let now = self.now();
        self.check_quota().await?;
        self.preflight(&slot.booking_for(entry.client_id), slot.studio_id, now).await?;
        self.transition(
            ledger,
            entry.id,
            WaitlistStatus::Notified,
            now,
            Some(slot.offer(release, Some(respond_by))),
            None,
        )
        .await?;
        Ok(Promoted::Notified)
    }

    /// Free sessions across the slot's studio, room and coach.
    async fn free_capacity(&self, slot: &FreedSlot) -> Result<u32, EngineError> {
        let studio_arc = self
            .store
            .studio(&slot.studio_id)
            .ok_or(EngineError::NotFound("studio", slot.studio_id))?;
        let coach_arc = slot.coach_id.and_then(|c| self.store.coach(&c));
        let studio = studio_arc.read().await;
        let mut loads = capacity::place_loads(&studio, slot.room_id.as_ref(), &slot.span)?;
        if let Some(coach) = &coach_arc {
            loads.push(capacity::coach_load(&*coach.read().await, &slot.span));
        }
        Ok(capacity::free_capacity(&loads))
    }

    // ── Ledger transitions ───────────────────────────────

    /// Persist and apply one status change. Illegal moves are rejected.
    async fn transition(
        &self,
        ledger: &mut WaitlistLedger,
        id: Ulid,
        to: WaitlistStatus,
        at: Ms,
        offer: Option<Offer>,
        session_id: Option<Ulid>,
    ) -> Result<WaitlistEntry, EngineError> {
        let from = ledger
            .get(&id)
            .map(|e| e.status)
            .ok_or(EngineError::NotFound("waitlist entry", id))?;
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidState { from: from.as_str(), to: to.as_str() });
        }
        let event = Event::WaitlistTransitioned { id, to, at, offer, session_id };
        self.wal_append(&event).await?;
        ledger.apply(&event);
        ledger.get(&id).cloned().ok_or(EngineError::NotFound("waitlist entry", id))
    }

    async fn pass_over(&self, ledger: &mut WaitlistLedger, id: Ulid, release: Ulid) -> Result<(), EngineError> {
        let event = Event::WaitlistPassedOver { id, release };
        self.wal_append(&event).await?;
        ledger.apply(&event);
        Ok(())
    }

    /// Back to pending at the original place, skipped for `release`.
    async fn revert(
        &self,
        ledger: &mut WaitlistLedger,
        id: Ulid,
        release: Ulid,
        now: Ms,
    ) -> Result<(), EngineError> {
        self.pass_over(ledger, id, release).await?;
        self.transition(ledger, id, WaitlistStatus::Pending, now, None, None).await?;
        Ok(())
    }

    /// Time-based transitions for one slot's queue, or every queue when
    /// `only` is `None`. Returns the offers that lapsed so their slots can
    /// be offered again.
    async fn expire_and_lapse(
        &self,
        ledger: &mut WaitlistLedger,
        only: Option<SlotKey>,
        now: Ms,
        tz: Tz,
        outcome: &mut SweepOutcome,
    ) -> Vec<(FreedSlot, Ulid)> {
        let keys = match only {
            Some(key) => vec![key],
            None => ledger.active_keys(),
        };
        let mut freed = Vec::new();

        for key in keys {
            let started = local_instant(key.date, key.time, tz) <= now;
            let entries: Vec<WaitlistEntry> = ledger.queue(key).cloned().collect();
            for entry in entries {
                let result = self.expire_or_lapse_one(ledger, &entry, started, now).await;
                match result {
                    Ok(Some(Lapse::Expired)) => {
                        metrics::counter!(WAITLIST_SWEEP_TOTAL, "outcome" => "expired").increment(1);
                        outcome.expired.push(entry.id);
                    }
                    Ok(Some(Lapse::Reverted(offer))) => {
                        metrics::counter!(WAITLIST_SWEEP_TOTAL, "outcome" => "reverted").increment(1);
                        outcome.reverted.push(entry.id);
                        if !started {
                            freed.push((FreedSlot::from_offer(&offer), offer.release));
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!("tenant {}: waitlist sweep aborted: {e}", self.tenant());
                        return freed;
                    }
                }
            }
        }
        freed
    }

    async fn expire_or_lapse_one(
        &self,
        ledger: &mut WaitlistLedger,
        entry: &WaitlistEntry,
        started: bool,
        now: Ms,
    ) -> Result<Option<Lapse>, EngineError> {
        let lapsed_offer = match (entry.status, &entry.offer) {
            // Approved never outlives the confirming call; one seen here was interrupted.
            (WaitlistStatus::Approved, Some(offer)) => Some(offer.clone()),
            (WaitlistStatus::Notified, Some(offer))
                if started || offer.respond_by.is_some_and(|t| t <= now) =>
            {
                Some(offer.clone())
            }
            _ => None,
        };
        if started {
            if entry.status == WaitlistStatus::Approved {
                self.transition(ledger, entry.id, WaitlistStatus::Pending, now, None, None).await?;
            }
            self.transition(ledger, entry.id, WaitlistStatus::Expired, now, None, None).await?;
            return Ok(Some(Lapse::Expired));
        }
        match lapsed_offer {
            Some(offer) => {
                self.revert(ledger, entry.id, offer.release, now).await?;
                Ok(Some(Lapse::Reverted(offer)))
            }
            None => Ok(None),
        }
    }
}

enum Lapse {
    Expired,
    Reverted(Offer),
}
