use chrono::NaiveDate;
use ulid::Ulid;

use crate::calendar::local_time_of_day;
use crate::model::*;

use super::availability::{slot_spans, working_intervals};
use super::capacity;
use super::{Engine, EngineError};

/// Input of the slot calculator. Without a coach the studio's own schedule
/// drives the slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotQuery {
    pub date: NaiveDate,
    pub studio_id: Option<Ulid>,
    pub coach_id: Option<Ulid>,
    pub room_id: Option<Ulid>,
}

impl SlotQuery {
    pub fn new(date: NaiveDate) -> Self {
        Self { date, studio_id: None, coach_id: None, room_id: None }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    pub id: Option<Ulid>,
    pub studio_id: Option<Ulid>,
    pub client_id: Option<Ulid>,
    pub coach_id: Option<Ulid>,
    pub status: Option<SessionStatus>,
    /// Sessions overlapping `[from, to)`.
    pub from: Option<Ms>,
    pub to: Option<Ms>,
}

impl SessionFilter {
    fn matches(&self, s: &Session) -> bool {
        self.id.is_none_or(|id| s.id == id)
            && self.client_id.is_none_or(|id| s.client_id == id)
            && self.coach_id.is_none_or(|id| s.coach_id == Some(id))
            && self.status.is_none_or(|st| s.status == st)
            && self.from.is_none_or(|from| s.span.end > from)
            && self.to.is_none_or(|to| s.span.start < to)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitlistFilter {
    pub id: Option<Ulid>,
    pub client_id: Option<Ulid>,
    pub studio_id: Option<Ulid>,
    pub status: Option<WaitlistStatus>,
    pub preferred_date: Option<NaiveDate>,
}

impl WaitlistFilter {
    fn matches(&self, e: &WaitlistEntry) -> bool {
        self.id.is_none_or(|id| e.id == id)
            && self.client_id.is_none_or(|id| e.client_id == id)
            && self.studio_id.is_none_or(|id| e.studio_id == Some(id))
            && self.status.is_none_or(|st| e.status == st)
            && self.preferred_date.is_none_or(|d| e.preferred_date == d)
    }
}

impl Engine {
    /// Slot calculator: candidate starts at the tenant's session length across
    /// the working intervals, each tagged by the capacity model. Slots outside
    /// working hours and slots already started are left out.
    pub async fn get_slots(&self, query: SlotQuery) -> Result<Vec<Slot>, EngineError> {
        let settings = self.settings().await;
        let now = self.now();
        let studio_id = self.resolve_studio(query.studio_id, query.room_id, &settings)?;
        let studio_arc = self
            .store
            .studio(&studio_id)
            .ok_or(EngineError::NotFound("studio", studio_id))?;
        let coach_arc = match query.coach_id {
            Some(id) => Some(self.store.coach(&id).ok_or(EngineError::NotFound("coach", id))?),
            None => None,
        };

        let studio = studio_arc.read().await;
        let coach = match &coach_arc {
            Some(c) => Some(c.read().await),
            None => None,
        };
        let intervals = match &coach {
            Some(coach) => working_intervals(&coach.rules, &coach.time_off, query.date, settings.timezone),
            None => working_intervals(&studio.rules, &[], query.date, settings.timezone),
        };

        let mut slots = Vec::new();
        for span in slot_spans(&intervals, settings.session_length_ms) {
            if span.start < now {
                continue;
            }
            let mut loads = capacity::place_loads(&studio, query.room_id.as_ref(), &span)?;
            if let Some(coach) = &coach {
                loads.push(capacity::coach_load(coach, &span));
            }
            let Some(time) = local_time_of_day(span.start, settings.timezone) else { continue };
            slots.push(Slot { time, span, status: capacity::slot_status(&loads) });
        }
        Ok(slots)
    }

    /// Sessions across studios, ordered by start.
    pub async fn list_sessions(&self, filter: &SessionFilter) -> Vec<Session> {
        let studio_ids = match (filter.studio_id, filter.id) {
            (Some(id), _) => vec![id],
            (None, Some(session_id)) => self.store.studio_for_session(&session_id).into_iter().collect(),
            (None, None) => self.store.studio_ids(),
        };
        let mut out = Vec::new();
        for id in studio_ids {
            let Some(studio) = self.store.studio(&id) else { continue };
            let guard = studio.read().await;
            out.extend(guard.sessions.iter().filter(|s| filter.matches(s)).cloned());
        }
        out.sort_by_key(|s| (s.span.start, s.id));
        out
    }

    /// Matching entries, oldest first, each with its current queue position.
    pub async fn list_waitlist(&self, filter: &WaitlistFilter) -> Vec<(WaitlistEntry, Option<usize>)> {
        let ledger = self.waitlist.lock().await;
        ledger
            .all()
            .into_iter()
            .filter(|e| filter.matches(e))
            .map(|e| (e.clone(), ledger.position(&e.id)))
            .collect()
    }

    /// Packages with expiry applied as of now.
    pub async fn list_packages(&self, client_id: Option<Ulid>) -> Vec<ClientPackage> {
        let now = self.now();
        let clients = match client_id {
            Some(id) => vec![id],
            None => self.store.client_ids(),
        };
        let mut out = Vec::new();
        for id in clients {
            let Some(wallet) = self.store.wallet(&id) else { continue };
            let guard = wallet.lock().await;
            out.extend(guard.packages.iter().map(|p| ClientPackage { status: p.status_at(now), ..p.clone() }));
        }
        out
    }

    pub async fn list_time_off(&self, coach_id: Option<Ulid>) -> Vec<TimeOffRequest> {
        let coaches = match coach_id {
            Some(id) => vec![id],
            None => self.store.coach_ids(),
        };
        let mut out = Vec::new();
        for id in coaches {
            let Some(coach) = self.store.coach(&id) else { continue };
            out.extend(coach.read().await.time_off.iter().cloned());
        }
        out.sort_by_key(|t| (t.span.start, t.id));
        out
    }

    /// Weekly rules of one owner, in the order they apply.
    pub async fn list_rules(&self, owner_id: Ulid) -> Result<Vec<AvailabilityRule>, EngineError> {
        if let Some(studio) = self.store.studio(&owner_id) {
            return Ok(studio.read().await.rules.clone());
        }
        if let Some(coach) = self.store.coach(&owner_id) {
            return Ok(coach.read().await.rules.clone());
        }
        Err(EngineError::NotFound("schedule owner", owner_id))
    }

    /// A studio id or coach id as the owner of a weekly schedule.
    pub fn schedule_owner(&self, id: Ulid) -> Result<ScheduleOwner, EngineError> {
        if self.store.studio(&id).is_some() {
            Ok(ScheduleOwner::Studio(id))
        } else if self.store.coach(&id).is_some() {
            Ok(ScheduleOwner::Coach(id))
        } else {
            Err(EngineError::NotFound("schedule owner", id))
        }
    }
}
