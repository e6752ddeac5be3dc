use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::store::apply_time_off_reviewed;
use super::{check_len, require_admin, validate_span, Engine, EngineError};

impl Engine {
    /// Replace an owner's weekly rules. An empty list closes the owner.
    pub async fn update_availability(
        &self,
        actor: Actor,
        owner: ScheduleOwner,
        rules: Vec<AvailabilityRule>,
    ) -> Result<(), EngineError> {
        match (actor, owner) {
            (Actor::Admin, _) => {}
            (Actor::Coach(me), ScheduleOwner::Coach(target)) if me == target => {
                if !self.settings.read().await.allow_coach_self_edit_availability {
                    return Err(EngineError::Forbidden(
                        "coach self-edit of availability is disabled".into(),
                    ));
                }
            }
            (Actor::Coach(_), ScheduleOwner::Coach(_)) => {
                return Err(EngineError::Forbidden(
                    "coaches may only edit their own availability".into(),
                ));
            }
            (Actor::Coach(_), ScheduleOwner::Studio(_)) => {
                return Err(EngineError::Forbidden(
                    "studio availability requires an admin".into(),
                ));
            }
        }

        if rules.len() > MAX_RULES_PER_OWNER {
            return Err(EngineError::LimitExceeded("too many availability rules"));
        }
        let rules: Vec<AvailabilityRule> = rules
            .into_iter()
            .map(|rule| validate_rule(AvailabilityRule { owner, ..rule }))
            .collect::<Result<_, _>>()?;

        let event = Event::AvailabilityReplaced { owner, rules: rules.clone() };
        match owner {
            ScheduleOwner::Studio(id) => {
                let studio = self.store.studio(&id).ok_or(EngineError::NotFound("studio", id))?;
                let mut guard = studio.write().await;
                self.wal_append(&event).await?;
                guard.rules = rules;
            }
            ScheduleOwner::Coach(id) => {
                let coach = self.store.coach(&id).ok_or(EngineError::NotFound("coach", id))?;
                let mut guard = coach.write().await;
                self.wal_append(&event).await?;
                guard.rules = rules;
            }
        }
        Ok(())
    }

    /// Admin submissions are approved on the spot; a coach's own request waits for review.
    pub async fn submit_time_off(
        &self,
        actor: Actor,
        id: Ulid,
        coach_id: Ulid,
        span: Span,
        notes: Option<String>,
    ) -> Result<TimeOffRequest, EngineError> {
        let status = match actor {
            Actor::Admin => TimeOffStatus::Approved,
            Actor::Coach(me) if me == coach_id => TimeOffStatus::Pending,
            Actor::Coach(_) => {
                return Err(EngineError::Forbidden(
                    "coaches may only request their own time off".into(),
                ));
            }
        };
        validate_span(&span, MAX_TIME_OFF_DURATION_MS)?;
        check_len(notes.as_deref(), MAX_NOTES_LEN, "notes too long")?;
        let _setup = self.setup.lock().await;
        if self.store.coach_for_time_off(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        let coach = self.store.coach(&coach_id).ok_or(EngineError::NotFound("coach", coach_id))?;
        let mut guard = coach.write().await;

        let now = self.now();
        let request = TimeOffRequest {
            id,
            tenant_id: self.tenant().to_string(),
            coach_id,
            span,
            notes,
            status,
            requested_at: now,
            reviewed_at: (status == TimeOffStatus::Approved).then_some(now),
        };
        self.wal_append(&Event::TimeOffSubmitted { request: request.clone() }).await?;
        guard.time_off.push(request.clone());
        self.store.index_time_off(id, coach_id);
        Ok(request)
    }

    /// Approve or reject. A reviewed request may be reviewed again.
    pub async fn review_time_off(
        &self,
        actor: Actor,
        request_id: Ulid,
        decision: TimeOffStatus,
    ) -> Result<TimeOffRequest, EngineError> {
        require_admin(actor, "reviewing time off")?;
        if decision == TimeOffStatus::Pending {
            return Err(EngineError::InvalidState { from: "reviewed", to: "pending" });
        }
        let coach_id = self
            .store
            .coach_for_time_off(&request_id)
            .ok_or(EngineError::NotFound("time off request", request_id))?;
        let coach = self.store.coach(&coach_id).ok_or(EngineError::NotFound("coach", coach_id))?;
        let mut guard = coach.write().await;

        let now = self.now();
        self.wal_append(&Event::TimeOffReviewed {
            id: request_id,
            coach_id,
            status: decision,
            reviewed_at: now,
        })
        .await?;
        apply_time_off_reviewed(&mut guard, &request_id, decision, now);
        info!("tenant {}: time off {request_id} for coach {coach_id} {decision:?}", self.tenant());
        guard
            .time_off
            .iter()
            .find(|t| t.id == request_id)
            .cloned()
            .ok_or(EngineError::NotFound("time off request", request_id))
    }
}

fn validate_rule(rule: AvailabilityRule) -> Result<AvailabilityRule, EngineError> {
    if rule.day_of_week > 6 {
        return Err(EngineError::InvalidTimeRange(format!(
            "day_of_week must be 0-6, got {}",
            rule.day_of_week
        )));
    }
    if rule.start_time >= rule.end_time {
        return Err(EngineError::InvalidTimeRange(format!(
            "rule end {} must be after start {}",
            rule.end_time, rule.start_time
        )));
    }
    Ok(rule)
}
