use ulid::Ulid;

use crate::model::*;

use super::store::{CoachState, StudioState};
use super::EngineError;

/// One resource dimension a slot consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Studio(Ulid),
    Room(Ulid),
    Coach(Ulid),
}

/// Capacity of one dimension over one interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Load {
    pub dimension: Dimension,
    pub max_concurrent: u32,
    pub current: u32,
}

impl Load {
    pub fn is_full(&self) -> bool {
        self.current >= self.max_concurrent
    }

    pub fn free(&self) -> u32 {
        self.max_concurrent.saturating_sub(self.current)
    }
}

/// Non-cancelled sessions of the studio intersecting `span`.
pub fn studio_load(studio: &StudioState, span: &Span) -> Load {
    let current = studio
        .overlapping(span)
        .filter(|s| s.status.consumes_capacity())
        .count() as u32;
    Load {
        dimension: Dimension::Studio(studio.studio.id),
        max_concurrent: studio.studio.capacity,
        current,
    }
}

pub fn room_load(studio: &StudioState, room_id: &Ulid, span: &Span) -> Result<Load, EngineError> {
    let room = studio.room(room_id).ok_or(EngineError::NotFound("room", *room_id))?;
    let current = studio
        .overlapping(span)
        .filter(|s| s.room_id == Some(*room_id) && s.status.consumes_capacity())
        .count() as u32;
    Ok(Load {
        dimension: Dimension::Room(room.id),
        max_concurrent: room.capacity,
        current,
    })
}

/// A coach never runs two sessions at once, whatever the room allows.
pub fn coach_load(coach: &CoachState, span: &Span) -> Load {
    Load {
        dimension: Dimension::Coach(coach.coach.id),
        max_concurrent: 1,
        current: coach.overlapping(span).count() as u32,
    }
}

/// Studio and, when given, room loads for `span`.
pub fn place_loads(
    studio: &StudioState,
    room_id: Option<&Ulid>,
    span: &Span,
) -> Result<Vec<Load>, EngineError> {
    let mut loads = vec![studio_load(studio, span)];
    if let Some(room_id) = room_id {
        loads.push(room_load(studio, room_id, span)?);
    }
    Ok(loads)
}

/// Available iff every dimension has room left.
pub fn slot_status(loads: &[Load]) -> SlotStatus {
    if loads.iter().any(Load::is_full) {
        SlotStatus::Full
    } else {
        SlotStatus::Available
    }
}

/// How many more sessions fit in every dimension at once.
pub fn free_capacity(loads: &[Load]) -> u32 {
    loads.iter().map(Load::free).min().unwrap_or(0)
}

/// `SlotFull` for the first saturated place dimension.
pub fn check_place(loads: &[Load]) -> Result<(), EngineError> {
    match loads.iter().find(|l| l.is_full()) {
        Some(l) => Err(EngineError::SlotFull { capacity: l.max_concurrent, booked: l.current }),
        None => Ok(()),
    }
}

/// `CoachConflict` naming the session the coach is already committed to.
pub fn check_coach(coach: &CoachState, span: &Span) -> Result<(), EngineError> {
    match coach.overlapping(span).next() {
        Some((_, session_id)) => Err(EngineError::CoachConflict {
            coach_id: coach.coach.id,
            session_id: *session_id,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: Ms = MINUTE_MS;

    fn studio(capacity: u32) -> StudioState {
        StudioState::new(Studio { id: Ulid::new(), name: None, capacity })
    }

    fn add_session(st: &mut StudioState, room: Option<Ulid>, span: Span, status: SessionStatus) {
        st.insert_session(Session {
            id: Ulid::new(),
            tenant_id: "t".into(),
            studio_id: st.studio.id,
            room_id: room,
            coach_id: None,
            client_id: Ulid::new(),
            package_id: Ulid::new(),
            span,
            status,
            cancellation_reason: None,
            created_at: 0,
        });
    }

    #[test]
    fn cancelled_sessions_free_capacity() {
        let mut st = studio(1);
        let slot = Span::new(0, 20 * M);
        add_session(&mut st, None, slot, SessionStatus::Cancelled);
        assert_eq!(slot_status(&[studio_load(&st, &slot)]), SlotStatus::Available);
        add_session(&mut st, None, slot, SessionStatus::Scheduled);
        let load = studio_load(&st, &slot);
        assert_eq!(load.current, 1);
        assert_eq!(slot_status(&[load]), SlotStatus::Full);
    }

    #[test]
    fn no_show_still_consumes() {
        let mut st = studio(1);
        let slot = Span::new(0, 20 * M);
        add_session(&mut st, None, slot, SessionStatus::NoShow);
        assert!(check_place(&[studio_load(&st, &slot)]).is_err());
    }

    #[test]
    fn partial_overlap_counts() {
        let mut st = studio(2);
        add_session(&mut st, None, Span::new(10 * M, 30 * M), SessionStatus::Scheduled);
        add_session(&mut st, None, Span::new(15 * M, 35 * M), SessionStatus::Scheduled);
        let load = studio_load(&st, &Span::new(0, 20 * M));
        assert_eq!((load.current, load.free()), (2, 0));
        // Adjacent sessions do not intersect.
        assert_eq!(studio_load(&st, &Span::new(35 * M, 55 * M)).current, 0);
    }

    #[test]
    fn room_dimension_checked_separately() {
        let mut st = studio(3);
        let room = Room { id: Ulid::new(), studio_id: st.studio.id, name: None, capacity: 1 };
        st.rooms.push(room.clone());
        let slot = Span::new(0, 20 * M);
        add_session(&mut st, Some(room.id), slot, SessionStatus::Scheduled);

        let loads = place_loads(&st, Some(&room.id), &slot).unwrap();
        assert_eq!(free_capacity(&loads), 0);
        match check_place(&loads) {
            Err(EngineError::SlotFull { capacity, booked }) => assert_eq!((capacity, booked), (1, 1)),
            other => panic!("expected SlotFull, got {other:?}"),
        }
        // The studio itself still has room elsewhere.
        assert_eq!(free_capacity(&place_loads(&st, None, &slot).unwrap()), 2);
        assert!(place_loads(&st, Some(&Ulid::new()), &slot).is_err());
    }

    #[test]
    fn coach_is_exclusive() {
        let mut coach = CoachState::new(Coach { id: Ulid::new(), name: None });
        let slot = Span::new(0, 20 * M);
        assert!(check_coach(&coach, &slot).is_ok());
        let sid = Ulid::new();
        coach.commit(sid, Span::new(10 * M, 30 * M));
        assert!(coach_load(&coach, &slot).is_full());
        match check_coach(&coach, &slot) {
            Err(EngineError::CoachConflict { session_id, .. }) => assert_eq!(session_id, sid),
            other => panic!("expected CoachConflict, got {other:?}"),
        }
        coach.release(&sid);
        assert!(check_coach(&coach, &slot).is_ok());
    }
}
