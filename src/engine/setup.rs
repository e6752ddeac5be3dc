use chrono_tz::Tz;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{check_len, require_admin, Engine, EngineError};

impl Engine {
    pub async fn create_studio(
        &self,
        actor: Actor,
        id: Ulid,
        name: Option<String>,
        capacity: u32,
    ) -> Result<Studio, EngineError> {
        require_admin(actor, "creating a studio")?;
        check_len(name.as_deref(), MAX_NAME_LEN, "studio name too long")?;
        check_capacity(capacity)?;
        let _setup = self.setup.lock().await;
        if self.store.studio_count() >= MAX_STUDIOS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many studios"));
        }
        if self.store.studio(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }

        let studio = Studio { id, name, capacity };
        self.wal_append(&Event::StudioCreated { studio: studio.clone() }).await?;
        self.store.insert_studio(studio.clone());
        Ok(studio)
    }

    pub async fn create_room(
        &self,
        actor: Actor,
        id: Ulid,
        studio_id: Ulid,
        name: Option<String>,
        capacity: u32,
    ) -> Result<Room, EngineError> {
        require_admin(actor, "creating a room")?;
        check_len(name.as_deref(), MAX_NAME_LEN, "room name too long")?;
        check_capacity(capacity)?;
        let _setup = self.setup.lock().await;
        let studio = self
            .store
            .studio(&studio_id)
            .ok_or(EngineError::NotFound("studio", studio_id))?;
        let mut guard = studio.write().await;
        if guard.rooms.len() >= MAX_ROOMS_PER_STUDIO {
            return Err(EngineError::LimitExceeded("too many rooms in studio"));
        }
        if self.store.studio_for_room(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }

        let room = Room { id, studio_id, name, capacity };
        self.wal_append(&Event::RoomCreated { room: room.clone() }).await?;
        guard.rooms.push(room.clone());
        self.store.index_room(id, studio_id);
        Ok(room)
    }

    pub async fn create_coach(
        &self,
        actor: Actor,
        id: Ulid,
        name: Option<String>,
    ) -> Result<Coach, EngineError> {
        require_admin(actor, "creating a coach")?;
        check_len(name.as_deref(), MAX_NAME_LEN, "coach name too long")?;
        let _setup = self.setup.lock().await;
        if self.store.coach_count() >= MAX_COACHES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many coaches"));
        }
        if self.store.coach(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }

        let coach = Coach { id, name };
        self.wal_append(&Event::CoachCreated { coach: coach.clone() }).await?;
        self.store.insert_coach(coach.clone());
        Ok(coach)
    }

    /// Credit top-up on behalf of the package service.
    pub async fn grant_package(
        &self,
        actor: Actor,
        id: Ulid,
        client_id: Ulid,
        package_id: Option<Ulid>,
        sessions: u32,
        expiry_date: Option<Ms>,
    ) -> Result<ClientPackage, EngineError> {
        require_admin(actor, "granting a package")?;
        if sessions == 0 || sessions > MAX_CAPACITY {
            return Err(EngineError::LimitExceeded("package session count out of range"));
        }
        let _setup = self.setup.lock().await;
        if self.store.client_for_package(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        let wallet = self.store.wallet_or_create(client_id);
        let mut guard = wallet.lock().await;
        if guard.packages.len() >= MAX_PACKAGES_PER_CLIENT {
            return Err(EngineError::LimitExceeded("too many packages for client"));
        }

        let package = ClientPackage {
            id,
            client_id,
            package_id,
            sessions_used: 0,
            sessions_remaining: sessions,
            expiry_date,
            status: PackageStatus::Active,
        };
        self.wal_append(&Event::PackageGranted { package: package.clone() }).await?;
        guard.packages.push(package.clone());
        self.store.index_package(id, client_id);
        Ok(package)
    }

    /// Change one setting by key, as sent over the wire.
    pub async fn set_setting(
        &self,
        actor: Actor,
        key: &str,
        value: &str,
    ) -> Result<TenantSettings, EngineError> {
        require_admin(actor, "changing settings")?;
        let mut guard = self.settings.write().await;
        let mut next = guard.clone();
        apply_setting(&mut next, key, value)?;
        validate_settings(&next, self)?;
        self.wal_append(&Event::SettingsUpdated { settings: next.clone() }).await?;
        *guard = next.clone();
        info!("tenant {}: setting {key} = {value}", self.tenant());
        Ok(next)
    }
}

fn check_capacity(capacity: u32) -> Result<(), EngineError> {
    if capacity == 0 || capacity > MAX_CAPACITY {
        return Err(EngineError::LimitExceeded("capacity out of range"));
    }
    Ok(())
}

fn validate_settings(settings: &TenantSettings, engine: &Engine) -> Result<(), EngineError> {
    if settings.session_length_ms < MIN_SESSION_LENGTH_MS
        || settings.session_length_ms > MAX_SESSION_DURATION_MS
    {
        return Err(EngineError::LimitExceeded("session length out of range"));
    }
    if let Some(id) = settings.default_studio
        && engine.store.studio(&id).is_none()
    {
        return Err(EngineError::NotFound("studio", id));
    }
    if let RefundPolicy::NoticeWindow { min_notice_ms } = settings.refund_policy {
        if min_notice_ms < 0 {
            return Err(EngineError::LimitExceeded("policy window must be positive"));
        }
        if min_notice_ms > MAX_REFUND_NOTICE_MS {
            return Err(EngineError::LimitExceeded("refund notice window too long"));
        }
    }
    if let PromotionPolicy::NotifyFirst { response_window_ms } = settings.promotion_policy {
        if response_window_ms <= 0 {
            return Err(EngineError::LimitExceeded("policy window must be positive"));
        }
        if response_window_ms > MAX_RESPONSE_WINDOW_MS {
            return Err(EngineError::LimitExceeded("offer response window too long"));
        }
    }
    Ok(())
}

fn parse_minutes(value: &str, key: &str) -> Result<Ms, EngineError> {
    value
        .trim()
        .parse::<i64>()
        .ok()
        .and_then(|m| m.checked_mul(MINUTE_MS))
        .ok_or_else(|| EngineError::InvalidTimeRange(format!("{key}: expected minutes, got {value:?}")))
}

/// Keys:
/// - `session_minutes`: integer
/// - `timezone`: IANA name
/// - `allow_coach_self_edit_availability`: `true` / `false`
/// - `refund_policy`: `always` or `notice_window:<minutes>`
/// - `promotion_policy`: `auto_book` or `notify_first:<minutes>`
/// - `default_studio`: studio id, or empty to clear
pub fn apply_setting(settings: &mut TenantSettings, key: &str, value: &str) -> Result<(), EngineError> {
    let bad = |what: &str| EngineError::InvalidTimeRange(format!("{key}: {what}, got {value:?}"));
    match key {
        "session_minutes" => settings.session_length_ms = parse_minutes(value, key)?,
        "timezone" => {
            settings.timezone = value.trim().parse::<Tz>().map_err(|_| bad("unknown timezone"))?;
        }
        "allow_coach_self_edit_availability" => {
            settings.allow_coach_self_edit_availability = match value.trim() {
                "true" | "on" | "1" => true,
                "false" | "off" | "0" => false,
                _ => return Err(bad("expected true or false")),
            };
        }
        "refund_policy" => {
            settings.refund_policy = match value.trim().split_once(':') {
                None if value.trim() == "always" => RefundPolicy::Always,
                Some(("notice_window", minutes)) => RefundPolicy::NoticeWindow {
                    min_notice_ms: parse_minutes(minutes, key)?,
                },
                _ => return Err(bad("expected always or notice_window:<minutes>")),
            };
        }
        "promotion_policy" => {
            settings.promotion_policy = match value.trim().split_once(':') {
                None if value.trim() == "auto_book" => PromotionPolicy::AutoBook,
                Some(("notify_first", minutes)) => PromotionPolicy::NotifyFirst {
                    response_window_ms: parse_minutes(minutes, key)?,
                },
                _ => return Err(bad("expected auto_book or notify_first:<minutes>")),
            };
        }
        "default_studio" => {
            let v = value.trim();
            settings.default_studio = if v.is_empty() {
                None
            } else {
                Some(Ulid::from_string(v).map_err(|_| bad("expected a studio id"))?)
            };
        }
        _ => return Err(EngineError::InvalidTimeRange(format!("unknown setting: {key}"))),
    }
    Ok(())
}

/// Settings as `(key, value)` pairs in the form `apply_setting` accepts.
pub fn setting_values(settings: &TenantSettings) -> Vec<(&'static str, String)> {
    let refund = match settings.refund_policy {
        RefundPolicy::Always => "always".to_string(),
        RefundPolicy::NoticeWindow { min_notice_ms } => {
            format!("notice_window:{}", min_notice_ms / MINUTE_MS)
        }
    };
    let promotion = match settings.promotion_policy {
        PromotionPolicy::AutoBook => "auto_book".to_string(),
        PromotionPolicy::NotifyFirst { response_window_ms } => {
            format!("notify_first:{}", response_window_ms / MINUTE_MS)
        }
    };
    vec![
        ("session_minutes", (settings.session_length_ms / MINUTE_MS).to_string()),
        ("timezone", settings.timezone.name().to_string()),
        (
            "allow_coach_self_edit_availability",
            settings.allow_coach_self_edit_availability.to_string(),
        ),
        ("refund_policy", refund),
        ("promotion_policy", promotion),
        ("default_studio", settings.default_studio.map(|id| id.to_string()).unwrap_or_default()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setting_values_round_trip_through_apply() {
        let mut s = TenantSettings::default();
        apply_setting(&mut s, "timezone", "Europe/Berlin").unwrap();
        apply_setting(&mut s, "refund_policy", "notice_window:720").unwrap();
        apply_setting(&mut s, "default_studio", &Ulid::nil().to_string()).unwrap();

        let mut copy = TenantSettings::default();
        for (key, value) in setting_values(&s) {
            apply_setting(&mut copy, key, &value).unwrap();
        }
        assert_eq!(copy, s);
    }

    #[test]
    fn apply_setting_parses_policies() {
        let mut s = TenantSettings::default();
        apply_setting(&mut s, "refund_policy", "notice_window:1440").unwrap();
        assert_eq!(s.refund_policy, RefundPolicy::NoticeWindow { min_notice_ms: 1440 * MINUTE_MS });
        apply_setting(&mut s, "promotion_policy", "notify_first:30").unwrap();
        assert_eq!(
            s.promotion_policy,
            PromotionPolicy::NotifyFirst { response_window_ms: 30 * MINUTE_MS }
        );
        apply_setting(&mut s, "promotion_policy", "auto_book").unwrap();
        assert_eq!(s.promotion_policy, PromotionPolicy::AutoBook);
        apply_setting(&mut s, "refund_policy", "always").unwrap();
        assert_eq!(s.refund_policy, RefundPolicy::Always);
    }

    #[test]
    fn apply_setting_basic_keys() {
        let mut s = TenantSettings::default();
        apply_setting(&mut s, "session_minutes", "45").unwrap();
        assert_eq!(s.session_length_ms, 45 * MINUTE_MS);
        apply_setting(&mut s, "timezone", "America/New_York").unwrap();
        assert_eq!(s.timezone, chrono_tz::America::New_York);
        apply_setting(&mut s, "allow_coach_self_edit_availability", "true").unwrap();
        assert!(s.allow_coach_self_edit_availability);
        let id = Ulid::new();
        apply_setting(&mut s, "default_studio", &id.to_string()).unwrap();
        assert_eq!(s.default_studio, Some(id));
        apply_setting(&mut s, "default_studio", "").unwrap();
        assert_eq!(s.default_studio, None);
    }

    #[test]
    fn apply_setting_rejects_garbage() {
        let mut s = TenantSettings::default();
        assert!(apply_setting(&mut s, "timezone", "Mars/Olympus").is_err());
        assert!(apply_setting(&mut s, "refund_policy", "sometimes").is_err());
        assert!(apply_setting(&mut s, "session_minutes", "twenty").is_err());
        assert!(apply_setting(&mut s, "colour", "blue").is_err());
        assert_eq!(s, TenantSettings::default());
    }
}
