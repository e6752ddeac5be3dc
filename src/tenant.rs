use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::info;

use crate::engine::{Engine, EngineDeps};
use crate::limits::*;
use crate::model::TenantSettings;
use crate::notify::NotifyHub;
use crate::reaper;

/// A loaded tenant: its engine and the hub its events are broadcast on.
#[derive(Clone)]
pub struct Tenant {
    pub engine: Arc<Engine>,
    pub hub: Arc<NotifyHub>,
}

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL +
/// waitlist sweep + compactor. Tenant = database name from the pgwire
/// connection.
pub struct TenantManager {
    tenants: DashMap<String, Tenant>,
    data_dir: PathBuf,
    compact_threshold: u64,
    sweep_interval: Duration,
    defaults: TenantSettings,
}

impl TenantManager {
    pub fn new(
        data_dir: PathBuf,
        compact_threshold: u64,
        sweep_interval: Duration,
        defaults: TenantSettings,
    ) -> Self {
        Self {
            tenants: DashMap::new(),
            data_dir,
            compact_threshold,
            sweep_interval,
            defaults,
        }
    }

    /// Get or lazily create the tenant with the given name.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Tenant> {
        if let Some(t) = self.tenants.get(tenant) {
            return Ok(t.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.tenants.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        // Two connections may race to create the same tenant; the entry lock
        // makes one of them open the WAL.
        let entry = self.tenants.entry(tenant.to_string());
        if let dashmap::mapref::entry::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let hub = Arc::new(NotifyHub::new());
        let deps = EngineDeps { notifier: hub.clone(), ..EngineDeps::default() };
        let engine = Arc::new(Engine::new(&safe_name, &wal_path, self.defaults.clone(), deps)?);

        tokio::spawn(reaper::run_waitlist_sweep(engine.clone(), self.sweep_interval));
        tokio::spawn(reaper::run_compactor(engine.clone(), self.compact_threshold));

        let loaded = Tenant { engine, hub };
        entry.or_insert(loaded.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.tenants.len() as f64);
        info!("tenant {safe_name} loaded from {}", wal_path.display());
        Ok(loaded)
    }
}
