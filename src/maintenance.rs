//! Periodic upkeep: top up popular templates and drop stale stock.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument, warn};

use crate::catalog::TemplateCatalog;
use crate::config::MaintenanceSettings;
use crate::domain::TemplateId;
use crate::pool::PoolService;
use crate::replenish::{ReplenishDecision, ReplenishmentCoordinator};
use crate::store::PoolStore;

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    /// Templates given a low-water check.
    pub checked: Vec<TemplateId>,
    /// Templates a batch was started for.
    pub scheduled: Vec<TemplateId>,
    pub purged: usize,
    pub errors: usize,
    pub elapsed_ms: u64,
}

/// One maintenance pass. Never fails; problems are logged and counted.
#[instrument(level = "info", skip_all)]
pub async fn run_pass(
    store: &dyn PoolStore,
    coordinator: &ReplenishmentCoordinator,
    catalog: &TemplateCatalog,
    settings: &MaintenanceSettings,
) -> MaintenanceReport {
    let started = Instant::now();
    let mut report = MaintenanceReport::default();

    // Most demanded first, then active templates that never served anyone.
    let mut candidates = match store.most_demanded_templates(settings.top_templates).await {
        Ok(ids) => ids,
        Err(e) => {
            error!(target: "maintenance", error = %e, "Could not rank templates");
            report.errors += 1;
            Vec::new()
        }
    };
    let mut seen: BTreeSet<TemplateId> = candidates.iter().copied().collect();
    for id in catalog.active_ids() {
        if seen.contains(&id) {
            continue;
        }
        match store.template_totals(id).await {
            Ok(t) if t.available == 0 && t.claimed == 0 => {
                seen.insert(id);
                candidates.push(id);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(target: "maintenance", template_id = %id, error = %e, "Could not read template totals");
                report.errors += 1;
            }
        }
    }

    for id in candidates {
        match coordinator.maybe_replenish(id).await {
            Ok(decision) => {
                report.checked.push(id);
                if matches!(decision, ReplenishDecision::Scheduled { .. }) {
                    report.scheduled.push(id);
                }
            }
            Err(e) => {
                warn!(target: "maintenance", template_id = %id, error = %e, "Replenishment check failed");
                report.errors += 1;
            }
        }
    }

    if let Some(days) = settings.stale_after_days.filter(|d| *d > 0) {
        let cutoff = chrono::Duration::try_days(i64::from(days))
            .and_then(|age| Utc::now().checked_sub_signed(age));
        match cutoff {
            Some(cutoff) => match store.purge_stale_available(cutoff).await {
                Ok(n) => report.purged = n,
                Err(e) => {
                    error!(target: "maintenance", error = %e, "Stale cleanup failed");
                    report.errors += 1;
                }
            },
            None => {
                warn!(target: "maintenance", stale_after_days = days, "Stale cutoff out of range; cleanup skipped");
                report.errors += 1;
            }
        }
    }

    report.elapsed_ms = started.elapsed().as_millis() as u64;
    info!(
        target: "maintenance",
        checked = report.checked.len(),
        scheduled = report.scheduled.len(),
        purged = report.purged,
        errors = report.errors,
        in_flight = coordinator.in_flight_count(),
        elapsed_ms = report.elapsed_ms,
        "Maintenance pass finished"
    );
    report
}

/// Run maintenance every `interval_secs` on its own task. `None` when disabled.
pub fn spawn(pool: Arc<PoolService>) -> Option<JoinHandle<()>> {
    let settings = pool.maintenance_settings().clone();
    if !settings.enabled {
        info!(target: "maintenance", "Maintenance disabled");
        return None;
    }
    let period = Duration::from_secs(settings.interval_secs.max(1));
    info!(target: "maintenance", interval_secs = period.as_secs(), "Maintenance scheduled");

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            pool.run_maintenance().await;
        }
    }))
}
