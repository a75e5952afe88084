//! Daily background workers: subscription-expiry reminders, push-token
//! cleanup, and the startup stale-status repair.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use rasil_core::types::EventKind;
use rasil_store::{inbox, licenses, notifications};
use tokio::sync::watch;
use tracing::{error, info};

use crate::pipeline::IngestServices;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
/// Reminder fires when the subscription expires this many days out.
const REMINDER_DAYS_AHEAD: i64 = 3;
/// Push tokens unused for this long are purged.
const TOKEN_STALE_DAYS: i64 = 30;

/// Once per 24 h: licenses expiring in exactly three days get a
/// high-priority notification.
pub async fn run_expiry_reminder(svcs: IngestServices, mut shutdown: watch::Receiver<bool>) {
    info!("subscription-expiry reminder worker started");
    loop {
        if let Err(e) = expiry_reminder_pass(&svcs).await {
            error!(error = %e, "expiry reminder pass failed");
        }
        tokio::select! {
            _ = tokio::time::sleep(DAY) => {}
            _ = shutdown.changed() => if *shutdown.borrow() { break },
        }
    }
}

pub async fn expiry_reminder_pass(svcs: &IngestServices) -> crate::Result<()> {
    let target = Utc::now().date_naive() + chrono::Duration::days(REMINDER_DAYS_AHEAD);
    let expiring = licenses::licenses_expiring_on(&svcs.db, target).await?;

    for license in expiring {
        let title = "تذكير بانتهاء الاشتراك".to_string();
        let body = format!(
            "ينتهي اشتراك {} بعد {} أيام. جدد الآن لتجنب انقطاع الخدمة.",
            license.company_name, REMINDER_DAYS_AHEAD
        );
        notifications::create_notification(&svcs.db, license.id, &title, &body, "high").await?;
        svcs.sink
            .emit(
                license.id,
                EventKind::Notification,
                serde_json::json!({ "title": title, "body": body, "priority": "high" }),
            )
            .await;
        info!(license_id = license.id, "expiry reminder sent");
    }
    Ok(())
}

/// Once per 24 h (± 1 h jitter): drop push tokens inactive for 30 days.
pub async fn run_token_cleanup(svcs: IngestServices, mut shutdown: watch::Receiver<bool>) {
    info!("push-token cleanup worker started");
    loop {
        let cutoff = Utc::now().naive_utc() - chrono::Duration::days(TOKEN_STALE_DAYS);
        match notifications::purge_stale_push_tokens(&svcs.db, cutoff).await {
            Ok(n) if n > 0 => info!(purged = n, "stale push tokens removed"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "push token cleanup failed"),
        }

        let jitter = rand::thread_rng().gen_range(-3600i64..=3600);
        let sleep_secs = (DAY.as_secs() as i64 + jitter).max(60) as u64;
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(sleep_secs)) => {}
            _ = shutdown.changed() => if *shutdown.borrow() { break },
        }
    }
}

/// Startup/on-demand: promote analyzed inbox rows whose sender already has a
/// later handled message.
pub async fn repair_stale_statuses(svcs: &IngestServices) -> crate::Result<u64> {
    let mut total = 0;
    for license_id in licenses::active_license_ids(&svcs.db).await? {
        total += inbox::repair_stale_statuses(&svcs.db, license_id).await?;
    }
    if total > 0 {
        info!(repaired = total, "stale inbox statuses promoted");
    }
    Ok(total)
}
