//! Notification outbox. Writers enqueue rows; a background dispatcher polls
//! unprocessed rows and hands them to a `Notifier`, so delivery survives a
//! process restart and is decoupled from the transactions that enqueue.

use std::time::Duration;

use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use tokio::time;
use tracing::{error, info};
use uuid::Uuid;

use shared::{EngineResult, Role};

use crate::models::{InventoryAlert, NewNotification, Notification};
use crate::schema::{notifications, users};
use crate::tenant::{get_conn, DbPool, TenantContext};

/// Delivery transport. The binary wires a log-backed notifier; the real
/// email/Slack transport lives outside this service.
pub trait Notifier: Send + Sync {
    fn deliver(&self, recipient: &str, subject: &str, body: &str) -> anyhow::Result<()>;
}

pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn deliver(&self, recipient: &str, subject: &str, _body: &str) -> anyhow::Result<()> {
        info!("notify {}: {}", recipient, subject);
        Ok(())
    }
}

pub struct NotificationDispatcher<N: Notifier> {
    pool: DbPool,
    notifier: N,
    interval_secs: u64,
}

impl<N: Notifier> NotificationDispatcher<N> {
    pub fn new(pool: DbPool, notifier: N, interval_secs: u64) -> Self {
        Self {
            pool,
            notifier,
            interval_secs,
        }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(Duration::from_secs(self.interval_secs));

        loop {
            interval.tick().await;

            if let Err(e) = self.process_pending().await {
                error!("error processing notification outbox: {}", e);
            }
        }
    }

    async fn process_pending(&self) -> EngineResult<usize> {
        let mut conn = get_conn(&self.pool).await?;

        let pending = notifications::table
            .filter(notifications::processed.eq(false))
            .order(notifications::created_at.asc())
            .limit(100)
            .load::<Notification>(&mut conn)
            .await?;

        let mut delivered = 0;
        for notification in pending {
            if let Err(e) =
                self.notifier
                    .deliver(&notification.recipient, &notification.subject, &notification.body)
            {
                error!("failed to deliver notification {}: {}", notification.id, e);
                continue;
            }

            diesel::update(notifications::table.filter(notifications::id.eq(notification.id)))
                .set(notifications::processed.eq(true))
                .execute(&mut conn)
                .await?;

            delivered += 1;
        }

        Ok(delivered)
    }
}

/// Queues one notification for every admin of the tenant.
pub async fn enqueue_for_admins(
    ctx: &TenantContext,
    subject: &str,
    body: &str,
) -> EngineResult<usize> {
    let mut conn = ctx.conn().await?;
    let admins = users::table
        .filter(users::org_id.eq(ctx.org_id()))
        .filter(users::role.eq(Role::Admin.as_str()))
        .select(users::email)
        .load::<String>(&mut conn)
        .await?;

    let rows: Vec<NewNotification> = admins
        .into_iter()
        .map(|email| NewNotification {
            id: Uuid::new_v4(),
            org_id: ctx.org_id(),
            recipient: email,
            subject: subject.to_string(),
            body: body.to_string(),
        })
        .collect();
    let queued = rows.len();

    if !rows.is_empty() {
        diesel::insert_into(notifications::table)
            .values(&rows)
            .execute(&mut conn)
            .await?;
    }

    Ok(queued)
}

/// Fan-out for a freshly created alert: tenant admins plus any recipients
/// the finding itself names in its details.
pub async fn fan_out_alert(ctx: &TenantContext, alert: &InventoryAlert) -> EngineResult<usize> {
    let subject = format!("[{}] {} alert", alert.severity, alert.alert_type);
    let body = serde_json::to_string_pretty(&alert.details).unwrap_or_default();

    let mut queued = enqueue_for_admins(ctx, &subject, &body).await?;

    if let Some(extra) = alert.details.get("notify").and_then(|v| v.as_array()) {
        let mut conn = ctx.conn().await?;
        for recipient in extra.iter().filter_map(|v| v.as_str()) {
            diesel::insert_into(notifications::table)
                .values(&NewNotification {
                    id: Uuid::new_v4(),
                    org_id: ctx.org_id(),
                    recipient: recipient.to_string(),
                    subject: subject.clone(),
                    body: body.clone(),
                })
                .execute(&mut conn)
                .await?;
            queued += 1;
        }
    }

    Ok(queued)
}
