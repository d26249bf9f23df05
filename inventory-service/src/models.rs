use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use shared::WorkflowSettings;

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::organizations)]
pub struct Organization {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::users)]
pub struct User {
    pub id: Uuid,
    pub org_id: Uuid,
    pub email: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::workflow_settings)]
pub struct WorkflowSettingsRow {
    pub org_id: Uuid,
    pub reservation_ttl_hours: i32,
    pub auto_reserve_enabled: bool,
    pub approval_required: bool,
    pub stuck_stage_sla_days: i32,
    pub degrade_to_alert: bool,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowSettingsRow {
    pub fn into_settings(self) -> WorkflowSettings {
        WorkflowSettings {
            reservation_ttl_hours: self.reservation_ttl_hours,
            auto_reserve_enabled: self.auto_reserve_enabled,
            approval_required: self.approval_required,
            stuck_stage_sla_days: self.stuck_stage_sla_days,
            degrade_to_alert: self.degrade_to_alert,
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::shows)]
pub struct Show {
    pub id: Uuid,
    pub org_id: Uuid,
    pub title: String,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::episodes)]
pub struct Episode {
    pub id: Uuid,
    pub org_id: Uuid,
    pub show_id: Uuid,
    pub title: String,
    pub air_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::episode_inventory)]
pub struct EpisodeInventory {
    pub id: Uuid,
    pub org_id: Uuid,
    pub episode_id: Uuid,
    pub placement_type: String,
    pub total_slots: i32,
    pub reserved_slots: i32,
    pub booked_slots: i32,
    pub updated_at: DateTime<Utc>,
}

impl EpisodeInventory {
    pub fn available(&self) -> i32 {
        self.total_slots - self.reserved_slots - self.booked_slots
    }
}

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::campaigns)]
pub struct Campaign {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub advertiser: String,
    pub progress: i32,
    pub status: String,
    pub buildable: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::campaign_schedules)]
pub struct CampaignSchedule {
    pub id: Uuid,
    pub org_id: Uuid,
    pub campaign_id: Uuid,
    pub episode_id: Uuid,
    pub placement_type: String,
    pub quantity: i32,
    pub rate: BigDecimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::reservations)]
pub struct Reservation {
    pub id: Uuid,
    pub org_id: Uuid,
    pub show_id: Uuid,
    pub episode_id: Uuid,
    pub placement_type: String,
    pub campaign_id: Uuid,
    pub schedule_id: Option<Uuid>,
    pub quantity: i32,
    pub status: String,
    pub locked: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::reservations)]
pub struct NewReservation {
    pub id: Uuid,
    pub org_id: Uuid,
    pub show_id: Uuid,
    pub episode_id: Uuid,
    pub placement_type: String,
    pub campaign_id: Uuid,
    pub schedule_id: Option<Uuid>,
    pub quantity: i32,
    pub status: String,
    pub locked: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::workflow_effects)]
pub struct NewWorkflowEffect {
    pub campaign_id: Uuid,
    pub stage: i32,
    pub effect: String,
    pub org_id: Uuid,
}

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::orders)]
pub struct Order {
    pub id: Uuid,
    pub org_id: Uuid,
    pub campaign_id: Uuid,
    pub total_amount: BigDecimal,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct NewOrder {
    pub id: Uuid,
    pub org_id: Uuid,
    pub campaign_id: Uuid,
    pub total_amount: BigDecimal,
    pub status: String,
}

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::inventory_alerts)]
pub struct InventoryAlert {
    pub id: Uuid,
    pub org_id: Uuid,
    pub alert_type: String,
    pub severity: String,
    pub episode_id: Option<Uuid>,
    pub placement_type: Option<String>,
    pub dedupe_key: String,
    pub details: serde_json::Value,
    pub status: String,
    pub acknowledged_by: Option<Uuid>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<Uuid>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::inventory_alerts)]
pub struct NewInventoryAlert {
    pub id: Uuid,
    pub org_id: Uuid,
    pub alert_type: String,
    pub severity: String,
    pub episode_id: Option<Uuid>,
    pub placement_type: Option<String>,
    pub dedupe_key: String,
    pub details: serde_json::Value,
    pub status: String,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::notifications)]
pub struct Notification {
    pub id: Uuid,
    pub org_id: Uuid,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::notifications)]
pub struct NewNotification {
    pub id: Uuid,
    pub org_id: Uuid,
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::tenant_access_audit)]
pub struct NewTenantAccessAudit {
    pub id: Uuid,
    pub actor_user_id: Uuid,
    pub target_org_id: Uuid,
    pub operation: String,
}
