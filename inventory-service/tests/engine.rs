//! Integration suite against a real Postgres. Every test builds its own
//! organization, so tests are isolated and can run concurrently. Run with:
//!
//!     DATABASE_URL=postgres://... cargo test -- --ignored

use axum::body::Body;
use axum::http::{Request, StatusCode};
use bigdecimal::BigDecimal;
use chrono::{Duration, Utc};
use diesel::prelude::*;
use diesel::{Connection, PgConnection};
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use diesel_migrations::MigrationHarness;
use futures::future::join_all;
use tower::ServiceExt;
use uuid::Uuid;

use shared::{AlertStatus, EngineError, PlacementType, ReservationStatus};

use inventory_service::api;
use inventory_service::models::{
    Campaign, CampaignSchedule, Episode, EpisodeInventory, Organization, Show, User,
    WorkflowSettingsRow,
};
use inventory_service::reconcile;
use inventory_service::reservations::ReservationManager;
use inventory_service::schema::{
    campaigns, episode_inventory, inventory_alerts, orders, organizations, reservations, shows,
    tenant_access_audit, users, workflow_effects, workflow_settings,
};
use inventory_service::tenant::{DbPool, TenantContext};
use inventory_service::workflow::StageTrigger;
use inventory_service::{alerts, MIGRATIONS};

fn database_url() -> String {
    std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests")
}

async fn pool() -> DbPool {
    let url = database_url();
    let mut conn = PgConnection::establish(&url).expect("connect for migrations");
    conn.run_pending_migrations(MIGRATIONS).expect("run migrations");
    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(url);
    Pool::builder().build(config).await.expect("build pool")
}

struct Fixture {
    org_id: Uuid,
    admin_id: Uuid,
    show_id: Uuid,
    episode_id: Uuid,
}

async fn fixture(pool: &DbPool, total_mid_roll: i32) -> Fixture {
    let mut conn = pool.get().await.unwrap();
    let org_id = Uuid::new_v4();
    let admin_id = Uuid::new_v4();
    let show_id = Uuid::new_v4();
    let episode_id = Uuid::new_v4();

    diesel::insert_into(organizations::table)
        .values(&Organization {
            id: org_id,
            slug: format!("org-{}", org_id.simple()),
            name: "Test Org".to_string(),
            created_at: Utc::now(),
        })
        .execute(&mut conn)
        .await
        .unwrap();

    diesel::insert_into(users::table)
        .values(&User {
            id: admin_id,
            org_id,
            email: format!("admin-{}@example.com", admin_id.simple()),
            role: "admin".to_string(),
            created_at: Utc::now(),
        })
        .execute(&mut conn)
        .await
        .unwrap();

    diesel::insert_into(shows::table)
        .values(&Show {
            id: show_id,
            org_id,
            title: "Test Show".to_string(),
            deleted_at: None,
        })
        .execute(&mut conn)
        .await
        .unwrap();

    diesel::insert_into(inventory_service::schema::episodes::table)
        .values(&Episode {
            id: episode_id,
            org_id,
            show_id,
            title: "Episode 1".to_string(),
            air_date: Utc::now() + Duration::days(14),
        })
        .execute(&mut conn)
        .await
        .unwrap();

    diesel::insert_into(episode_inventory::table)
        .values(&EpisodeInventory {
            id: Uuid::new_v4(),
            org_id,
            episode_id,
            placement_type: PlacementType::MidRoll.as_str().to_string(),
            total_slots: total_mid_roll,
            reserved_slots: 0,
            booked_slots: 0,
            updated_at: Utc::now(),
        })
        .execute(&mut conn)
        .await
        .unwrap();

    Fixture {
        org_id,
        admin_id,
        show_id,
        episode_id,
    }
}

async fn add_campaign(pool: &DbPool, org_id: Uuid, status: &str, progress: i32) -> Uuid {
    let mut conn = pool.get().await.unwrap();
    let id = Uuid::new_v4();
    diesel::insert_into(campaigns::table)
        .values(&Campaign {
            id,
            org_id,
            name: format!("Campaign {}", id.simple()),
            advertiser: "Acme".to_string(),
            progress,
            status: status.to_string(),
            buildable: false,
            updated_at: Utc::now(),
        })
        .execute(&mut conn)
        .await
        .unwrap();
    id
}

async fn add_schedule(
    pool: &DbPool,
    org_id: Uuid,
    campaign_id: Uuid,
    episode_id: Uuid,
    quantity: i32,
) -> Uuid {
    let mut conn = pool.get().await.unwrap();
    let id = Uuid::new_v4();
    diesel::insert_into(inventory_service::schema::campaign_schedules::table)
        .values(&CampaignSchedule {
            id,
            org_id,
            campaign_id,
            episode_id,
            placement_type: PlacementType::MidRoll.as_str().to_string(),
            quantity,
            rate: BigDecimal::from(250),
            created_at: Utc::now(),
        })
        .execute(&mut conn)
        .await
        .unwrap();
    id
}

async fn set_settings(pool: &DbPool, org_id: Uuid, approval_required: bool) {
    let mut conn = pool.get().await.unwrap();
    diesel::insert_into(workflow_settings::table)
        .values(&WorkflowSettingsRow {
            org_id,
            reservation_ttl_hours: 72,
            auto_reserve_enabled: true,
            approval_required,
            stuck_stage_sla_days: 3,
            degrade_to_alert: false,
            updated_at: Utc::now(),
        })
        .execute(&mut conn)
        .await
        .unwrap();
}

async fn counters(pool: &DbPool, episode_id: Uuid, placement: PlacementType) -> (i32, i32) {
    let mut conn = pool.get().await.unwrap();
    let row = episode_inventory::table
        .filter(episode_inventory::episode_id.eq(episode_id))
        .filter(episode_inventory::placement_type.eq(placement.as_str()))
        .first::<EpisodeInventory>(&mut conn)
        .await
        .unwrap();
    (row.reserved_slots, row.booked_slots)
}

#[tokio::test]
#[ignore = "requires a Postgres database via DATABASE_URL"]
async fn concurrent_holds_never_oversell() {
    let pool = pool().await;
    let fx = fixture(&pool, 3).await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let campaign_id = add_campaign(&pool, fx.org_id, "building", 65).await;
        let pool = pool.clone();
        let org_id = fx.org_id;
        let episode_id = fx.episode_id;
        handles.push(tokio::spawn(async move {
            let ctx = TenantContext::for_system(&pool, org_id);
            let mgr = ReservationManager::new(&ctx).with_lock_retries(20);
            mgr.hold(
                campaign_id,
                episode_id,
                PlacementType::MidRoll,
                None,
                1,
                Duration::hours(1),
            )
            .await
        }));
    }

    let mut held = 0;
    let mut conflicts = 0;
    for result in join_all(handles).await {
        match result.unwrap() {
            Ok(_) => held += 1,
            Err(EngineError::Conflict { .. }) => conflicts += 1,
            Err(err) => panic!("unexpected error: {}", err),
        }
    }

    assert_eq!(held, 3);
    assert_eq!(conflicts, 1);
    assert_eq!(counters(&pool, fx.episode_id, PlacementType::MidRoll).await, (3, 0));
}

#[tokio::test]
#[ignore = "requires a Postgres database via DATABASE_URL"]
async fn confirm_and_release_are_idempotent() {
    let pool = pool().await;
    let fx = fixture(&pool, 5).await;
    let ctx = TenantContext::for_system(&pool, fx.org_id);
    let mgr = ReservationManager::new(&ctx);

    let campaign_a = add_campaign(&pool, fx.org_id, "building", 65).await;
    let held = mgr
        .hold(campaign_a, fx.episode_id, PlacementType::MidRoll, None, 2, Duration::hours(1))
        .await
        .unwrap();

    let first = mgr.confirm(held.id).await.unwrap();
    let second = mgr.confirm(held.id).await.unwrap();
    assert_eq!(first.status, ReservationStatus::Confirmed.as_str());
    assert_eq!(second.status, ReservationStatus::Confirmed.as_str());
    assert_eq!(counters(&pool, fx.episode_id, PlacementType::MidRoll).await, (0, 2));

    let campaign_b = add_campaign(&pool, fx.org_id, "building", 65).await;
    let held = mgr
        .hold(campaign_b, fx.episode_id, PlacementType::MidRoll, None, 1, Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(counters(&pool, fx.episode_id, PlacementType::MidRoll).await, (1, 2));

    mgr.release(held.id, "test release").await.unwrap();
    let again = mgr.release(held.id, "test release").await.unwrap();
    assert_eq!(again.status, ReservationStatus::Released.as_str());
    assert_eq!(counters(&pool, fx.episode_id, PlacementType::MidRoll).await, (0, 2));
}

#[tokio::test]
#[ignore = "requires a Postgres database via DATABASE_URL"]
async fn re_holding_the_same_slot_returns_the_existing_reservation() {
    let pool = pool().await;
    let fx = fixture(&pool, 4).await;
    let ctx = TenantContext::for_system(&pool, fx.org_id);
    let mgr = ReservationManager::new(&ctx);
    let campaign_id = add_campaign(&pool, fx.org_id, "building", 65).await;

    let first = mgr
        .hold(campaign_id, fx.episode_id, PlacementType::MidRoll, None, 2, Duration::hours(1))
        .await
        .unwrap();
    let second = mgr
        .hold(campaign_id, fx.episode_id, PlacementType::MidRoll, None, 2, Duration::hours(1))
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(counters(&pool, fx.episode_id, PlacementType::MidRoll).await, (2, 0));
}

#[tokio::test]
#[ignore = "requires a Postgres database via DATABASE_URL"]
async fn expiry_sweep_returns_capacity() {
    let pool = pool().await;
    let fx = fixture(&pool, 3).await;
    let ctx = TenantContext::for_system(&pool, fx.org_id);
    let mgr = ReservationManager::new(&ctx);
    let campaign_id = add_campaign(&pool, fx.org_id, "building", 65).await;

    let held = mgr
        .hold(campaign_id, fx.episode_id, PlacementType::MidRoll, None, 1, Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(counters(&pool, fx.episode_id, PlacementType::MidRoll).await, (1, 0));

    // push the hold past its TTL
    {
        let mut conn = pool.get().await.unwrap();
        diesel::update(reservations::table.filter(reservations::id.eq(held.id)))
            .set(reservations::expires_at.eq(Some(Utc::now() - Duration::minutes(61))))
            .execute(&mut conn)
            .await
            .unwrap();
    }

    assert_eq!(reconcile::sweep_expired(&ctx).await.unwrap(), 1);
    assert_eq!(counters(&pool, fx.episode_id, PlacementType::MidRoll).await, (0, 0));

    let swept = mgr.get(held.id).await.unwrap();
    assert_eq!(swept.status, ReservationStatus::Expired.as_str());
    assert!(!swept.locked);

    // second sweep finds nothing left to do
    assert_eq!(reconcile::sweep_expired(&ctx).await.unwrap(), 0);

    // a lapsed hold cannot be extended back to life
    let err = mgr.extend(held.id, Duration::hours(2)).await.unwrap_err();
    assert!(matches!(err, EngineError::Expired));
}

#[tokio::test]
#[ignore = "requires a Postgres database via DATABASE_URL"]
async fn conflicting_campaign_succeeds_after_rival_hold_expires() {
    let pool = pool().await;
    let fx = fixture(&pool, 2).await;
    let ctx = TenantContext::for_system(&pool, fx.org_id);
    let mgr = ReservationManager::new(&ctx);

    let campaign_a = add_campaign(&pool, fx.org_id, "building", 65).await;
    let campaign_b = add_campaign(&pool, fx.org_id, "building", 65).await;

    let held_a = mgr
        .hold(campaign_a, fx.episode_id, PlacementType::MidRoll, None, 1, Duration::hours(1))
        .await
        .unwrap();

    let err = mgr
        .hold(campaign_b, fx.episode_id, PlacementType::MidRoll, None, 2, Duration::hours(1))
        .await
        .unwrap_err();
    match err {
        EngineError::Conflict { remaining } => assert_eq!(remaining, 1),
        other => panic!("expected conflict, got {}", other),
    }
    assert_eq!(counters(&pool, fx.episode_id, PlacementType::MidRoll).await, (1, 0));

    {
        let mut conn = pool.get().await.unwrap();
        diesel::update(reservations::table.filter(reservations::id.eq(held_a.id)))
            .set(reservations::expires_at.eq(Some(Utc::now() - Duration::minutes(1))))
            .execute(&mut conn)
            .await
            .unwrap();
    }
    reconcile::sweep_expired(&ctx).await.unwrap();

    mgr.hold(campaign_b, fx.episode_id, PlacementType::MidRoll, None, 2, Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(counters(&pool, fx.episode_id, PlacementType::MidRoll).await, (2, 0));
}

#[tokio::test]
#[ignore = "requires a Postgres database via DATABASE_URL"]
async fn drift_is_detected_once_and_alert_lifecycle_is_one_directional() {
    let pool = pool().await;
    let fx = fixture(&pool, 5).await;
    let ctx = TenantContext::for_system(&pool, fx.org_id);

    // force the cached counter away from ground truth (no reservation rows)
    {
        let mut conn = pool.get().await.unwrap();
        diesel::update(
            episode_inventory::table.filter(episode_inventory::episode_id.eq(fx.episode_id)),
        )
        .set(episode_inventory::reserved_slots.eq(2))
        .execute(&mut conn)
        .await
        .unwrap();
    }

    let report = reconcile::run_audit(&ctx, true).await.unwrap();
    assert_eq!(report.counts.inventory_mismatches, 1);
    let drift = &report.inventory_mismatches[0];
    assert_eq!(drift.episode_id, fx.episode_id);
    assert_eq!(drift.cached_reserved, 2);
    assert_eq!(drift.actual_reserved, 0);

    // a second sweep refreshes the same alert instead of stacking a new one
    reconcile::run_audit(&ctx, true).await.unwrap();
    let active: Vec<Uuid> = {
        let mut conn = pool.get().await.unwrap();
        inventory_alerts::table
            .filter(inventory_alerts::org_id.eq(fx.org_id))
            .filter(inventory_alerts::alert_type.eq("drift"))
            .filter(inventory_alerts::status.eq(AlertStatus::Active.as_str()))
            .select(inventory_alerts::id)
            .load(&mut conn)
            .await
            .unwrap()
    };
    assert_eq!(active.len(), 1);
    let alert_id = active[0];

    let acked = alerts::acknowledge(&ctx, alert_id, fx.admin_id).await.unwrap();
    assert_eq!(acked.status, AlertStatus::Acknowledged.as_str());
    let resolved = alerts::resolve(&ctx, alert_id, fx.admin_id, Some("repaired".into()))
        .await
        .unwrap();
    assert_eq!(resolved.status, AlertStatus::Resolved.as_str());

    let err = alerts::acknowledge(&ctx, alert_id, fx.admin_id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));

    // repair brings the cache back to ground truth
    let counts = inventory_service::ledger::repair(&ctx, fx.episode_id, PlacementType::MidRoll)
        .await
        .unwrap();
    assert_eq!(counts.reserved, 0);
    assert_eq!(counters(&pool, fx.episode_id, PlacementType::MidRoll).await, (0, 0));
}

#[tokio::test]
#[ignore = "requires a Postgres database via DATABASE_URL"]
async fn stage_trigger_reserves_confirms_and_stays_idempotent() {
    let pool = pool().await;
    let fx = fixture(&pool, 4).await;
    set_settings(&pool, fx.org_id, false).await;
    let ctx = TenantContext::for_system(&pool, fx.org_id);

    let campaign_id = add_campaign(&pool, fx.org_id, "draft", 0).await;
    add_schedule(&pool, fx.org_id, campaign_id, fx.episode_id, 2).await;

    let trigger = StageTrigger::new(&ctx);
    trigger.advance(campaign_id, 90).await.unwrap();
    assert_eq!(counters(&pool, fx.episode_id, PlacementType::MidRoll).await, (2, 0));

    let held: i64 = {
        let mut conn = pool.get().await.unwrap();
        reservations::table
            .filter(reservations::campaign_id.eq(campaign_id))
            .count()
            .get_result(&mut conn)
            .await
            .unwrap()
    };
    assert_eq!(held, 1);

    // re-running the same transition must not double-reserve
    trigger.advance(campaign_id, 90).await.unwrap();
    assert_eq!(counters(&pool, fx.episode_id, PlacementType::MidRoll).await, (2, 0));

    trigger.advance(campaign_id, 100).await.unwrap();
    assert_eq!(counters(&pool, fx.episode_id, PlacementType::MidRoll).await, (0, 2));

    let order_count: i64 = {
        let mut conn = pool.get().await.unwrap();
        orders::table
            .filter(orders::campaign_id.eq(campaign_id))
            .count()
            .get_result(&mut conn)
            .await
            .unwrap()
    };
    assert_eq!(order_count, 1);

    // at-least-once upstream: the terminal transition can arrive twice
    trigger.advance(campaign_id, 100).await.unwrap();
    let order_count: i64 = {
        let mut conn = pool.get().await.unwrap();
        orders::table
            .filter(orders::campaign_id.eq(campaign_id))
            .count()
            .get_result(&mut conn)
            .await
            .unwrap()
    };
    assert_eq!(order_count, 1);
    assert_eq!(counters(&pool, fx.episode_id, PlacementType::MidRoll).await, (0, 2));
}

#[tokio::test]
#[ignore = "requires a Postgres database via DATABASE_URL"]
async fn regression_releases_the_campaigns_holds() {
    let pool = pool().await;
    let fx = fixture(&pool, 4).await;
    set_settings(&pool, fx.org_id, false).await;
    let ctx = TenantContext::for_system(&pool, fx.org_id);

    let campaign_id = add_campaign(&pool, fx.org_id, "draft", 0).await;
    add_schedule(&pool, fx.org_id, campaign_id, fx.episode_id, 3).await;

    let trigger = StageTrigger::new(&ctx);
    trigger.advance(campaign_id, 90).await.unwrap();
    assert_eq!(counters(&pool, fx.episode_id, PlacementType::MidRoll).await, (3, 0));

    trigger.advance(campaign_id, 0).await.unwrap();
    assert_eq!(counters(&pool, fx.episode_id, PlacementType::MidRoll).await, (0, 0));

    let campaign: Campaign = {
        let mut conn = pool.get().await.unwrap();
        campaigns::table
            .filter(campaigns::id.eq(campaign_id))
            .first(&mut conn)
            .await
            .unwrap()
    };
    assert_eq!(campaign.progress, 0);
    assert_eq!(campaign.status, "cancelled");

    // cancelling again is a no-op
    trigger.advance(campaign_id, 0).await.unwrap();
    assert_eq!(counters(&pool, fx.episode_id, PlacementType::MidRoll).await, (0, 0));
}

#[tokio::test]
#[ignore = "requires a Postgres database via DATABASE_URL"]
async fn approval_gate_holds_the_campaign_at_the_reserve_checkpoint() {
    let pool = pool().await;
    let fx = fixture(&pool, 4).await;
    set_settings(&pool, fx.org_id, true).await;
    let ctx = TenantContext::for_system(&pool, fx.org_id);

    let campaign_id = add_campaign(&pool, fx.org_id, "draft", 0).await;
    add_schedule(&pool, fx.org_id, campaign_id, fx.episode_id, 1).await;

    let trigger = StageTrigger::new(&ctx);
    let outcome = trigger.advance(campaign_id, 100).await.unwrap();
    assert_eq!(outcome.to, 90);
    assert_eq!(counters(&pool, fx.episode_id, PlacementType::MidRoll).await, (1, 0));

    let campaign: Campaign = {
        let mut conn = pool.get().await.unwrap();
        campaigns::table
            .filter(campaigns::id.eq(campaign_id))
            .first(&mut conn)
            .await
            .unwrap()
    };
    assert_eq!(campaign.progress, 90);
    assert_eq!(campaign.status, "pending");

    // an admin approves; the next transition completes the order
    {
        let mut conn = pool.get().await.unwrap();
        diesel::update(campaigns::table.filter(campaigns::id.eq(campaign_id)))
            .set(campaigns::status.eq("approved"))
            .execute(&mut conn)
            .await
            .unwrap();
    }
    let outcome = trigger.advance(campaign_id, 100).await.unwrap();
    assert_eq!(outcome.to, 100);
    assert_eq!(counters(&pool, fx.episode_id, PlacementType::MidRoll).await, (0, 1));
}

#[tokio::test]
#[ignore = "requires a Postgres database via DATABASE_URL"]
async fn tenants_cannot_see_each_others_reservations() {
    let pool = pool().await;
    let fx_a = fixture(&pool, 3).await;
    let fx_b = fixture(&pool, 3).await;

    let ctx_a = TenantContext::for_system(&pool, fx_a.org_id);
    let campaign_id = add_campaign(&pool, fx_a.org_id, "building", 65).await;
    let held = ReservationManager::new(&ctx_a)
        .hold(campaign_id, fx_a.episode_id, PlacementType::MidRoll, None, 1, Duration::hours(1))
        .await
        .unwrap();

    let ctx_b = TenantContext::for_system(&pool, fx_b.org_id);
    let err = ReservationManager::new(&ctx_b).get(held.id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));

    let err = ReservationManager::new(&ctx_b)
        .release(held.id, "cross-tenant attempt")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[tokio::test]
#[ignore = "requires a Postgres database via DATABASE_URL"]
async fn dry_run_simulation_writes_nothing() {
    let pool = pool().await;
    let fx = fixture(&pool, 4).await;
    set_settings(&pool, fx.org_id, false).await;

    let campaign_id = add_campaign(&pool, fx.org_id, "draft", 0).await;
    add_schedule(&pool, fx.org_id, campaign_id, fx.episode_id, 2).await;

    let app = api::create_router(api::AppState {
        pool: pool.clone(),
        lock_retries: 3,
    });

    let body = serde_json::to_vec(&serde_json::json!({
        "campaign_id": campaign_id,
        "target_stage": 100,
        "dry_run": true,
    }))
    .unwrap();
    let request = Request::builder()
        .method("POST")
        .uri("/workflow/simulate")
        .header("content-type", "application/json")
        .header("x-user-id", fx.admin_id.to_string())
        .body(Body::from(body))
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let report: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(report["applied"], serde_json::Value::Bool(false));
    assert!(!report["effects"].as_array().unwrap().is_empty());

    let mut conn = pool.get().await.unwrap();
    let reservation_count: i64 = reservations::table
        .filter(reservations::campaign_id.eq(campaign_id))
        .count()
        .get_result(&mut conn)
        .await
        .unwrap();
    let order_count: i64 = orders::table
        .filter(orders::campaign_id.eq(campaign_id))
        .count()
        .get_result(&mut conn)
        .await
        .unwrap();
    let effect_count: i64 = workflow_effects::table
        .filter(workflow_effects::campaign_id.eq(campaign_id))
        .count()
        .get_result(&mut conn)
        .await
        .unwrap();
    let alert_count: i64 = inventory_alerts::table
        .filter(inventory_alerts::org_id.eq(fx.org_id))
        .count()
        .get_result(&mut conn)
        .await
        .unwrap();
    assert_eq!(reservation_count, 0);
    assert_eq!(order_count, 0);
    assert_eq!(effect_count, 0);
    assert_eq!(alert_count, 0);
    assert_eq!(counters(&pool, fx.episode_id, PlacementType::MidRoll).await, (0, 0));
}

#[tokio::test]
#[ignore = "requires a Postgres database via DATABASE_URL"]
async fn reservation_endpoint_maps_capacity_conflicts_to_409() {
    let pool = pool().await;
    let fx = fixture(&pool, 1).await;
    let campaign_id = add_campaign(&pool, fx.org_id, "building", 65).await;

    let app = api::create_router(api::AppState {
        pool: pool.clone(),
        lock_retries: 3,
    });

    let make_request = |quantity: i32| {
        let body = serde_json::to_vec(&serde_json::json!({
            "campaign_id": campaign_id,
            "episode_id": fx.episode_id,
            "placement_type": "mid_roll",
            "quantity": quantity,
        }))
        .unwrap();
        Request::builder()
            .method("POST")
            .uri("/reservations")
            .header("content-type", "application/json")
            .header("x-user-id", fx.admin_id.to_string())
            .body(Body::from(body))
            .unwrap()
    };

    let response = app.clone().oneshot(make_request(1)).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    // same campaign re-holding is idempotent, not a conflict
    let response = app.clone().oneshot(make_request(1)).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let rival = add_campaign(&pool, fx.org_id, "building", 65).await;
    let body = serde_json::to_vec(&serde_json::json!({
        "campaign_id": rival,
        "episode_id": fx.episode_id,
        "placement_type": "mid_roll",
        "quantity": 1,
    }))
    .unwrap();
    let request = Request::builder()
        .method("POST")
        .uri("/reservations")
        .header("content-type", "application/json")
        .header("x-user-id", fx.admin_id.to_string())
        .body(Body::from(body))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let error: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(error["remaining"], serde_json::json!(0));
}

#[tokio::test]
#[ignore = "requires a Postgres database via DATABASE_URL"]
async fn audit_flags_orphans_and_blocked_deletions() {
    let pool = pool().await;
    let fx = fixture(&pool, 3).await;
    let ctx = TenantContext::for_system(&pool, fx.org_id);
    let mgr = ReservationManager::new(&ctx);

    let campaign_id = add_campaign(&pool, fx.org_id, "building", 65).await;
    mgr.hold(campaign_id, fx.episode_id, PlacementType::MidRoll, None, 1, Duration::hours(1))
        .await
        .unwrap();

    // the campaign disappears out from under its reservation, and the show
    // is soft-deleted while the hold is still live
    {
        let mut conn = pool.get().await.unwrap();
        diesel::delete(campaigns::table.filter(campaigns::id.eq(campaign_id)))
            .execute(&mut conn)
            .await
            .unwrap();
        diesel::update(shows::table.filter(shows::id.eq(fx.show_id)))
            .set(shows::deleted_at.eq(Some(Utc::now())))
            .execute(&mut conn)
            .await
            .unwrap();
    }

    let report = reconcile::run_audit(&ctx, false).await.unwrap();
    assert_eq!(report.counts.orphaned_reservations, 1);
    assert!(report.orphaned_reservations[0].reason.contains("campaign missing"));

    // the live hold and the upcoming episode both block the deletion
    assert_eq!(report.counts.blocked_deletions, 2);
    assert_eq!(report.blocked_deletions[0].kind, "reservation");
    assert!(report
        .blocked_deletions
        .iter()
        .any(|b| b.kind == "episode" && b.reference_id == fx.episode_id));
}

#[tokio::test]
#[ignore = "requires a Postgres database via DATABASE_URL"]
async fn cross_tenant_access_is_admin_only_and_audited() {
    let pool = pool().await;
    let fx_a = fixture(&pool, 3).await;
    let fx_b = fixture(&pool, 3).await;

    // a member of org A cannot borrow org B's partition
    let member_id = Uuid::new_v4();
    {
        let mut conn = pool.get().await.unwrap();
        diesel::insert_into(users::table)
            .values(&User {
                id: member_id,
                org_id: fx_a.org_id,
                email: format!("member-{}@example.com", member_id.simple()),
                role: "member".to_string(),
                created_at: Utc::now(),
            })
            .execute(&mut conn)
            .await
            .unwrap();
    }
    let err = TenantContext::resolve_for_org(&pool, member_id, fx_b.org_id, "support lookup")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    // an admin can, and the grant leaves an audit trail
    let ctx = TenantContext::resolve_for_org(&pool, fx_a.admin_id, fx_b.org_id, "support lookup")
        .await
        .unwrap();
    assert_eq!(ctx.org_id(), fx_b.org_id);

    let mut conn = pool.get().await.unwrap();
    let audited: i64 = tenant_access_audit::table
        .filter(tenant_access_audit::actor_user_id.eq(fx_a.admin_id))
        .filter(tenant_access_audit::target_org_id.eq(fx_b.org_id))
        .count()
        .get_result(&mut conn)
        .await
        .unwrap();
    assert_eq!(audited, 1);
}
