//! The inventory ledger owns the per-(episode, placement) slot counters.
//! `try_reserve`, `release`, and `confirm` are the only code paths that
//! mutate them; they run inside the caller's transaction with the counter
//! row locked, so `reserved + booked <= total` holds at every commit point.

use chrono::Utc;
use diesel::prelude::*;
use diesel::result::Error as DieselError;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use shared::{EngineError, EngineResult, PlacementType, ReservationStatus};

use crate::models::EpisodeInventory;
use crate::schema::{episode_inventory, reservations};
use crate::tenant::TenantContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedgerCounts {
    pub reserved: i64,
    pub booked: i64,
}

/// Lock failure from `FOR UPDATE NOWAIT` means a concurrent writer holds the
/// row; that is `Busy`, not a database fault.
fn map_lock_error(err: DieselError) -> EngineError {
    if let DieselError::DatabaseError(_, ref info) = err {
        if info.message().contains("could not obtain lock") {
            return EngineError::Busy;
        }
    }
    EngineError::Database(err)
}

async fn lock_counter_row(
    conn: &mut AsyncPgConnection,
    org_id: Uuid,
    episode_id: Uuid,
    placement: PlacementType,
) -> EngineResult<EpisodeInventory> {
    match episode_inventory::table
        .filter(episode_inventory::org_id.eq(org_id))
        .filter(episode_inventory::episode_id.eq(episode_id))
        .filter(episode_inventory::placement_type.eq(placement.as_str()))
        .for_update()
        .no_wait()
        .first::<EpisodeInventory>(conn)
        .await
    {
        Ok(row) => Ok(row),
        Err(DieselError::NotFound) => Err(EngineError::not_found("episode inventory", episode_id)),
        Err(err) => Err(map_lock_error(err)),
    }
}

/// Checks capacity and increments `reserved_slots` in one locked step.
/// Returns the slots remaining after the increment.
pub(crate) async fn try_reserve(
    conn: &mut AsyncPgConnection,
    org_id: Uuid,
    episode_id: Uuid,
    placement: PlacementType,
    quantity: i32,
) -> EngineResult<i32> {
    let row = lock_counter_row(conn, org_id, episode_id, placement).await?;
    let remaining = row.available();
    if remaining < quantity {
        return Err(EngineError::Conflict { remaining });
    }

    diesel::update(episode_inventory::table.filter(episode_inventory::id.eq(row.id)))
        .set((
            episode_inventory::reserved_slots.eq(row.reserved_slots + quantity),
            episode_inventory::updated_at.eq(Utc::now()),
        ))
        .execute(conn)
        .await?;

    Ok(remaining - quantity)
}

/// Returns reserved capacity to the pool. A decrement below zero is never
/// written; it aborts the transaction as corruption instead.
pub(crate) async fn release(
    conn: &mut AsyncPgConnection,
    org_id: Uuid,
    episode_id: Uuid,
    placement: PlacementType,
    quantity: i32,
) -> EngineResult<()> {
    let row = lock_counter_row(conn, org_id, episode_id, placement).await?;
    if quantity > row.reserved_slots {
        return Err(EngineError::LedgerCorruption {
            episode_id,
            placement,
            message: format!(
                "release of {} exceeds reserved count {}",
                quantity, row.reserved_slots
            ),
        });
    }

    diesel::update(episode_inventory::table.filter(episode_inventory::id.eq(row.id)))
        .set((
            episode_inventory::reserved_slots.eq(row.reserved_slots - quantity),
            episode_inventory::updated_at.eq(Utc::now()),
        ))
        .execute(conn)
        .await?;

    Ok(())
}

/// Moves quantity from reserved to booked.
pub(crate) async fn confirm(
    conn: &mut AsyncPgConnection,
    org_id: Uuid,
    episode_id: Uuid,
    placement: PlacementType,
    quantity: i32,
) -> EngineResult<()> {
    let row = lock_counter_row(conn, org_id, episode_id, placement).await?;
    if quantity > row.reserved_slots {
        return Err(EngineError::LedgerCorruption {
            episode_id,
            placement,
            message: format!(
                "confirm of {} exceeds reserved count {}",
                quantity, row.reserved_slots
            ),
        });
    }

    diesel::update(episode_inventory::table.filter(episode_inventory::id.eq(row.id)))
        .set((
            episode_inventory::reserved_slots.eq(row.reserved_slots - quantity),
            episode_inventory::booked_slots.eq(row.booked_slots + quantity),
            episode_inventory::updated_at.eq(Utc::now()),
        ))
        .execute(conn)
        .await?;

    Ok(())
}

/// Recomputes the counters from the authoritative reservation rows.
/// Read-only; the cached row is untouched.
pub async fn recount(
    ctx: &TenantContext,
    episode_id: Uuid,
    placement: PlacementType,
) -> EngineResult<LedgerCounts> {
    let mut conn = ctx.conn().await?;
    recount_with(&mut conn, ctx.org_id(), episode_id, placement).await
}

pub(crate) async fn recount_with(
    conn: &mut AsyncPgConnection,
    org_id: Uuid,
    episode_id: Uuid,
    placement: PlacementType,
) -> EngineResult<LedgerCounts> {
    use diesel::dsl::sum;

    let reserved: Option<i64> = reservations::table
        .filter(reservations::org_id.eq(org_id))
        .filter(reservations::episode_id.eq(episode_id))
        .filter(reservations::placement_type.eq(placement.as_str()))
        .filter(reservations::status.eq(ReservationStatus::Reserved.as_str()))
        .filter(reservations::locked.eq(true))
        .select(sum(reservations::quantity))
        .first(conn)
        .await?;

    let booked: Option<i64> = reservations::table
        .filter(reservations::org_id.eq(org_id))
        .filter(reservations::episode_id.eq(episode_id))
        .filter(reservations::placement_type.eq(placement.as_str()))
        .filter(reservations::status.eq(ReservationStatus::Confirmed.as_str()))
        .select(sum(reservations::quantity))
        .first(conn)
        .await?;

    Ok(LedgerCounts {
        reserved: reserved.unwrap_or(0),
        booked: booked.unwrap_or(0),
    })
}

/// Writes the recomputed counts back over the cached row. Admin-invoked
/// only; the periodic sweep detects drift but never repairs it.
pub async fn repair(
    ctx: &TenantContext,
    episode_id: Uuid,
    placement: PlacementType,
) -> EngineResult<LedgerCounts> {
    let mut conn = ctx.conn().await?;
    let org_id = ctx.org_id();

    let counts = conn
        .transaction::<_, EngineError, _>(|conn| {
            Box::pin(async move {
                let row = lock_counter_row(conn, org_id, episode_id, placement).await?;
                let counts = recount_with(conn, org_id, episode_id, placement).await?;

                diesel::update(
                    episode_inventory::table.filter(episode_inventory::id.eq(row.id)),
                )
                .set((
                    episode_inventory::reserved_slots.eq(counts.reserved as i32),
                    episode_inventory::booked_slots.eq(counts.booked as i32),
                    episode_inventory::updated_at.eq(Utc::now()),
                ))
                .execute(conn)
                .await?;

                Ok(counts)
            })
        })
        .await?;

    info!(
        "repaired inventory counters for episode {} {}: reserved={} booked={}",
        episode_id, placement, counts.reserved, counts.booked
    );

    Ok(counts)
}

/// Counter rows for one episode, all placements.
pub async fn counts_for_episode(
    ctx: &TenantContext,
    episode_id: Uuid,
) -> EngineResult<Vec<EpisodeInventory>> {
    let mut conn = ctx.conn().await?;
    let rows = episode_inventory::table
        .filter(episode_inventory::org_id.eq(ctx.org_id()))
        .filter(episode_inventory::episode_id.eq(episode_id))
        .order(episode_inventory::placement_type.asc())
        .load::<EpisodeInventory>(&mut conn)
        .await?;
    Ok(rows)
}
