//! Reservation lifecycle. The manager is the sole writer of reservation
//! rows; every counter change it makes goes through the ledger inside the
//! same transaction, so a hold and its increment commit or roll back as one.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use tracing::{debug, info};
use uuid::Uuid;

use shared::{EngineError, EngineResult, PlacementType, ReservationStatus};

use crate::ledger;
use crate::models::{Episode, NewReservation, Reservation};
use crate::schema::{campaigns, episodes, reservations};
use crate::tenant::TenantContext;

const LOCK_RETRY_DELAY: StdDuration = StdDuration::from_millis(50);

pub struct ReservationManager<'a> {
    ctx: &'a TenantContext,
    lock_retries: u32,
}

impl<'a> ReservationManager<'a> {
    pub fn new(ctx: &'a TenantContext) -> Self {
        Self {
            ctx,
            lock_retries: 3,
        }
    }

    pub fn with_lock_retries(mut self, lock_retries: u32) -> Self {
        self.lock_retries = lock_retries;
        self
    }

    /// Places a TTL-bounded hold on capacity. Re-holding a slot this
    /// campaign already actively holds returns the existing row; `Busy`
    /// is retried a bounded number of times before surfacing.
    pub async fn hold(
        &self,
        campaign_id: Uuid,
        episode_id: Uuid,
        placement: PlacementType,
        schedule_id: Option<Uuid>,
        quantity: i32,
        ttl: Duration,
    ) -> EngineResult<Reservation> {
        if quantity <= 0 {
            return Err(EngineError::Validation(
                "quantity must be positive".into(),
            ));
        }

        let mut conn = self.ctx.conn().await?;
        let org_id = self.ctx.org_id();

        if let Some(existing) =
            active_hold(&mut conn, org_id, campaign_id, episode_id, placement).await?
        {
            debug!(
                "campaign {} already holds episode {} {}; returning existing reservation {}",
                campaign_id, episode_id, placement, existing.id
            );
            return Ok(existing);
        }

        let episode = episodes::table
            .filter(episodes::org_id.eq(org_id))
            .filter(episodes::id.eq(episode_id))
            .first::<Episode>(&mut conn)
            .await
            .optional()?
            .ok_or_else(|| EngineError::not_found("episode", episode_id))?;

        let campaign_exists: i64 = campaigns::table
            .filter(campaigns::org_id.eq(org_id))
            .filter(campaigns::id.eq(campaign_id))
            .count()
            .get_result(&mut conn)
            .await?;
        if campaign_exists == 0 {
            return Err(EngineError::not_found("campaign", campaign_id));
        }

        let mut attempt = 0;
        loop {
            match self
                .insert_hold(
                    &mut conn,
                    &episode,
                    campaign_id,
                    placement,
                    schedule_id,
                    quantity,
                    ttl,
                )
                .await
            {
                Ok(reservation) => {
                    info!(
                        "held {} x {} on episode {} for campaign {} (expires {:?})",
                        quantity, placement, episode_id, campaign_id, reservation.expires_at
                    );
                    return Ok(reservation);
                }
                Err(EngineError::Busy) if attempt < self.lock_retries => {
                    attempt += 1;
                    tokio::time::sleep(LOCK_RETRY_DELAY).await;
                }
                Err(EngineError::Database(DieselError::DatabaseError(
                    DatabaseErrorKind::UniqueViolation,
                    _,
                ))) => {
                    // lost a race to a concurrent hold for the same slot;
                    // the committed winner is the reservation we wanted
                    return active_hold(&mut conn, org_id, campaign_id, episode_id, placement)
                        .await?
                        .ok_or(EngineError::Busy);
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn insert_hold(
        &self,
        conn: &mut AsyncPgConnection,
        episode: &Episode,
        campaign_id: Uuid,
        placement: PlacementType,
        schedule_id: Option<Uuid>,
        quantity: i32,
        ttl: Duration,
    ) -> EngineResult<Reservation> {
        let org_id = self.ctx.org_id();
        let new_row = NewReservation {
            id: Uuid::new_v4(),
            org_id,
            show_id: episode.show_id,
            episode_id: episode.id,
            placement_type: placement.as_str().to_string(),
            campaign_id,
            schedule_id,
            quantity,
            status: ReservationStatus::Reserved.as_str().to_string(),
            locked: true,
            expires_at: Some(Utc::now() + ttl),
            created_by: self.ctx.user_id(),
        };
        let episode_id = episode.id;

        conn.transaction::<_, EngineError, _>(|conn| {
            Box::pin(async move {
                ledger::try_reserve(conn, org_id, episode_id, placement, quantity).await?;

                let reservation = diesel::insert_into(reservations::table)
                    .values(&new_row)
                    .get_result::<Reservation>(conn)
                    .await?;

                Ok(reservation)
            })
        })
        .await
    }

    /// Pushes the expiry forward. Only a still-active hold can be extended.
    pub async fn extend(&self, reservation_id: Uuid, new_ttl: Duration) -> EngineResult<Reservation> {
        let mut conn = self.ctx.conn().await?;
        let org_id = self.ctx.org_id();

        conn.transaction::<_, EngineError, _>(|conn| {
            Box::pin(async move {
                let row = lock_reservation(conn, org_id, reservation_id).await?;
                if ReservationStatus::parse(&row.status) != Some(ReservationStatus::Reserved) {
                    return Err(EngineError::Expired);
                }

                let updated = diesel::update(
                    reservations::table.filter(reservations::id.eq(row.id)),
                )
                .set((
                    reservations::expires_at.eq(Some(Utc::now() + new_ttl)),
                    reservations::updated_at.eq(Utc::now()),
                ))
                .get_result::<Reservation>(conn)
                .await?;

                Ok(updated)
            })
        })
        .await
    }

    /// Books the held capacity. Idempotent: confirming an already-confirmed
    /// reservation returns it unchanged, because the stage trigger upstream
    /// delivers at-least-once.
    pub async fn confirm(&self, reservation_id: Uuid) -> EngineResult<Reservation> {
        let mut attempt = 0;
        loop {
            match self.confirm_once(reservation_id).await {
                Err(EngineError::Busy) if attempt < self.lock_retries => {
                    attempt += 1;
                    tokio::time::sleep(LOCK_RETRY_DELAY).await;
                }
                other => return other,
            }
        }
    }

    async fn confirm_once(&self, reservation_id: Uuid) -> EngineResult<Reservation> {
        let mut conn = self.ctx.conn().await?;
        let org_id = self.ctx.org_id();

        conn.transaction::<_, EngineError, _>(|conn| {
            Box::pin(async move {
                let row = lock_reservation(conn, org_id, reservation_id).await?;
                match ReservationStatus::parse(&row.status) {
                    Some(ReservationStatus::Confirmed) => Ok(row),
                    Some(ReservationStatus::Reserved) => {
                        let placement = placement_of(&row)?;
                        ledger::confirm(conn, org_id, row.episode_id, placement, row.quantity)
                            .await?;

                        let updated = diesel::update(
                            reservations::table.filter(reservations::id.eq(row.id)),
                        )
                        .set((
                            reservations::status
                                .eq(ReservationStatus::Confirmed.as_str()),
                            reservations::locked.eq(false),
                            reservations::expires_at.eq(None::<DateTime<Utc>>),
                            reservations::updated_at.eq(Utc::now()),
                        ))
                        .get_result::<Reservation>(conn)
                        .await?;

                        Ok(updated)
                    }
                    _ => Err(EngineError::Expired),
                }
            })
        })
        .await
    }

    /// Gives the held capacity back. Idempotent on released and expired
    /// rows; a confirmed reservation is order-backed and cannot be released
    /// through this path.
    pub async fn release(&self, reservation_id: Uuid, reason: &str) -> EngineResult<Reservation> {
        let mut attempt = 0;
        loop {
            match self.release_once(reservation_id, reason).await {
                Err(EngineError::Busy) if attempt < self.lock_retries => {
                    attempt += 1;
                    tokio::time::sleep(LOCK_RETRY_DELAY).await;
                }
                other => return other,
            }
        }
    }

    async fn release_once(&self, reservation_id: Uuid, reason: &str) -> EngineResult<Reservation> {
        let mut conn = self.ctx.conn().await?;
        let org_id = self.ctx.org_id();
        let reason = reason.to_string();

        conn.transaction::<_, EngineError, _>(|conn| {
            Box::pin(async move {
                let row = lock_reservation(conn, org_id, reservation_id).await?;
                match ReservationStatus::parse(&row.status) {
                    Some(ReservationStatus::Released) | Some(ReservationStatus::Expired) => Ok(row),
                    Some(ReservationStatus::Confirmed) => Err(EngineError::Validation(
                        "confirmed reservation cannot be released".into(),
                    )),
                    Some(ReservationStatus::Reserved) => {
                        let placement = placement_of(&row)?;
                        ledger::release(conn, org_id, row.episode_id, placement, row.quantity)
                            .await?;

                        let updated = diesel::update(
                            reservations::table.filter(reservations::id.eq(row.id)),
                        )
                        .set((
                            reservations::status.eq(ReservationStatus::Released.as_str()),
                            reservations::locked.eq(false),
                            reservations::updated_at.eq(Utc::now()),
                        ))
                        .get_result::<Reservation>(conn)
                        .await?;

                        info!("released reservation {}: {}", reservation_id, reason);
                        Ok(updated)
                    }
                    None => Err(EngineError::Validation(format!(
                        "unknown reservation status '{}'",
                        row.status
                    ))),
                }
            })
        })
        .await
    }

    /// Sweep-only variant of release that lands the row on `expired`.
    /// Idempotent per reservation: a crash mid-sweep leaves each row either
    /// untouched or fully expired, never in between.
    pub async fn expire(&self, reservation_id: Uuid) -> EngineResult<bool> {
        let mut conn = self.ctx.conn().await?;
        let org_id = self.ctx.org_id();

        conn.transaction::<_, EngineError, _>(|conn| {
            Box::pin(async move {
                let row = match lock_reservation(conn, org_id, reservation_id).await {
                    Ok(row) => row,
                    Err(EngineError::NotFound { .. }) => return Ok(false),
                    Err(err) => return Err(err),
                };

                if ReservationStatus::parse(&row.status) != Some(ReservationStatus::Reserved) {
                    return Ok(false);
                }
                if row.expires_at.map_or(false, |t| t > Utc::now()) {
                    return Ok(false);
                }

                let placement = placement_of(&row)?;
                ledger::release(conn, org_id, row.episode_id, placement, row.quantity).await?;

                diesel::update(reservations::table.filter(reservations::id.eq(row.id)))
                    .set((
                        reservations::status.eq(ReservationStatus::Expired.as_str()),
                        reservations::locked.eq(false),
                        reservations::updated_at.eq(Utc::now()),
                    ))
                    .execute(conn)
                    .await?;

                Ok(true)
            })
        })
        .await
    }

    /// Releases every active hold a campaign owns. No-op when none are.
    pub async fn release_all_for_campaign(
        &self,
        campaign_id: Uuid,
        reason: &str,
    ) -> EngineResult<usize> {
        let ids = self
            .active_reservation_ids(campaign_id)
            .await?;
        let mut released = 0;
        for id in ids {
            self.release(id, reason).await?;
            released += 1;
        }
        Ok(released)
    }

    /// Confirms every active hold a campaign owns.
    pub async fn confirm_all_for_campaign(&self, campaign_id: Uuid) -> EngineResult<usize> {
        let ids = self.active_reservation_ids(campaign_id).await?;
        let mut confirmed = 0;
        for id in ids {
            self.confirm(id).await?;
            confirmed += 1;
        }
        Ok(confirmed)
    }

    async fn active_reservation_ids(&self, campaign_id: Uuid) -> EngineResult<Vec<Uuid>> {
        let mut conn = self.ctx.conn().await?;
        let ids = reservations::table
            .filter(reservations::org_id.eq(self.ctx.org_id()))
            .filter(reservations::campaign_id.eq(campaign_id))
            .filter(reservations::status.eq(ReservationStatus::Reserved.as_str()))
            .select(reservations::id)
            .load::<Uuid>(&mut conn)
            .await?;
        Ok(ids)
    }

    pub async fn get(&self, reservation_id: Uuid) -> EngineResult<Reservation> {
        let mut conn = self.ctx.conn().await?;
        reservations::table
            .filter(reservations::org_id.eq(self.ctx.org_id()))
            .filter(reservations::id.eq(reservation_id))
            .first::<Reservation>(&mut conn)
            .await
            .optional()?
            .ok_or_else(|| EngineError::not_found("reservation", reservation_id))
    }

    pub async fn list(&self, campaign_id: Option<Uuid>) -> EngineResult<Vec<Reservation>> {
        let mut conn = self.ctx.conn().await?;
        let mut query = reservations::table
            .filter(reservations::org_id.eq(self.ctx.org_id()))
            .into_boxed();
        if let Some(campaign_id) = campaign_id {
            query = query.filter(reservations::campaign_id.eq(campaign_id));
        }
        let rows = query
            .order(reservations::created_at.desc())
            .load::<Reservation>(&mut conn)
            .await?;
        Ok(rows)
    }
}

async fn lock_reservation(
    conn: &mut AsyncPgConnection,
    org_id: Uuid,
    reservation_id: Uuid,
) -> EngineResult<Reservation> {
    reservations::table
        .filter(reservations::org_id.eq(org_id))
        .filter(reservations::id.eq(reservation_id))
        .for_update()
        .first::<Reservation>(conn)
        .await
        .optional()?
        .ok_or_else(|| EngineError::not_found("reservation", reservation_id))
}

async fn active_hold(
    conn: &mut AsyncPgConnection,
    org_id: Uuid,
    campaign_id: Uuid,
    episode_id: Uuid,
    placement: PlacementType,
) -> EngineResult<Option<Reservation>> {
    let row = reservations::table
        .filter(reservations::org_id.eq(org_id))
        .filter(reservations::campaign_id.eq(campaign_id))
        .filter(reservations::episode_id.eq(episode_id))
        .filter(reservations::placement_type.eq(placement.as_str()))
        .filter(reservations::status.eq(ReservationStatus::Reserved.as_str()))
        .filter(reservations::locked.eq(true))
        .first::<Reservation>(conn)
        .await
        .optional()?;
    Ok(row)
}

fn placement_of(row: &Reservation) -> EngineResult<PlacementType> {
    PlacementType::parse(&row.placement_type).ok_or_else(|| {
        EngineError::Validation(format!(
            "unknown placement type '{}' on reservation {}",
            row.placement_type, row.id
        ))
    })
}
