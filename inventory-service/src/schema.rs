diesel::table! {
    organizations (id) {
        id -> Uuid,
        slug -> Varchar,
        name -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    users (id) {
        id -> Uuid,
        org_id -> Uuid,
        email -> Varchar,
        role -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    workflow_settings (org_id) {
        org_id -> Uuid,
        reservation_ttl_hours -> Int4,
        auto_reserve_enabled -> Bool,
        approval_required -> Bool,
        stuck_stage_sla_days -> Int4,
        degrade_to_alert -> Bool,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    shows (id) {
        id -> Uuid,
        org_id -> Uuid,
        title -> Varchar,
        deleted_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    episodes (id) {
        id -> Uuid,
        org_id -> Uuid,
        show_id -> Uuid,
        title -> Varchar,
        air_date -> Timestamptz,
    }
}

diesel::table! {
    episode_inventory (id) {
        id -> Uuid,
        org_id -> Uuid,
        episode_id -> Uuid,
        placement_type -> Varchar,
        total_slots -> Int4,
        reserved_slots -> Int4,
        booked_slots -> Int4,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    campaigns (id) {
        id -> Uuid,
        org_id -> Uuid,
        name -> Varchar,
        advertiser -> Varchar,
        progress -> Int4,
        status -> Varchar,
        buildable -> Bool,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    campaign_schedules (id) {
        id -> Uuid,
        org_id -> Uuid,
        campaign_id -> Uuid,
        episode_id -> Uuid,
        placement_type -> Varchar,
        quantity -> Int4,
        rate -> Numeric,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    reservations (id) {
        id -> Uuid,
        org_id -> Uuid,
        show_id -> Uuid,
        episode_id -> Uuid,
        placement_type -> Varchar,
        campaign_id -> Uuid,
        schedule_id -> Nullable<Uuid>,
        quantity -> Int4,
        status -> Varchar,
        locked -> Bool,
        expires_at -> Nullable<Timestamptz>,
        created_by -> Uuid,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    workflow_effects (campaign_id, stage, effect) {
        campaign_id -> Uuid,
        stage -> Int4,
        effect -> Varchar,
        org_id -> Uuid,
        applied_at -> Timestamptz,
    }
}

diesel::table! {
    orders (id) {
        id -> Uuid,
        org_id -> Uuid,
        campaign_id -> Uuid,
        total_amount -> Numeric,
        status -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    inventory_alerts (id) {
        id -> Uuid,
        org_id -> Uuid,
        alert_type -> Varchar,
        severity -> Varchar,
        episode_id -> Nullable<Uuid>,
        placement_type -> Nullable<Varchar>,
        dedupe_key -> Varchar,
        details -> Jsonb,
        status -> Varchar,
        acknowledged_by -> Nullable<Uuid>,
        acknowledged_at -> Nullable<Timestamptz>,
        resolved_by -> Nullable<Uuid>,
        resolved_at -> Nullable<Timestamptz>,
        resolution -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    notifications (id) {
        id -> Uuid,
        org_id -> Uuid,
        recipient -> Varchar,
        subject -> Varchar,
        body -> Text,
        processed -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    tenant_access_audit (id) {
        id -> Uuid,
        actor_user_id -> Uuid,
        target_org_id -> Uuid,
        operation -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    organizations,
    users,
    workflow_settings,
    shows,
    episodes,
    episode_inventory,
    campaigns,
    campaign_schedules,
    reservations,
    workflow_effects,
    orders,
    inventory_alerts,
    notifications,
    tenant_access_audit,
);
