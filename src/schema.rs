// Kept in sync with migrations/ by hand.

diesel::table! {
    power (site_id, day, ts) {
        site_id -> Text,
        day -> Date,
        ts -> Timestamptz,
        p_cons -> Float8,
        p_prod -> Float8,
        p_tot -> Float8,
        config_id -> Timestamptz,
    }
}

diesel::table! {
    group_power (group_id, day, ts) {
        group_id -> Text,
        day -> Date,
        ts -> Timestamptz,
        p_cons -> Float8,
        p_prod -> Float8,
        p_tot -> Float8,
        config_id -> Timestamptz,
    }
}

diesel::table! {
    raw_power (site_id, sensor_id, day, ts) {
        site_id -> Text,
        sensor_id -> Text,
        day -> Date,
        ts -> Timestamptz,
        power -> Float8,
        config_id -> Timestamptz,
    }
}

diesel::table! {
    raw_missing (site_id, sensor_id, day) {
        site_id -> Text,
        sensor_id -> Text,
        day -> Date,
        first_missing -> Timestamptz,
        missing_ticks -> Int4,
        config_id -> Timestamptz,
    }
}

diesel::table! {
    sensors_config (insertion_time, site_id, sensor_id) {
        insertion_time -> Timestamptz,
        site_id -> Text,
        sensor_id -> Text,
        phase -> Text,
        device_id -> Text,
        token -> Text,
        net -> Int2,
        con -> Int2,
        pro -> Int2,
    }
}

diesel::table! {
    site_groups (group_id, site_id) {
        group_id -> Text,
        site_id -> Text,
    }
}

diesel::table! {
    sync_markers (site_id) {
        site_id -> Text,
        last_synced_day -> Date,
        updated_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    power,
    group_power,
    raw_power,
    raw_missing,
    sensors_config,
    site_groups,
    sync_markers,
);
