// Kept in sync with `db/migrations` by hand. Regenerate with `diesel print-schema` against a
// migrated database when a migration changes a table.

diesel::table! {
    alert (id) {
        id -> Uuid,
        kind -> Text,
        entity_type -> Text,
        entity_id -> Uuid,
        title -> Text,
        message -> Text,
        created_by -> Nullable<Uuid>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    alert_experiment (alert_id, experiment_id) {
        alert_id -> Uuid,
        experiment_id -> Uuid,
        acknowledged_at -> Nullable<Timestamptz>,
        acknowledged_by -> Nullable<Uuid>,
    }
}

diesel::table! {
    aliquot (id) {
        id -> Uuid,
        code -> Text,
        sample_id -> Uuid,
        batch_id -> Uuid,
        status -> Text,
        volume -> Nullable<Float8>,
        concentration -> Nullable<Float8>,
        unit -> Nullable<Text>,
        freezer -> Nullable<Text>,
        box_label -> Nullable<Text>,
        position -> Nullable<Text>,
        made_on -> Date,
        created_by -> Nullable<Uuid>,
        inserted_at -> Timestamptz,
    }
}

diesel::table! {
    audit_log (id) {
        id -> Uuid,
        entity_type -> Text,
        entity_id -> Uuid,
        action -> Text,
        actor_id -> Nullable<Uuid>,
        reason -> Nullable<Text>,
        metadata -> Nullable<Jsonb>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    batch (id) {
        id -> Uuid,
        lot_number -> Text,
        vendor -> Nullable<Text>,
        qc_status -> Text,
        received_on -> Nullable<Date>,
        expires_on -> Nullable<Date>,
        inserted_at -> Timestamptz,
    }
}

diesel::table! {
    experiment (id) {
        id -> Uuid,
        title -> Text,
        performed_on -> Date,
        owner_id -> Uuid,
        notes -> Nullable<Text>,
        outputs -> Nullable<Text>,
        inserted_at -> Timestamptz,
    }
}

diesel::table! {
    experiment_aliquot (experiment_id, aliquot_id) {
        experiment_id -> Uuid,
        aliquot_id -> Uuid,
        usage_notes -> Nullable<Text>,
        attached_at -> Timestamptz,
    }
}

diesel::table! {
    person (id) {
        id -> Uuid,
        name -> Text,
        email -> Text,
    }
}

diesel::table! {
    sample (id) {
        id -> Uuid,
        batch_id -> Uuid,
        name -> Text,
        category -> Nullable<Text>,
        next_aliquot_index -> Int4,
        inserted_at -> Timestamptz,
    }
}

diesel::joinable!(alert_experiment -> alert (alert_id));
diesel::joinable!(alert_experiment -> experiment (experiment_id));
diesel::joinable!(aliquot -> batch (batch_id));
diesel::joinable!(aliquot -> sample (sample_id));
diesel::joinable!(experiment -> person (owner_id));
diesel::joinable!(experiment_aliquot -> aliquot (aliquot_id));
diesel::joinable!(experiment_aliquot -> experiment (experiment_id));
diesel::joinable!(sample -> batch (batch_id));

diesel::allow_tables_to_appear_in_same_query!(
    alert,
    alert_experiment,
    aliquot,
    audit_log,
    batch,
    experiment,
    experiment_aliquot,
    person,
    sample,
);
