// Diesel schema for the surveyor tables.

diesel::table! {
    tasks (task_id) {
        task_id -> Text,
        status -> Text,
        params -> Jsonb,
        original_topic -> Nullable<Text>,
        expected_result_key -> Nullable<Text>,
        user_id -> Nullable<Text>,
        error -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        start_time -> Nullable<Timestamptz>,
        end_time -> Nullable<Timestamptz>,
        execution_seconds -> Nullable<Float8>,
        expire_at -> Timestamptz,
    }
}

diesel::table! {
    surveys (task_id) {
        task_id -> Text,
        title -> Text,
        survey_data -> Jsonb,
        created_at -> Timestamptz,
        status -> Text,
        cite_ratio -> Float8,
        content_length -> Int8,
        references_count -> Int8,
    }
}

diesel::table! {
    crawl_results (task_id) {
        task_id -> Text,
        data -> Jsonb,
        created_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(tasks, surveys, crawl_results);
