use diesel::{allow_tables_to_appear_in_same_query, joinable, table};

table! {
    users (id) {
        id -> Uuid,
        email -> Text,
        telegram_chat_id -> Nullable<Text>,
        webhook_url -> Nullable<Text>,
        preferred_channel -> Nullable<Text>,
        is_active -> Bool,
        created_at -> Timestamptz,
    }
}

table! {
    watched_products (id) {
        id -> Uuid,
        user_id -> Uuid,
        asin -> Text,
        product_name -> Nullable<Text>,
        target_price -> Float8,
        current_price -> Nullable<Float8>,
        volatility_score -> Float8,
        status -> Text,
        last_checked_at -> Nullable<Timestamptz>,
        last_price_change -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    price_history (id) {
        id -> Uuid,
        watch_id -> Uuid,
        price -> Float8,
        source -> Nullable<Text>,
        recorded_at -> Timestamptz,
    }
}

table! {
    price_alerts (id) {
        id -> Uuid,
        watch_id -> Uuid,
        triggered_price -> Float8,
        target_price -> Float8,
        old_price -> Nullable<Float8>,
        new_price -> Nullable<Float8>,
        discount_percent -> Nullable<Float8>,
        status -> Text,
        notification_channel -> Nullable<Text>,
        triggered_at -> Timestamptz,
        sent_at -> Nullable<Timestamptz>,
    }
}

table! {
    deal_filters (id) {
        id -> Uuid,
        user_id -> Uuid,
        name -> Text,
        categories -> Nullable<Jsonb>,
        min_price -> Float8,
        max_price -> Float8,
        min_discount -> Float8,
        max_discount -> Float8,
        min_rating -> Float8,
        is_active -> Bool,
        created_at -> Timestamptz,
    }
}

table! {
    deal_reports (id) {
        id -> Uuid,
        filter_id -> Uuid,
        deals_data -> Nullable<Jsonb>,
        generated_at -> Timestamptz,
        sent_at -> Nullable<Timestamptz>,
    }
}

table! {
    collected_deals (id) {
        id -> Uuid,
        asin -> Text,
        title -> Nullable<Text>,
        current_price -> Float8,
        original_price -> Nullable<Float8>,
        discount_percent -> Nullable<Float8>,
        rating -> Nullable<Float8>,
        review_count -> Nullable<Int4>,
        sales_rank -> Nullable<Int4>,
        domain -> Text,
        category -> Nullable<Text>,
        url -> Nullable<Text>,
        prime_eligible -> Bool,
        deal_score -> Nullable<Float8>,
        collected_at -> Timestamptz,
    }
}

joinable!(watched_products -> users (user_id));
joinable!(price_history -> watched_products (watch_id));
joinable!(price_alerts -> watched_products (watch_id));
joinable!(deal_filters -> users (user_id));
joinable!(deal_reports -> deal_filters (filter_id));

allow_tables_to_appear_in_same_query!(
    users,
    watched_products,
    price_history,
    price_alerts,
    deal_filters,
    deal_reports,
    collected_deals,
);
