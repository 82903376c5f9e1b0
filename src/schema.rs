// Diesel table definitions.
// Kept in sync with repository/schema_sqlite.sql by hand.

diesel::table! {
    states (id) {
        id -> Integer,
        abbreviation -> Text,
        name -> Text,
        slug -> Text,
        listing_count -> Integer,
        created_at -> Text,
    }
}

diesel::table! {
    cities (id) {
        id -> Integer,
        state_id -> Integer,
        name -> Text,
        slug -> Text,
        listing_count -> Integer,
        created_at -> Text,
    }
}

diesel::table! {
    listings (id) {
        id -> Integer,
        slug -> Text,
        name -> Text,
        address -> Text,
        city_id -> Integer,
        state_id -> Integer,
        zip -> Text,
        phone -> Text,
        website -> Nullable<Text>,
        latitude -> Double,
        longitude -> Double,
        coordinates_approximate -> Bool,
        rating -> Double,
        review_count -> Integer,
        hours -> Text,
        services -> Text,
        open_24_hours -> Bool,
        has_wifi -> Bool,
        has_parking -> Bool,
        accepts_cards -> Bool,
        wash_and_fold -> Bool,
        dry_cleaning -> Bool,
        has_attendant -> Bool,
        premium_score -> Integer,
        is_premium -> Bool,
        is_featured -> Bool,
        seo_title -> Nullable<Text>,
        seo_description -> Nullable<Text>,
        source_offset -> BigInt,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    import_checkpoints (run_key) {
        run_key -> Text,
        data -> Text,
        updated_at -> Text,
    }
}

diesel::joinable!(cities -> states (state_id));
diesel::joinable!(listings -> cities (city_id));

diesel::allow_tables_to_appear_in_same_query!(states, cities, listings, import_checkpoints,);
