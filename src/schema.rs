#![allow(clippy::all, missing_docs)]

table! {
    agents (id) {
        id -> Text,
        name -> Text,
        location -> Text,
        secret -> Text,
        online -> BigInt,
        description -> Nullable<Text>,
        picture -> Nullable<Text>,
    }
}

table! {
    reports (id) {
        id -> Text,
        time -> BigInt,
        location -> Text,
        agent -> Text,
    }
}

table! {
    images (id) {
        id -> Text,
        path -> Text,
        location -> Text,
        confirmed -> Bool,
        report -> Text,
    }
}

joinable!(reports -> agents (agent));
joinable!(images -> reports (report));

allow_tables_to_appear_in_same_query!(agents, images, reports,);
