use crate::api::types::{ErrorCode, Event, Metadata, MetadataValue, Origin, Resource};
use proptest::prelude::*;
use serde_json::Value;

pub fn json_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-z0-9 ]{0,16}".prop_map(Value::from),
    ]
}

pub fn json_value() -> impl Strategy<Value = Value> {
    json_leaf().prop_recursive(4, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::from),
            prop::collection::btree_map(metadata_key(), inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

pub fn metadata_key() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("password".to_string()),
        Just("user_id".to_string()),
        Just("Api-Key".to_string()),
        "[a-z_]{1,12}",
    ]
}

pub fn metadata_value() -> impl Strategy<Value = MetadataValue> {
    prop_oneof![
        "[a-zA-Z0-9 ]{0,24}".prop_map(MetadataValue::Text),
        json_value().prop_map(MetadataValue::Structured),
    ]
}

pub fn metadata() -> impl Strategy<Value = Metadata> {
    prop::collection::btree_map(metadata_key(), metadata_value(), 0..8)
}

pub fn origin() -> impl Strategy<Value = Origin> {
    prop_oneof![
        Just(Origin::Trigger),
        Just(Origin::Other("http".into())),
        Just(Origin::Other("sql".into())),
    ]
}

pub fn error_code() -> impl Strategy<Value = ErrorCode> {
    prop_oneof![
        Just(ErrorCode::Ok),
        Just(ErrorCode::Error),
        Just(ErrorCode::Exception),
        Just(ErrorCode::Timeout),
    ]
}

/// A non-runner event.
pub fn event() -> impl Strategy<Value = Event> {
    ("[a-z]{1,8}", origin(), error_code(), metadata()).prop_map(
        |(name, origin, error_code, metadata)| {
            let mut resource = Resource::new("http", name, "GET");
            resource.metadata = metadata;
            let mut event = Event::new(resource, origin);
            event.error_code = error_code;
            event
        },
    )
}
