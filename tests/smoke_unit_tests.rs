//! Smoke screen unit tests for the request workflow components
//!
//! Unit tests that span the crate's public surface, exercising each piece in
//! isolation from the service. Mostly the happy path.

use chrono::{Datelike, Timelike};
use request_workflow::{
    config::{EngineConfig, LogFormat},
    directory::Role,
    request::{Request, RequestFields, RequestType, TimeStamp},
    utils::{REQUEST_HRP, new_request_id, new_uuid_to_bech32},
    workflow::{ApprovalChain, ApproverStep, Route},
};

// UTILS MODULE TESTS
mod utils_tests {
    use super::*;

    /// Identifiers carry the human-readable prefix and the bech32 separator
    #[test]
    fn generates_valid_bech32_with_hrp() {
        let encoded = new_uuid_to_bech32("user_").unwrap();
        assert!(encoded.starts_with("user_1"));
        assert!(encoded.len() > 10);
    }

    #[test]
    fn request_ids_use_request_prefix() {
        let id = new_request_id().unwrap();
        assert!(id.starts_with(REQUEST_HRP));
        assert_ne!(id, new_request_id().unwrap());
    }
}

// TIMESTAMP TESTS
mod timestamp_tests {
    use super::*;

    #[test]
    fn new_with_builds_exact_instant() {
        let ts = TimeStamp::new_with(2025, 3, 14, 15, 9, 26).unwrap();
        let dt = ts.to_datetime_utc();
        assert_eq!((dt.year(), dt.month(), dt.day()), (2025, 3, 14));
        assert_eq!((dt.hour(), dt.minute(), dt.second()), (15, 9, 26));
    }

    #[test]
    fn impossible_dates_are_none() {
        assert!(TimeStamp::new_with(2025, 2, 30, 0, 0, 0).is_none());
    }

    #[test]
    fn timestamps_order_chronologically() {
        let earlier = TimeStamp::new_with(2025, 1, 1, 0, 0, 0).unwrap();
        let later = TimeStamp::new_with(2025, 1, 2, 0, 0, 0).unwrap();
        assert!(earlier < later);
    }
}

// REQUEST SNAPSHOT TESTS
mod snapshot_tests {
    use super::*;

    fn request() -> Request {
        let fields = RequestFields::new()
            .subject("Late shift")
            .reason("Release night")
            .start_date(TimeStamp::new_with(2025, 9, 1, 18, 0, 0).unwrap())
            .hour(4.0);
        let chain = ApprovalChain::new(vec![ApproverStep::new(1, "root", Role::Admin)]).unwrap();
        Request::create(
            new_request_id().unwrap(),
            "mgr".into(),
            RequestType::Overtime,
            &fields,
            ["alice".to_string(), "alice".to_string()],
            vec![],
            Route::Chain(chain),
            TimeStamp::new(),
        )
        .unwrap()
    }

    /// The stored form decodes back to the same snapshot, nanoseconds included
    #[test]
    fn cbor_snapshot_decodes_to_the_same_request() {
        let original = request();
        let (_, cbor) = original.encode().unwrap();
        assert_eq!(Request::decode(&cbor).unwrap(), original);
    }

    /// Hash is stable for a given snapshot and sensitive to any change
    #[test]
    fn digest_is_deterministic() {
        let original = request();
        let (h1, _) = original.encode().unwrap();
        let (h2, _) = original.clone().encode().unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);

        let (other, _) = request().encode().unwrap();
        assert_ne!(h1, other);
    }

    #[test]
    fn cc_list_is_a_set() {
        assert_eq!(request().cc().len(), 1);
    }
}

// CONFIG TESTS
mod config_tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.logging.format, LogFormat::Compact);
    }

    #[test]
    fn configured_storage_opens() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.storage.path = dir.path().join("db");

        let db = config.storage.open().unwrap();
        db.insert(b"k", b"v".as_slice()).unwrap();
        assert_eq!(db.get(b"k").unwrap().as_deref(), Some(b"v".as_slice()));
    }
}
