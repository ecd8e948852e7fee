use std::{path::PathBuf, time::Duration};

use hub_core::{manifest::DEFAULT_CONCURRENCY, Manifest, ManifestError, MessageType, RetrySchedule};
use proptest::prelude::*;

fn write_manifest(contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("hub-manifest-{}.json", uuid::Uuid::new_v4()));
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn loads_manifest_from_file() {
    let path = write_manifest(
        r#"{
            "signup": { "publishes": ["user.created"] },
            "mailer": {
                "subscribes": ["user.created"],
                "endpoint": "http://mailer.local/webhook",
                "retrySchedule": [1000, 5000]
            }
        }"#,
    );

    let manifest = Manifest::load(&path, DEFAULT_CONCURRENCY).unwrap();
    std::fs::remove_file(&path).ok();

    let mailer = manifest.service("mailer").unwrap();
    assert_eq!(mailer.concurrency, DEFAULT_CONCURRENCY);
    assert_eq!(mailer.retry_schedule.delay_after(1), Some(Duration::from_secs(5)));
    assert_eq!(mailer.endpoint.as_ref().unwrap().as_str(), "http://mailer.local/webhook");

    let created = MessageType::from("user.created");
    assert_eq!(manifest.subscribers_of(&created).count(), 1);
    assert_eq!(manifest.subscribers().count(), 1);
}

#[test]
fn missing_file_is_an_io_error() {
    let err = Manifest::load("/nonexistent/hub-manifest.json", 1.0).unwrap_err();
    assert!(matches!(err, ManifestError::Io(_)));
}

#[test]
fn invalid_json_is_a_parse_error() {
    let err = Manifest::from_json("{ not json", 1.0).unwrap_err();
    assert!(matches!(err, ManifestError::Parse(_)));
}

#[test]
fn invalid_endpoint_url_is_a_parse_error() {
    let err =
        Manifest::from_json(r#"{"a": {"subscribes": ["t"], "endpoint": "not a url"}}"#, 1.0)
            .unwrap_err();
    assert!(matches!(err, ManifestError::Parse(_)));
}

#[test]
fn fractional_concurrency_is_kept() {
    let manifest = Manifest::from_json(
        r#"{"a": {"subscribes": ["t"], "endpoint": "http://a.local/", "concurrency": 2.5}}"#,
        1.0,
    )
    .unwrap();
    assert_eq!(manifest.service("a").unwrap().concurrency, 2.5);
}

proptest! {
    #[test]
    fn retry_schedule_exhausts_after_its_length(delays in prop::collection::vec(0u64..100_000, 0..10)) {
        let schedule = RetrySchedule::from_millis(&delays);

        for (attempt, delay) in delays.iter().enumerate() {
            let attempt = u32::try_from(attempt).unwrap();
            prop_assert_eq!(schedule.delay_after(attempt), Some(Duration::from_millis(*delay)));
        }
        prop_assert_eq!(schedule.delay_after(u32::try_from(delays.len()).unwrap()), None);
    }
}
