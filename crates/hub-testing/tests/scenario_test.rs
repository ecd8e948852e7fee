//! Delivery scenarios run through the scenario builder.

use anyhow::Result;
use hub_testing::{ScenarioBuilder, TestEnv};
use serde_json::json;

#[tokio::test]
async fn delivers_a_published_message() -> Result<()> {
    let env = TestEnv::new().await?;

    let report = ScenarioBuilder::new("single delivery")
        .with_subscriber("order.created")
        .at("/orders")
        .when_sending_message(json!({"order": 42}))
        .it_is_received_at("/orders")
        .run(&env)
        .await?;

    assert_eq!(report.requests.len(), 1);
    assert_eq!(report.requests[0].body, json!({"order": 42}));
    assert_eq!(report.requests[0].attempt, Some(0));
    Ok(())
}

#[tokio::test]
async fn delivers_every_message_sent() -> Result<()> {
    let env = TestEnv::new().await?;

    let report = ScenarioBuilder::new("burst")
        .with_subscriber("order.created")
        .at("/orders")
        .when_sending_message(json!({}))
        .times(5)
        .it_is_received_at("/orders")
        .received_times(5)
        .run(&env)
        .await?;

    assert_eq!(report.requests.len(), 5);
    Ok(())
}

#[tokio::test]
async fn failing_subscriber_is_retried_on_schedule() -> Result<()> {
    let env = TestEnv::new().await?;

    let report = ScenarioBuilder::new("retry schedule")
        .with_subscriber("job.done")
        .with_status(500)
        .with_retry_schedule(&[100, 500])
        .at("/jobs")
        .when_sending_message(json!({"job": 1}))
        .it_is_received_at("/jobs")
        .within_schedule(&[0, 100, 600])
        .run(&env)
        .await?;

    let attempts: Vec<_> = report.requests.iter().map(|r| r.attempt).collect();
    assert_eq!(attempts, vec![Some(0), Some(1), Some(2)]);
    Ok(())
}

#[tokio::test]
async fn no_retry_without_schedule() -> Result<()> {
    let env = TestEnv::new().await?;

    ScenarioBuilder::new("no schedule")
        .with_subscriber("job.done")
        .with_status(503)
        .at("/jobs")
        .when_sending_message(json!({}))
        .it_is_received_at("/jobs")
        .after(500)
        .received_times(1)
        .run(&env)
        .await?;
    Ok(())
}

#[tokio::test]
async fn slow_subscriber_is_served_one_at_a_time() -> Result<()> {
    let env = TestEnv::new().await?;

    let report = ScenarioBuilder::new("concurrency one")
        .with_subscriber("doc.indexed")
        .with_concurrency(1.0)
        .with_response_taking(500)
        .at("/index")
        .when_sending_message(json!({}))
        .times(3)
        .it_is_received_at("/index")
        .after(700)
        .received_times(2)
        .run(&env)
        .await?;

    assert!(report.peak_concurrency <= 1, "peak {}", report.peak_concurrency);
    Ok(())
}

#[tokio::test]
async fn hubs_share_the_declared_concurrency() -> Result<()> {
    let env = TestEnv::new().await?;

    let report = ScenarioBuilder::new("two hubs")
        .for_hub(2)
        .with_subscriber("doc.indexed")
        .with_concurrency(2.0)
        .with_response_taking(300)
        .at("/index")
        .when_sending_message(json!({}))
        .times(6)
        .it_is_received_at("/index")
        .received_times(6)
        .run(&env)
        .await?;

    assert!(report.peak_concurrency <= 2, "peak {}", report.peak_concurrency);
    // six 300ms deliveries two at a time
    let last = report.offsets().last().copied().unwrap_or_default();
    assert!(last >= std::time::Duration::from_millis(550), "last arrival at {last:?}");
    Ok(())
}

#[tokio::test]
async fn scenario_without_subscriber_fails() -> Result<()> {
    let env = TestEnv::new().await?;

    let result = ScenarioBuilder::new("incomplete").when_sending_message(json!({})).run(&env).await;

    assert!(result.is_err());
    Ok(())
}
