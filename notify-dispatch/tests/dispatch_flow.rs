//! Event fan-out and first-attempt behavior against a real SQLite file.

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use serde_json::json;

use common::*;
use notify_dispatch::config::DispatchConfig;
use notify_dispatch::database::models::{
    ChannelKind, NewEvent, NewSubscription, NotificationFilters, NotificationStatus,
    PaginationParams,
};
use notify_dispatch::database::time::now_ms;

fn filters_for_event(event_type: &str) -> NotificationFilters {
    NotificationFilters {
        tenant_id: Some(TENANT),
        event_type: Some(event_type.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_event_without_subscribers_is_processed() {
    let h = harness(DispatchConfig::default()).await;

    let event_id = h
        .service
        .ingest_event(order_created(json!({"order_id": 1})))
        .await
        .unwrap();
    let summary = h.service.process_event(&event_id).await.unwrap();

    assert!(summary.claimed);
    assert_eq!(summary.matched, 0);
    assert_eq!(summary.created, 0);

    let event = h.service.get_event(&event_id).await.unwrap();
    assert!(event.processed);
    assert!(event.processed_at.is_some());

    let page = h
        .service
        .list_notifications(&NotificationFilters::default(), &PaginationParams::default())
        .await
        .unwrap();
    assert_eq!(page.total, 0);
}

#[tokio::test]
async fn test_fan_out_creates_one_notification_per_match() {
    let h = harness(DispatchConfig::default()).await;
    let receiver = ok_receiver().await;

    // Matching: two webhooks (one with a satisfied filter) and an in-app inbox.
    h.service
        .create_subscription(webhook_subscription(&receiver.url))
        .await
        .unwrap();
    h.service
        .create_subscription(
            webhook_subscription(&receiver.url).with_filter(json!({"region": "north"})),
        )
        .await
        .unwrap();
    h.service
        .create_subscription(
            NewSubscription::new(TENANT, ORDER_CREATED, ChannelKind::InApp, json!({}))
                .with_user("user-7"),
        )
        .await
        .unwrap();

    // Not matching: wrong filter, inactive, other tenant, other event type.
    h.service
        .create_subscription(
            webhook_subscription(&receiver.url).with_filter(json!({"region": "south"})),
        )
        .await
        .unwrap();
    h.service
        .create_subscription(webhook_subscription(&receiver.url).inactive())
        .await
        .unwrap();
    let mut other_tenant = webhook_subscription(&receiver.url);
    other_tenant.tenant_id = 2;
    h.service.create_subscription(other_tenant).await.unwrap();
    let mut other_type = webhook_subscription(&receiver.url);
    other_type.event_type = "order.cancelled".to_string();
    h.service.create_subscription(other_type).await.unwrap();

    let event_id = h
        .service
        .ingest_event(order_created(json!({"order_id": 7, "region": "north"})))
        .await
        .unwrap();
    let summary = h.service.process_event(&event_id).await.unwrap();

    assert_eq!(summary.matched, 3);
    assert_eq!(summary.created, 3);
    assert_eq!(summary.attempts.sent, 3);
    assert_eq!(receiver.hits(), 2);

    let page = h
        .service
        .list_notifications(&filters_for_event(ORDER_CREATED), &PaginationParams::default())
        .await
        .unwrap();
    assert_eq!(page.total, 3);
    for n in &page.items {
        assert_eq!(n.status, "sent");
        assert_eq!(n.attempts, 1);
        assert_eq!(n.event_id.as_deref(), Some(event_id.as_str()));
        assert!(n.sent_at.is_some());
        assert!(n.claim_token.is_none());
    }

    let inbox = h.service.inbox().messages("user-7");
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].metadata["event_id"], event_id.as_str());
}

#[tokio::test]
async fn test_processing_twice_never_duplicates() {
    let h = harness(DispatchConfig::default()).await;
    let receiver = ok_receiver().await;
    h.service
        .create_subscription(webhook_subscription(&receiver.url))
        .await
        .unwrap();

    let event_id = h
        .service
        .ingest_event(order_created(json!({"order_id": 1})))
        .await
        .unwrap();

    let first = h.service.process_event(&event_id).await.unwrap();
    let second = h.service.process_event(&event_id).await.unwrap();
    assert!(first.claimed);
    assert!(!second.claimed);
    assert_eq!(second.created, 0);

    let page = h
        .service
        .list_notifications(&filters_for_event(ORDER_CREATED), &PaginationParams::default())
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(receiver.hits(), 1);
}

#[tokio::test]
async fn test_concurrent_processing_claims_event_once() {
    let h = harness(DispatchConfig::default()).await;
    let receiver = ok_receiver().await;
    for _ in 0..3 {
        h.service
            .create_subscription(webhook_subscription(&receiver.url))
            .await
            .unwrap();
    }

    let event_id = h
        .service
        .ingest_event(order_created(json!({"order_id": 1})))
        .await
        .unwrap();

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let service = h.service.clone();
        let event_id = event_id.clone();
        tasks.spawn(async move { service.process_event(&event_id).await });
    }

    let mut claimed = 0;
    while let Some(result) = tasks.join_next().await {
        if result.unwrap().unwrap().claimed {
            claimed += 1;
        }
    }

    assert_eq!(claimed, 1);
    let page = h
        .service
        .list_notifications(&filters_for_event(ORDER_CREATED), &PaginationParams::default())
        .await
        .unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(receiver.hits(), 3);
}

#[tokio::test]
async fn test_webhook_payload_shape_and_auth() {
    let h = harness(DispatchConfig::default()).await;
    let receiver = ok_receiver().await;
    h.service
        .create_subscription(webhook_subscription(&receiver.url))
        .await
        .unwrap();

    let event_id = h
        .service
        .ingest_event(
            order_created(json!({"order_id": 7, "title": "New order #7"}))
                .with_metadata(json!({"body": "Table 4 ordered"})),
        )
        .await
        .unwrap();
    h.service.process_event(&event_id).await.unwrap();

    let requests = receiver.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    assert_eq!(
        request.headers.get("authorization").unwrap().to_str().unwrap(),
        "Bearer t0k"
    );
    assert!(
        request
            .headers
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("application/json")
    );

    let body = request.body.as_object().unwrap();
    let mut keys: Vec<&str> = body.keys().map(String::as_str).collect();
    keys.sort_unstable();
    assert_eq!(keys, ["channel_metadata", "message", "timestamp", "title"]);
    assert_eq!(body["title"], "New order #7");
    assert_eq!(body["message"], "Table 4 ordered");
    assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));
    assert_eq!(body["channel_metadata"]["store"], "north-1");
    assert_eq!(body["channel_metadata"]["event_type"], ORDER_CREATED);
    assert_eq!(body["channel_metadata"]["source_id"], "order-42");
    assert_eq!(body["channel_metadata"]["payload"]["order_id"], 7);
}

#[tokio::test]
async fn test_transport_timeout_schedules_retry() {
    let h = harness(DispatchConfig::default()).await;
    let receiver = spawn_receiver(Vec::new(), StatusCode::OK, Duration::from_secs(5)).await;
    let mut sub = webhook_subscription(&receiver.url);
    sub.channel_config["timeout_secs"] = json!(1);
    h.service.create_subscription(sub).await.unwrap();

    let event_id = h
        .service
        .ingest_event(order_created(json!({"order_id": 1})))
        .await
        .unwrap();

    let before = now_ms();
    let summary = h.service.process_event(&event_id).await.unwrap();
    let after = now_ms();
    assert_eq!(summary.attempts.retrying, 1);

    let page = h
        .service
        .list_notifications(&filters_for_event(ORDER_CREATED), &PaginationParams::default())
        .await
        .unwrap();
    let n = &page.items[0];
    assert_eq!(n.status().unwrap(), NotificationStatus::Retrying);
    assert_eq!(n.attempts, 1);
    assert_eq!(n.max_attempts, 3);
    let next = n.next_retry_at.unwrap();
    assert!(next >= before + 30_000, "next_retry_at {} too early", next);
    assert!(next <= after + 30_000, "next_retry_at {} too late", next);

    let logs = h.service.notification_logs(&n.id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].attempt, 1);
    assert_eq!(logs[0].status_at_attempt, "retrying");
}

#[tokio::test]
async fn test_single_attempt_budget_fails() {
    let h = harness(DispatchConfig::default()).await;
    let receiver = spawn_receiver(Vec::new(), StatusCode::OK, Duration::from_secs(5)).await;
    let mut sub = webhook_subscription(&receiver.url).with_max_attempts(1);
    sub.channel_config["timeout_secs"] = json!(1);
    h.service.create_subscription(sub).await.unwrap();

    let event_id = h
        .service
        .ingest_event(order_created(json!({"order_id": 1})))
        .await
        .unwrap();
    let summary = h.service.process_event(&event_id).await.unwrap();
    assert_eq!(summary.attempts.failed, 1);

    let page = h
        .service
        .list_notifications(&filters_for_event(ORDER_CREATED), &PaginationParams::default())
        .await
        .unwrap();
    let n = &page.items[0];
    assert_eq!(n.status, "failed");
    assert_eq!(n.attempts, 1);
    assert_eq!(n.max_attempts, 1);
    assert!(n.next_retry_at.is_none());
    assert!(n.failed_at.is_some());
    assert!(n.last_error.is_some());
}

#[tokio::test]
async fn test_unreadable_subscription_target_fails_permanently() {
    let h = harness(DispatchConfig::default()).await;
    let receiver = ok_receiver().await;
    let bad_config = h
        .service
        .create_subscription(webhook_subscription(&receiver.url))
        .await
        .unwrap();
    let bad_kind = h
        .service
        .create_subscription(webhook_subscription(&receiver.url))
        .await
        .unwrap();
    sqlx::query("UPDATE subscription SET channel_config = 'not json' WHERE id = ?")
        .bind(&bad_config.id)
        .execute(&h.db.write_pool)
        .await
        .unwrap();
    sqlx::query("UPDATE subscription SET channel_kind = 'carrier_pigeon' WHERE id = ?")
        .bind(&bad_kind.id)
        .execute(&h.db.write_pool)
        .await
        .unwrap();

    let event_id = h
        .service
        .ingest_event(order_created(json!({"order_id": 1})))
        .await
        .unwrap();
    let summary = h.service.process_event(&event_id).await.unwrap();
    assert_eq!(summary.matched, 2);
    assert_eq!(summary.created, 2);
    assert_eq!(summary.attempts.failed, 2);
    assert_eq!(receiver.hits(), 0);

    let page = h
        .service
        .list_notifications(&filters_for_event(ORDER_CREATED), &PaginationParams::default())
        .await
        .unwrap();
    assert_eq!(page.total, 2);
    for n in &page.items {
        assert_eq!(n.status, "failed");
        assert_eq!(n.attempts, 1);
        assert_eq!(n.max_attempts, 1);
        assert_eq!(n.recipient, "");
        assert!(n.last_error.is_some());
    }
    let kinds: Vec<_> = page.items.iter().map(|n| n.channel_kind.as_str()).collect();
    assert!(kinds.contains(&"carrier_pigeon"));
}

#[tokio::test]
async fn test_server_error_is_retried_and_client_error_is_not() {
    let h = harness(DispatchConfig::default()).await;
    let flaky = spawn_receiver(Vec::new(), StatusCode::INTERNAL_SERVER_ERROR, Duration::ZERO).await;
    let missing = spawn_receiver(Vec::new(), StatusCode::NOT_FOUND, Duration::ZERO).await;

    let flaky_sub = h
        .service
        .create_subscription(webhook_subscription(&flaky.url))
        .await
        .unwrap();
    let missing_sub = h
        .service
        .create_subscription(webhook_subscription(&missing.url))
        .await
        .unwrap();

    let event_id = h
        .service
        .ingest_event(order_created(json!({"order_id": 1})))
        .await
        .unwrap();
    let summary = h.service.process_event(&event_id).await.unwrap();
    assert_eq!(summary.attempts.retrying, 1);
    assert_eq!(summary.attempts.failed, 1);

    let page = h
        .service
        .list_notifications(&filters_for_event(ORDER_CREATED), &PaginationParams::default())
        .await
        .unwrap();
    let by_sub = |id: &str| {
        page.items
            .iter()
            .find(|n| n.subscription_id.as_deref() == Some(id))
            .unwrap()
            .clone()
    };

    let retrying = by_sub(&flaky_sub.id);
    assert_eq!(retrying.status, "retrying");
    assert_eq!(retrying.attempts, 1);

    let failed = by_sub(&missing_sub.id);
    assert_eq!(failed.status, "failed");
    assert_eq!(failed.attempts, 1);
    // Permanent failure lowers the budget so failed rows keep attempts == max_attempts.
    assert_eq!(failed.max_attempts, 1);
    assert!(failed.last_error.as_deref().unwrap().contains("404"));
}

#[tokio::test]
async fn test_pending_events_are_processed_in_batches() {
    let h = harness(DispatchConfig::default()).await;
    let receiver = ok_receiver().await;
    h.service
        .create_subscription(webhook_subscription(&receiver.url))
        .await
        .unwrap();

    for order_id in 0..3 {
        h.service
            .ingest_event(order_created(json!({"order_id": order_id})))
            .await
            .unwrap();
    }
    h.service
        .ingest_event(NewEvent::new(TENANT, "order.cancelled", json!({})))
        .await
        .unwrap();

    assert_eq!(h.service.unprocessed_event_count().await.unwrap(), 4);
    assert_eq!(h.service.process_pending_events().await.unwrap(), 4);
    assert_eq!(h.service.process_pending_events().await.unwrap(), 0);
    assert_eq!(h.service.unprocessed_event_count().await.unwrap(), 0);
    assert_eq!(receiver.hits(), 3);
}
