//! Subscription management, queries, direct sends, maintenance and lifecycle.

mod common;

use std::time::Duration;

use serde_json::json;

use common::*;
use notify_dispatch::Error;
use notify_dispatch::config::DispatchConfig;
use notify_dispatch::database::models::{
    ChannelKind, NewSubscription, NotificationFilters, NotificationStatus, PaginationParams,
    SubscriptionUpdate,
};
use notify_dispatch::notification::DirectNotification;

fn in_app_direct(user: &str, title: &str) -> DirectNotification {
    let mut direct = DirectNotification::new(
        TENANT,
        ChannelKind::InApp,
        json!({ "user_id": user }),
        title,
        "Your table is ready",
    );
    direct.event_type = "table.ready".to_string();
    direct
}

#[tokio::test]
async fn test_invalid_channel_configs_are_rejected() {
    let h = harness(DispatchConfig::default()).await;

    let cases = [
        NewSubscription::new(
            TENANT,
            ORDER_CREATED,
            ChannelKind::Webhook,
            json!({ "url": "ftp://example.com/hook" }),
        ),
        NewSubscription::new(TENANT, ORDER_CREATED, ChannelKind::Webhook, json!({})),
        NewSubscription::new(
            TENANT,
            ORDER_CREATED,
            ChannelKind::Push,
            json!({ "server_key": "key" }),
        ),
        NewSubscription::new(
            TENANT,
            ORDER_CREATED,
            ChannelKind::Email,
            json!({ "smtp_host": "" }),
        ),
        // In-app needs a user either in the config or on the subscription.
        NewSubscription::new(TENANT, ORDER_CREATED, ChannelKind::InApp, json!({})),
        NewSubscription::new(TENANT, ORDER_CREATED, ChannelKind::Webhook, json!("not an object")),
    ];

    for sub in cases {
        let err = h.service.create_subscription(sub.clone()).await.unwrap_err();
        assert!(
            matches!(err, Error::Configuration(_)),
            "expected configuration error for {:?}, got {:?}",
            sub.channel_config,
            err
        );
    }
    assert!(h.service.list_subscriptions(TENANT).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_subscription_update_and_toggle() {
    let h = harness(DispatchConfig::default()).await;
    let created = h
        .service
        .create_subscription(webhook_subscription("https://example.com/a"))
        .await
        .unwrap();
    assert!(created.active);

    let bad = SubscriptionUpdate {
        channel_config: Some(json!({ "url": "not a url" })),
        ..Default::default()
    };
    let err = h
        .service
        .update_subscription(&created.id, bad)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));

    let good = SubscriptionUpdate {
        channel_config: Some(json!({ "url": "https://example.com/b" })),
        filter: Some(Some(json!({ "region": "north" }))),
        max_attempts: Some(Some(5)),
        ..Default::default()
    };
    let updated = h.service.update_subscription(&created.id, good).await.unwrap();
    assert_eq!(updated.config_json().unwrap()["url"], "https://example.com/b");
    assert_eq!(updated.max_attempts, Some(5));

    let stored = h.service.get_subscription(&created.id).await.unwrap();
    assert_eq!(stored.filter_json().unwrap(), Some(json!({ "region": "north" })));

    let toggled = h
        .service
        .set_subscription_active(&created.id, false)
        .await
        .unwrap();
    assert!(!toggled.active);

    let listed = h.service.list_subscriptions(TENANT).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(h.service.list_subscriptions(99).await.unwrap().is_empty());

    let err = h
        .service
        .set_subscription_active("missing", true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
async fn test_direct_send_to_in_app_inbox() {
    let h = harness(DispatchConfig::default()).await;

    let n = h
        .service
        .send_direct(in_app_direct("user-1", "Table ready"))
        .await
        .unwrap();
    assert_eq!(n.status().unwrap(), NotificationStatus::Sent);
    assert_eq!(n.attempts, 1);
    assert_eq!(n.recipient, "user-1");
    assert!(n.event_id.is_none());
    assert!(n.subscription_id.is_none());
    assert_eq!(n.external_id.as_deref(), Some(n.id.as_str()));

    let inbox = h.service.inbox().messages("user-1");
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].title, "Table ready");

    let logs = h.service.notification_logs(&n.id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status_at_attempt, "sent");
}

#[tokio::test]
async fn test_direct_send_validation() {
    let h = harness(DispatchConfig::default()).await;

    let mut bad_metadata = in_app_direct("user-1", "x");
    bad_metadata.metadata = Some(json!([1, 2]));
    let err = h.service.send_direct(bad_metadata).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let bad_config = DirectNotification::new(
        TENANT,
        ChannelKind::Webhook,
        json!({ "url": "mailto:someone@example.com" }),
        "t",
        "b",
    );
    let err = h.service.send_direct(bad_config).await.unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));

    let mut zero_attempts = in_app_direct("user-1", "x");
    zero_attempts.max_attempts = Some(0);
    assert!(h.service.send_direct(zero_attempts).await.is_err());
}

#[tokio::test]
async fn test_notification_queries_and_stats() {
    let h = harness(DispatchConfig::default()).await;

    for i in 0..5 {
        h.service
            .send_direct(in_app_direct("user-1", &format!("n{}", i)))
            .await
            .unwrap();
    }
    let mut other_tenant = in_app_direct("user-2", "other");
    other_tenant.tenant_id = 2;
    h.service.send_direct(other_tenant).await.unwrap();

    let tenant_filter = NotificationFilters {
        tenant_id: Some(TENANT),
        ..Default::default()
    };
    let first = h
        .service
        .list_notifications(&tenant_filter, &PaginationParams::new(2, 0))
        .await
        .unwrap();
    assert_eq!(first.total, 5);
    assert_eq!(first.limit, 2);
    assert_eq!(first.items.len(), 2);

    let last = h
        .service
        .list_notifications(&tenant_filter, &PaginationParams::new(2, 4))
        .await
        .unwrap();
    assert_eq!(last.items.len(), 1);
    assert_eq!(last.offset, 4);

    // Newest first, no overlap between pages.
    let all = h
        .service
        .list_notifications(&tenant_filter, &PaginationParams::new(100, 0))
        .await
        .unwrap();
    assert_eq!(all.items[0].title, "n4");
    assert!(!first.items.iter().any(|a| last.items.iter().any(|b| a.id == b.id)));

    let by_status_and_kind = NotificationFilters {
        status: Some(NotificationStatus::Sent),
        channel_kind: Some(ChannelKind::InApp),
        event_type: Some("table.ready".to_string()),
        ..Default::default()
    };
    let page = h
        .service
        .list_notifications(&by_status_and_kind, &PaginationParams::default())
        .await
        .unwrap();
    assert_eq!(page.total, 6);

    let none = NotificationFilters {
        channel_kind: Some(ChannelKind::Webhook),
        ..Default::default()
    };
    let page = h
        .service
        .list_notifications(&none, &PaginationParams::default())
        .await
        .unwrap();
    assert_eq!(page.total, 0);

    let future = NotificationFilters {
        created_from: Some(i64::MAX / 2),
        ..Default::default()
    };
    let page = h
        .service
        .list_notifications(&future, &PaginationParams::default())
        .await
        .unwrap();
    assert_eq!(page.total, 0);

    let stats = h.service.stats(Some(TENANT)).await.unwrap();
    assert_eq!(stats.sent, 5);
    assert_eq!(stats.total(), 5);
    assert_eq!(h.service.stats(None).await.unwrap().total(), 6);

    let err = h.service.get_notification("missing").await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
    let err = h.service.notification_logs("missing").await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
async fn test_maintenance_prunes_old_terminal_rows() {
    let h = harness(DispatchConfig::default()).await;

    let old = h
        .service
        .send_direct(in_app_direct("user-1", "old"))
        .await
        .unwrap();
    let fresh = h
        .service
        .send_direct(in_app_direct("user-1", "fresh"))
        .await
        .unwrap();
    let event_id = h
        .service
        .ingest_event(order_created(json!({})))
        .await
        .unwrap();
    h.service.process_event(&event_id).await.unwrap();

    let report = h.service.run_maintenance().await.unwrap();
    assert_eq!(report.notifications_pruned, 0);
    assert_eq!(report.events_pruned, 0);

    sqlx::query("UPDATE notification SET updated_at = 0 WHERE id = ?")
        .bind(&old.id)
        .execute(&h.db.write_pool)
        .await
        .unwrap();
    sqlx::query("UPDATE domain_event SET processed_at = 0 WHERE id = ?")
        .bind(&event_id)
        .execute(&h.db.write_pool)
        .await
        .unwrap();

    let report = h.service.run_maintenance().await.unwrap();
    assert_eq!(report.notifications_pruned, 1);
    assert_eq!(report.events_pruned, 1);

    assert!(h.service.get_notification(&old.id).await.is_err());
    assert!(h.service.get_notification(&fresh.id).await.is_ok());
    let orphan_logs: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM notification_log WHERE notification_id = ?")
            .bind(&old.id)
            .fetch_one(&h.db.pool)
            .await
            .unwrap();
    assert_eq!(orphan_logs, 0);
}

#[tokio::test]
async fn test_background_loop_dispatches_ingested_events() {
    let config = DispatchConfig {
        event_poll_interval_ms: 50,
        ..Default::default()
    };
    let h = harness(config).await;
    h.service
        .create_subscription(
            NewSubscription::new(TENANT, ORDER_CREATED, ChannelKind::InApp, json!({}))
                .with_user("kitchen"),
        )
        .await
        .unwrap();

    h.service.start();
    assert!(h.service.is_running());

    let event_id = h
        .service
        .ingest_event(order_created(json!({ "title": "Order #9" })))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if h.service.get_event(&event_id).await.unwrap().processed
            && h.service.inbox().len("kitchen") == 1
        {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "event was not dispatched");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(h.service.inbox().messages("kitchen")[0].title, "Order #9");

    h.service.stop().await;
    assert!(!h.service.is_running());
    // Stopping twice is a no-op.
    h.service.stop().await;
}
