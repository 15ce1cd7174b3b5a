//! Integration tests for the health-check scheduler.

mod common;

use castkeeper_core::{
    CredentialStatus, HealthCheckScheduler, LifecycleSettings, MemoryNotifier, NotificationType,
    Platform, Severity, StoreUserDirectory, UserId,
};
use chrono::{Duration, Utc};
use common::{Fixture, Script, ScriptedAdapter, fixture};
use std::sync::Arc;

fn scheduler(fx: &Fixture, notifier: Arc<MemoryNotifier>) -> Arc<HealthCheckScheduler> {
    Arc::new(HealthCheckScheduler::new(
        fx.refresher.clone(),
        Arc::new(StoreUserDirectory::new(fx.store.clone())),
        notifier,
        LifecycleSettings::default(),
    ))
}

#[tokio::test]
async fn test_credential_expiring_in_five_days_is_renewed() {
    let adapter = ScriptedAdapter::new(
        Platform::YouTube,
        Script::Succeed {
            expires_in: Duration::days(60),
            rotate: true,
        },
    );
    let fx = fixture(&[adapter.clone()]);
    let expires_at = Utc::now() + Duration::days(5);
    fx.seed("u1", Platform::YouTube, expires_at, Some("refresh-0"))
        .await;
    let notifier = Arc::new(MemoryNotifier::new());

    let before = Utc::now();
    let response = scheduler(&fx, notifier.clone()).run_now().await;

    assert!(response.success);
    let report = response.report.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.success_count, 1);
    assert_eq!(report.warning_count, 0);
    assert_eq!(report.error_count, 0);
    assert_eq!(adapter.refresh_calls(), 1);

    let notifications = notifier.list(&UserId::new("u1"));
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].kind, NotificationType::TokenRenewed);
    assert_eq!(notifications[0].severity, Severity::Success);
    assert_eq!(notifications[0].platform, Platform::YouTube);

    let stored = fx.stored("u1", &Platform::YouTube).await.unwrap();
    let new_expiry = stored.expires_at.unwrap();
    assert!(new_expiry >= before + Duration::days(60));
    assert!(new_expiry <= Utc::now() + Duration::days(60));
}

#[tokio::test]
async fn test_credential_expiring_in_thirty_days_is_left_alone() {
    let adapter = ScriptedAdapter::succeeding(Platform::Spotify);
    let fx = fixture(&[adapter.clone()]);
    let seeded = fx
        .seed("u1", Platform::Spotify, Utc::now() + Duration::days(30), Some("refresh-0"))
        .await;
    let notifier = Arc::new(MemoryNotifier::new());

    let response = scheduler(&fx, notifier.clone()).run_now().await;

    let report = response.report.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.success_count + report.warning_count + report.error_count, 0);
    assert_eq!(adapter.refresh_calls(), 0);
    assert!(notifier.all().is_empty());

    let stored = fx.stored("u1", &Platform::Spotify).await.unwrap();
    assert_eq!(stored.expires_at, seeded.expires_at);
    assert_eq!(stored.access_token, seeded.access_token);
}

#[tokio::test]
async fn test_one_failure_does_not_stop_the_sweep() {
    let youtube = ScriptedAdapter::succeeding(Platform::YouTube);
    let spotify = ScriptedAdapter::new(
        Platform::Spotify,
        Script::Reject("invalid_grant".to_string()),
    );
    let tiktok = ScriptedAdapter::new(
        Platform::TikTok,
        Script::Fail("connection refused".to_string()),
    );
    let fx = fixture(&[youtube.clone(), spotify.clone(), tiktok.clone()]);
    let soon = Utc::now() + Duration::days(2);

    for user in ["ok-1", "ok-2", "ok-3"] {
        fx.seed(user, Platform::YouTube, soon, Some("refresh-0")).await;
    }
    for user in ["rejected-1", "rejected-2"] {
        fx.seed(user, Platform::Spotify, soon, Some("refresh-0")).await;
    }
    fx.seed("offline-1", Platform::TikTok, soon, Some("refresh-0"))
        .await;
    let notifier = Arc::new(MemoryNotifier::new());

    let response = scheduler(&fx, notifier.clone()).run_now().await;

    assert!(response.success);
    let report = response.report.unwrap();
    assert_eq!(report.checked, 6);
    assert_eq!(report.success_count, 3);
    assert_eq!(report.warning_count, 2);
    assert_eq!(report.error_count, 1);
    // 6 users x 3 configured platforms, minus the 6 stored credentials.
    assert_eq!(report.skipped, 12);

    let warning = &notifier.list(&UserId::new("rejected-1"))[0];
    assert_eq!(warning.kind, NotificationType::TokenWarning);
    assert_eq!(warning.severity, Severity::Warning);
    assert_eq!(warning.action_label.as_deref(), Some("Reconnect"));
    assert_eq!(
        warning.action_path.as_deref(),
        Some("/settings/connections?platform=spotify")
    );
    assert_eq!(
        fx.status("rejected-1", &Platform::Spotify).await,
        Some(CredentialStatus::Invalid)
    );

    let error = &notifier.list(&UserId::new("offline-1"))[0];
    assert_eq!(error.kind, NotificationType::TokenError);
    assert_eq!(error.severity, Severity::Error);
    // Transient failures do not invalidate the credential.
    assert_eq!(
        fx.status("offline-1", &Platform::TikTok).await,
        Some(CredentialStatus::Active)
    );
}

#[tokio::test]
async fn test_missing_refresh_token_asks_user_to_reconnect() {
    let adapter = ScriptedAdapter::succeeding(Platform::Instagram);
    let fx = fixture(&[adapter.clone()]);
    fx.seed("u1", Platform::Instagram, Utc::now() + Duration::days(1), None)
        .await;
    let notifier = Arc::new(MemoryNotifier::new());

    let report = scheduler(&fx, notifier.clone())
        .run_now()
        .await
        .report
        .unwrap();

    assert_eq!(report.warning_count, 1);
    assert_eq!(adapter.refresh_calls(), 0);
    let notifications = notifier.list(&UserId::new("u1"));
    assert_eq!(notifications[0].kind, NotificationType::TokenWarning);
}

#[tokio::test]
async fn test_platforms_without_adapter_are_not_visited() {
    let adapter = ScriptedAdapter::succeeding(Platform::YouTube);
    let fx = fixture(&[adapter.clone()]);
    fx.seed("u1", Platform::YouTube, Utc::now() + Duration::days(30), Some("r"))
        .await;
    fx.seed("u1", Platform::LinkedIn, Utc::now() + Duration::days(1), Some("r"))
        .await;
    let notifier = Arc::new(MemoryNotifier::new());

    let report = scheduler(&fx, notifier.clone())
        .run_now()
        .await
        .report
        .unwrap();

    assert_eq!(report.checked, 1);
    assert_eq!(report.skipped, 0);
    assert_eq!(report.error_count, 0);
    assert!(notifier.list(&UserId::new("u1")).is_empty());
    assert_eq!(
        fx.status("u1", &Platform::LinkedIn).await,
        Some(CredentialStatus::Active)
    );
}

#[tokio::test]
async fn test_inactive_credentials_are_skipped() {
    let adapter = ScriptedAdapter::succeeding(Platform::YouTube);
    let fx = fixture(&[adapter.clone()]);
    fx.seed("u1", Platform::YouTube, Utc::now() + Duration::days(1), Some("r"))
        .await;
    fx.refresher
        .mark_status(&UserId::new("u1"), &Platform::YouTube, CredentialStatus::Revoked)
        .await
        .unwrap();

    let report = scheduler(&fx, Arc::new(MemoryNotifier::new()))
        .run_now()
        .await
        .report
        .unwrap();

    assert_eq!(report.checked, 0);
    assert_eq!(report.skipped, 1);
    assert_eq!(adapter.refresh_calls(), 0);
}

#[tokio::test]
async fn test_manual_trigger_while_running_is_rejected() {
    let adapter = ScriptedAdapter::with_delay(
        Platform::YouTube,
        Script::Succeed {
            expires_in: Duration::days(60),
            rotate: true,
        },
        std::time::Duration::from_millis(300),
    );
    let fx = fixture(&[adapter]);
    fx.seed("u1", Platform::YouTube, Utc::now() + Duration::days(1), Some("r"))
        .await;
    let scheduler = scheduler(&fx, Arc::new(MemoryNotifier::new()));

    let running = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run_now().await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert!(scheduler.is_running());
    let rejected = scheduler.run_now().await;
    assert!(!rejected.success);
    assert_eq!(rejected.message, "already running");
    assert!(rejected.report.is_none());

    let first = running.await.unwrap();
    assert!(first.success);
    assert!(!scheduler.is_running());

    // Idle again: the next trigger runs.
    assert!(scheduler.run_now().await.success);
}

#[tokio::test]
async fn test_started_scheduler_sweeps_immediately_and_stops() {
    let adapter = ScriptedAdapter::succeeding(Platform::YouTube);
    let fx = fixture(&[adapter.clone()]);
    fx.seed("u1", Platform::YouTube, Utc::now() + Duration::days(3), Some("r"))
        .await;
    let notifier = Arc::new(MemoryNotifier::new());
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let handle = scheduler(&fx, notifier.clone()).start(shutdown_rx);

    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while notifier.all().is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("first sweep should run immediately");
    assert_eq!(adapter.refresh_calls(), 1);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("scheduler should stop")
        .unwrap();
}
