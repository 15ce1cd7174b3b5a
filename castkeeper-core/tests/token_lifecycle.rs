//! Integration tests for the token refresher.
//!
//! These tests verify that the TokenRefresher:
//! - Serves cached tokens without touching the provider
//! - Collapses concurrent refreshes into one provider call
//! - Leaves stored credentials untouched when a refresh fails
//! - Connects, warms and disconnects credentials

mod common;

use castkeeper_core::{
    AdapterError, CredentialStatus, CredentialStore, Platform, TokenError, UserId,
};
use chrono::{Duration, Utc};
use common::{Script, ScriptedAdapter, fixture};

#[tokio::test]
async fn test_valid_cached_token_skips_provider() {
    let adapter = ScriptedAdapter::succeeding(Platform::YouTube);
    let fx = fixture(&[adapter.clone()]);
    fx.seed("u1", Platform::YouTube, Utc::now() + Duration::hours(2), Some("refresh-0"))
        .await;
    let user = UserId::new("u1");

    let first = fx
        .refresher
        .ensure_fresh_token(&user, &Platform::YouTube)
        .await
        .unwrap();
    let second = fx
        .refresher
        .ensure_fresh_token(&user, &Platform::YouTube)
        .await
        .unwrap();

    assert_eq!(first.access_token.expose(), "access-0");
    assert_eq!(second.access_token.expose(), "access-0");
    assert!(!first.refreshed);
    assert_eq!(adapter.refresh_calls(), 0);
    assert!(!fx.cache.is_expired(&user, &Platform::YouTube));
}

#[tokio::test]
async fn test_expired_token_is_refreshed_and_persisted() {
    let adapter = ScriptedAdapter::new(
        Platform::Spotify,
        Script::Succeed {
            expires_in: Duration::hours(1),
            rotate: true,
        },
    );
    let fx = fixture(&[adapter.clone()]);
    fx.seed("u1", Platform::Spotify, Utc::now() - Duration::minutes(1), Some("refresh-0"))
        .await;

    let before = Utc::now();
    let token = fx
        .refresher
        .ensure_fresh_token(&UserId::new("u1"), &Platform::Spotify)
        .await
        .unwrap();

    assert!(token.refreshed);
    assert!(token.refresh_token_rotated);
    assert_eq!(token.access_token.expose(), "access-1");
    assert_eq!(adapter.refresh_calls(), 1);

    let stored = fx.stored("u1", &Platform::Spotify).await.unwrap();
    assert_eq!(stored.access_token.expose(), "access-1");
    assert_eq!(stored.refresh_token.unwrap().expose(), "refresh-1");
    assert_eq!(stored.expires_at, token.expires_at);
    assert!(stored.expires_at.unwrap() >= before + Duration::hours(1));
    assert!(stored.last_refreshed_at >= before);
}

#[tokio::test]
async fn test_token_inside_buffer_but_not_expired_is_served_from_store() {
    let adapter = ScriptedAdapter::succeeding(Platform::TikTok);
    let fx = fixture(&[adapter.clone()]);
    fx.seed("u1", Platform::TikTok, Utc::now() + Duration::minutes(3), Some("refresh-0"))
        .await;

    let token = fx
        .refresher
        .ensure_fresh_token(&UserId::new("u1"), &Platform::TikTok)
        .await
        .unwrap();

    assert_eq!(token.access_token.expose(), "access-0");
    assert_eq!(adapter.refresh_calls(), 0);
    assert!(
        fx.cache
            .get(&UserId::new("u1"), &Platform::TikTok)
            .is_some()
    );
}

#[tokio::test]
async fn test_refresh_without_rotation_keeps_refresh_token() {
    let adapter = ScriptedAdapter::new(
        Platform::LinkedIn,
        Script::Succeed {
            expires_in: Duration::days(60),
            rotate: false,
        },
    );
    let fx = fixture(&[adapter]);
    fx.seed("u1", Platform::LinkedIn, Utc::now() - Duration::hours(1), Some("long-lived"))
        .await;

    let token = fx
        .refresher
        .ensure_fresh_token(&UserId::new("u1"), &Platform::LinkedIn)
        .await
        .unwrap();
    assert!(!token.refresh_token_rotated);

    let stored = fx.stored("u1", &Platform::LinkedIn).await.unwrap();
    assert_eq!(stored.refresh_token.unwrap().expose(), "long-lived");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_share_one_refresh() {
    let adapter = ScriptedAdapter::with_delay(
        Platform::YouTube,
        Script::Succeed {
            expires_in: Duration::hours(1),
            rotate: true,
        },
        std::time::Duration::from_millis(100),
    );
    let fx = fixture(&[adapter.clone()]);
    fx.seed("u1", Platform::YouTube, Utc::now() - Duration::minutes(10), Some("refresh-0"))
        .await;

    let user = UserId::new("u1");
    let calls = (0..16).map(|_| {
        let refresher = fx.refresher.clone();
        let user = user.clone();
        tokio::spawn(async move {
            refresher
                .ensure_fresh_token(&user, &Platform::YouTube)
                .await
        })
    });
    let results = futures::future::join_all(calls).await;

    assert_eq!(adapter.refresh_calls(), 1);
    for result in results {
        let token = result.unwrap().unwrap();
        assert_eq!(token.access_token.expose(), "access-1");
    }

    let stored = fx.stored("u1", &Platform::YouTube).await.unwrap();
    assert_eq!(stored.refresh_token.unwrap().expose(), "refresh-1");
}

/// Wait until the adapter's first refresh call is in progress.
async fn refresh_started(adapter: &ScriptedAdapter) {
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while adapter.refresh_calls() == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("refresh should start");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disconnect_during_refresh_stays_disconnected() {
    let adapter = ScriptedAdapter::with_delay(
        Platform::YouTube,
        Script::Succeed {
            expires_in: Duration::hours(1),
            rotate: true,
        },
        std::time::Duration::from_millis(200),
    );
    let fx = fixture(&[adapter.clone()]);
    fx.seed("u1", Platform::YouTube, Utc::now() - Duration::minutes(10), Some("refresh-0"))
        .await;
    let user = UserId::new("u1");

    let refresh = {
        let refresher = fx.refresher.clone();
        let user = user.clone();
        tokio::spawn(async move { refresher.ensure_fresh_token(&user, &Platform::YouTube).await })
    };
    refresh_started(&adapter).await;

    assert!(fx.refresher.disconnect(&user, &Platform::YouTube).await.unwrap());
    refresh.await.unwrap().unwrap();

    assert!(fx.stored("u1", &Platform::YouTube).await.is_none());
    assert!(fx.cache.get(&user, &Platform::YouTube).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reconnect_during_refresh_keeps_new_tokens() {
    let adapter = ScriptedAdapter::with_delay(
        Platform::Spotify,
        Script::Succeed {
            expires_in: Duration::hours(1),
            rotate: true,
        },
        std::time::Duration::from_millis(200),
    );
    let fx = fixture(&[adapter.clone()]);
    fx.seed("u1", Platform::Spotify, Utc::now() - Duration::minutes(10), Some("old-refresh"))
        .await;
    let user = UserId::new("u1");

    let refresh = {
        let refresher = fx.refresher.clone();
        let user = user.clone();
        tokio::spawn(async move { refresher.force_refresh(&user, &Platform::Spotify).await })
    };
    refresh_started(&adapter).await;

    fx.refresher
        .complete_connection(&user, &Platform::Spotify, "reconnect", None)
        .await
        .unwrap();
    let refreshed = refresh.await.unwrap().unwrap();
    assert_eq!(refreshed.access_token.expose(), "access-1");

    let stored = fx.stored("u1", &Platform::Spotify).await.unwrap();
    assert_eq!(stored.access_token.expose(), "access-reconnect");
    assert_eq!(stored.refresh_token.unwrap().expose(), "refresh-0");
    let cached = fx.cache.get(&user, &Platform::Spotify).unwrap();
    assert_eq!(cached.access_token.expose(), "access-reconnect");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_failures_share_one_attempt() {
    let adapter = ScriptedAdapter::with_delay(
        Platform::Instagram,
        Script::Fail("connection reset".to_string()),
        std::time::Duration::from_millis(100),
    );
    let fx = fixture(&[adapter.clone()]);
    fx.seed("u1", Platform::Instagram, Utc::now() - Duration::minutes(10), Some("refresh-0"))
        .await;

    let user = UserId::new("u1");
    let calls = (0..8).map(|_| {
        let refresher = fx.refresher.clone();
        let user = user.clone();
        tokio::spawn(async move {
            refresher
                .ensure_fresh_token(&user, &Platform::Instagram)
                .await
        })
    });
    let results = futures::future::join_all(calls).await;

    assert_eq!(adapter.refresh_calls(), 1);
    for result in results {
        assert!(matches!(
            result.unwrap(),
            Err(TokenError::RefreshFailed { .. })
        ));
    }

    // The next call retries.
    adapter.set_script(Script::Succeed {
        expires_in: Duration::hours(1),
        rotate: true,
    });
    let token = fx
        .refresher
        .ensure_fresh_token(&user, &Platform::Instagram)
        .await
        .unwrap();
    assert_eq!(token.access_token.expose(), "access-2");
}

#[tokio::test]
async fn test_failed_refresh_leaves_credential_untouched() {
    for script in [
        Script::Fail("timeout".to_string()),
        Script::Reject("invalid_grant".to_string()),
    ] {
        let adapter = ScriptedAdapter::new(Platform::Twitter, script);
        let fx = fixture(&[adapter]);
        let expires_at = Utc::now() - Duration::minutes(1);
        let seeded = fx
            .seed("u1", Platform::Twitter, expires_at, Some("refresh-0"))
            .await;

        let err = fx
            .refresher
            .ensure_fresh_token(&UserId::new("u1"), &Platform::Twitter)
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::RefreshFailed { .. }));

        let stored = fx.stored("u1", &Platform::Twitter).await.unwrap();
        assert_eq!(stored.access_token, seeded.access_token);
        assert_eq!(stored.refresh_token, seeded.refresh_token);
        assert_eq!(stored.expires_at, Some(expires_at));
        assert_eq!(stored.status, CredentialStatus::Active);
        assert!(fx.cache.is_empty());
    }
}

#[tokio::test]
async fn test_rejected_refresh_carries_provider_message() {
    let adapter = ScriptedAdapter::new(
        Platform::YouTube,
        Script::Reject("invalid_grant: Token has been revoked".to_string()),
    );
    let fx = fixture(&[adapter]);
    fx.seed("u1", Platform::YouTube, Utc::now() - Duration::minutes(1), Some("refresh-0"))
        .await;

    let err = fx
        .refresher
        .ensure_fresh_token(&UserId::new("u1"), &Platform::YouTube)
        .await
        .unwrap_err();

    match err {
        TokenError::RefreshFailed { platform, source } => {
            assert_eq!(platform, Platform::YouTube);
            assert_eq!(
                source,
                AdapterError::Rejected {
                    message: "invalid_grant: Token has been revoked".to_string()
                }
            );
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_missing_refresh_token_requires_reauthorization() {
    let adapter = ScriptedAdapter::succeeding(Platform::Instagram);
    let fx = fixture(&[adapter.clone()]);
    fx.seed("u1", Platform::Instagram, Utc::now() - Duration::minutes(1), None)
        .await;

    let err = fx
        .refresher
        .ensure_fresh_token(&UserId::new("u1"), &Platform::Instagram)
        .await
        .unwrap_err();

    assert!(matches!(err, TokenError::ReauthorizationRequired { .. }));
    assert!(err.requires_user_action());
    assert_eq!(adapter.refresh_calls(), 0);
}

#[tokio::test]
async fn test_unconfigured_platform_cannot_refresh() {
    let fx = fixture(&[]);
    fx.seed("u1", Platform::Spotify, Utc::now() - Duration::minutes(1), Some("refresh-0"))
        .await;

    let err = fx
        .refresher
        .ensure_fresh_token(&UserId::new("u1"), &Platform::Spotify)
        .await
        .unwrap_err();
    assert!(matches!(err, TokenError::ProviderNotConfigured { .. }));
}

#[tokio::test]
async fn test_corrupt_credential_is_reported() {
    let adapter = ScriptedAdapter::succeeding(Platform::YouTube);
    let fx = fixture(&[adapter]);
    let seeded = fx
        .seed("u1", Platform::YouTube, Utc::now() + Duration::hours(1), Some("refresh-0"))
        .await;

    let mut record = seeded.seal(&fx.cipher).unwrap();
    record.access_token_cipher = "not-an-encrypted-token".to_string();
    fx.store.upsert(record).await.unwrap();

    let err = fx
        .refresher
        .ensure_fresh_token(&UserId::new("u1"), &Platform::YouTube)
        .await
        .unwrap_err();
    assert!(matches!(err, TokenError::Cipher(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_force_refresh_ignores_remaining_lifetime() {
    let adapter = ScriptedAdapter::succeeding(Platform::YouTube);
    let fx = fixture(&[adapter.clone()]);
    fx.seed("u1", Platform::YouTube, Utc::now() + Duration::days(3), Some("refresh-0"))
        .await;

    let token = fx
        .refresher
        .force_refresh(&UserId::new("u1"), &Platform::YouTube)
        .await
        .unwrap();

    assert!(token.refreshed);
    assert_eq!(adapter.refresh_calls(), 1);
}

#[tokio::test]
async fn test_connect_warm_and_disconnect() {
    let adapter = ScriptedAdapter::succeeding(Platform::TikTok);
    let fx = fixture(&[adapter]);
    let user = UserId::new("u1");

    let request = fx.refresher.authorization_url(&Platform::TikTok).unwrap();
    assert!(request.url.contains("client_id=test-client-id"));

    let connected = fx
        .refresher
        .complete_connection(&user, &Platform::TikTok, "abc", Some(&request.state))
        .await
        .unwrap();
    assert_eq!(connected.access_token.expose(), "access-abc");

    let stored = fx.stored("u1", &Platform::TikTok).await.unwrap();
    assert_eq!(stored.status, CredentialStatus::Active);
    assert_eq!(stored.refresh_token.unwrap().expose(), "refresh-0");
    assert_eq!(stored.scope.as_deref(), Some("publish"));

    fx.cache.clear(None);
    let report = fx.refresher.init_user_tokens(&user).await;
    assert_eq!(report.loaded, 1);
    assert_eq!(report.failed, 0);
    assert!(!fx.cache.is_expired(&user, &Platform::TikTok));

    assert!(fx.refresher.disconnect(&user, &Platform::TikTok).await.unwrap());
    assert!(fx.cache.get(&user, &Platform::TikTok).is_none());
    assert!(fx.stored("u1", &Platform::TikTok).await.is_none());

    let err = fx
        .refresher
        .ensure_fresh_token(&user, &Platform::TikTok)
        .await
        .unwrap_err();
    assert!(matches!(err, TokenError::CredentialNotFound { .. }));
}

#[tokio::test]
async fn test_failed_code_exchange_stores_nothing() {
    let adapter = ScriptedAdapter::succeeding(Platform::Spotify);
    let fx = fixture(&[adapter]);

    let err = fx
        .refresher
        .complete_connection(&UserId::new("u1"), &Platform::Spotify, "bad-code", None)
        .await
        .unwrap_err();

    assert!(matches!(err, TokenError::ConnectionFailed { .. }));
    assert!(fx.store.is_empty());
}

#[tokio::test]
async fn test_reconnect_reactivates_invalid_credential() {
    let adapter = ScriptedAdapter::succeeding(Platform::YouTube);
    let fx = fixture(&[adapter]);
    fx.seed("u1", Platform::YouTube, Utc::now() - Duration::days(1), Some("revoked"))
        .await;
    let user = UserId::new("u1");
    fx.refresher
        .mark_status(&user, &Platform::YouTube, CredentialStatus::Invalid)
        .await
        .unwrap();

    fx.refresher
        .complete_connection(&user, &Platform::YouTube, "fresh", None)
        .await
        .unwrap();

    assert_eq!(
        fx.status("u1", &Platform::YouTube).await,
        Some(CredentialStatus::Active)
    );
    assert_eq!(fx.store.len(), 1);
}

#[tokio::test]
async fn test_init_user_tokens_survives_bad_platforms() {
    let fx = fixture(&[]);
    fx.seed("u1", Platform::YouTube, Utc::now() + Duration::hours(1), Some("r"))
        .await;
    fx.seed("u1", Platform::Spotify, Utc::now() + Duration::hours(1), Some("r"))
        .await;
    let broken = fx
        .seed("u1", Platform::LinkedIn, Utc::now() + Duration::hours(1), Some("r"))
        .await;
    let mut record = broken.seal(&fx.cipher).unwrap();
    record.refresh_token_cipher = Some("00:ff".to_string());
    fx.store.upsert(record).await.unwrap();
    fx.seed("u2", Platform::TikTok, Utc::now() + Duration::hours(1), Some("r"))
        .await;

    let report = fx.refresher.init_user_tokens(&UserId::new("u1")).await;

    assert_eq!(report.loaded, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(fx.cache.len(), 2);
}

#[tokio::test]
async fn test_expiring_within_lists_soonest_first() {
    let fx = fixture(&[]);
    let now = Utc::now();
    fx.seed("later", Platform::YouTube, now + Duration::days(6), Some("r"))
        .await;
    fx.seed("sooner", Platform::YouTube, now + Duration::days(2), Some("r"))
        .await;
    fx.seed("fine", Platform::YouTube, now + Duration::days(40), Some("r"))
        .await;

    let expiring = fx.refresher.expiring_within(Duration::days(7)).await.unwrap();
    let users: Vec<&str> = expiring.iter().map(|r| r.user_id.as_str()).collect();
    assert_eq!(users, vec!["sooner", "later"]);
}
