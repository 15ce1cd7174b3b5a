//! Periodic credential health checks.
//!
//! The [`HealthCheckScheduler`] sweeps every active user and every configured
//! platform, renews credentials that expire within the warning threshold and
//! notifies users about the outcome. A sweep never fails as a whole: each
//! (user, platform) outcome is counted in a [`SweepReport`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::TokenError;
use crate::model::{CredentialStatus, Platform, UserId};
use crate::notify::{NewNotification, NotificationEmitter, NotificationType, Severity};
use crate::provider::AdapterError;
use crate::refresher::{FreshToken, TokenRefresher};
use crate::settings::LifecycleSettings;
use crate::store::{CredentialStore, StoreError};

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Source of the users a sweep visits.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn active_users(&self) -> Result<Vec<UserId>, StoreError>;
}

/// Treats every user with a stored credential as active.
pub struct StoreUserDirectory {
    store: Arc<dyn CredentialStore>,
}

impl StoreUserDirectory {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl UserDirectory for StoreUserDirectory {
    async fn active_users(&self) -> Result<Vec<UserId>, StoreError> {
        self.store.user_ids().await
    }
}

/// Counters of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Credentials inspected.
    pub checked: usize,
    /// Pairs without a credential, or with an inactive one.
    pub skipped: usize,
    pub success_count: usize,
    pub warning_count: usize,
    pub error_count: usize,
}

/// Result of a manual trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<SweepReport>,
}

/// What happened to one credential during a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Skipped,
    Healthy,
    Renewed,
    Warning,
    Error,
}

/// Whole days until `expires_at`, rounded down. `None` when the expiry is
/// unknown.
pub fn days_until_expiry(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<i64> {
    expires_at.map(|exp| (exp - now).num_seconds().div_euclid(SECONDS_PER_DAY))
}

/// Resets the running flag when a sweep ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Renews soon-to-expire credentials on a fixed interval.
///
/// Runs never overlap; a manual trigger during a run is rejected.
pub struct HealthCheckScheduler {
    refresher: TokenRefresher,
    users: Arc<dyn UserDirectory>,
    notifier: Arc<dyn NotificationEmitter>,
    settings: LifecycleSettings,
    running: AtomicBool,
}

impl HealthCheckScheduler {
    pub fn new(
        refresher: TokenRefresher,
        users: Arc<dyn UserDirectory>,
        notifier: Arc<dyn NotificationEmitter>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            refresher,
            users,
            notifier,
            settings,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn try_begin(&self) -> Option<RunningGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunningGuard(&self.running))
    }

    /// Run a sweep now unless one is already in progress.
    pub async fn run_now(&self) -> TriggerResponse {
        let Some(_guard) = self.try_begin() else {
            return TriggerResponse {
                success: false,
                message: "already running".to_string(),
                report: None,
            };
        };

        let report = self.sweep().await;
        TriggerResponse {
            success: true,
            message: format!(
                "checked {} credential(s): {} renewed, {} warning(s), {} error(s)",
                report.checked, report.success_count, report.warning_count, report.error_count
            ),
            report: Some(report),
        }
    }

    /// Start the periodic sweep. The first sweep runs immediately.
    ///
    /// The task ends when `shutdown` turns true or its sender is dropped.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.settings.sweep_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            tracing::info!(
                "Health check scheduler started (every {}h)",
                self.settings.sweep_interval_hours
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let response = self.run_now().await;
                        if !response.success {
                            tracing::debug!("Skipping scheduled sweep: {}", response.message);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("Health check scheduler stopped");
        })
    }

    /// Visit every active user and configured platform once.
    async fn sweep(&self) -> SweepReport {
        let started = std::time::Instant::now();
        let mut report = SweepReport::default();

        let users = match self.users.active_users().await {
            Ok(users) => users,
            Err(e) => {
                tracing::error!("Health check could not list users: {}", e);
                report.error_count += 1;
                return report;
            }
        };
        let platforms = self.refresher.adapters().platforms();

        for user_id in &users {
            for platform in &platforms {
                match self.check(user_id, platform).await {
                    Outcome::Skipped => report.skipped += 1,
                    Outcome::Healthy => report.checked += 1,
                    Outcome::Renewed => {
                        report.checked += 1;
                        report.success_count += 1;
                    }
                    Outcome::Warning => {
                        report.checked += 1;
                        report.warning_count += 1;
                    }
                    Outcome::Error => {
                        report.checked += 1;
                        report.error_count += 1;
                    }
                }
            }
        }

        tracing::info!(
            "Health check finished in {:?}: {} user(s), {} checked, {} renewed, {} warning(s), {} error(s)",
            started.elapsed(),
            users.len(),
            report.checked,
            report.success_count,
            report.warning_count,
            report.error_count
        );
        report
    }

    async fn check(&self, user_id: &UserId, platform: &Platform) -> Outcome {
        let record = match self.refresher.store().get(user_id, platform).await {
            Ok(Some(record)) => record,
            Ok(None) => return Outcome::Skipped,
            Err(e) => {
                tracing::error!("Health check could not read {}/{}: {}", user_id, platform, e);
                return Outcome::Error;
            }
        };

        if record.status != CredentialStatus::Active {
            tracing::debug!("Skipping {}/{}: credential is {}", user_id, platform, record.status);
            return Outcome::Skipped;
        }

        let days = days_until_expiry(record.expires_at, Utc::now());
        if let Some(days) = days {
            if days > self.settings.warning_threshold_days {
                return Outcome::Healthy;
            }
        }

        tracing::debug!(
            "{}/{} expires in {:?} day(s), renewing",
            user_id,
            platform,
            days
        );

        match self.refresher.force_refresh(user_id, platform).await {
            Ok(token) => self.on_renewed(user_id, platform, &token).await,
            Err(e) => self.on_failed(user_id, platform, e).await,
        }
    }

    async fn on_renewed(&self, user_id: &UserId, platform: &Platform, token: &FreshToken) -> Outcome {
        if !token.refresh_token_rotated {
            tracing::debug!(
                "{} did not rotate the refresh token for {}; keeping the stored one",
                platform,
                user_id
            );
        }

        self.notify(
            user_id,
            NewNotification::new(
                NotificationType::TokenRenewed,
                platform.clone(),
                Severity::Success,
                format!(
                    "Your {} connection was renewed automatically.",
                    platform.display_name()
                ),
            ),
        )
        .await;
        Outcome::Renewed
    }

    async fn on_failed(&self, user_id: &UserId, platform: &Platform, error: TokenError) -> Outcome {
        match &error {
            TokenError::ReauthorizationRequired { .. }
            | TokenError::RefreshFailed {
                source: AdapterError::Rejected { .. },
                ..
            } => {
                tracing::warn!("{}/{} needs to be reconnected: {}", user_id, platform, error);

                if matches!(error, TokenError::RefreshFailed { .. }) {
                    if let Err(e) = self
                        .refresher
                        .mark_status(user_id, platform, CredentialStatus::Invalid)
                        .await
                    {
                        tracing::error!("Failed to mark {}/{} invalid: {}", user_id, platform, e);
                    }
                }

                self.notify(
                    user_id,
                    NewNotification::new(
                        NotificationType::TokenWarning,
                        platform.clone(),
                        Severity::Warning,
                        format!(
                            "Your {} connection has expired. Reconnect it to keep publishing.",
                            platform.display_name()
                        ),
                    )
                    .with_action("Reconnect", self.settings.reconnect_path(platform)),
                )
                .await;
                Outcome::Warning
            }
            TokenError::RefreshFailed { .. } => {
                tracing::warn!("Renewing {}/{} failed: {}", user_id, platform, error);
                self.notify(
                    user_id,
                    NewNotification::new(
                        NotificationType::TokenError,
                        platform.clone(),
                        Severity::Error,
                        format!(
                            "We could not renew your {} connection. We will try again automatically.",
                            platform.display_name()
                        ),
                    ),
                )
                .await;
                Outcome::Error
            }
            _ => {
                // Corruption and storage failures are operational incidents.
                tracing::error!("Health check of {}/{} failed: {}", user_id, platform, error);
                Outcome::Error
            }
        }
    }

    async fn notify(&self, user_id: &UserId, notification: NewNotification) {
        if self.notifier.create(user_id, notification).await.is_none() {
            tracing::warn!("Failed to create notification for {}", user_id);
        }
    }
}

impl std::fmt::Debug for HealthCheckScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthCheckScheduler")
            .field("settings", &self.settings)
            .field("running", &self.is_running())
            .finish()
    }
}
