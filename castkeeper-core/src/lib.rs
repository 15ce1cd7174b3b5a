//! # Castkeeper Core
//!
//! Core library for keeping podcast creators' platform connections alive.
//!
//! This crate provides:
//! - Domain types for users, platforms and OAuth credentials
//! - AES-256-GCM encryption of tokens at rest
//! - Credential storage (in-memory and JSON file)
//! - A process-wide token cache with a safety buffer
//! - Per-platform OAuth adapters behind a single trait
//! - A token refresher that collapses concurrent refreshes into one
//! - A health-check scheduler that renews expiring credentials and notifies
//!   users
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use castkeeper_core::{Platform, TokenError, TokenRefresher, UserId};
//!
//! async fn publish(refresher: &TokenRefresher) -> Result<(), TokenError> {
//!     let token = refresher
//!         .ensure_fresh_token(&UserId::new("user-42"), &Platform::YouTube)
//!         .await?;
//!     upload_episode(token.access_token.expose()).await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cipher;
pub mod error;
pub mod health;
pub mod model;
pub mod notify;
pub mod provider;
pub mod refresher;
pub mod secret;
pub mod settings;
pub mod store;

// Re-export commonly used types at crate root
pub use model::{Credential, CredentialKey, CredentialRecord, CredentialStatus, Platform, UserId};

pub use secret::Secret;

pub use cipher::{Cipher, CipherError};

pub use store::{
    CredentialStore, ExpiringFilter, FileCredentialStore, MemoryCredentialStore, StoreError,
};

pub use cache::{CacheEntry, TokenCache, TokenData};

pub use provider::{
    AdapterError, AdapterRegistry, AuthorizationRequest, ClientCredentials, ProviderAdapter,
    ProviderConfig, ProviderRegistry, ProviderTokens,
};

#[cfg(feature = "oauth")]
pub use provider::OAuth2Adapter;

pub use refresher::{FreshToken, InitReport, TokenRefresher};

pub use notify::{
    MemoryNotifier, NewNotification, Notification, NotificationEmitter, NotificationType,
    Severity, TracingNotifier,
};

pub use health::{
    HealthCheckScheduler, StoreUserDirectory, SweepReport, TriggerResponse, UserDirectory,
};

pub use settings::LifecycleSettings;

pub use error::{CastkeeperError, TokenError};
