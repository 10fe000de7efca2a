//! Startup: token provisioning and opening the stores.

use crate::service::arena_range;
use crate::state::AppState;
use anyhow::{Context, Result, bail};
use keepsake_core::config::{AppConfig, AuthConfig};
use keepsake_core::{Clock, Principal};
use keepsake_metadata::MetadataStore;
use keepsake_metadata::models::TokenRow;
use keepsake_storage::ByteArena;
use std::collections::HashSet;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

/// Normalize a configured token hash to the lowercase hex form stored in the index.
fn normalize_token_hash(raw: &str) -> Result<String> {
    let hash = raw.strip_prefix("sha256:").unwrap_or(raw).to_lowercase();
    if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("invalid token_hash: expected 64 hex chars");
    }
    Ok(hash)
}

/// Make the token table match `auth.tokens`.
///
/// Configured tokens that are missing are created. Active tokens that are no
/// longer configured are revoked. Returns the number of tokens created.
pub async fn provision_tokens(
    metadata: &dyn MetadataStore,
    config: &AuthConfig,
    now: OffsetDateTime,
) -> Result<usize> {
    let mut configured = HashSet::new();
    let mut created = 0;

    for entry in &config.tokens {
        let hash = normalize_token_hash(&entry.token_hash)
            .with_context(|| format!("token for principal {:?}", entry.principal))?;
        let principal = Principal::parse(&entry.principal)
            .with_context(|| format!("invalid token principal {:?}", entry.principal))?;

        if let Some(existing) = metadata.get_token_by_hash(&hash).await? {
            if existing.revoked_at.is_some() {
                bail!(
                    "token hash for {principal} matches a revoked token (id={}); \
                     use a new token",
                    existing.token_id
                );
            }
            if existing.principal != principal.as_str() {
                bail!(
                    "token hash for {principal} is already provisioned for {} (id={})",
                    existing.principal,
                    existing.token_id
                );
            }
            configured.insert(existing.token_id);
            continue;
        }

        let token = TokenRow {
            token_id: Uuid::new_v4(),
            principal: principal.to_string(),
            token_hash: hash,
            created_at: now,
            last_used_at: None,
            revoked_at: None,
        };
        metadata.create_token(&token).await?;
        configured.insert(token.token_id);
        created += 1;
        tracing::info!(token_id = %token.token_id, principal = %principal, "Token provisioned");
    }

    for token in metadata.list_active_tokens().await? {
        if !configured.contains(&token.token_id) {
            metadata.revoke_token(token.token_id, now).await?;
            tracing::info!(
                token_id = %token.token_id,
                principal = %token.principal,
                "Token no longer configured, revoked"
            );
        }
    }

    Ok(created)
}

/// Open every store named by the configuration and wire the application state.
///
/// The arena allocator is rebuilt from the ranges the index still references.
pub async fn open_state(config: AppConfig, clock: Arc<dyn Clock>) -> Result<AppState> {
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    let metadata = keepsake_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    tracing::info!("Metadata store initialized");

    let memory =
        keepsake_storage::open_memory(&config.arena).context("failed to open arena memory")?;
    let live = metadata
        .live_arena_ranges()
        .await
        .context("failed to load live arena ranges")?;
    let arena = Arc::new(
        ByteArena::restore(memory, live.into_iter().map(arena_range))
            .context("failed to restore arena")?,
    );

    let external = match &config.external {
        Some(external_config) => {
            let store = keepsake_storage::from_config(external_config)
                .await
                .context("failed to initialize external store")?;
            store
                .health_check()
                .await
                .context("external store health check failed")?;
            tracing::info!(backend = store.backend_name(), "External store connectivity verified");
            Some(store)
        }
        None => {
            tracing::warn!("No external store configured, large assets stay in the arena");
            None
        }
    };

    provision_tokens(metadata.as_ref(), &config.auth, clock.now()).await?;

    Ok(AppState::new(config, metadata, arena, external, clock))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_token_hash() {
        let hex = "AB".repeat(32);
        assert_eq!(
            normalize_token_hash(&format!("sha256:{hex}")).unwrap(),
            "ab".repeat(32)
        );
        assert!(normalize_token_hash("sha256:abc").is_err());
        assert!(normalize_token_hash(&"zz".repeat(32)).is_err());
    }
}
