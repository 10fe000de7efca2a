//! Bearer tokens, stored by SHA-256 of the secret.

use crate::error::MetadataResult;
use crate::models::TokenRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

#[async_trait]
pub trait TokenRepo: Send + Sync {
    /// Fails with `AlreadyExists` when the hash is already on file.
    async fn create_token(&self, token: &TokenRow) -> MetadataResult<()>;

    /// Revoked tokens are returned too; callers decide what revocation means.
    async fn get_token_by_hash(&self, token_hash: &str) -> MetadataResult<Option<TokenRow>>;

    async fn touch_token(&self, token_id: Uuid, used_at: OffsetDateTime) -> MetadataResult<()>;

    async fn revoke_token(&self, token_id: Uuid, revoked_at: OffsetDateTime) -> MetadataResult<()>;

    async fn list_active_tokens(&self) -> MetadataResult<Vec<TokenRow>>;
}
