//! Capsule wire types.

use crate::ids::CapsuleId;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A newly created capsule.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateCapsuleResponse {
    pub capsule_id: CapsuleId,
    pub owner: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Request to let another principal write into a capsule.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GrantWriterRequest {
    pub principal: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_capsule_response_uses_rfc3339() {
        let response = CreateCapsuleResponse {
            capsule_id: CapsuleId::new(),
            owner: "alice".to_string(),
            created_at: OffsetDateTime::UNIX_EPOCH,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["created_at"], "1970-01-01T00:00:00Z");
        assert_eq!(json["owner"], "alice");
    }
}
