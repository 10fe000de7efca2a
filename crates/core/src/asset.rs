//! Asset variants and storage tiers.

use crate::hash::ContentHash;
use crate::ids::{AssetId, MemoryId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// A named representation of a memory's content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetVariant {
    /// The bytes as uploaded.
    Original,
    /// Web-sized rendition.
    Display,
    /// Small preview.
    Thumbnail,
    /// Tiny placeholder preview, usually small enough to live inline.
    Placeholder,
    /// Metadata-only document.
    Metadata,
}

impl AssetVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Original => "original",
            Self::Display => "display",
            Self::Thumbnail => "thumbnail",
            Self::Placeholder => "placeholder",
            Self::Metadata => "metadata",
        }
    }

    /// Parse a variant name. Unknown names are an error, never a fallback.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "original" => Ok(Self::Original),
            "display" => Ok(Self::Display),
            "thumbnail" => Ok(Self::Thumbnail),
            "placeholder" => Ok(Self::Placeholder),
            "metadata" => Ok(Self::Metadata),
            other => Err(crate::Error::InvalidArgument(format!(
                "unknown asset variant: {other}"
            ))),
        }
    }
}

impl fmt::Display for AssetVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetVariant {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

/// Where an asset's bytes live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationTier {
    /// Embedded in the asset record.
    Inline,
    /// In this system's persistent paged arena, addressed by offset and length.
    Internal,
    /// In an external blob store, addressed by an opaque key.
    External,
}

/// Tier preference order used when resolving a variant.
pub const RESOLVE_ORDER: [LocationTier; 3] = [
    LocationTier::Internal,
    LocationTier::External,
    LocationTier::Inline,
];

impl LocationTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::Internal => "internal",
            Self::External => "external",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "inline" => Ok(Self::Inline),
            "internal" => Ok(Self::Internal),
            "external" => Ok(Self::External),
            other => Err(crate::Error::InvalidArgument(format!(
                "unknown location tier: {other}"
            ))),
        }
    }
}

impl fmt::Display for LocationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Concrete location of an asset's bytes. The tier follows from the location.
#[derive(Clone, PartialEq, Eq)]
pub enum AssetLocation {
    /// Bytes embedded in the record.
    Inline(Vec<u8>),
    /// Range in the persistent arena.
    Internal { offset: u64, len: u64 },
    /// Object key in the external blob store.
    External { key: String },
}

impl AssetLocation {
    pub fn tier(&self) -> LocationTier {
        match self {
            Self::Inline(_) => LocationTier::Inline,
            Self::Internal { .. } => LocationTier::Internal,
            Self::External { .. } => LocationTier::External,
        }
    }
}

impl fmt::Debug for AssetLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline(data) => write!(f, "Inline({} bytes)", data.len()),
            Self::Internal { offset, len } => write!(f, "Internal({offset}+{len})"),
            Self::External { key } => write!(f, "External({key})"),
        }
    }
}

/// A finished, stored asset.
///
/// `byte_size` and `sha256` always describe the whole reassembled object.
#[derive(Clone, Debug)]
pub struct Asset {
    pub id: AssetId,
    pub memory_id: MemoryId,
    pub variant: AssetVariant,
    pub location: AssetLocation,
    pub byte_size: u64,
    pub mime_type: String,
    pub sha256: ContentHash,
    pub tags: Vec<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub created_at: OffsetDateTime,
}

impl Asset {
    pub fn tier(&self) -> LocationTier {
        self.location.tier()
    }

    pub fn descriptor(&self) -> AssetDescriptor {
        AssetDescriptor {
            asset_id: self.id,
            memory_id: self.memory_id,
            variant: self.variant,
            tier: self.tier(),
            byte_size: self.byte_size,
            mime_type: self.mime_type.clone(),
            sha256: self.sha256.to_hex(),
            tags: self.tags.clone(),
            width: self.width,
            height: self.height,
            created_at: self.created_at,
        }
    }
}

/// Wire description of a stored asset, without its bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub asset_id: AssetId,
    pub memory_id: MemoryId,
    pub variant: AssetVariant,
    pub tier: LocationTier,
    pub byte_size: u64,
    pub mime_type: String,
    pub sha256: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Every asset stored for a memory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListAssetsResponse {
    pub memory_id: MemoryId,
    pub assets: Vec<AssetDescriptor>,
}

/// Result of deleting a memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteMemoryResponse {
    pub memory_id: MemoryId,
    pub deleted_assets: u64,
}
