//! Catalog and task data model
//!
//! A [`Product`] is an immutable catalog snapshot row. The same shape, with its
//! image links narrowed to the ones still needing work, travels through the
//! queue as a [`ClassificationTask`].

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Catalog product as read from the latest ingestion batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub offer_id: String,
    pub merchant_id: i64,
    pub aggregator_id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub product_type: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub image_link: Option<String>,
    #[serde(default)]
    pub additional_image_links: Vec<String>,
}

impl Product {
    /// Ordering key used for owner tie-breaks and output ordering
    pub fn sort_key(&self) -> (&str, &str, i64, i64) {
        (
            self.offer_id.as_str(),
            self.title.as_str(),
            self.merchant_id,
            self.aggregator_id,
        )
    }

    /// All image references of this product, primary first, without repeats
    pub fn image_refs(&self) -> Vec<ImageRef> {
        let mut seen = HashSet::new();
        let mut refs = Vec::new();

        if let Some(link) = self.image_link.as_deref() {
            if !link.is_empty() && seen.insert(link.to_string()) {
                refs.push(ImageRef::primary(link));
            }
        }
        for link in &self.additional_image_links {
            if !link.is_empty() && seen.insert(link.clone()) {
                refs.push(ImageRef::additional(link));
            }
        }

        refs
    }
}

/// Role of an image link relative to the product that references it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageRole {
    Primary,
    Additional,
}

/// An image URL plus its role. Identity (and the dedup key) is the URL alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub image_link: String,
    pub role: ImageRole,
}

impl ImageRef {
    pub fn primary(link: impl Into<String>) -> Self {
        Self {
            image_link: link.into(),
            role: ImageRole::Primary,
        }
    }

    pub fn additional(link: impl Into<String>) -> Self {
        Self {
            image_link: link.into(),
            role: ImageRole::Additional,
        }
    }
}

/// One queue message: one product and the image links it still owns.
///
/// Serializes flat: `{ offer_id, merchant_id, aggregator_id, title,
/// product_type, brand, image_link, additional_image_links }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationTask {
    #[serde(flatten)]
    pub product: Product,
}

impl ClassificationTask {
    /// Build a task carrying only the given image references.
    ///
    /// The primary slot is filled only if one of `images` is the product's own
    /// primary link; every other reference is listed as additional.
    pub fn new(product: &Product, images: &[ImageRef]) -> Self {
        let mut narrowed = product.clone();
        narrowed.image_link = images
            .iter()
            .find(|r| r.role == ImageRole::Primary)
            .map(|r| r.image_link.clone());
        narrowed.additional_image_links = images
            .iter()
            .filter(|r| r.role == ImageRole::Additional)
            .map(|r| r.image_link.clone())
            .collect();
        Self { product: narrowed }
    }

    /// Distinct image references to classify, in prompt order
    pub fn image_refs(&self) -> Vec<ImageRef> {
        self.product.image_refs()
    }

    pub fn offer_id(&self) -> &str {
        &self.product.offer_id
    }

    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

/// Content metadata derived from fetched image bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub mime_type: String,
    pub byte_size: i64,
    /// Hex SHA-256 of the raw bytes. Metadata only, never a dedup key.
    pub content_hash: String,
}
