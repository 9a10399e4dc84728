//! Image service client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ImageConfig;
use crate::model::ImageMeta;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image {image_id} not found")]
    NotFound { image_id: String },

    #[error("image service unavailable: {0}")]
    Unavailable(String),

    #[error("invalid image service response: {0}")]
    Decode(String),
}

/// Read access to image metadata.
#[async_trait]
pub trait ImageService: Send + Sync {
    async fn get(&self, image_id: &str) -> Result<ImageMeta, ImageError>;
}

/// Image service over HTTP (`GET /v2/images/{id}`).
pub struct HttpImageService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpImageService {
    pub fn new(config: &ImageConfig) -> Result<Self, ImageError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ImageError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ImageService for HttpImageService {
    async fn get(&self, image_id: &str) -> Result<ImageMeta, ImageError> {
        let url = format!("{}/v2/images/{}", self.base_url, image_id);
        debug!(url = %url, "Fetching image metadata");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ImageError::Unavailable(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(ImageError::NotFound {
                image_id: image_id.to_string(),
            }),
            status if status.is_success() => {
                let mut image: ImageMeta = response
                    .json()
                    .await
                    .map_err(|e| ImageError::Decode(e.to_string()))?;
                if image.id.is_none() {
                    image.id = Some(image_id.to_string());
                }
                Ok(image)
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                warn!(status = %status, body = %body, image_id, "Image lookup failed");
                Err(ImageError::Unavailable(format!("{status}: {body}")))
            }
        }
    }
}

/// Image metadata held in memory.
#[derive(Default)]
pub struct MemoryImageService {
    images: Mutex<HashMap<String, ImageMeta>>,
    lookups: AtomicUsize,
}

impl MemoryImageService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, image_id: impl Into<String>, mut image: ImageMeta) {
        let image_id = image_id.into();
        image.id.get_or_insert_with(|| image_id.clone());
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(image_id, image);
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageService for MemoryImageService {
    async fn get(&self, image_id: &str) -> Result<ImageMeta, ImageError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(image_id)
            .cloned()
            .ok_or_else(|| ImageError::NotFound {
                image_id: image_id.to_string(),
            })
    }
}
