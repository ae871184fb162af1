//! Core services: naming policy, retrying storage gateway, the image
//! pipeline and the resize & cache engine.

pub mod image_pipeline;
pub mod media_policy;
pub mod resize_service;
pub mod storage_gateway;

pub use media_policy::MediaPolicy;
pub use resize_service::{
    BatchResizeItem, BatchResizeOutcome, CacheHitEvent, GeneratedVariant, ImageResponse,
    ImageStreamResponse, ResizeHooks, ResizeService, VariantGeneratedEvent,
};
pub use storage_gateway::{RetryPolicy, StorageGateway};
