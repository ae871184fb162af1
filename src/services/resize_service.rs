//! The resize & cache engine.
//!
//! Orchestrates a request for "width-W variant of file F, optionally in
//! format X": validates it, checks the variant cache, falls back to
//! fetching the original and running the image pipeline, and repopulates
//! the cache from a detached task. The cache is strictly an optimization;
//! every response is correct without the cache write succeeding.

use crate::config::ResizeConfig;
use crate::errors::{MediaError, MediaResult};
use crate::models::{NEGOTIATION_ORDER, OutputFormat};
use crate::services::image_pipeline;
use crate::services::media_policy::MediaPolicy;
use crate::services::storage_gateway::StorageGateway;
use crate::storage::ByteStream;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Metadata attached to cached variants, pointing back at their original.
const META_ORIGINAL_KEY: &str = "original-key";
const META_VARIANT_WIDTH: &str = "variant-width";

pub type CacheHitHook = Arc<dyn Fn(&CacheHitEvent) + Send + Sync>;
pub type VariantGeneratedHook = Arc<dyn Fn(&VariantGeneratedEvent) + Send + Sync>;

/// Fired when a request is answered from an already-cached variant.
#[derive(Clone, Debug)]
pub struct CacheHitEvent {
    pub key: String,
    pub variant_key: String,
    pub width: u32,
}

/// Fired when the pipeline produced a fresh variant.
#[derive(Clone, Debug)]
pub struct VariantGeneratedEvent {
    pub key: String,
    pub variant_key: String,
    pub width: u32,
    pub size: usize,
}

/// Observability callbacks. Pass-through notifications only; they are
/// invoked synchronously and must not block.
#[derive(Clone, Default)]
pub struct ResizeHooks {
    pub on_cache_hit: Option<CacheHitHook>,
    pub on_variant_generated: Option<VariantGeneratedHook>,
}

impl fmt::Debug for ResizeHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResizeHooks")
            .field("on_cache_hit", &self.on_cache_hit.is_some())
            .field("on_variant_generated", &self.on_variant_generated.is_some())
            .finish()
    }
}

/// Buffered resize response.
#[derive(Debug)]
pub enum ImageResponse {
    /// The caller's conditional ETag matched; no body is transferred.
    NotModified { etag: String },
    Content {
        bytes: Bytes,
        mime_type: String,
        etag: String,
    },
}

/// Streaming resize response. Streaming responses are never cache-backed
/// and their ETag derives from request parameters plus the origin's stat,
/// not from content; this asymmetry with the buffered path is deliberate.
pub enum ImageStreamResponse {
    NotModified {
        etag: String,
    },
    Content {
        stream: ByteStream,
        mime_type: String,
        etag: String,
        last_modified: DateTime<Utc>,
    },
}

impl fmt::Debug for ImageStreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotModified { etag } => {
                f.debug_struct("NotModified").field("etag", etag).finish()
            }
            Self::Content {
                mime_type,
                etag,
                last_modified,
                ..
            } => f
                .debug_struct("Content")
                .field("mime_type", mime_type)
                .field("etag", etag)
                .field("last_modified", last_modified)
                .finish_non_exhaustive(),
        }
    }
}

/// One (file, widths) entry in a bulk resize request.
#[derive(Clone, Debug)]
pub struct BatchResizeItem {
    pub key: String,
    pub widths: Vec<u32>,
}

/// Per-(file, width) result of a bulk operation. Failure is a value here,
/// never an error that aborts sibling items.
#[derive(Clone, Debug)]
pub struct BatchResizeOutcome {
    pub key: String,
    pub width: u32,
    pub variant_key: Option<String>,
    pub success: bool,
    pub error: Option<String>,
}

/// Output of the single-size generation primitive.
#[derive(Clone, Debug)]
pub struct GeneratedVariant {
    pub variant_key: String,
    /// Width actually rendered, after any upscale clamp.
    pub width: u32,
    pub bytes: Bytes,
    pub etag: String,
    pub format: OutputFormat,
    pub mime_type: String,
}

/// The stateful cache-fill engine. One instance serves all requests;
/// concurrent identical requests may both regenerate a missing variant,
/// which is safe because the cache write is an idempotent overwrite.
pub struct ResizeService {
    gateway: Arc<StorageGateway>,
    policy: MediaPolicy,
    config: Arc<ResizeConfig>,
    hooks: ResizeHooks,
}

impl ResizeService {
    pub fn new(gateway: Arc<StorageGateway>, config: Arc<ResizeConfig>, hooks: ResizeHooks) -> Self {
        Self {
            policy: MediaPolicy::new(Arc::clone(&config)),
            gateway,
            config,
            hooks,
        }
    }

    /// Serve the width-`width` variant of `key`, generating and caching it
    /// on a miss.
    ///
    /// `if_none_match` is the caller's conditional ETag; a match yields
    /// `NotModified` with no body. `format` overrides the configured
    /// preferred format; callers doing content negotiation pass the
    /// result of [`Self::negotiate_format`] here.
    pub async fn get_resized_image(
        &self,
        key: &str,
        width: u32,
        if_none_match: Option<&str>,
        format: Option<OutputFormat>,
    ) -> MediaResult<ImageResponse> {
        self.policy.validate_resizable(key)?;
        self.policy.validate_width(width)?;

        let origin = self.gateway.stat(key).await?;
        self.check_source_size(key, origin.size)?;

        let format = format.unwrap_or(self.config.preferred_format);
        let out_ext = format.extension(&Self::source_extension(key));
        let variant_key = MediaPolicy::variant_key(key, width, &out_ext);

        match self.gateway.stat(&variant_key).await {
            Ok(variant) => {
                let etag =
                    MediaPolicy::metadata_etag(&variant_key, variant.last_modified, variant.size);
                self.notify_cache_hit(key, &variant_key, width);
                if if_none_match == Some(etag.as_str()) {
                    debug!(key, variant_key = %variant_key, "cached variant fresh for caller");
                    return Ok(ImageResponse::NotModified { etag });
                }
                let bytes = self.gateway.get_bytes(&variant_key).await?;
                Ok(ImageResponse::Content {
                    bytes,
                    mime_type: MediaPolicy::mime_type(&out_ext),
                    etag,
                })
            }
            Err(err) if err.is_not_found() => {
                debug!(key, variant_key = %variant_key, "variant missing, generating");
                let original = self.gateway.get_bytes(key).await?;
                let generated = self
                    .render_variant(key, variant_key, original, width, format, None)
                    .await?;
                if if_none_match == Some(generated.etag.as_str()) {
                    // The caller already holds these exact bytes; skip the
                    // redundant cache write.
                    return Ok(ImageResponse::NotModified {
                        etag: generated.etag,
                    });
                }
                self.spawn_cache_write(key, &generated);
                self.notify_variant_generated(key, &generated);
                Ok(ImageResponse::Content {
                    mime_type: generated.mime_type,
                    etag: generated.etag,
                    bytes: generated.bytes,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Streaming counterpart of [`Self::get_resized_image`].
    ///
    /// Skips the cache entirely (the bytes cannot be inspected before the
    /// stream is consumed) and always regenerates by piping the origin
    /// through the transform.
    pub async fn get_resized_image_stream(
        &self,
        key: &str,
        width: u32,
        if_none_match: Option<&str>,
        format: Option<OutputFormat>,
    ) -> MediaResult<ImageStreamResponse> {
        self.policy.validate_resizable(key)?;
        self.policy.validate_width(width)?;

        let origin = self.gateway.stat(key).await?;
        self.check_source_size(key, origin.size)?;

        let format = format.unwrap_or(self.config.preferred_format);
        let out_ext = format.extension(&Self::source_extension(key));
        let etag = MediaPolicy::request_etag(key, width, format, origin.last_modified, origin.size);
        if if_none_match == Some(etag.as_str()) {
            return Ok(ImageStreamResponse::NotModified { etag });
        }

        let origin_stream = self.gateway.get_stream(key).await?;
        let stream = image_pipeline::transform_stream(
            origin_stream,
            width,
            format,
            self.config.max_source_bytes,
            self.config.auto_prevent_upscale,
        );
        Ok(ImageStreamResponse::Content {
            stream,
            mime_type: MediaPolicy::mime_type(&out_ext),
            etag,
            last_modified: origin.last_modified,
        })
    }

    /// Single-size generation primitive shared by the bulk paths.
    ///
    /// Applies the same width, source-size and upscale-clamp rules as the
    /// interactive path but never consults the cache: bulk callers want a
    /// full regeneration. `known_original_width` skips the pixel probe;
    /// `skip_upload` leaves the result out of storage.
    pub async fn generate_variant(
        &self,
        key: &str,
        original: &Bytes,
        width: u32,
        known_original_width: Option<u32>,
        skip_upload: bool,
    ) -> MediaResult<GeneratedVariant> {
        self.policy.validate_width(width)?;
        self.check_source_size(key, original.len() as u64)?;

        let format = self.config.preferred_format;
        let out_ext = format.extension(&Self::source_extension(key));
        let variant_key = MediaPolicy::variant_key(key, width, &out_ext);
        let generated = self
            .render_variant(
                key,
                variant_key,
                original.clone(),
                width,
                format,
                known_original_width,
            )
            .await?;

        if !skip_upload {
            self.gateway
                .put(
                    &generated.variant_key,
                    generated.bytes.clone(),
                    Self::variant_metadata(key, generated.width),
                )
                .await?;
        }
        self.notify_variant_generated(key, &generated);
        Ok(generated)
    }

    /// Generate a fixed set of widths for original bytes already in hand.
    ///
    /// The pixel probe runs once; per-size failures are logged and
    /// reported as outcomes without aborting the remaining widths.
    pub async fn pre_generate_inline(
        &self,
        key: &str,
        bytes: Bytes,
        widths: &[u32],
    ) -> MediaResult<Vec<BatchResizeOutcome>> {
        self.policy.validate_resizable(key)?;
        let source_width = image_pipeline::probe_width(&bytes)?;

        let mut outcomes = Vec::with_capacity(widths.len());
        for &width in widths {
            match self
                .generate_variant(key, &bytes, width, Some(source_width), false)
                .await
            {
                Ok(generated) => outcomes.push(BatchResizeOutcome {
                    key: key.to_string(),
                    width,
                    variant_key: Some(generated.variant_key),
                    success: true,
                    error: None,
                }),
                Err(err) => {
                    warn!(key, width, error = %err, "pre-generation failed for width");
                    outcomes.push(BatchResizeOutcome {
                        key: key.to_string(),
                        width,
                        variant_key: None,
                        success: false,
                        error: Some(err.to_string()),
                    });
                }
            }
        }
        Ok(outcomes)
    }

    /// Bulk resize over multiple (file, widths) pairs.
    ///
    /// A file that is not resizable or fails to load produces one failure
    /// outcome per requested width; sibling items always proceed.
    pub async fn batch_resize(&self, items: &[BatchResizeItem]) -> Vec<BatchResizeOutcome> {
        let mut outcomes = Vec::new();
        for item in items {
            match self.load_original(&item.key).await {
                Ok((bytes, source_width)) => {
                    for &width in &item.widths {
                        match self
                            .generate_variant(&item.key, &bytes, width, Some(source_width), false)
                            .await
                        {
                            Ok(generated) => outcomes.push(BatchResizeOutcome {
                                key: item.key.clone(),
                                width,
                                variant_key: Some(generated.variant_key),
                                success: true,
                                error: None,
                            }),
                            Err(err) => {
                                warn!(key = %item.key, width, error = %err, "batch resize failed for width");
                                outcomes.push(BatchResizeOutcome {
                                    key: item.key.clone(),
                                    width,
                                    variant_key: None,
                                    success: false,
                                    error: Some(err.to_string()),
                                });
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(key = %item.key, error = %err, "batch item failed to load");
                    for &width in &item.widths {
                        outcomes.push(BatchResizeOutcome {
                            key: item.key.clone(),
                            width,
                            variant_key: None,
                            success: false,
                            error: Some(err.to_string()),
                        });
                    }
                }
            }
        }
        outcomes
    }

    /// Pick the output format for a client `Accept` header value.
    ///
    /// With negotiation disabled the configured preferred format always
    /// wins. Otherwise the highest-priority format both accepted by the
    /// client and allowed by configuration is chosen, falling back through
    /// avif → webp → jpeg → original.
    pub fn negotiate_format(&self, accept: Option<&str>) -> OutputFormat {
        if !self.config.content_negotiation {
            return self.config.preferred_format;
        }
        let Some(accept) = accept else {
            return self.config.preferred_format;
        };
        let accepted: Vec<String> = accept
            .split(',')
            .filter_map(|part| {
                let media_type = part.split(';').next()?.trim().to_ascii_lowercase();
                (!media_type.is_empty()).then_some(media_type)
            })
            .collect();
        if accepted.is_empty() {
            return self.config.preferred_format;
        }

        let wildcard = accepted.iter().any(|t| t == "image/*" || t == "*/*");
        for candidate in NEGOTIATION_ORDER {
            if !self.format_allowed(candidate) {
                continue;
            }
            let Some(token) = candidate.accept_token() else {
                continue;
            };
            if wildcard || accepted.iter().any(|t| t == token) {
                return candidate;
            }
        }
        OutputFormat::Original
    }

    fn format_allowed(&self, format: OutputFormat) -> bool {
        match format {
            OutputFormat::Avif => self.config.avif_enabled,
            OutputFormat::Webp => self.config.webp_enabled,
            OutputFormat::Jpeg | OutputFormat::Original => true,
        }
    }

    async fn load_original(&self, key: &str) -> MediaResult<(Bytes, u32)> {
        self.policy.validate_resizable(key)?;
        let bytes = self.gateway.get_bytes(key).await?;
        let source_width = image_pipeline::probe_width(&bytes)?;
        Ok((bytes, source_width))
    }

    /// Run the pipeline for one variant: clamp the target width, resize,
    /// encode and compute the content ETag. No storage I/O.
    async fn render_variant(
        &self,
        key: &str,
        variant_key: String,
        original: Bytes,
        requested_width: u32,
        format: OutputFormat,
        known_original_width: Option<u32>,
    ) -> MediaResult<GeneratedVariant> {
        let target = match known_original_width {
            Some(source_width) if self.config.auto_prevent_upscale => {
                requested_width.min(source_width)
            }
            Some(_) => requested_width,
            None => image_pipeline::clamp_target_width(
                &original,
                requested_width,
                self.config.auto_prevent_upscale,
            )?,
        };

        let out_ext = format.extension(&Self::source_extension(key));
        let encoded = image_pipeline::resize_to_width(original, target, format).await?;
        let etag = MediaPolicy::content_etag(&encoded);
        Ok(GeneratedVariant {
            variant_key,
            width: target,
            mime_type: MediaPolicy::mime_type(&out_ext),
            format,
            etag,
            bytes: Bytes::from(encoded),
        })
    }

    /// Detached cache population. Runs to completion independently of the
    /// response; its outcome is observed only by the log.
    fn spawn_cache_write(&self, key: &str, generated: &GeneratedVariant) {
        let gateway = Arc::clone(&self.gateway);
        let variant_key = generated.variant_key.clone();
        let bytes = generated.bytes.clone();
        let metadata = Self::variant_metadata(key, generated.width);
        tokio::spawn(async move {
            match gateway.put(&variant_key, bytes, metadata).await {
                Ok(()) => debug!(key = %variant_key, "variant cached"),
                Err(err) => warn!(key = %variant_key, error = %err, "variant cache write failed"),
            }
        });
    }

    fn variant_metadata(key: &str, width: u32) -> HashMap<String, String> {
        HashMap::from([
            (META_ORIGINAL_KEY.to_string(), key.to_string()),
            (META_VARIANT_WIDTH.to_string(), width.to_string()),
        ])
    }

    fn check_source_size(&self, key: &str, size: u64) -> MediaResult<()> {
        let max = self.config.max_source_bytes;
        if size > max {
            return Err(MediaError::LimitExceeded(format!(
                "`{key}` is {size} bytes; on-the-fly resize is limited to {max} bytes"
            )));
        }
        Ok(())
    }

    fn source_extension(key: &str) -> String {
        MediaPolicy::extension(key).unwrap_or_default()
    }

    fn notify_cache_hit(&self, key: &str, variant_key: &str, width: u32) {
        if let Some(hook) = &self.hooks.on_cache_hit {
            hook(&CacheHitEvent {
                key: key.to_string(),
                variant_key: variant_key.to_string(),
                width,
            });
        }
    }

    fn notify_variant_generated(&self, key: &str, generated: &GeneratedVariant) {
        if let Some(hook) = &self.hooks.on_variant_generated {
            hook(&VariantGeneratedEvent {
                key: key.to_string(),
                variant_key: generated.variant_key.clone(),
                width: generated.width,
                size: generated.bytes.len(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage_gateway::RetryPolicy;
    use crate::storage::{MemoryStore, ObjectStore};
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn png_fixture(width: u32, height: u32) -> Bytes {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([12, 80, 160])));
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        Bytes::from(out)
    }

    fn service_over(store: Arc<MemoryStore>, config: ResizeConfig) -> ResizeService {
        let gateway = Arc::new(StorageGateway::new(store, RetryPolicy::default()));
        ResizeService::new(gateway, Arc::new(config), ResizeHooks::default())
    }

    async fn seed(store: &MemoryStore, key: &str, bytes: Bytes) {
        store.put(key, bytes, HashMap::new()).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_non_images_and_non_resizable_images() {
        let store = Arc::new(MemoryStore::new());
        let service = service_over(store, ResizeConfig::default());

        assert!(matches!(
            service.get_resized_image("doc.pdf", 100, None, None).await,
            Err(MediaError::WrongMediaType(_))
        ));
        assert!(matches!(
            service.get_resized_image("logo.svg", 100, None, None).await,
            Err(MediaError::UnsupportedOperation(_))
        ));
    }

    #[tokio::test]
    async fn rejects_widths_over_the_ceiling() {
        let store = Arc::new(MemoryStore::new());
        let service = service_over(store, ResizeConfig::default());

        assert!(matches!(
            service.get_resized_image("a.png", 1201, None, None).await,
            Err(MediaError::LimitExceeded(_))
        ));
    }

    #[tokio::test]
    async fn refuses_oversized_originals() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "big.png", png_fixture(64, 64)).await;
        let service = service_over(
            store,
            ResizeConfig {
                max_source_bytes: 16,
                ..ResizeConfig::default()
            },
        );

        let err = service
            .get_resized_image("big.png", 32, None, None)
            .await
            .unwrap_err();
        match err {
            MediaError::LimitExceeded(msg) => assert!(msg.contains("16 bytes")),
            other => panic!("expected LimitExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn upscale_is_clamped_to_source_width() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "small.png", png_fixture(200, 100)).await;
        let service = service_over(store, ResizeConfig::default());

        let response = service
            .get_resized_image("small.png", 500, None, None)
            .await
            .unwrap();
        let ImageResponse::Content { bytes, .. } = response else {
            panic!("expected content");
        };
        assert_eq!(image_pipeline::probe_width(&bytes).unwrap(), 200);
    }

    #[tokio::test]
    async fn upscale_happens_when_prevention_is_disabled() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "small.png", png_fixture(200, 100)).await;
        let service = service_over(
            store,
            ResizeConfig {
                auto_prevent_upscale: false,
                ..ResizeConfig::default()
            },
        );

        let response = service
            .get_resized_image("small.png", 500, None, None)
            .await
            .unwrap();
        let ImageResponse::Content { bytes, .. } = response else {
            panic!("expected content");
        };
        assert_eq!(image_pipeline::probe_width(&bytes).unwrap(), 500);
    }

    #[tokio::test]
    async fn missing_original_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let service = service_over(store, ResizeConfig::default());

        assert!(matches!(
            service.get_resized_image("ghost.png", 100, None, None).await,
            Err(MediaError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn generate_variant_skip_upload_leaves_storage_untouched() {
        let store = Arc::new(MemoryStore::new());
        let service = service_over(store.clone(), ResizeConfig::default());
        let original = png_fixture(200, 100);

        let generated = service
            .generate_variant("art/cat.png", &original, 100, None, true)
            .await
            .unwrap();
        assert_eq!(generated.variant_key, "art/cat-100.png");
        assert_eq!(generated.width, 100);
        assert!(!store.contains("art/cat-100.png"));

        service
            .generate_variant("art/cat.png", &original, 100, Some(200), false)
            .await
            .unwrap();
        assert!(store.contains("art/cat-100.png"));
    }

    #[tokio::test]
    async fn pre_generate_inline_continues_past_failures() {
        let store = Arc::new(MemoryStore::new());
        let service = service_over(store.clone(), ResizeConfig::default());

        // 5000 exceeds the width ceiling and must fail; the others succeed.
        let outcomes = service
            .pre_generate_inline("cat.png", png_fixture(2000, 1000), &[100, 5000, 300])
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].success);
        assert!(!outcomes[1].success);
        assert!(outcomes[1].error.as_deref().unwrap().contains("5000"));
        assert!(outcomes[2].success);
        assert!(store.contains("cat-100.png"));
        assert!(store.contains("cat-300.png"));
    }

    mod negotiation {
        use super::*;

        fn negotiating(webp: bool, avif: bool) -> ResizeService {
            service_over(
                Arc::new(MemoryStore::new()),
                ResizeConfig {
                    content_negotiation: true,
                    webp_enabled: webp,
                    avif_enabled: avif,
                    ..ResizeConfig::default()
                },
            )
        }

        #[test]
        fn disabled_negotiation_returns_preferred() {
            let service = service_over(
                Arc::new(MemoryStore::new()),
                ResizeConfig {
                    content_negotiation: false,
                    ..ResizeConfig::default()
                },
            );
            assert_eq!(
                service.negotiate_format(Some("image/avif,image/webp")),
                OutputFormat::Original
            );
        }

        #[test]
        fn falls_back_to_webp_when_avif_is_disallowed() {
            let service = negotiating(true, false);
            assert_eq!(
                service.negotiate_format(Some("image/avif,image/webp,image/*")),
                OutputFormat::Webp
            );
        }

        #[test]
        fn picks_avif_when_accepted_and_allowed() {
            let service = negotiating(true, true);
            assert_eq!(
                service.negotiate_format(Some("image/avif,image/webp")),
                OutputFormat::Avif
            );
            assert_eq!(
                service.negotiate_format(Some("IMAGE/AVIF;q=0.9")),
                OutputFormat::Avif
            );
        }

        #[test]
        fn wildcard_accepts_the_best_allowed_format() {
            let service = negotiating(true, true);
            assert_eq!(service.negotiate_format(Some("image/*")), OutputFormat::Avif);
            let no_avif = negotiating(true, false);
            assert_eq!(no_avif.negotiate_format(Some("*/*")), OutputFormat::Webp);
        }

        #[test]
        fn absent_or_empty_header_returns_preferred() {
            let service = negotiating(true, true);
            assert_eq!(service.negotiate_format(None), OutputFormat::Original);
            assert_eq!(service.negotiate_format(Some("  ")), OutputFormat::Original);
        }

        #[test]
        fn no_acceptable_format_falls_back_to_original() {
            let service = negotiating(true, true);
            assert_eq!(
                service.negotiate_format(Some("text/html,application/json")),
                OutputFormat::Original
            );
        }
    }
}
