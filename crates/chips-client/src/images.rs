//! Outgoing image delivery.
//!
//! An image is shown locally before anything goes on the wire. Large images
//! are recompressed on a worker first; if that fails the original bytes are
//! sent. Images only travel over the direct link.

use std::collections::HashMap;
use std::io::Cursor;

use base64::Engine;
use chips_common::{Error, PeerPayload, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, GenericImageView};
use tracing::{debug, info, warn};

use crate::analytics::Reporter;
use crate::config::ClientConfig;
use crate::event::ImageUpload;
use crate::ports::{CompressJob, ImageCompressor, SendTag};
use crate::router::{MessageRouter, Outbound};
use crate::types::{DeliveryStatus, Transport};

pub fn data_url(mime: &str, bytes: &[u8]) -> String {
    format!(
        "data:{mime};base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

/// Re-encode as JPEG at `quality` (0..=1), shrinking so the longer edge is at
/// most `max_edge` pixels. Aspect ratio is preserved; smaller images keep
/// their size.
pub fn recompress(bytes: &[u8], quality: f32, max_edge: u32) -> Result<Vec<u8>> {
    let mut img = image::load_from_memory(bytes).map_err(Error::image)?;
    let (width, height) = img.dimensions();
    if width.max(height) > max_edge {
        img = img.resize(max_edge, max_edge, FilterType::Triangle);
    }
    let rgb = img.to_rgb8();
    let q = (quality.clamp(0.01, 1.0) * 100.0).round() as u8;
    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, q)
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)
        .map_err(Error::image)?;
    Ok(out.into_inner())
}

struct PendingImage {
    message_id: String,
    upload: ImageUpload,
}

pub struct ImageDeliveryPipeline {
    threshold: usize,
    quality: f32,
    max_edge: u32,
    next_job: u64,
    pending: HashMap<u64, PendingImage>,
    analytics: Reporter,
}

impl ImageDeliveryPipeline {
    pub fn new(config: &ClientConfig, analytics: Reporter) -> Self {
        Self {
            threshold: config.image_compress_threshold_bytes,
            quality: config.image_quality,
            max_edge: config.image_max_edge,
            next_job: 0,
            pending: HashMap::new(),
            analytics,
        }
    }

    pub fn pending_jobs(&self) -> usize {
        self.pending.len()
    }

    /// Show the image locally, then compress or transmit it. Returns the
    /// local message id.
    pub fn send_image(
        &mut self,
        upload: ImageUpload,
        now_ms: u64,
        router: &mut MessageRouter,
        compressor: &mut dyn ImageCompressor,
        out: &mut dyn Outbound,
    ) -> Option<String> {
        if upload.bytes.is_empty() {
            return None;
        }
        let message_id = router.upsert_sent_image(
            &upload.filename,
            data_url(&upload.mime, &upload.bytes),
            upload.replace_message_id.as_deref(),
            now_ms,
        );

        if upload.bytes.len() > self.threshold {
            self.next_job += 1;
            let job = CompressJob {
                id: self.next_job,
                bytes: upload.bytes.clone(),
                quality: self.quality,
                max_edge: self.max_edge,
            };
            info!(job = job.id, size = upload.bytes.len(), "recompressing large image");
            match compressor.compress(job) {
                Ok(()) => {
                    self.pending.insert(
                        self.next_job,
                        PendingImage {
                            message_id: message_id.clone(),
                            upload,
                        },
                    );
                    return Some(message_id);
                }
                Err(e) => {
                    warn!(error = %e, "could not start recompression, sending original");
                }
            }
        }

        let payload = data_url(&upload.mime, &upload.bytes);
        self.deliver(&message_id, &upload, payload, false, router, out);
        Some(message_id)
    }

    /// Compression finished. Stale jobs (after teardown) are ignored.
    pub fn on_compressed(
        &mut self,
        job: u64,
        result: Result<Vec<u8>>,
        router: &mut MessageRouter,
        out: &mut dyn Outbound,
    ) {
        let Some(pending) = self.pending.remove(&job) else {
            debug!(job, "compression result for unknown job; ignoring");
            return;
        };
        let (payload, compressed) = match result {
            Ok(bytes) => {
                debug!(
                    job,
                    before = pending.upload.bytes.len(),
                    after = bytes.len(),
                    "image recompressed"
                );
                (data_url("image/jpeg", &bytes), true)
            }
            Err(e) => {
                warn!(job, error = %e, "recompression failed, sending original");
                (
                    data_url(&pending.upload.mime, &pending.upload.bytes),
                    false,
                )
            }
        };
        self.deliver(
            &pending.message_id,
            &pending.upload,
            payload,
            compressed,
            router,
            out,
        );
    }

    fn deliver(
        &mut self,
        message_id: &str,
        upload: &ImageUpload,
        data: String,
        compressed: bool,
        router: &mut MessageRouter,
        out: &mut dyn Outbound,
    ) {
        if !out.direct_open() {
            warn!(id = %message_id, "no direct link; image not sent");
            self.analytics.error("image_send_no_p2p", "webrtc");
            router.set_status(message_id, DeliveryStatus::Failed, None);
            return;
        }
        let payload = PeerPayload::Image {
            id: Some(message_id.to_string()),
            filename: upload.filename.clone(),
            data,
            replace_message_id: upload.replace_message_id.clone(),
        };
        let tag = SendTag {
            message_id: Some(message_id.to_string()),
            fallback: None,
        };
        match payload.encode().and_then(|p| out.send_direct(&p, tag)) {
            Ok(()) => {
                self.analytics.image_shared(upload.bytes.len(), compressed);
                router.set_status(message_id, DeliveryStatus::Sent, Some(Transport::Direct));
            }
            Err(e) => {
                warn!(id = %message_id, error = %e, "image send failed");
                self.analytics.error("image_send_failed", "webrtc");
                router.set_status(message_id, DeliveryStatus::Failed, None);
            }
        }
    }

    /// Forget in-flight compression jobs. Their results will be ignored and
    /// the images they carried are marked failed.
    pub fn clear(&mut self, router: &mut MessageRouter) {
        for (job, pending) in self.pending.drain() {
            debug!(job, id = %pending.message_id, "compression job dropped");
            router.set_status(&pending.message_id, DeliveryStatus::Failed, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::{DummyCompressor, RecordingAnalytics};
    use crate::types::Notifier;
    use chips_common::ClientFrame;
    use image::{ImageBuffer, ImageOutputFormat, Rgb};
    use std::sync::Arc;

    #[derive(Default)]
    struct Wire {
        open: bool,
        direct: Vec<String>,
        relay: Vec<ClientFrame>,
    }

    impl Outbound for Wire {
        fn direct_open(&self) -> bool {
            self.open
        }

        fn send_direct(&mut self, payload: &str, _tag: SendTag) -> Result<()> {
            self.direct.push(payload.to_string());
            Ok(())
        }

        fn send_relay(&mut self, frame: ClientFrame) -> Result<()> {
            self.relay.push(frame);
            Ok(())
        }
    }

    fn setup() -> (ImageDeliveryPipeline, MessageRouter, RecordingAnalytics) {
        let analytics = RecordingAnalytics::new();
        let reporter = Reporter::new(Arc::new(analytics.clone()));
        let (notifier, _rx) = Notifier::channel();
        (
            ImageDeliveryPipeline::new(&ClientConfig::default(), reporter.clone()),
            MessageRouter::new(100, notifier, reporter),
            analytics,
        )
    }

    fn upload(size: usize) -> ImageUpload {
        ImageUpload {
            filename: "cat.png".into(),
            mime: "image/png".into(),
            bytes: vec![7u8; size],
            replace_message_id: None,
        }
    }

    fn sent_payload(wire: &Wire) -> PeerPayload {
        PeerPayload::decode(&wire.direct[0]).unwrap()
    }

    #[test]
    fn test_small_image_sent_directly() {
        let (mut pipeline, mut router, analytics) = setup();
        let compressor = DummyCompressor::new();
        let mut wire = Wire {
            open: true,
            ..Default::default()
        };
        let id = pipeline
            .send_image(upload(10), 0, &mut router, &mut compressor.clone(), &mut wire)
            .unwrap();
        assert!(compressor.jobs().is_empty());
        assert_eq!(wire.direct.len(), 1);
        assert_eq!(router.message(&id).unwrap().status, DeliveryStatus::Sent);
        assert_eq!(analytics.images(), vec![(10, false)]);
    }

    #[test]
    fn test_large_image_is_recompressed() {
        let (mut pipeline, mut router, analytics) = setup();
        let compressor = DummyCompressor::new();
        let mut wire = Wire {
            open: true,
            ..Default::default()
        };
        let size = 1024 * 1024 + 1;
        let id = pipeline
            .send_image(upload(size), 0, &mut router, &mut compressor.clone(), &mut wire)
            .unwrap();
        assert_eq!(router.message(&id).unwrap().status, DeliveryStatus::Pending);
        assert!(wire.direct.is_empty());
        let jobs = compressor.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].max_edge, 1024);
        assert!((jobs[0].quality - 0.7).abs() < f32::EPSILON);

        pipeline.on_compressed(jobs[0].id, Ok(vec![1, 2, 3]), &mut router, &mut wire);
        let PeerPayload::Image { data, .. } = sent_payload(&wire) else {
            panic!("expected image payload");
        };
        assert!(data.starts_with("data:image/jpeg;base64,"));
        assert_eq!(analytics.images(), vec![(size, true)]);
    }

    #[test]
    fn test_compression_failure_sends_original() {
        let (mut pipeline, mut router, _) = setup();
        let compressor = DummyCompressor::new();
        let mut wire = Wire {
            open: true,
            ..Default::default()
        };
        let up = upload(2 * 1024 * 1024);
        let expected = data_url(&up.mime, &up.bytes);
        pipeline.send_image(up, 0, &mut router, &mut compressor.clone(), &mut wire);
        let job = compressor.jobs()[0].id;
        pipeline.on_compressed(job, Err(Error::image("corrupt")), &mut router, &mut wire);
        let PeerPayload::Image { data, .. } = sent_payload(&wire) else {
            panic!("expected image payload");
        };
        assert_eq!(data, expected);
    }

    #[test]
    fn test_compressor_refusal_sends_original() {
        let (mut pipeline, mut router, _) = setup();
        let compressor = DummyCompressor::new();
        compressor.refuse(true);
        let mut wire = Wire {
            open: true,
            ..Default::default()
        };
        pipeline.send_image(
            upload(2 * 1024 * 1024),
            0,
            &mut router,
            &mut compressor.clone(),
            &mut wire,
        );
        assert_eq!(wire.direct.len(), 1);
        assert_eq!(pipeline.pending_jobs(), 0);
    }

    #[test]
    fn test_no_direct_link_fails_without_relay() {
        let (mut pipeline, mut router, analytics) = setup();
        let mut wire = Wire::default();
        let id = pipeline
            .send_image(upload(10), 0, &mut router, &mut DummyCompressor::new(), &mut wire)
            .unwrap();
        assert!(wire.relay.is_empty());
        assert!(wire.direct.is_empty());
        assert_eq!(router.message(&id).unwrap().status, DeliveryStatus::Failed);
        assert!(analytics.has_error("image_send_no_p2p"));
    }

    #[test]
    fn test_stale_job_ignored_after_clear() {
        let (mut pipeline, mut router, _) = setup();
        let compressor = DummyCompressor::new();
        let mut wire = Wire {
            open: true,
            ..Default::default()
        };
        let id = pipeline
            .send_image(
                upload(2 * 1024 * 1024),
                0,
                &mut router,
                &mut compressor.clone(),
                &mut wire,
            )
            .unwrap();
        pipeline.clear(&mut router);
        assert_eq!(router.message(&id).unwrap().status, DeliveryStatus::Failed);
        pipeline.on_compressed(compressor.jobs()[0].id, Ok(vec![1]), &mut router, &mut wire);
        assert!(wire.direct.is_empty());
        assert_eq!(router.message(&id).unwrap().status, DeliveryStatus::Failed);
    }

    #[test]
    fn test_recompress_caps_longer_edge() {
        let img = ImageBuffer::from_fn(2048, 1024, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
        let mut png = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut png, ImageOutputFormat::Png)
            .unwrap();

        let jpeg = recompress(png.get_ref(), 0.7, 1024).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (1024, 512));
    }

    #[test]
    fn test_recompress_rejects_garbage() {
        assert!(matches!(
            recompress(b"definitely not an image", 0.7, 1024),
            Err(Error::Image(_))
        ));
    }
}
