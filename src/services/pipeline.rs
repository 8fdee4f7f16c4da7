//! Deterministic image transformation pipeline.
//!
//! `transform` is a pure function of `(bytes, directives)`: the same input always
//! yields byte-identical PNG output, which is what makes reprocessing a redelivered
//! job safe.

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::models::directive::Directive;

pub const OUTPUT_FORMAT: ImageFormat = ImageFormat::Png;

/// Decode `source`, apply `directives` left to right, encode as PNG.
pub fn transform(source: &[u8], directives: &[Directive]) -> Result<Vec<u8>, TransformError> {
    let image = image::load_from_memory(source).map_err(TransformError::Decode)?;

    let image = directives.iter().fold(image, |image, directive| apply(image, *directive));

    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, OUTPUT_FORMAT)
        .map_err(TransformError::Encode)?;
    Ok(out.into_inner())
}

/// Apply a single directive to the current image.
pub fn apply(image: DynamicImage, directive: Directive) -> DynamicImage {
    match directive {
        Directive::Resize { width, height } => image.resize_exact(width, height, FilterType::Triangle),
        Directive::Grayscale => DynamicImage::ImageLuma8(image.to_luma8()),
    }
}

/// Bounded execution context for CPU-bound transforms.
///
/// Transforms run on tokio's blocking pool; the semaphore caps how many run at once
/// independently of how many messages a consumer has in flight.
#[derive(Clone)]
pub struct TransformPool {
    permits: Arc<Semaphore>,
}

impl TransformPool {
    pub fn new(threads: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(threads.max(1))),
        }
    }

    pub async fn run(
        &self,
        source: Vec<u8>,
        directives: Vec<Directive>,
    ) -> Result<Vec<u8>, TransformError> {
        self.execute(move || transform(&source, &directives)).await?
    }

    /// Run blocking `work` once a slot is free.
    pub async fn execute<F, T>(&self, work: F) -> Result<T, TransformError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransformError::PoolClosed)?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            work()
        })
        .await
        .map_err(|e| TransformError::Aborted(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("Image processing failed: cannot decode source image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("Image processing failed: cannot encode result: {0}")]
    Encode(#[source] image::ImageError),

    #[error("Image processing failed: transform task aborted: {0}")]
    Aborted(String),

    #[error("Image processing failed: transform pool closed")]
    PoolClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::directive::parse_lenient;
    use image::{GenericImageView, RgbImage};

    fn sample_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x + y) % 256) as u8])
        });
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn decode(bytes: &[u8]) -> DynamicImage {
        image::load_from_memory_with_format(bytes, ImageFormat::Png).unwrap()
    }

    #[test]
    fn test_resize_then_grayscale() {
        let output = transform(
            &sample_png(64, 48),
            &[Directive::Resize { width: 100, height: 100 }, Directive::Grayscale],
        )
        .unwrap();

        let result = decode(&output);
        assert_eq!(result.dimensions(), (100, 100));
        assert!(matches!(result, DynamicImage::ImageLuma8(_)));
    }

    #[test]
    fn test_deterministic_output() {
        let source = sample_png(40, 30);
        let directives = [Directive::Grayscale, Directive::Resize { width: 17, height: 9 }];

        let first = transform(&source, &directives).unwrap();
        let second = transform(&source, &directives).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_order_is_significant() {
        let source = sample_png(40, 30);
        let out = transform(
            &source,
            &[Directive::Resize { width: 10, height: 10 }, Directive::Resize { width: 3, height: 5 }],
        )
        .unwrap();
        assert_eq!(decode(&out).dimensions(), (3, 5));
    }

    #[test]
    fn test_unknown_directive_does_not_abort() {
        let directives = parse_lenient(&["sharpen", "resize:20x10", "grayscale"]);
        let out = transform(&sample_png(8, 8), &directives).unwrap();

        let result = decode(&out);
        assert_eq!(result.dimensions(), (20, 10));
        assert!(matches!(result, DynamicImage::ImageLuma8(_)));
    }

    #[test]
    fn test_malformed_resize_is_skipped() {
        let directives = parse_lenient(&["resize:axb", "grayscale"]);
        let out = transform(&sample_png(12, 6), &directives).unwrap();

        let result = decode(&out);
        assert_eq!(result.dimensions(), (12, 6));
        assert!(matches!(result, DynamicImage::ImageLuma8(_)));
    }

    #[test]
    fn test_empty_directive_list_reencodes() {
        let out = transform(&sample_png(5, 4), &[]).unwrap();
        assert_eq!(decode(&out).dimensions(), (5, 4));
    }

    #[test]
    fn test_corrupt_source_is_a_decode_error() {
        let err = transform(b"definitely not an image", &[Directive::Grayscale]).unwrap_err();
        assert!(matches!(err, TransformError::Decode(_)));
    }

    #[tokio::test]
    async fn test_pool_runs_transform() {
        let pool = TransformPool::new(1);
        let source = sample_png(10, 10);
        let (a, b) = tokio::join!(
            pool.run(source.clone(), vec![Directive::Grayscale]),
            pool.run(source.clone(), vec![Directive::Grayscale]),
        );
        assert_eq!(a.unwrap(), b.unwrap());
    }

    #[tokio::test]
    async fn test_pool_caps_concurrent_transforms() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        async fn peak(threads: usize) -> usize {
            let pool = TransformPool::new(threads);
            let active = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));

            let jobs = (0..4).map(|_| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                pool.execute(move || {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(30));
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            });
            for result in futures::future::join_all(jobs).await {
                result.unwrap();
            }
            peak.load(Ordering::SeqCst)
        }

        assert_eq!(peak(1).await, 1);
        assert!(peak(2).await <= 2);
    }
}
