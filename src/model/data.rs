use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use burn::data::dataloader::DataLoader;
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use image::{GrayImage, ImageReader, Luma, imageops::FilterType};
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut};
use imageproc::rect::Rect;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::DataStreamError;

const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "tiff", "webp"];

/// One training sample; decoding happens in the batcher, on the loader's workers.
#[derive(Debug, Clone)]
pub struct InpaintItem {
    pub path: PathBuf,
}

pub struct InpaintDataset {
    pub image_paths: Vec<PathBuf>,
}

impl InpaintDataset {
    /// Every image file directly under `path`, in a stable order.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DataStreamError> {
        let path = path.as_ref();
        let listing_error = |err: std::io::Error| DataStreamError::Listing {
            path: path.to_path_buf(),
            message: err.to_string(),
        };

        let mut image_paths = Vec::new();
        for entry in std::fs::read_dir(path).map_err(listing_error)? {
            let path = entry.map_err(listing_error)?.path();
            if !path.is_file() {
                continue;
            }
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()));
            if is_image {
                image_paths.push(path);
            }
        }
        if image_paths.is_empty() {
            return Err(DataStreamError::Empty(path.to_path_buf()));
        }
        image_paths.sort();
        Ok(Self { image_paths })
    }
}

impl Dataset<InpaintItem> for InpaintDataset {
    fn len(&self) -> usize {
        self.image_paths.len()
    }

    fn get(&self, index: usize) -> Option<InpaintItem> {
        self.image_paths
            .get(index)
            .map(|path| InpaintItem { path: path.clone() })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskKind {
    /// A single square hole.
    Box,
    /// Random brush strokes.
    FreeForm,
    /// Union of a box and strokes.
    Mixed,
}

/// Random hole generation. Lengths are in pixels at a 256px resolution and scale with the
/// image size.
#[derive(Config, Debug)]
pub struct MaskConfig {
    #[config(default = "MaskKind::FreeForm")]
    pub kind: MaskKind,

    /// Minimum distance between a box hole and the image border.
    #[config(default = 10)]
    pub margin: usize,

    #[config(default = 30)]
    pub bbox_shape: usize,

    /// Upper bound on the number of strokes.
    #[config(default = 15)]
    pub max_strokes: usize,

    /// Upper bound on the number of segments per stroke.
    #[config(default = 5)]
    pub max_vertices: usize,

    /// Upper bound on the turning angle of a segment, in radians.
    #[config(default = 4)]
    pub max_angle: usize,

    #[config(default = 40)]
    pub max_length: usize,

    #[config(default = 10)]
    pub max_width: usize,
}

impl MaskConfig {
    /// Draw a `size`x`size` mask: 1 marks pixels to inpaint, 0 pixels to keep.
    pub fn sample<R: Rng>(&self, size: usize, rng: &mut R) -> GrayImage {
        let mut mask = GrayImage::new(size as u32, size as u32);
        if matches!(self.kind, MaskKind::Box | MaskKind::Mixed) {
            self.draw_box(&mut mask, rng);
        }
        if matches!(self.kind, MaskKind::FreeForm | MaskKind::Mixed) {
            self.draw_strokes(&mut mask, rng);
        }
        mask
    }

    fn scaled(&self, value: usize, size: u32) -> i32 {
        ((value * size as usize) / 256).max(1) as i32
    }

    fn draw_box<R: Rng>(&self, mask: &mut GrayImage, rng: &mut R) {
        let size = mask.width() as i32;
        let shape = self.scaled(self.bbox_shape, mask.width()).min(size / 2).max(1);
        let margin = self.scaled(self.margin, mask.width()).min((size - shape) / 2);
        let top = rng.random_range(margin..=size - margin - shape);
        let left = rng.random_range(margin..=size - margin - shape);
        draw_filled_rect_mut(
            mask,
            Rect::at(left, top).of_size(shape as u32, shape as u32),
            Luma([1]),
        );
    }

    fn draw_strokes<R: Rng>(&self, mask: &mut GrayImage, rng: &mut R) {
        let size = mask.width() as i32;
        let max_length = self.scaled(self.max_length, mask.width());
        let max_width = self.scaled(self.max_width, mask.width());
        let min_length = self.scaled(10, mask.width());
        let min_width = self.scaled(5, mask.width());

        let strokes = rng.random_range(1..=self.max_strokes.max(1));
        for stroke in 0..strokes {
            let mut x = rng.random_range(0..size) as f32;
            let mut y = rng.random_range(0..size) as f32;
            let vertices = 1 + rng.random_range(0..self.max_vertices.max(1));
            for _ in 0..vertices {
                let mut angle = 0.01 + rng.random_range(0..self.max_angle.max(1)) as f32;
                if stroke % 2 == 0 {
                    angle = 2.0 * std::f32::consts::PI - angle;
                }
                let length = (min_length + rng.random_range(0..max_length)) as f32;
                let radius = (min_width + rng.random_range(0..max_width)) / 2;

                let end_x = (x + length * angle.sin()).clamp(0.0, (size - 1) as f32);
                let end_y = (y + length * angle.cos()).clamp(0.0, (size - 1) as f32);
                brush_segment(mask, (x, y), (end_x, end_y), radius.max(1));
                x = end_x;
                y = end_y;
            }
        }
    }
}

/// A line of width `2 * radius`, drawn as overlapping discs.
fn brush_segment(mask: &mut GrayImage, from: (f32, f32), to: (f32, f32), radius: i32) {
    let steps = (to.0 - from.0).abs().max((to.1 - from.1).abs()).ceil().max(1.0) as usize;
    for step in 0..=steps {
        let t = step as f32 / steps as f32;
        let x = from.0 + (to.0 - from.0) * t;
        let y = from.1 + (to.1 - from.1) * t;
        draw_filled_circle_mut(mask, (x.round() as i32, y.round() as i32), radius, Luma([1]));
    }
}

/// Decode, resize to `size`x`size` and lay out as CHW in [-1, 1].
fn load_image(path: &Path, size: usize) -> Result<Vec<f32>, DataStreamError> {
    let decode_error = |message: String| DataStreamError::Decode {
        path: path.to_path_buf(),
        message,
    };
    let image = ImageReader::open(path)
        .map_err(|err| decode_error(err.to_string()))?
        .decode()
        .map_err(|err| decode_error(err.to_string()))?
        .to_rgb8();
    let image = image::imageops::resize(&image, size as u32, size as u32, FilterType::Triangle);

    let plane = size * size;
    let mut data = vec![0.0f32; 3 * plane];
    for (idx, pixel) in image.pixels().enumerate() {
        for channel in 0..3 {
            data[channel * plane + idx] = pixel[channel] as f32 / 127.5 - 1.0;
        }
    }
    Ok(data)
}

#[derive(Clone, Debug)]
pub struct InpaintBatch<B: Backend> {
    /// `[batch, 3, H, W]` in [-1, 1].
    pub images: Tensor<B, 4>,
    /// `[batch, 1, H, W]`, 1 where the generator must fill in.
    pub masks: Tensor<B, 4>,
}

impl<B: Backend> InpaintBatch<B> {
    pub fn validate(&self) -> Result<(), DataStreamError> {
        let [batch, channels, height, width] = self.images.dims();
        let [mask_batch, mask_channels, mask_height, mask_width] = self.masks.dims();
        if channels != 3 || mask_channels != 1 {
            return Err(DataStreamError::Shape(format!(
                "expected 3 image channels and 1 mask channel, got {channels} and {mask_channels}"
            )));
        }
        if (batch, height, width) != (mask_batch, mask_height, mask_width) {
            return Err(DataStreamError::Shape(format!(
                "image batch {:?} does not match mask batch {:?}",
                [batch, height, width],
                [mask_batch, mask_height, mask_width]
            )));
        }
        Ok(())
    }

    pub fn to_device(self, device: &B::Device) -> Self {
        Self {
            images: self.images.to_device(device),
            masks: self.masks.to_device(device),
        }
    }
}

pub type BatchResult<B> = Result<InpaintBatch<B>, DataStreamError>;

/// Loads images and draws one fresh mask per item.
#[derive(Clone)]
pub struct InpaintBatcher {
    image_size: usize,
    mask: MaskConfig,
    rng: Arc<Mutex<StdRng>>,
}

impl InpaintBatcher {
    pub fn new(image_size: usize, mask: MaskConfig, seed: u64) -> Self {
        Self {
            image_size,
            mask,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    fn sample_mask(&self) -> Vec<f32> {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.mask
            .sample(self.image_size, &mut *rng)
            .into_raw()
            .into_iter()
            .map(f32::from)
            .collect()
    }
}

impl<B: Backend> Batcher<B, InpaintItem, BatchResult<B>> for InpaintBatcher {
    fn batch(&self, items: Vec<InpaintItem>, device: &B::Device) -> BatchResult<B> {
        let size = self.image_size;
        let count = items.len();
        if count == 0 {
            return Err(DataStreamError::Shape("empty batch".into()));
        }

        let mut images = Vec::with_capacity(count * 3 * size * size);
        let mut masks = Vec::with_capacity(count * size * size);
        for item in &items {
            images.extend(load_image(&item.path, size)?);
            masks.extend(self.sample_mask());
        }

        let images = Tensor::<B, 4>::from_data(
            TensorData::new(images, [count, 3, size, size]).convert::<B::FloatElem>(),
            device,
        );
        let masks = Tensor::<B, 4>::from_data(
            TensorData::new(masks, [count, 1, size, size]).convert::<B::FloatElem>(),
            device,
        );
        Ok(InpaintBatch { images, masks })
    }
}

/// A finite, re-iterable sequence of batches: one pass is one epoch.
pub trait BatchStream<B: Backend> {
    fn batches(&self) -> Box<dyn Iterator<Item = BatchResult<B>> + '_>;
    fn num_batches(&self) -> usize;
}

/// Shuffling, prefetching stream backed by burn's data loader.
pub struct LoaderStream<B: Backend> {
    loader: Arc<dyn DataLoader<B, BatchResult<B>>>,
    batch_size: usize,
}

impl<B: Backend> LoaderStream<B> {
    pub fn new(loader: Arc<dyn DataLoader<B, BatchResult<B>>>, batch_size: usize) -> Self {
        Self { loader, batch_size }
    }
}

impl<B: Backend> BatchStream<B> for LoaderStream<B> {
    fn batches(&self) -> Box<dyn Iterator<Item = BatchResult<B>> + '_> {
        Box::new(self.loader.iter())
    }

    fn num_batches(&self) -> usize {
        self.loader.num_items().div_ceil(self.batch_size.max(1))
    }
}

impl<B: Backend> BatchStream<B> for Vec<InpaintBatch<B>> {
    fn batches(&self) -> Box<dyn Iterator<Item = BatchResult<B>> + '_> {
        Box::new(self.iter().cloned().map(Ok))
    }

    fn num_batches(&self) -> usize {
        self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::{Rgb, RgbImage};

    type TestBackend = NdArray<f32>;

    #[test]
    fn dataset_lists_only_images_in_sorted_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["b.png", "a.JPG", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"").expect("write");
        }
        std::fs::create_dir(dir.path().join("nested.png")).expect("mkdir");

        let dataset = InpaintDataset::new(dir.path()).expect("dataset");
        assert_eq!(dataset.len(), 2);
        let first = dataset.get(0).expect("item");
        assert_eq!(first.path.file_name().and_then(|n| n.to_str()), Some("a.JPG"));
        assert!(dataset.get(2).is_none());
    }

    #[test]
    fn empty_directory_is_a_data_stream_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            InpaintDataset::new(dir.path()),
            Err(DataStreamError::Empty(_))
        ));
    }

    #[test]
    fn masks_are_binary_and_not_empty() {
        let mut rng = StdRng::seed_from_u64(7);
        for kind in [MaskKind::Box, MaskKind::FreeForm, MaskKind::Mixed] {
            let mask = MaskConfig::new().with_kind(kind).sample(64, &mut rng);
            assert_eq!(mask.dimensions(), (64, 64));
            assert!(mask.pixels().all(|p| p[0] <= 1));
            assert!(mask.pixels().any(|p| p[0] == 1), "{kind:?} mask is empty");
        }
    }

    #[test]
    fn box_masks_respect_the_margin() {
        let mut rng = StdRng::seed_from_u64(3);
        let config = MaskConfig::new().with_kind(MaskKind::Box);
        for _ in 0..20 {
            let mask = config.sample(256, &mut rng);
            for (x, y, p) in mask.enumerate_pixels() {
                if p[0] == 1 {
                    assert!((10..246).contains(&x) && (10..246).contains(&y));
                }
            }
        }
    }

    #[test]
    fn batcher_produces_matching_image_and_mask_tensors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut items = Vec::new();
        for (idx, value) in [0u8, 255].into_iter().enumerate() {
            let path = dir.path().join(format!("{idx}.png"));
            RgbImage::from_pixel(12, 12, Rgb([value, value, value]))
                .save(&path)
                .expect("save");
            items.push(InpaintItem { path });
        }

        let batcher = InpaintBatcher::new(8, MaskConfig::new().with_kind(MaskKind::Mixed), 1);
        let device = Default::default();
        let batch: InpaintBatch<TestBackend> = batcher.batch(items, &device).expect("batch");
        batch.validate().expect("valid batch");
        assert_eq!(batch.images.dims(), [2, 3, 8, 8]);
        assert_eq!(batch.masks.dims(), [2, 1, 8, 8]);

        let images = batch.images.into_data().to_vec::<f32>().expect("f32");
        assert!(images[..3 * 64].iter().all(|&v| (v + 1.0).abs() < 1e-6));
        assert!(images[3 * 64..].iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn undecodable_files_fail_the_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not a png").expect("write");

        let batcher = InpaintBatcher::new(8, MaskConfig::new(), 1);
        let result: BatchResult<TestBackend> =
            batcher.batch(vec![InpaintItem { path }], &Default::default());
        assert!(matches!(result, Err(DataStreamError::Decode { .. })));
    }

    #[test]
    fn mismatched_batches_are_rejected() {
        let device = Default::default();
        let batch = InpaintBatch::<TestBackend> {
            images: Tensor::zeros([2, 3, 8, 8], &device),
            masks: Tensor::zeros([2, 1, 4, 4], &device),
        };
        assert!(matches!(batch.validate(), Err(DataStreamError::Shape(_))));
    }
}
