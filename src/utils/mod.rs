use burn::prelude::*;
use image::{GenericImage, Rgb, RgbImage};

/// Per-channel statistics of the ImageNet training set, as expected by the perceptual network.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Map a [-1, 1] image batch to [0, 1].
pub fn to_unit_range<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    images.add_scalar(1.0).div_scalar(2.0)
}

/// Standardize a [0, 1] RGB batch with the ImageNet mean and std.
pub fn normalize_imagenet<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    let device = images.device();
    let dims = images.dims();
    let mean = Tensor::<B, 1>::from_floats(IMAGENET_MEAN, &device)
        .reshape([1, 3, 1, 1])
        .expand(dims);
    let std = Tensor::<B, 1>::from_floats(IMAGENET_STD, &device)
        .reshape([1, 3, 1, 1])
        .expand(dims);
    (images - mean) / std
}

/// Convert one CHW image with values in [0, 1] to RGB. Single-channel input becomes grey.
pub fn chw_to_image(
    data: &[f32],
    channels: usize,
    height: usize,
    width: usize,
) -> Option<RgbImage> {
    let hw = height * width;
    if !(channels == 1 || channels == 3) || data.len() != channels * hw {
        return None;
    }

    let to_u8 = |value: f32| (value * 255.0).round().clamp(0.0, 255.0) as u8;
    let mut img = RgbImage::new(width as u32, height as u32);
    for y in 0..height {
        for x in 0..width {
            let idx = y * width + x;
            let pixel = if channels == 1 {
                let v = to_u8(data[idx]);
                [v, v, v]
            } else {
                [
                    to_u8(data[idx]),
                    to_u8(data[hw + idx]),
                    to_u8(data[2 * hw + idx]),
                ]
            };
            img.put_pixel(x as u32, y as u32, Rgb(pixel));
        }
    }
    Some(img)
}

/// Rescale each image of a flattened BCHW batch to [0, 1] using its own min and max.
///
/// Constant images map to 0.
pub fn normalize_each(data: &mut [f32], batch: usize) {
    if batch == 0 {
        return;
    }
    let per_image = data.len() / batch;
    for image in data.chunks_mut(per_image.max(1)) {
        let (low, high) = image
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let range = (high - low).max(1e-5);
        for value in image.iter_mut() {
            *value = (value.clamp(low, high) - low) / range;
        }
    }
}

/// Arrange a flattened BCHW batch (values in [0, 1]) into one grid image.
///
/// Up to `per_row` images per row, separated and framed by `padding` black pixels.
pub fn make_grid(
    data: &[f32],
    dims: [usize; 4],
    per_row: usize,
    padding: usize,
) -> Option<RgbImage> {
    let [batch, channels, height, width] = dims;
    if batch == 0 || per_row == 0 {
        return None;
    }
    let per_image = channels * height * width;
    if data.len() != batch * per_image {
        return None;
    }

    let cols = per_row.min(batch);
    let rows = batch.div_ceil(cols);
    let cell_h = height + padding;
    let cell_w = width + padding;
    let mut grid = RgbImage::new(
        (cols * cell_w + padding) as u32,
        (rows * cell_h + padding) as u32,
    );

    for (idx, image) in data.chunks(per_image).enumerate() {
        let tile = chw_to_image(image, channels, height, width)?;
        let x = (idx % cols) * cell_w + padding;
        let y = (idx / cols) * cell_h + padding;
        grid.copy_from(&tile, x as u32, y as u32).ok()?;
    }
    Some(grid)
}
