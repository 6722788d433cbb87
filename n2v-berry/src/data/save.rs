//! 结果的持久化存储.

use std::path::Path;

use image::ImageResult;
use ndarray::{ArrayView2, ArrayViewD};

use super::DisplayWindow;
use crate::Result;

/// 将单个 2D 平面以 8-bit PNG 形式保存, 便于肉眼检查去噪效果.
///
/// `window` 为 `None` 时, 使用平面自身的最小/最大值; 常数平面保存为全黑.
pub fn save_preview<P: AsRef<Path>>(
    plane: ArrayView2<f32>,
    window: Option<DisplayWindow>,
    path: P,
) -> ImageResult<()> {
    let (height, width) = plane.dim();
    let window = window.or_else(|| DisplayWindow::from_min_max(plane.view()));
    let mut buf = image::GrayImage::new(width as u32, height as u32);
    for ((h, w), &v) in plane.indexed_iter() {
        let gray = window.and_then(|win| win.eval(v)).unwrap_or(0);
        buf.put_pixel(w as u32, h as u32, image::Luma([gray]));
    }
    buf.save(path)
}

/// 按原样将数组保存为 `.npy`.
pub fn save_npy<P: AsRef<Path>>(path: P, array: ArrayViewD<f32>) -> Result<()> {
    ndarray_npy::write_npy(path, &array)?;
    Ok(())
}
