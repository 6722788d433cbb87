//! 图像数据的读取、列举与统计.
//!
//! 支持的格式:
//!
//! 1. `.npy`: 任意维度数组, 元素类型可为 `f32`, `f64`, `u16`, `u8`;
//!    `.npz`: 形状相同的 `f32` 数组, 沿新的第 0 轴堆叠.
//! 2. `.nii`, `.nii.gz`: nifti 体数据, 读取后按 `(Z, Y, X)` 排列.
//! 3. `.tif`, `.tiff`: 灰度 tiff, 多页时按页堆叠为 `(页, Y, X)`;
//! 4. `.png`: 单平面图像, 彩色图像转为灰度.
//!
//! 像素值保持原始强度, 只转换为 `f32`.
//!
//! 读取后的数据都会经过 [`Axes::normalize`], 即为 `(N, C, [Z], Y, X)` 布局.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::BufReader;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use image::{DynamicImage, GenericImageView};
use ndarray::{Array2, ArrayD, IxDyn};
use nifti::{IntoNdArray, NiftiObject, ReaderOptions};

use crate::axes::Axes;
use crate::{Error, Result};

mod npz_archive;
mod save;
mod stats;
mod window;

pub use npz_archive::{NpzArchive, OpenArchiveError};
pub use save::{save_npy, save_preview};
pub use stats::{RunningStats, Stats};
pub use window::DisplayWindow;

/// 获取 `{用户主目录}/dataset` 目录下给定继续项组成的全路径.
pub fn home_dataset_dir_with<P: AsRef<Path>, I: IntoIterator<Item = P>>(it: I) -> Option<PathBuf> {
    let mut ans = dirs::home_dir()?;
    ans.push("dataset");
    ans.extend(it);
    Some(ans)
}

/// 本模块能识别的文件格式.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FileFormat {
    /// numpy `.npy`.
    Npy,

    /// numpy `.npz`.
    Npz,

    /// nifti `.nii` / `.nii.gz`.
    Nifti,

    /// tiff `.tif` / `.tiff`, 可以有多页.
    Tiff,

    /// 普通 2D 图像 `.png`.
    Plane,
}

impl FileFormat {
    /// 根据文件名判断格式.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".npy") {
            Some(Self::Npy)
        } else if name.ends_with(".npz") {
            Some(Self::Npz)
        } else if name.ends_with(".nii") || name.ends_with(".nii.gz") {
            Some(Self::Nifti)
        } else if name.ends_with(".tif") || name.ends_with(".tiff") {
            Some(Self::Tiff)
        } else if name.ends_with(".png") {
            Some(Self::Plane)
        } else {
            None
        }
    }
}

/// 列举数据文件.
///
/// 1. `path` 是文件时, 直接返回该文件;
/// 2. `path` 是目录时, 递归返回所有文件名包含 `.{extension}` 的文件, 按路径排序;
/// 3. 结果为空或 `path` 不存在时返回 [`Error::EmptyPath`].
pub fn list_files<P: AsRef<Path>>(path: P, extension: &str) -> Result<Vec<PathBuf>> {
    let path = path.as_ref();
    if path.is_file() {
        return Ok(vec![path.to_owned()]);
    }
    if !path.is_dir() {
        return Err(Error::EmptyPath(path.to_owned()));
    }

    let pattern = format!(".{}", extension.trim_start_matches('.'));
    let mut ans = Vec::new();
    let mut stack = vec![path.to_owned()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let p = entry?.path();
            if p.is_dir() {
                stack.push(p);
            } else if p
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.contains(&pattern))
            {
                ans.push(p);
            }
        }
    }

    if ans.is_empty() {
        return Err(Error::EmptyPath(path.to_owned()));
    }
    ans.sort();
    Ok(ans)
}

/// 检查训练文件与监督目标文件是否一一对应: 数量相同, 且文件名集合相同.
pub fn validate_files(train: &[PathBuf], target: &[PathBuf]) -> Result<()> {
    if train.len() != target.len() {
        return Err(Error::Mismatch(format!(
            "number of train files ({}) is not equal to the number of target files ({})",
            train.len(),
            target.len()
        )));
    }
    let names = |files: &[PathBuf]| -> BTreeSet<OsString> {
        files
            .iter()
            .filter_map(|f| f.file_name().map(|n| n.to_owned()))
            .collect()
    };
    if names(train) != names(target) {
        return Err(Error::Mismatch(
            "some filenames in train and target folders are not the same".to_string(),
        ));
    }
    Ok(())
}

/// 按原样读取文件内容, 不做轴规范化.
pub fn read_raw<P: AsRef<Path>>(path: P) -> Result<ArrayD<f32>> {
    let path = path.as_ref();
    match FileFormat::from_path(path) {
        Some(FileFormat::Npy) => read_npy_any(path),
        Some(FileFormat::Npz) => NpzArchive::new(NonZeroUsize::MIN, path)?.stacked(),
        Some(FileFormat::Nifti) => {
            let obj = ReaderOptions::new().read_file(path)?;
            // [X, Y, Z, ...] -> [..., Z, Y, X]
            let data = obj.into_volume().into_ndarray::<f32>()?.reversed_axes();
            Ok(data.as_standard_layout().into_owned())
        }
        Some(FileFormat::Tiff) => read_tiff(path),
        Some(FileFormat::Plane) => {
            let img = image::open(path)?;
            let (w, h) = GenericImageView::dimensions(&img);
            let (w, h) = (w as usize, h as usize);
            let data: Vec<f32> = match img {
                DynamicImage::ImageLuma16(buf) => buf.into_raw().into_iter().map(f32::from).collect(),
                other => other.into_luma8().into_raw().into_iter().map(f32::from).collect(),
            };
            Ok(Array2::from_shape_vec((h, w), data)?.into_dyn())
        }
        None => Err(Error::UnsupportedFile(path.to_owned())),
    }
}

/// 读取灰度 tiff 的全部页. 单页为 `(Y, X)`, 多页为 `(页, Y, X)`, 各页尺寸必须一致.
fn read_tiff(path: &Path) -> Result<ArrayD<f32>> {
    use tiff::decoder::{Decoder, DecodingResult};

    let mut decoder = Decoder::new(BufReader::new(File::open(path)?))?;
    let (w, h) = decoder.dimensions()?;
    let mut data = Vec::new();
    let mut pages = 0;
    loop {
        let page: Vec<f32> = match decoder.read_image()? {
            DecodingResult::U8(v) => v.into_iter().map(f32::from).collect(),
            DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
            DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::U64(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::I8(v) => v.into_iter().map(f32::from).collect(),
            DecodingResult::I16(v) => v.into_iter().map(f32::from).collect(),
            DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::I64(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::F32(v) => v,
            DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
            #[allow(unreachable_patterns)]
            _ => return Err(Error::UnsupportedFile(path.to_owned())),
        };
        // 多通道 (RGB 等) 页的采样数不等于像素数.
        if decoder.dimensions()? != (w, h) || page.len() != w as usize * h as usize {
            return Err(Error::Dimension {
                expected: format!("grayscale pages of {h} x {w}"),
                shape: vec![pages, page.len()],
            });
        }
        data.extend(page);
        pages += 1;
        if !decoder.more_images() {
            break;
        }
        decoder.next_image()?;
    }

    let (h, w) = (h as usize, w as usize);
    let shape = if pages == 1 { vec![h, w] } else { vec![pages, h, w] };
    Ok(ArrayD::from_shape_vec(IxDyn(&shape), data)?)
}

/// 依次尝试以若干常见元素类型读取 npy 文件.
fn read_npy_any(path: &Path) -> Result<ArrayD<f32>> {
    use ndarray_npy::{read_npy, ReadNpyError};

    macro_rules! try_read {
        ($($ty: ty),+) => {
            $(
                match read_npy::<_, ArrayD<$ty>>(path) {
                    Ok(a) => return Ok(a.mapv(|v| v as f32)),
                    Err(ReadNpyError::WrongDescriptor(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            )+
        };
    }

    try_read!(f32, f64, u16, u8, i32);
    // 让最后一次尝试给出真实的错误信息.
    Ok(read_npy::<_, ArrayD<f32>>(path)?)
}

/// 读取文件并规范化为 `(N, C, [Z], Y, X)`.
pub fn read_array<P: AsRef<Path>>(path: P, axes: &Axes) -> Result<ArrayD<f32>> {
    let path = path.as_ref();
    let raw = read_raw(path)?;
    log::debug!("Read {} with shape {:?}", path.display(), raw.shape());
    axes.normalize(raw)
}

/// 从文件列表创建数据加载器. 加载器按给定顺序迭代, 并在内部完成轴规范化.
pub fn file_loader<I: IntoIterator<Item = PathBuf>>(files: I, axes: Axes) -> FileLoader {
    let mut files_rev: Vec<(usize, PathBuf)> = files.into_iter().enumerate().collect();
    files_rev.reverse();
    FileLoader { files_rev, axes }
}

/// 数据文件加载器. 每次迭代读取一个文件.
#[derive(Debug)]
pub struct FileLoader {
    files_rev: Vec<(usize, PathBuf)>,
    axes: Axes,
}

impl Iterator for FileLoader {
    type Item = (usize, Result<ArrayD<f32>>);

    fn next(&mut self) -> Option<Self::Item> {
        let (idx, path) = self.files_rev.pop()?;
        Some((idx, read_array(&path, &self.axes)))
    }
}

impl ExactSizeIterator for FileLoader {
    #[inline]
    fn len(&self) -> usize {
        self.files_rev.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// 在系统临时目录下创建一个唯一的空目录.
    pub(crate) fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("n2v-berry-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&p);
        fs::create_dir_all(&p).unwrap();
        p
    }

    /// 初始化测试日志, 重复调用无副作用.
    pub(crate) fn init_logger() {
        let _ = simple_logger::init_with_level(log::Level::Debug);
    }

    #[test]
    fn test_file_format() {
        assert_eq!(FileFormat::from_path(Path::new("a/b.npy")), Some(FileFormat::Npy));
        assert_eq!(FileFormat::from_path(Path::new("b.nii.gz")), Some(FileFormat::Nifti));
        assert_eq!(FileFormat::from_path(Path::new("c.npz")), Some(FileFormat::Npz));
        assert_eq!(FileFormat::from_path(Path::new("B.TIF")), Some(FileFormat::Tiff));
        assert_eq!(FileFormat::from_path(Path::new("b.png")), Some(FileFormat::Plane));
        assert_eq!(FileFormat::from_path(Path::new("b.zarr")), None);
    }

    #[test]
    fn test_list_and_validate_files() {
        let dir = temp_dir("list");
        fs::create_dir_all(dir.join("sub")).unwrap();
        for p in ["b.npy", "a.npy", "sub/c.npy", "d.txt"] {
            fs::write(dir.join(p), b"").unwrap();
        }
        let files = list_files(&dir, "npy").unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|f| f.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["a.npy", "b.npy", "c.npy"]);

        assert!(list_files(&dir, "tif").is_err());
        assert!(validate_files(&files, &files).is_ok());
        assert!(validate_files(&files, &files[1..]).is_err());

        let mut renamed = files.clone();
        renamed[0] = dir.join("z.npy");
        assert!(validate_files(&files, &renamed).is_err());
        fs::remove_dir_all(dir).unwrap();
    }

    fn write_tiff(path: &Path, pages: &[Vec<u16>], h: u32, w: u32) {
        use tiff::encoder::{colortype, TiffEncoder};
        let mut enc = TiffEncoder::new(File::create(path).unwrap()).unwrap();
        for p in pages {
            enc.write_image::<colortype::Gray16>(w, h, p).unwrap();
        }
    }

    #[test]
    fn test_read_tiff_raw_intensity() {
        let dir = temp_dir("tiff");
        let path = dir.join("plane.tif");
        write_tiff(&path, &[vec![1000; 6 * 5]], 6, 5);
        let a = read_raw(&path).unwrap();
        assert_eq!(a.shape(), &[6, 5]);
        assert!(a.iter().all(|&v| v == 1000.0));

        // 与同样数据的 npy 文件一致.
        let npy = dir.join("plane.npy");
        ndarray_npy::write_npy(&npy, &Array2::<u16>::from_elem((6, 5), 1000)).unwrap();
        assert_eq!(read_raw(&npy).unwrap(), a);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_read_tiff_stack() {
        let dir = temp_dir("tiff-stack");
        let path = dir.join("stack.tif");
        let pages: Vec<Vec<u16>> = (0..3u16).map(|z| (0..4 * 7).map(|i| z * 100 + i).collect()).collect();
        write_tiff(&path, &pages, 4, 7);

        let a = read_array(&path, &Axes::new("ZYX").unwrap()).unwrap();
        assert_eq!(a.shape(), &[1, 1, 3, 4, 7]);
        assert_eq!(a[[0, 0, 2, 1, 3]], 210.0);
        assert!(read_array(&path, &Axes::yx()).is_err());
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_read_png_raw_intensity() {
        let dir = temp_dir("png");
        let path = dir.join("plane.png");
        let img = image::GrayImage::from_fn(5, 3, |x, y| image::Luma([(10 * y + x) as u8]));
        img.save(&path).unwrap();
        let a = read_raw(&path).unwrap();
        assert_eq!(a.shape(), &[3, 5]);
        assert_eq!(a[[2, 4]], 24.0);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_read_npy_and_loader() {
        let dir = temp_dir("read");
        let raw = ArrayD::from_shape_fn(IxDyn(&[6, 7]), |i| (i[0] * 7 + i[1]) as u16);
        let path = dir.join("img.npy");
        ndarray_npy::write_npy(&path, &raw).unwrap();

        let axes = Axes::new("YX").unwrap();
        let arr = read_array(&path, &axes).unwrap();
        assert_eq!(arr.shape(), &[1, 1, 6, 7]);
        assert_eq!(arr[[0, 0, 2, 3]], 17.0);

        let mut loader = file_loader([path.clone(), path], axes);
        assert_eq!(loader.len(), 2);
        let (idx, first) = loader.next().unwrap();
        assert_eq!(idx, 0);
        assert!(first.is_ok());
        assert_eq!(loader.next().unwrap().0, 1);
        assert!(loader.next().is_none());
        fs::remove_dir_all(dir).unwrap();
    }
}
