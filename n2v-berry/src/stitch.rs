//! 分块预测拼接.
//!
//! 每个 tile 只贡献 [`TileInfo::overlap_crop`] 部分, 写入原图的 [`TileInfo::stitch`] 位置.
//! 同一样本的各 tile 拼接区域互不相交且恰好覆盖原图, 因此无需加权平均,
//! 也不会出现接缝处的重复计数. 拼接器逐像素记录覆盖情况来校验这一点.

use ndarray::{ArrayD, ArrayViewD, Axis, Slice};

use crate::patch::TileInfo;
use crate::{Error, Result};

/// 单个样本的拼接器.
#[derive(Debug)]
pub struct Stitcher {
    output: ArrayD<f32>,
    covered: ArrayD<bool>,
    written: usize,
}

impl Stitcher {
    /// 为 `(C, [Z], Y, X)` 形状的样本预分配输出.
    pub fn new(array_shape: &[usize]) -> Self {
        let spatial = array_shape.get(1..).unwrap_or_default();
        Self {
            output: ArrayD::zeros(array_shape),
            covered: ArrayD::from_elem(spatial, false),
            written: 0,
        }
    }

    /// 输出形状.
    #[inline]
    pub fn shape(&self) -> &[usize] {
        self.output.shape()
    }

    /// 已写入的 (单通道) 像素个数.
    #[inline]
    pub fn written(&self) -> usize {
        self.written
    }

    /// 放入一个 tile 的预测结果.
    ///
    /// `tile` 的通道数必须与输出一致, 且空间形状足以容纳 `overlap_crop`;
    /// `stitch` 必须落在输出之内, 且不能与已写入的区域重叠.
    pub fn place(&mut self, tile: ArrayViewD<f32>, info: &TileInfo) -> Result<()> {
        if info.array_shape != self.output.shape() {
            return Err(Error::Stitch(format!(
                "tile belongs to an array of shape {:?}, stitcher holds {:?}",
                info.array_shape,
                self.output.shape()
            )));
        }
        let rank = info.stitch.len();
        if tile.ndim() != rank + 1
            || tile.shape()[0] != self.output.shape()[0]
            || info.overlap_crop.len() != rank
        {
            return Err(Error::Stitch(format!(
                "tile of shape {:?} does not fit output {:?}",
                tile.shape(),
                self.output.shape()
            )));
        }
        let fits = |(i, r): (usize, &std::ops::Range<usize>)| r.end <= tile.shape()[i + 1];
        if !info.overlap_crop.iter().enumerate().all(fits) {
            return Err(Error::Stitch(format!(
                "crop {:?} exceeds tile of shape {:?}",
                info.overlap_crop,
                tile.shape()
            )));
        }

        let inside = |(i, r): (usize, &std::ops::Range<usize>)| r.end <= self.output.shape()[i + 1];
        if !info.stitch.iter().enumerate().all(inside) {
            return Err(Error::Stitch(format!(
                "stitch region {:?} exceeds output of shape {:?}",
                info.stitch,
                self.output.shape()
            )));
        }

        let mut src = tile;
        let mut dst = self.output.view_mut();
        let mut cov = self.covered.view_mut();
        for (i, (crop, stitch)) in info.overlap_crop.iter().zip(&info.stitch).enumerate() {
            src.slice_axis_inplace(Axis(i + 1), Slice::from(crop.clone()));
            dst.slice_axis_inplace(Axis(i + 1), Slice::from(stitch.clone()));
            cov.slice_axis_inplace(Axis(i), Slice::from(stitch.clone()));
        }
        if src.shape() != dst.shape() {
            return Err(Error::Stitch(format!(
                "crop region {:?} differs from stitch region {:?}",
                src.shape(),
                dst.shape()
            )));
        }
        if cov.iter().any(|&c| c) {
            return Err(Error::Stitch(format!(
                "stitch region {:?} overlaps pixels already written",
                info.stitch
            )));
        }
        dst.assign(&src);
        cov.fill(true);
        self.written += cov.len();
        Ok(())
    }

    /// 完成拼接. 若仍有像素未被写入, 返回 [`Error::Stitch`].
    pub fn finish(self) -> Result<ArrayD<f32>> {
        let expected = self.covered.len();
        if self.written != expected || self.covered.iter().any(|&c| !c) {
            return Err(Error::Stitch(format!(
                "{} of {} pixels written",
                self.written, expected
            )));
        }
        Ok(self.output)
    }
}

/// 将按顺序排列的 tile 预测拼接为完整样本, 每个样本一个 `(C, [Z], Y, X)` 数组.
///
/// tile 必须按样本顺序给出, 每个样本以 `last_tile` 结束.
pub fn stitch_prediction(tiles: &[ArrayD<f32>], infos: &[TileInfo]) -> Result<Vec<ArrayD<f32>>> {
    if tiles.len() != infos.len() {
        return Err(Error::Stitch(format!(
            "{} tiles but {} tile infos",
            tiles.len(),
            infos.len()
        )));
    }

    let mut ans = Vec::new();
    let mut cur: Option<Stitcher> = None;
    for (tile, info) in tiles.iter().zip(infos) {
        if info.sample != ans.len() {
            return Err(Error::Stitch(format!(
                "expected a tile of sample {}, got sample {}",
                ans.len(),
                info.sample
            )));
        }
        let stitcher = cur.get_or_insert_with(|| Stitcher::new(&info.array_shape));
        stitcher.place(tile.view(), info)?;
        if info.last_tile {
            if let Some(s) = cur.take() {
                ans.push(s.finish()?);
            }
        }
    }
    if cur.is_some() {
        return Err(Error::Stitch("the last sample is incomplete".to_string()));
    }
    Ok(ans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::extract_tiles;
    use crate::patch::tests::ramp;

    fn roundtrip(shape: &[usize], tile: &[usize], overlap: &[usize]) {
        let a = ramp(shape);
        let (tiles, infos): (Vec<_>, Vec<_>) = extract_tiles(a.view(), tile, overlap).unwrap().unzip();
        let out = stitch_prediction(&tiles, &infos).unwrap();
        assert_eq!(out.len(), shape[0]);
        for (n, sample) in out.iter().enumerate() {
            assert_eq!(sample, &a.index_axis(Axis(0), n));
        }
    }

    #[test]
    fn test_roundtrip_2d() {
        roundtrip(&[2, 1, 37, 50], &[16, 16], &[4, 6]);
        roundtrip(&[1, 3, 20, 20], &[8, 32], &[2, 0]);
    }

    #[test]
    fn test_roundtrip_3d() {
        roundtrip(&[1, 2, 9, 17, 23], &[4, 8, 8], &[2, 4, 2]);
    }

    #[test]
    fn test_incomplete() {
        let a = ramp(&[1, 1, 20, 20]);
        let (tiles, infos): (Vec<_>, Vec<_>) = extract_tiles(a.view(), &[8, 8], &[2, 2]).unwrap().unzip();
        let n = tiles.len();
        assert!(stitch_prediction(&tiles[..n - 1], &infos[..n - 1]).is_err());

        let mut s = Stitcher::new(&[1, 20, 20]);
        s.place(tiles[0].view(), &infos[0]).unwrap();
        assert_eq!(s.written(), infos[0].stitch_len());
        assert!(s.finish().is_err());
    }

    #[test]
    fn test_out_of_order() {
        let a = ramp(&[2, 1, 16, 16]);
        let (mut tiles, mut infos): (Vec<_>, Vec<_>) =
            extract_tiles(a.view(), &[8, 8], &[2, 2]).unwrap().unzip();
        tiles.rotate_left(1);
        infos.rotate_left(1);
        let per_sample = infos.len() / 2;
        // 第一个样本的首块被移到了末尾.
        assert_eq!(infos[per_sample - 1].sample, 1);
        assert!(stitch_prediction(&tiles, &infos).is_err());
        assert!(stitch_prediction(&tiles[..1], &infos).is_err());
    }

    #[test]
    fn test_repeated_tile() {
        let a = ramp(&[1, 1, 16, 16]);
        let (tiles, infos): (Vec<_>, Vec<_>) = extract_tiles(a.view(), &[8, 8], &[0, 0]).unwrap().unzip();
        assert_eq!(tiles.len(), 4);

        // 同一块放置多次, 写入总数虽然凑够, 但另外三块从未写入.
        let mut s = Stitcher::new(&[1, 16, 16]);
        s.place(tiles[0].view(), &infos[0]).unwrap();
        for _ in 0..3 {
            assert!(s.place(tiles[0].view(), &infos[0]).is_err());
        }
        assert!(s.finish().is_err());

        let mut dup_tiles = tiles.clone();
        let mut dup_infos = infos.clone();
        dup_tiles[3] = tiles[0].clone();
        dup_infos[3].stitch = infos[0].stitch.clone();
        dup_infos[3].overlap_crop = infos[0].overlap_crop.clone();
        assert!(stitch_prediction(&dup_tiles, &dup_infos).is_err());
    }

    #[test]
    fn test_stitch_out_of_bounds() {
        let a = ramp(&[1, 1, 16, 16]);
        let (tiles, mut infos): (Vec<_>, Vec<_>) = extract_tiles(a.view(), &[8, 8], &[0, 0]).unwrap().unzip();
        infos[0].stitch[0] = 12..20;
        let mut s = Stitcher::new(&[1, 16, 16]);
        assert!(matches!(s.place(tiles[0].view(), &infos[0]), Err(Error::Stitch(_))));
    }

    #[test]
    fn test_shape_mismatch() {
        let a = ramp(&[1, 1, 16, 16]);
        let (tiles, infos): (Vec<_>, Vec<_>) = extract_tiles(a.view(), &[8, 8], &[2, 2]).unwrap().unzip();
        let mut s = Stitcher::new(&[2, 16, 16]);
        assert!(s.place(tiles[0].view(), &infos[0]).is_err());

        let mut s = Stitcher::new(&[1, 16, 16]);
        let small = ArrayD::<f32>::zeros(ndarray::IxDyn(&[1, 4, 4]));
        assert!(s.place(small.view(), &infos[0]).is_err());
    }
}
