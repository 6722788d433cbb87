use ndarray::{ArrayD, Axis, IxDyn, OwnedRepr};
use ndarray_npy::{NpzReader, ReadNpzError};
use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::axes::Axes;

/// 打开 `NpzArchive` 错误.
#[derive(Debug)]
pub enum OpenArchiveError {
    /// workers 太大. 最多支持 64.
    TooManyWorkers(u32),

    /// 打开 npz 文件错误.
    ReadNpzError(ReadNpzError),

    /// 其他底层 I/O 错误.
    IoError(std::io::Error),
}

impl From<OpenArchiveError> for crate::Error {
    fn from(e: OpenArchiveError) -> Self {
        match e {
            OpenArchiveError::TooManyWorkers(n) => Self::Config(format!("at most {n} npz workers")),
            OpenArchiveError::ReadNpzError(e) => e.into(),
            OpenArchiveError::IoError(e) => e.into(),
        }
    }
}

/// Npz 文件归档.
///
/// 该结构可用于建模硬盘上以单个压缩文件存储的多幅图像 (每个条目一幅, 均为 `f32`).
/// 多个读取通道使得并行的数据集构建不会在同一把锁上排队.
pub struct NpzArchive {
    entries: Vec<Mutex<NpzReader<File>>>,
    turn: AtomicUsize,
}

impl NpzArchive {
    /// 初始化.
    ///
    /// `workers` 指定了底层工作通道的个数, 最大为 64. 系统会从路径 `p` 打开文件
    /// `workers` 次, 并为每个打开通道指定一个排他入口点.
    pub fn new<P: AsRef<Path>>(workers: NonZeroUsize, p: P) -> Result<Self, OpenArchiveError> {
        let workers = workers.get();
        if workers > 64 {
            return Err(OpenArchiveError::TooManyWorkers(64));
        }
        let mut v = Vec::with_capacity(workers);
        for _ in 0..workers {
            let file = OpenOptions::new()
                .read(true)
                .open(p.as_ref())
                .map_err(OpenArchiveError::IoError)?;
            v.push(Mutex::new(
                NpzReader::new(file).map_err(OpenArchiveError::ReadNpzError)?,
            ));
        }
        Ok(Self {
            entries: v,
            turn: AtomicUsize::new(0),
        })
    }

    /// 通过 npz 索引文件名 `name` 获取原始图像.
    pub fn array_by_name(&self, name: &str) -> Result<ArrayD<f32>, ReadNpzError> {
        self.next_entry().by_name::<OwnedRepr<f32>, IxDyn>(name)
    }

    /// 通过 npz 数值索引获取原始图像.
    pub fn array_by_index(&self, index: usize) -> Result<ArrayD<f32>, ReadNpzError> {
        self.next_entry().by_index::<OwnedRepr<f32>, IxDyn>(index)
    }

    /// 获取底层 npz 文件包含的所有文件名.
    pub fn names(&self) -> Result<Vec<String>, ReadNpzError> {
        self.next_entry().names()
    }

    /// 读取全部图像并规范化为 `(N, C, [Z], Y, X)`. 按 npz 内部顺序返回.
    pub fn normalized_arrays(&self, axes: &Axes) -> crate::Result<Vec<ArrayD<f32>>> {
        (0..self.array_len())
            .map(|i| axes.normalize(self.array_by_index(i)?))
            .collect()
    }

    /// 将全部条目沿新的第 0 轴堆叠, 各条目形状必须一致. 只有一个条目时原样返回.
    pub fn stacked(&self) -> crate::Result<ArrayD<f32>> {
        let mut arrays = (0..self.array_len())
            .map(|i| self.array_by_index(i))
            .collect::<Result<Vec<_>, _>>()?;
        match arrays.len() {
            0 => Err(crate::Error::Empty("empty npz archive".to_string())),
            1 => Ok(arrays.remove(0)),
            _ => {
                let views: Vec<_> = arrays.iter().map(|a| a.view()).collect();
                Ok(ndarray::stack(Axis(0), &views)?)
            }
        }
    }

    /// 工作通道个数.
    #[inline]
    pub fn worker_len(&self) -> usize {
        self.entries.len()
    }

    /// 获取底层 npz 文件的图像个数.
    pub fn array_len(&self) -> usize {
        self.next_entry().len()
    }

    fn next_entry(&self) -> MutexGuard<'_, NpzReader<File>> {
        let slot = self.turn.fetch_add(1, Ordering::Relaxed) % self.worker_len();
        // 持锁线程 panic 后读取器本身仍然可用.
        self.entries[slot]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::NpzArchive;
    use crate::axes::Axes;
    use crate::data::tests::temp_dir;
    use ndarray::{Array2, Array3};
    use ndarray_npy::NpzWriter;
    use std::fs::File;
    use std::num::NonZeroUsize;

    #[test]
    fn test_npz_archive_roundtrip_shapes() {
        let dir = temp_dir("npz");
        let path = dir.join("images.npz");
        {
            let mut w = NpzWriter::new(File::create(&path).unwrap());
            w.add_array("a", &Array2::<f32>::ones((8, 9))).unwrap();
            w.add_array("b", &Array3::<f32>::zeros((2, 8, 9))).unwrap();
            w.finish().unwrap();
        }

        let archive = NpzArchive::new(NonZeroUsize::new(2).unwrap(), &path).unwrap();
        assert_eq!(archive.worker_len(), 2);
        assert_eq!(archive.array_len(), 2);
        assert_eq!(archive.names().unwrap().len(), 2);
        assert_eq!(archive.array_by_index(0).unwrap().shape(), &[8, 9]);

        let arrays = archive.normalized_arrays(&Axes::new("YX").unwrap());
        // 第二幅图多出一个非单例轴, 与 "YX" 不一致.
        assert!(arrays.is_err());

        let sample = archive.array_by_index(1).unwrap();
        let sample = Axes::new("SYX").unwrap().normalize(sample).unwrap();
        assert_eq!(sample.shape(), &[2, 1, 8, 9]);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_stacked() {
        let dir = temp_dir("npz-stacked");
        let path = dir.join("images.npz");
        {
            let mut w = NpzWriter::new(File::create(&path).unwrap());
            w.add_array("a", &Array2::<f32>::ones((8, 9))).unwrap();
            w.add_array("b", &Array2::<f32>::zeros((8, 9))).unwrap();
            w.finish().unwrap();
        }
        let archive = NpzArchive::new(NonZeroUsize::MIN, &path).unwrap();
        let s = archive.stacked().unwrap();
        assert_eq!(s.shape(), &[2, 8, 9]);
        assert_eq!(s[[0, 0, 0]], 1.0);

        // 经 `read_array` 按 "SYX" 读取.
        let a = crate::data::read_array(&path, &Axes::new("SYX").unwrap()).unwrap();
        assert_eq!(a.shape(), &[2, 1, 8, 9]);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_too_many_workers() {
        let r = NpzArchive::new(NonZeroUsize::new(65).unwrap(), "/nonexistent.npz");
        assert!(r.is_err());
    }
}
