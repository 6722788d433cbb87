//! 轴描述与规范化.
//!
//! 原始数据可以是 `STCZYX` 的任意子集 (必须包含 `Y` 和 `X`), 顺序任意.
//! 规范化后统一为 `(N, C, [Z], Y, X)`, 其中 `S` 与 `T` 按 S 优先合并为 `N`.

use std::fmt;
use std::str::FromStr;

use ndarray::{ArrayD, Axis, IxDyn};
use serde::{Deserialize, Serialize};

use crate::consts::ALLOWED_AXES;
use crate::{Error, Result};

/// 原始数据的轴描述, 例如 `"YX"`, `"SZYX"`, `"TYXC"`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Axes {
    raw: String,
}

impl Axes {
    /// 解析轴描述.
    ///
    /// 只允许 `S T C Z Y X` 中的字符, 不允许重复, 必须包含 `Y` 和 `X`.
    pub fn new(axes: &str) -> Result<Self> {
        let raw = axes.trim().to_ascii_uppercase();
        let err = |reason: &'static str| Error::InvalidAxes {
            axes: axes.to_string(),
            reason,
        };

        if !(2..=ALLOWED_AXES.len()).contains(&raw.len()) {
            return Err(err("length must be between 2 and 6"));
        }
        if let Some(c) = raw.chars().find(|c| !ALLOWED_AXES.contains(*c)) {
            return Err(match c {
                'N' => err("`N` is reserved, use `S` or `T`"),
                _ => err("only `STCZYX` are allowed"),
            });
        }
        for (i, c) in raw.char_indices() {
            if raw[i + 1..].contains(c) {
                return Err(err("duplicated axis"));
            }
        }
        if !(raw.contains('Y') && raw.contains('X')) {
            return Err(err("`Y` and `X` are mandatory"));
        }

        Ok(Self { raw })
    }

    /// 最常见的单平面 `"YX"`.
    #[inline]
    pub fn yx() -> Self {
        Self {
            raw: "YX".to_string(),
        }
    }

    /// 原始描述字符串.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// 原始轴个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// 轴描述是否为空. 合法的 `Axes` 永远非空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// 是否包含给定轴.
    #[inline]
    pub fn contains(&self, axis: char) -> bool {
        self.raw.contains(axis)
    }

    /// 是否为 3D 空间数据 (包含 `Z`).
    #[inline]
    pub fn is_3d(&self) -> bool {
        self.contains('Z')
    }

    /// 空间维度个数, 2 或 3.
    #[inline]
    pub fn spatial_dims(&self) -> usize {
        if self.is_3d() {
            3
        } else {
            2
        }
    }

    /// 规范化后的维度个数, `N` 与 `C` 永远存在.
    #[inline]
    pub fn normalized_ndim(&self) -> usize {
        2 + self.spatial_dims()
    }

    /// 将原始轴排列成 `STCZYX` 相对顺序所需的置换.
    fn canonical_permutation(&self) -> Vec<usize> {
        ALLOWED_AXES
            .chars()
            .filter_map(|c| self.raw.find(c))
            .collect()
    }

    /// 将与本描述一致的原始数据转换为 `(N, C, [Z], Y, X)` 布局.
    ///
    /// 当数据维度多于轴描述时, 会先依次移除长度为 1 的轴.
    /// 若最终维度仍不一致, 返回 [`Error::Dimension`].
    pub fn normalize(&self, array: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let array = squeeze_to(array, self.len());
        if array.ndim() != self.len() {
            return Err(Error::Dimension {
                expected: format!("{} axes (`{}`)", self.len(), self.raw),
                shape: array.shape().to_vec(),
            });
        }

        let perm = self.canonical_permutation();
        let array = array.permuted_axes(perm.clone());

        // 置换后各轴的含义与长度.
        let named: Vec<(char, usize)> = perm
            .iter()
            .map(|&i| self.raw.as_bytes()[i] as char)
            .zip(array.shape().iter().copied())
            .collect();
        let len_of = |c: char| named.iter().find(|(n, _)| *n == c).map(|(_, l)| *l);

        let n = len_of('S').unwrap_or(1) * len_of('T').unwrap_or(1);
        let mut shape = vec![n, len_of('C').unwrap_or(1)];
        shape.extend(len_of('Z'));
        shape.extend(len_of('Y'));
        shape.extend(len_of('X'));

        let array = array.as_standard_layout().into_owned();
        Ok(array.into_shape(IxDyn(&shape))?)
    }
}

/// 移除长度为 1 的轴, 直到维度不超过 `ndim`.
fn squeeze_to(mut array: ArrayD<f32>, ndim: usize) -> ArrayD<f32> {
    while array.ndim() > ndim {
        match array.shape().iter().position(|&l| l == 1) {
            Some(i) => array = array.remove_axis(Axis(i)),
            None => break,
        }
    }
    array
}

impl FromStr for Axes {
    type Err = Error;

    #[inline]
    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for Axes {
    type Error = Error;

    #[inline]
    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl From<Axes> for String {
    #[inline]
    fn from(value: Axes) -> Self {
        value.raw
    }
}

impl fmt::Display for Axes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
