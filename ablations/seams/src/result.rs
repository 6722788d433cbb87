//! 实验结果.

use std::io::{self, Write};
use std::time::Duration;

/// 单个重叠大小的测量结果.
#[derive(Clone, Debug, Default)]
pub struct SeamProfile {
    /// 每个空间轴上的重叠像素数.
    pub overlap: usize,

    /// tile 总数.
    pub tiles: usize,

    /// 与整幅推理的最大绝对误差.
    pub max_abs_err: f32,

    /// 与整幅推理的平均绝对误差.
    pub mean_abs_err: f64,

    /// 以整幅推理为参考的最低 PSNR.
    pub min_psnr: f32,

    /// 误差超过阈值的像素数.
    pub bad_pixels: usize,

    /// 推理与拼接耗时.
    pub elapsed: Duration,
}

/// 将 `p` 的结果写进 `w` 中.
fn describe_into<W: Write>(p: &SeamProfile, w: &mut W) -> io::Result<()> {
    const S4: &str = "    ";

    writeln!(w, "Overlap {}:", p.overlap)?;
    writeln!(w, "{S4}Tiles: {}", p.tiles)?;
    writeln!(w, "{S4}Max abs error: {:.6}", p.max_abs_err)?;
    writeln!(w, "{S4}Mean abs error: {:.3e}", p.mean_abs_err)?;
    writeln!(w, "{S4}Min PSNR: {:.2} dB", p.min_psnr)?;
    writeln!(w, "{S4}Pixels off by more than 1e-4: {}", p.bad_pixels)?;
    write!(w, "{S4}Time: {} us", p.elapsed.as_micros())?;
    Ok(())
}

/// 消融实验最终结果.
pub struct AblationResult {
    kernel: usize,
    data: Vec<SeamProfile>,
}

impl AblationResult {
    pub fn new(kernel: usize, data: Vec<SeamProfile>) -> Self {
        Self { kernel, data }
    }

    /// 输出运行结果. 重叠不小于卷积核半径两倍时应当没有拼接缝.
    pub fn analyze(&self) {
        utils::sep();
        println!("Blind-spot mean filter, kernel {}", self.kernel);
        utils::sep();
        let mut buf = Vec::with_capacity(512);

        for profile in self.data.iter() {
            describe_into(profile, &mut buf).unwrap();
            println!("{}", String::from_utf8_lossy(&buf));
            buf.clear();

            if profile.overlap >= self.kernel / 2 * 2 && profile.bad_pixels > 0 {
                println!("Unexpected seams at overlap {}", profile.overlap);
            }
            utils::sep();
        }
    }
}
