//! 程序运行函数.

use std::env;
use std::path::PathBuf;
use std::thread;
use std::time::Instant;

use n2v_berry::data::save_preview;
use n2v_berry::metrics::psnr;
use n2v_berry::prelude::*;
use ndarray::{ArrayD, Axis, Ix2, IxDyn};

use crate::result::{AblationResult, SeamProfile};

const KERNEL: usize = 5;
const TILE: usize = 64;
const OVERLAPS: [usize; 5] = [0, 2, 4, 8, 16];

/// 设置后, 整幅推理结果与各重叠下的误差图会以 PNG 形式写入该目录.
const ENV_PREVIEW_DIR: &str = "N2V_SEAMS_PREVIEW_DIR";

/// 读取推理目录下的图像. 目录不存在时生成一幅带条纹的合成图像.
fn load_images() -> Vec<ArrayD<f32>> {
    if let Some(Ok(loader)) = utils::loader::predict_loader_from_env_or_home() {
        let images: Vec<_> = loader
            .filter_map(|(idx, r)| match r {
                Ok(a) => Some(a),
                Err(e) => {
                    log::warn!("Skipping file {idx}: {e}");
                    None
                }
            })
            .collect();
        if !images.is_empty() {
            return images;
        }
    }
    log::info!("No prediction data found, using a synthetic image");
    vec![ArrayD::from_shape_fn(IxDyn(&[1, 1, 200, 300]), |idx| {
        let (y, x) = (idx[2] as f32, idx[3] as f32);
        0.5 + 0.3 * (x * 0.11).sin() * (y * 0.07).cos() + 0.05 * ((x * 7.3 + y * 3.1).sin())
    })]
}

fn engine(tiling: Option<usize>, stats: Stats) -> Engine<LinearFilter> {
    let mut config = Configuration::default();
    config.experiment_name = "seams".to_string();
    config.prediction.batch_size = 16;
    if let Some(overlap) = tiling {
        config.prediction.tile_size = Some(vec![TILE, TILE]);
        config.prediction.tile_overlap = Some(vec![overlap, overlap]);
    }
    let model = LinearFilter::blind_spot_mean(2, KERNEL).unwrap();
    let mut engine = Engine::new(config, model).unwrap();
    engine.set_stats(stats);
    engine
}

fn dataset(images: &[ArrayD<f32>], overlap: Option<usize>) -> PredictDataset {
    let ds = PredictDataset::from_arrays(images.to_vec());
    match overlap {
        Some(o) => ds.with_tiling(vec![TILE, TILE], vec![o, o]),
        None => ds,
    }
}

fn save_plane(dir: &Option<PathBuf>, name: &str, a: &ArrayD<f32>) {
    let Some(dir) = dir else { return };
    let plane = a.index_axis(Axis(0), 0).into_dimensionality::<Ix2>();
    match plane {
        Ok(p) => {
            if let Err(e) = save_preview(p, None, dir.join(name)) {
                log::warn!("Cannot save {name}: {e}");
            }
        }
        Err(e) => log::warn!("Cannot preview {name}: {e}"),
    }
}

/// 实际运行.
pub fn run() -> AblationResult {
    let images = load_images();
    let stats = Stats::from_arrays(images.iter().map(|a| a.view())).unwrap();
    let preview_dir = env::var_os(ENV_PREVIEW_DIR).map(PathBuf::from);
    if let Some(d) = &preview_dir {
        std::fs::create_dir_all(d).unwrap();
    }

    let whole = engine(None, stats).predict(&dataset(&images, None)).unwrap();
    save_plane(&preview_dir, "whole.png", &whole.outputs[0]);

    println!("Running ablation studies on {} threads...", utils::cpus().min(OVERLAPS.len()));
    let data = thread::scope(|s| {
        let handles = OVERLAPS.map(|overlap| {
            let (images, whole, preview_dir) = (&images, &whole, &preview_dir);
            s.spawn(move || {
                let start = Instant::now();
                let tiled = engine(Some(overlap), stats)
                    .predict(&dataset(images, Some(overlap)))
                    .unwrap();
                let elapsed = start.elapsed();

                let mut profile = SeamProfile {
                    overlap,
                    tiles: tiled.tiles.len(),
                    min_psnr: f32::INFINITY,
                    elapsed,
                    ..Default::default()
                };
                let mut sum = 0.0f64;
                let mut count = 0usize;
                for (i, (w, t)) in whole.outputs.iter().zip(&tiled.outputs).enumerate() {
                    let err = (w - t).mapv(f32::abs);
                    for &e in err.iter() {
                        profile.max_abs_err = profile.max_abs_err.max(e);
                        profile.bad_pixels += usize::from(e > 1e-4);
                        sum += f64::from(e);
                    }
                    count += err.len();
                    let (lo, hi) = w.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                        (lo.min(v), hi.max(v))
                    });
                    let range = hi - lo;
                    profile.min_psnr = profile.min_psnr.min(psnr(w.view(), t.view(), range));
                    if i == 0 {
                        save_plane(preview_dir, &format!("err-overlap-{overlap}.png"), &err);
                    }
                }
                profile.mean_abs_err = sum / count.max(1) as f64;
                profile
            })
        });
        handles
            .into_iter()
            .map(|th| th.join().expect("Thread joining error"))
            .collect()
    });
    AblationResult::new(KERNEL, data)
}
