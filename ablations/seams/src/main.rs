//! 分块推理的拼接缝消融实验.
//!
//! 对同一组图像分别做整幅推理和不同重叠大小的分块推理, 比较两者的差异.
//! 模型为不可训练的盲点均值滤波器, 因此两者的差异只来自 tile 边界处的填充.

mod result;
mod runner;

fn main() {
    simple_logger::init_with_level(log::Level::Info).unwrap();
    runner::run().analyze();
}
