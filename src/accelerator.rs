// 该文件是 Shanan （山南西风） 项目的一部分。
// src/accelerator.rs - NPU 运行时接口
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

use crate::tensor::{InputTensor, IoAttrs, OutputTensor};

mod sim;
pub use self::sim::{SimContext, SimManifest, SimOutput};

#[cfg(feature = "rknpu")]
mod rknn;
#[cfg(feature = "rknpu")]
pub use self::rknn::RknpuContext;

#[derive(Error, Debug)]
pub enum AcceleratorError {
  #[error("模型加载失败: {0}")]
  Load(String),
  #[error("上下文复制失败: {0}")]
  Duplicate(String),
  #[error("绑定 NPU 核心 {core} 失败: {reason}")]
  BindCore { core: NpuCore, reason: String },
  #[error("张量属性查询失败: {0}")]
  Query(String),
  #[error("推理执行失败: {0}")]
  Execute(String),
  #[error("获取输出失败: {0}")]
  Output(String),
}

/// NPU 逻辑核心
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NpuCore {
  Auto,
  Core0,
  Core1,
  Core2,
}

impl NpuCore {
  /// RK3588 上的物理核心数
  pub const PHYSICAL_CORES: usize = 3;

  pub fn from_index(index: usize) -> Self {
    match index {
      0 => NpuCore::Core0,
      1 => NpuCore::Core1,
      2 => NpuCore::Core2,
      _ => NpuCore::Auto,
    }
  }

  pub fn index(&self) -> Option<usize> {
    match self {
      NpuCore::Core0 => Some(0),
      NpuCore::Core1 => Some(1),
      NpuCore::Core2 => Some(2),
      NpuCore::Auto => None,
    }
  }
}

impl std::fmt::Display for NpuCore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self.index() {
      Some(i) => write!(f, "{}", i),
      None => write!(f, "auto"),
    }
  }
}

/// 按轮询顺序分配 NPU 核心，每个副本集合独享一个
#[derive(Debug)]
pub struct CoreAllocator {
  next: AtomicUsize,
  core_count: usize,
}

impl CoreAllocator {
  pub fn new(core_count: usize) -> Self {
    Self {
      next: AtomicUsize::new(0),
      core_count,
    }
  }

  pub fn core_count(&self) -> usize {
    self.core_count
  }

  pub fn next_core(&self) -> NpuCore {
    if self.core_count == 0 {
      return NpuCore::Auto;
    }
    let index = self.next.fetch_add(1, Ordering::SeqCst) % self.core_count;
    NpuCore::from_index(index)
  }
}

impl Default for CoreAllocator {
  fn default() -> Self {
    Self::new(NpuCore::PHYSICAL_CORES)
  }
}

/// 一个已加载（或共享权重）的网络上下文。
///
/// 上下文由单个模型独占；`duplicate` 产生的新上下文与源上下文共享权重内存，
/// 但拥有独立的执行状态，可以先于源上下文释放。释放即 `Drop`。
pub trait AcceleratorContext: Send + Sized {
  /// 加载完整权重
  fn load(weights: &[u8]) -> Result<Self, AcceleratorError>;

  /// 复用已加载的权重创建新上下文
  fn duplicate(&self) -> Result<Self, AcceleratorError>;

  fn bind_core(&mut self, core: NpuCore) -> Result<(), AcceleratorError>;

  fn query_io(&self) -> Result<IoAttrs, AcceleratorError>;

  /// 输入、输出张量数量。只能给出数量的运行时需要覆盖此方法。
  fn io_counts(&self) -> Result<(usize, usize), AcceleratorError> {
    self
      .query_io()
      .map(|io| (io.inputs.len(), io.outputs.len()))
  }

  /// 绑定输入并执行一次前向推理。`want_float` 为真时输出转换为 f32，
  /// 否则按输出张量的原始类型返回。
  fn execute(
    &mut self,
    inputs: &[InputTensor<'_>],
    want_float: bool,
  ) -> Result<Vec<OutputTensor>, AcceleratorError>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_core_allocator_round_robin() {
    let cores = CoreAllocator::default();
    let got: Vec<NpuCore> = (0..7).map(|_| cores.next_core()).collect();
    assert_eq!(
      got,
      vec![
        NpuCore::Core0,
        NpuCore::Core1,
        NpuCore::Core2,
        NpuCore::Core0,
        NpuCore::Core1,
        NpuCore::Core2,
        NpuCore::Core0
      ]
    );
  }

  #[test]
  fn test_core_allocator_is_scoped_per_instance() {
    let a = CoreAllocator::new(3);
    let b = CoreAllocator::new(3);
    assert_eq!(a.next_core(), NpuCore::Core0);
    assert_eq!(a.next_core(), NpuCore::Core1);
    assert_eq!(b.next_core(), NpuCore::Core0);
  }

  #[test]
  fn test_extra_cores_map_to_auto() {
    let cores = CoreAllocator::new(4);
    let got: Vec<NpuCore> = (0..4).map(|_| cores.next_core()).collect();
    assert_eq!(got[3], NpuCore::Auto);
    assert_eq!(CoreAllocator::new(0).next_core(), NpuCore::Auto);
  }
}
