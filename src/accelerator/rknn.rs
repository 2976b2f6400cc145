// 该文件是 Shanan （山南西风） 项目的一部分。
// src/accelerator/rknn.rs - 基于 rknpu 的板端 NPU 运行时
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

//! rknpu 只提供输入输出数量，不提供张量属性，张量布局需通过模型 URL 的
//! `layout` 参数给出。运行时也没有上下文复制与核心掩码接口，
//! 因此只支持独立权重副本，核心由驱动自动调度。

use rknpu::{Context, InitFlags, TensorFormat, TensorType};
use tracing::{debug, error, info};

use super::{AcceleratorContext, AcceleratorError, NpuCore};
use crate::tensor::{InputTensor, IoAttrs, OutputTensor, TensorData, TensorKind, TensorLayout};

pub struct RknpuContext {
  context: Context,
  num_outputs: usize,
}

// SAFETY: 上下文只被一个线程持有，推理需要 `&mut self`，且未实现 Sync
unsafe impl Send for RknpuContext {}

impl AcceleratorContext for RknpuContext {
  fn load(weights: &[u8]) -> Result<Self, AcceleratorError> {
    info!("创建 RKNN 推理上下文");
    let context = Context::new(weights, InitFlags::default())
      .map_err(|e| AcceleratorError::Load(e.to_string()))?;

    match context.sdk_version() {
      Ok(version) => {
        if let Ok(api_ver) = version.api_version() {
          debug!("模型 API 版本: {}", api_ver);
        }
        if let Ok(drv_ver) = version.driver_version() {
          debug!("模型驱动版本: {}", drv_ver);
        }
      }
      Err(e) => {
        error!("查询 SDK 版本失败: {}", e);
        return Err(AcceleratorError::Load(format!("无法查询 SDK 版本: {}", e)));
      }
    }

    let num_outputs = context
      .num_outputs()
      .map_err(|e| AcceleratorError::Query(format!("无法获取输出数量: {}", e)))?
      as usize;
    Ok(RknpuContext {
      context,
      num_outputs,
    })
  }

  fn duplicate(&self) -> Result<Self, AcceleratorError> {
    Err(AcceleratorError::Duplicate(
      "rknpu 运行时不支持共享权重, 请使用独立权重副本".to_string(),
    ))
  }

  fn bind_core(&mut self, core: NpuCore) -> Result<(), AcceleratorError> {
    match core {
      NpuCore::Auto => Ok(()),
      _ => Err(AcceleratorError::BindCore {
        core,
        reason: "rknpu 运行时不支持指定核心, 请设置 cores=0".to_string(),
      }),
    }
  }

  fn query_io(&self) -> Result<IoAttrs, AcceleratorError> {
    Err(AcceleratorError::Query(
      "rknpu 运行时不提供张量属性, 请通过 layout 参数给出".to_string(),
    ))
  }

  fn io_counts(&self) -> Result<(usize, usize), AcceleratorError> {
    let num_inputs = self
      .context
      .num_inputs()
      .map_err(|e| AcceleratorError::Query(format!("无法获取输入数量: {}", e)))?;
    Ok((num_inputs as usize, self.num_outputs))
  }

  /// 输出总是以 f32 取回，量化输出由运行时反量化
  fn execute(
    &mut self,
    inputs: &[InputTensor<'_>],
    want_float: bool,
  ) -> Result<Vec<OutputTensor>, AcceleratorError> {
    for input in inputs {
      if input.kind != TensorKind::UInt8 {
        return Err(AcceleratorError::Execute(format!(
          "输入 {} 类型 {} 不受支持",
          input.index, input.kind
        )));
      }
      let format = match input.layout {
        TensorLayout::Nhwc => TensorFormat::NHWC,
        TensorLayout::Nchw => TensorFormat::NCHW,
      };
      self
        .context
        .set_input(input.index as _, input.data, format, TensorType::UInt8)
        .map_err(|e| AcceleratorError::Execute(format!("设置输入 {} 失败: {}", input.index, e)))?;
    }

    self
      .context
      .run()
      .map_err(|e| AcceleratorError::Execute(e.to_string()))?;

    if !want_float {
      debug!("rknpu 运行时以浮点形式返回量化输出");
    }
    let output = self
      .context
      .get_outputs()
      .map_err(|e| AcceleratorError::Output(e.to_string()))?;

    (0..self.num_outputs)
      .map(|i| {
        let data = output
          .get_f32(i)
          .map_err(|e| AcceleratorError::Output(format!("获取第 {} 个输出失败: {}", i, e)))?;
        Ok(OutputTensor {
          index: i as u32,
          data: TensorData::Float32(data.to_vec()),
        })
      })
      .collect()
  }
}
