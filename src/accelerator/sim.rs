// 该文件是 Shanan （山南西风） 项目的一部分。
// src/accelerator/sim.rs - 主机端模拟 NPU 运行时
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

//! 模拟运行时的“权重文件”是一个 JSON 清单，描述输入输出张量以及输出内容。
//! 它让副本池、解码与调度逻辑可以在没有 NPU 的机器上运行。

use std::{sync::Arc, thread, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AcceleratorContext, AcceleratorError, NpuCore};
use crate::{
  quant::{dequantize_i8, dequantize_u8, quantize_i8, quantize_u8},
  tensor::{InputTensor, IoAttrs, OutputTensor, TensorAttrs, TensorData, TensorKind},
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimManifest {
  pub inputs: Vec<TensorAttrs>,
  pub outputs: Vec<SimOutput>,
  /// 每次推理的模拟耗时
  #[serde(default)]
  pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimOutput {
  #[serde(flatten)]
  pub attrs: TensorAttrs,
  /// 实数值输出，不足部分补 0
  #[serde(default)]
  pub values: Vec<f32>,
  /// 稀疏覆盖 `(下标, 实数值)`，在 `values` 之后生效
  #[serde(default)]
  pub sparse: Vec<(usize, f32)>,
}

impl SimManifest {
  pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec_pretty(self)
  }

  fn validate(&self) -> Result<(), String> {
    if self.inputs.is_empty() {
      return Err("模型没有输入张量".to_string());
    }
    for output in &self.outputs {
      if output.values.len() > output.attrs.n_elems() {
        return Err(format!(
          "输出 {} 的数据长度 {} 超过张量大小 {}",
          output.attrs.index,
          output.values.len(),
          output.attrs.n_elems()
        ));
      }
      if let Some(&(offset, _)) = output
        .sparse
        .iter()
        .find(|(offset, _)| *offset >= output.attrs.n_elems())
      {
        return Err(format!(
          "输出 {} 的稀疏下标 {} 越界",
          output.attrs.index, offset
        ));
      }
    }
    Ok(())
  }
}

pub struct SimContext {
  weights: Arc<SimManifest>,
  core: NpuCore,
  runs: u64,
}

impl SimContext {
  pub fn core(&self) -> NpuCore {
    self.core
  }

  pub fn runs(&self) -> u64 {
    self.runs
  }

  pub fn shares_weights_with(&self, other: &SimContext) -> bool {
    Arc::ptr_eq(&self.weights, &other.weights)
  }

  fn render_output(output: &SimOutput, want_float: bool) -> TensorData {
    let attrs = &output.attrs;
    let mut real = vec![0.0f32; attrs.n_elems()];
    real[..output.values.len()].copy_from_slice(&output.values);
    for &(offset, value) in &output.sparse {
      real[offset] = value;
    }
    let values = real.into_iter();
    let qp = attrs.quant();

    match (attrs.kind, want_float) {
      (TensorKind::Int8, false) => TensorData::Int8(
        values
          .map(|v| quantize_i8(v, qp.zero_point, qp.scale))
          .collect(),
      ),
      (TensorKind::UInt8, false) => TensorData::UInt8(
        values
          .map(|v| quantize_u8(v, qp.zero_point, qp.scale))
          .collect(),
      ),
      // 量化模型请求浮点输出时，得到的是量化后再反量化的数值
      (TensorKind::Int8, true) => TensorData::Float32(
        values
          .map(|v| dequantize_i8(quantize_i8(v, qp.zero_point, qp.scale), qp.zero_point, qp.scale))
          .collect(),
      ),
      (TensorKind::UInt8, true) => TensorData::Float32(
        values
          .map(|v| dequantize_u8(quantize_u8(v, qp.zero_point, qp.scale), qp.zero_point, qp.scale))
          .collect(),
      ),
      (TensorKind::Float32, _) => TensorData::Float32(values.collect()),
    }
  }
}

impl AcceleratorContext for SimContext {
  fn load(weights: &[u8]) -> Result<Self, AcceleratorError> {
    let manifest: SimManifest =
      serde_json::from_slice(weights).map_err(|e| AcceleratorError::Load(e.to_string()))?;
    manifest.validate().map_err(AcceleratorError::Load)?;
    debug!(
      "模拟 NPU 载入模型: {} 个输入, {} 个输出",
      manifest.inputs.len(),
      manifest.outputs.len()
    );
    Ok(SimContext {
      weights: Arc::new(manifest),
      core: NpuCore::Auto,
      runs: 0,
    })
  }

  fn duplicate(&self) -> Result<Self, AcceleratorError> {
    Ok(SimContext {
      weights: Arc::clone(&self.weights),
      core: NpuCore::Auto,
      runs: 0,
    })
  }

  fn bind_core(&mut self, core: NpuCore) -> Result<(), AcceleratorError> {
    self.core = core;
    Ok(())
  }

  fn query_io(&self) -> Result<IoAttrs, AcceleratorError> {
    Ok(IoAttrs {
      inputs: self.weights.inputs.clone(),
      outputs: self.weights.outputs.iter().map(|o| o.attrs.clone()).collect(),
    })
  }

  fn execute(
    &mut self,
    inputs: &[InputTensor<'_>],
    want_float: bool,
  ) -> Result<Vec<OutputTensor>, AcceleratorError> {
    if inputs.len() != self.weights.inputs.len() {
      return Err(AcceleratorError::Execute(format!(
        "预期 {} 个输入, 实际为 {}",
        self.weights.inputs.len(),
        inputs.len()
      )));
    }

    for (input, attrs) in inputs.iter().zip(self.weights.inputs.iter()) {
      if input.kind != TensorKind::UInt8 {
        return Err(AcceleratorError::Execute(format!(
          "输入 {} 仅支持 UINT8, 实际为 {}",
          input.index, input.kind
        )));
      }
      if input.data.len() != attrs.n_elems() {
        return Err(AcceleratorError::Execute(format!(
          "输入 {} 大小不匹配: 期望 {}, 实际 {}",
          input.index,
          attrs.n_elems(),
          input.data.len()
        )));
      }
    }

    if self.weights.latency_ms > 0 {
      thread::sleep(Duration::from_millis(self.weights.latency_ms));
    }
    self.runs += 1;

    Ok(
      self
        .weights
        .outputs
        .iter()
        .map(|output| OutputTensor {
          index: output.attrs.index,
          data: Self::render_output(output, want_float),
        })
        .collect(),
    )
  }
}

impl Drop for SimContext {
  fn drop(&mut self) {
    debug!("释放模拟 NPU 上下文 (core {}, 共推理 {} 次)", self.core, self.runs);
  }
}
