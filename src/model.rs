// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 检测模型与推理结果
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

use thiserror::Error;

use crate::{
  accelerator::AcceleratorError,
  decode::{Candidate, QuantSlice},
  quant::{QuantElem, QuantParams},
  tensor::{IoAttrs, ModelGeometry, OutputTensor, TensorAttrs, TensorKind},
};

mod detector;
mod yolo11;
mod yolov5;

pub use self::detector::{Detector, DetectorBuilder};

/// 单次推理最多保留的检测框数量
pub const OBJ_NUMB_MAX_SIZE: usize = 128;

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&mut self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 推理错误的严重程度。非致命错误只影响当次调用。
pub trait InferError: std::error::Error + Send + Sync + 'static {
  fn is_fatal(&self) -> bool {
    true
  }
}

impl InferError for ModelError {
  fn is_fatal(&self) -> bool {
    ModelError::is_fatal(self)
  }
}

/// 模型构造时给定，生命周期内不变
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionParams {
  pub confidence: f32,
  pub nms_threshold: f32,
  pub class_num: usize,
  pub pad_color: u8,
  /// 张量布局描述，运行时无法查询张量属性时使用
  pub layout: Option<IoAttrs>,
}

impl Default for DetectionParams {
  fn default() -> Self {
    Self {
      confidence: 0.25,
      nms_threshold: 0.45,
      class_num: 80,
      pad_color: 114,
      layout: None,
    }
  }
}

/// 原图像素坐标系下的矩形
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageRect {
  pub left: i32,
  pub top: i32,
  pub right: i32,
  pub bottom: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem {
  pub class_id: usize,
  pub score: f32,
  pub bbox: ImageRect,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

impl DetectResult {
  pub fn count(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("模型加载错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("NPU 错误: {0}")]
  Accelerator(#[from] AcceleratorError),
  #[error("模型无效: {0}")]
  Invalid(String),
  #[error("模型路径错误: {0}")]
  ModelPath(String),
}

impl ModelError {
  pub fn invalid(msg: impl Into<String>) -> Self {
    ModelError::Invalid(msg.into())
  }

  /// 推理执行与取输出失败只影响当次调用，其余错误说明模型或配置不可用
  pub fn is_fatal(&self) -> bool {
    !matches!(
      self,
      ModelError::Accelerator(AcceleratorError::Execute(_) | AcceleratorError::Output(_))
    )
  }
}

/// 检测器家族，决定输出布局与解码方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
  /// anchor-free，DFL 回归
  Yolo11,
  /// anchor-based，sigmoid 回归
  Yolov5,
}

impl ModelFamily {
  pub fn scheme(&self) -> &'static str {
    match self {
      ModelFamily::Yolo11 => "yolo11",
      ModelFamily::Yolov5 => "yolov5",
    }
  }

  pub fn from_scheme(scheme: &str) -> Option<Self> {
    match scheme {
      "yolo11" => Some(ModelFamily::Yolo11),
      "yolov5" => Some(ModelFamily::Yolov5),
      _ => None,
    }
  }

  fn validate(&self, io: &IoAttrs, params: &DetectionParams) -> Result<(), ModelError> {
    match self {
      ModelFamily::Yolo11 => yolo11::validate(io, params),
      ModelFamily::Yolov5 => yolov5::validate(io, params),
    }
  }

  /// 按输出元素类型分派到对应的解码实现
  fn decode(
    &self,
    heads: &HeadOutputs<'_>,
    geometry: ModelGeometry,
    params: &DetectionParams,
    out: &mut Vec<Candidate>,
  ) -> usize {
    match heads.kind() {
      Some(TensorKind::Int8) => self.decode_as::<i8>(heads, geometry, params, out),
      Some(TensorKind::UInt8) => self.decode_as::<u8>(heads, geometry, params, out),
      Some(TensorKind::Float32) => self.decode_as::<f32>(heads, geometry, params, out),
      None => 0,
    }
  }

  fn decode_as<T: QuantElem>(
    &self,
    heads: &HeadOutputs<'_>,
    geometry: ModelGeometry,
    params: &DetectionParams,
    out: &mut Vec<Candidate>,
  ) -> usize {
    match self {
      ModelFamily::Yolo11 => yolo11::decode::<T>(heads, geometry, params, out),
      ModelFamily::Yolov5 => yolov5::decode::<T>(heads, geometry, params, out),
    }
  }
}

impl std::fmt::Display for ModelFamily {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.scheme())
  }
}

/// 一次推理的全部输出及其属性
pub(crate) struct HeadOutputs<'a> {
  outputs: &'a [OutputTensor],
  attrs: &'a [TensorAttrs],
  quantized: bool,
}

impl<'a> HeadOutputs<'a> {
  pub(crate) fn new(outputs: &'a [OutputTensor], attrs: &'a [TensorAttrs], quantized: bool) -> Self {
    Self {
      outputs,
      attrs,
      quantized,
    }
  }

  fn len(&self) -> usize {
    self.outputs.len()
  }

  fn kind(&self) -> Option<TensorKind> {
    self.outputs.first().map(|o| o.data.kind())
  }

  fn attrs(&self, i: usize) -> Option<&'a TensorAttrs> {
    self.attrs.get(i)
  }

  /// 取第 `i` 个输出。浮点输出已由运行时反量化，使用恒等参数。
  fn slice<T: QuantElem>(&self, i: usize) -> Option<QuantSlice<'a, T>> {
    let output = self.outputs.get(i)?;
    let attrs = self.attrs.get(i)?;
    let Some(data) = T::view(&output.data) else {
      tracing::warn!(
        "输出 {} 类型为 {}, 与首个输出 {} 不一致",
        i,
        output.data.kind(),
        T::KIND
      );
      return None;
    };
    let qp = if self.quantized {
      attrs.quant()
    } else {
      QuantParams::IDENTITY
    };
    Some(QuantSlice::new(data, qp))
  }
}
