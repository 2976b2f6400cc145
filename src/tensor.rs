// 该文件是 Shanan （山南西风） 项目的一部分。
// src/tensor.rs - 张量属性与数据
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

use serde::{Deserialize, Serialize};

use crate::quant::QuantParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorKind {
  Int8,
  UInt8,
  Float32,
}

impl std::fmt::Display for TensorKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      TensorKind::Int8 => write!(f, "INT8"),
      TensorKind::UInt8 => write!(f, "UINT8"),
      TensorKind::Float32 => write!(f, "FP32"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantType {
  #[default]
  None,
  Affine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
  Nchw,
  Nhwc,
}

/// 张量属性，在模型初始化时查询一次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorAttrs {
  pub index: u32,
  #[serde(default)]
  pub name: String,
  pub dims: Vec<u32>,
  pub layout: TensorLayout,
  pub kind: TensorKind,
  #[serde(default)]
  pub qnt_type: QuantType,
  #[serde(default)]
  pub zero_point: i32,
  #[serde(default = "default_scale")]
  pub scale: f32,
}

fn default_scale() -> f32 {
  1.0
}

impl TensorAttrs {
  pub fn quant(&self) -> QuantParams {
    match self.qnt_type {
      QuantType::Affine => QuantParams::new(self.zero_point, self.scale),
      QuantType::None => QuantParams::IDENTITY,
    }
  }

  pub fn n_elems(&self) -> usize {
    self.dims.iter().map(|&d| d as usize).product()
  }

  /// 第 `i` 维，不存在时返回 0
  pub fn dim(&self, i: usize) -> usize {
    self.dims.get(i).copied().unwrap_or(0) as usize
  }

  /// 输出是否为仿射量化的整数张量
  pub fn is_affine_quantized(&self) -> bool {
    self.qnt_type == QuantType::Affine && matches!(self.kind, TensorKind::Int8 | TensorKind::UInt8)
  }
}

impl std::fmt::Display for TensorAttrs {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "index={}, name={}, dims={:?}, n_elems={}, fmt={:?}, type={}, qnt_type={:?}, zp={}, scale={}",
      self.index,
      self.name,
      self.dims,
      self.n_elems(),
      self.layout,
      self.kind,
      self.qnt_type,
      self.zero_point,
      self.scale
    )
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IoAttrs {
  pub inputs: Vec<TensorAttrs>,
  pub outputs: Vec<TensorAttrs>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
  Int8(Vec<i8>),
  UInt8(Vec<u8>),
  Float32(Vec<f32>),
}

impl TensorData {
  pub fn kind(&self) -> TensorKind {
    match self {
      TensorData::Int8(_) => TensorKind::Int8,
      TensorData::UInt8(_) => TensorKind::UInt8,
      TensorData::Float32(_) => TensorKind::Float32,
    }
  }

  pub fn len(&self) -> usize {
    match self {
      TensorData::Int8(v) => v.len(),
      TensorData::UInt8(v) => v.len(),
      TensorData::Float32(v) => v.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputTensor {
  pub index: u32,
  pub data: TensorData,
}

/// 送入 NPU 的输入缓冲
#[derive(Debug, Clone, Copy)]
pub struct InputTensor<'a> {
  pub index: u32,
  pub data: &'a [u8],
  pub layout: TensorLayout,
  pub kind: TensorKind,
}

/// 模型输入分辨率
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelGeometry {
  pub height: u32,
  pub width: u32,
  pub channels: u32,
}

impl ModelGeometry {
  /// 从输入张量属性推断，NCHW 为 `[n, c, h, w]`，NHWC 为 `[n, h, w, c]`
  pub fn from_input(attrs: &TensorAttrs) -> Option<Self> {
    if attrs.dims.len() != 4 {
      return None;
    }
    let geometry = match attrs.layout {
      TensorLayout::Nchw => ModelGeometry {
        channels: attrs.dims[1],
        height: attrs.dims[2],
        width: attrs.dims[3],
      },
      TensorLayout::Nhwc => ModelGeometry {
        height: attrs.dims[1],
        width: attrs.dims[2],
        channels: attrs.dims[3],
      },
    };
    Some(geometry)
  }

  pub fn input_size(&self) -> usize {
    self.height as usize * self.width as usize * self.channels as usize
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn attrs(dims: Vec<u32>, layout: TensorLayout) -> TensorAttrs {
    TensorAttrs {
      index: 0,
      name: "images".to_string(),
      dims,
      layout,
      kind: TensorKind::UInt8,
      qnt_type: QuantType::Affine,
      zero_point: 0,
      scale: 1.0 / 255.0,
    }
  }

  #[test]
  fn test_geometry_from_channel_first_and_last() {
    let nchw = ModelGeometry::from_input(&attrs(vec![1, 3, 480, 640], TensorLayout::Nchw)).unwrap();
    assert_eq!((nchw.height, nchw.width, nchw.channels), (480, 640, 3));

    let nhwc = ModelGeometry::from_input(&attrs(vec![1, 480, 640, 3], TensorLayout::Nhwc)).unwrap();
    assert_eq!((nhwc.height, nhwc.width, nhwc.channels), (480, 640, 3));
    assert_eq!(nhwc.input_size(), 480 * 640 * 3);

    assert!(ModelGeometry::from_input(&attrs(vec![640, 640], TensorLayout::Nhwc)).is_none());
  }

  #[test]
  fn test_quant_params_follow_qnt_type() {
    let mut a = attrs(vec![1, 255, 20, 20], TensorLayout::Nchw);
    a.kind = TensorKind::Int8;
    a.zero_point = -128;
    a.scale = 0.0039;
    assert!(a.is_affine_quantized());
    assert_eq!(a.quant(), QuantParams::new(-128, 0.0039));

    a.qnt_type = QuantType::None;
    assert!(!a.is_affine_quantized());
    assert_eq!(a.quant(), QuantParams::IDENTITY);
  }

  #[test]
  fn test_attrs_json_defaults() {
    let a: TensorAttrs = serde_json::from_str(
      r#"{"index": 2, "dims": [1, 1, 80, 80], "layout": "nchw", "kind": "float32"}"#,
    )
    .unwrap();
    assert_eq!(a.qnt_type, QuantType::None);
    assert_eq!(a.scale, 1.0);
    assert_eq!(a.n_elems(), 6400);
    assert_eq!(a.dim(2), 80);
    assert_eq!(a.dim(7), 0);
  }
}
