// 该文件是 Shanan （山南西风） 项目的一部分。
// src/quant.rs - 仿射量化编解码
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

//! NPU 输出张量的仿射量化：`q = f / scale + zp`，截断到整数类型范围。

use crate::tensor::{TensorData, TensorKind};

/// 仿射量化参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantParams {
  pub zero_point: i32,
  pub scale: f32,
}

impl QuantParams {
  /// 浮点张量使用的恒等参数
  pub const IDENTITY: QuantParams = QuantParams {
    zero_point: 0,
    scale: 1.0,
  };

  pub fn new(zero_point: i32, scale: f32) -> Self {
    Self { zero_point, scale }
  }
}

impl Default for QuantParams {
  fn default() -> Self {
    Self::IDENTITY
  }
}

// 先夹紧再向零截断
fn clip(val: f32, min: f32, max: f32) -> i32 {
  let f = if val <= min {
    min
  } else if val >= max {
    max
  } else {
    val
  };
  f as i32
}

pub fn quantize_i8(value: f32, zero_point: i32, scale: f32) -> i8 {
  let dst = value / scale + zero_point as f32;
  clip(dst, i8::MIN as f32, i8::MAX as f32) as i8
}

pub fn quantize_u8(value: f32, zero_point: i32, scale: f32) -> u8 {
  let dst = value / scale + zero_point as f32;
  clip(dst, u8::MIN as f32, u8::MAX as f32) as u8
}

pub fn dequantize_i8(value: i8, zero_point: i32, scale: f32) -> f32 {
  (value as f32 - zero_point as f32) * scale
}

pub fn dequantize_u8(value: u8, zero_point: i32, scale: f32) -> f32 {
  (value as f32 - zero_point as f32) * scale
}

/// 解码器按元素类型泛化所需的数值接口。
///
/// 量化类型在原生整数空间内比较阈值，浮点类型直接比较。
pub trait QuantElem: Copy + PartialOrd + Send + Sync + 'static {
  const KIND: TensorKind;

  /// anchor-based 解码中类别分数扫描的起始值
  const SCAN_FLOOR: Self;

  fn to_f32(self, qp: QuantParams) -> f32;

  /// 把浮点阈值换算到本类型的数值空间
  fn threshold(value: f32, qp: QuantParams) -> Self;

  /// anchor-free 解码中最大类别分数的初始值，对应浮点 0 的量化表示
  fn score_floor(qp: QuantParams) -> Self;

  /// 类型匹配时借出输出缓冲
  fn view(data: &TensorData) -> Option<&[Self]>;
}

impl QuantElem for i8 {
  const KIND: TensorKind = TensorKind::Int8;
  const SCAN_FLOOR: Self = i8::MIN;

  fn to_f32(self, qp: QuantParams) -> f32 {
    dequantize_i8(self, qp.zero_point, qp.scale)
  }

  fn threshold(value: f32, qp: QuantParams) -> Self {
    quantize_i8(value, qp.zero_point, qp.scale)
  }

  fn score_floor(qp: QuantParams) -> Self {
    qp.zero_point.wrapping_neg() as i8
  }

  fn view(data: &TensorData) -> Option<&[Self]> {
    match data {
      TensorData::Int8(v) => Some(v.as_slice()),
      _ => None,
    }
  }
}

impl QuantElem for u8 {
  const KIND: TensorKind = TensorKind::UInt8;
  const SCAN_FLOOR: Self = u8::MIN;

  fn to_f32(self, qp: QuantParams) -> f32 {
    dequantize_u8(self, qp.zero_point, qp.scale)
  }

  fn threshold(value: f32, qp: QuantParams) -> Self {
    quantize_u8(value, qp.zero_point, qp.scale)
  }

  fn score_floor(qp: QuantParams) -> Self {
    qp.zero_point.wrapping_neg() as u8
  }

  fn view(data: &TensorData) -> Option<&[Self]> {
    match data {
      TensorData::UInt8(v) => Some(v.as_slice()),
      _ => None,
    }
  }
}

impl QuantElem for f32 {
  const KIND: TensorKind = TensorKind::Float32;
  const SCAN_FLOOR: Self = 0.0;

  fn to_f32(self, _qp: QuantParams) -> f32 {
    self
  }

  fn threshold(value: f32, _qp: QuantParams) -> Self {
    value
  }

  fn score_floor(_qp: QuantParams) -> Self {
    0.0
  }

  fn view(data: &TensorData) -> Option<&[Self]> {
    match data {
      TensorData::Float32(v) => Some(v.as_slice()),
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_quantize_clamps_to_type_range() {
    assert_eq!(quantize_i8(1000.0, 0, 0.1), 127);
    assert_eq!(quantize_i8(-1000.0, 0, 0.1), -128);
    assert_eq!(quantize_u8(1000.0, 0, 0.1), 255);
    assert_eq!(quantize_u8(-1000.0, 10, 0.1), 0);
  }

  #[test]
  fn test_quantize_truncates_toward_zero() {
    // 0.26 / 0.1 = 2.6 -> 2
    assert_eq!(quantize_i8(0.26, 0, 0.1), 2);
    // -0.26 / 0.1 = -2.6 -> -2
    assert_eq!(quantize_i8(-0.26, 0, 0.1), -2);
    assert_eq!(quantize_u8(0.26, 3, 0.1), 5);
  }

  #[test]
  fn test_roundtrip_within_one_step() {
    let params = [(-128, 0.003_921_569_f32), (0, 0.05), (-14, 0.0123), (37, 0.2)];
    for &(zp, scale) in &params {
      let mut x = -1.5f32;
      while x <= 1.5 {
        let q = quantize_i8(x, zp, scale);
        let back = dequantize_i8(q, zp, scale);
        let lo = dequantize_i8(i8::MIN, zp, scale);
        let hi = dequantize_i8(i8::MAX, zp, scale);
        if x >= lo && x <= hi {
          assert!(
            (back - x).abs() <= scale * 1.0001,
            "i8 zp={} scale={} x={} back={}",
            zp,
            scale,
            x,
            back
          );
        }
        x += 0.013;
      }
    }

    for &(zp, scale) in &[(0, 0.004_f32), (128, 0.01), (77, 0.3)] {
      let mut x = 0.0f32;
      while x <= 2.0 {
        let q = quantize_u8(x, zp, scale);
        let back = dequantize_u8(q, zp, scale);
        let lo = dequantize_u8(u8::MIN, zp, scale);
        let hi = dequantize_u8(u8::MAX, zp, scale);
        if x >= lo && x <= hi {
          assert!((back - x).abs() <= scale * 1.0001);
        }
        x += 0.017;
      }
    }
  }

  #[test]
  fn test_representable_levels_are_exact() {
    let (zp, scale) = (-20, 0.25f32);
    for q in i8::MIN..=i8::MAX {
      let f = dequantize_i8(q, zp, scale);
      assert_eq!(quantize_i8(f, zp, scale), q);
      assert_eq!(dequantize_i8(quantize_i8(f, zp, scale), zp, scale), f);
    }
    let (zp, scale) = (100, 0.5f32);
    for q in u8::MIN..=u8::MAX {
      let f = dequantize_u8(q, zp, scale);
      assert_eq!(quantize_u8(f, zp, scale), q);
    }
  }

  #[test]
  fn test_elem_trait_matches_free_functions() {
    let qp = QuantParams::new(-5, 0.1);
    assert_eq!(<i8 as QuantElem>::threshold(0.25, qp), quantize_i8(0.25, -5, 0.1));
    assert_eq!(12i8.to_f32(qp), dequantize_i8(12, -5, 0.1));
    assert_eq!(<f32 as QuantElem>::threshold(0.25, qp), 0.25);
    assert_eq!(0.7f32.to_f32(qp), 0.7);
  }

  #[test]
  fn test_score_floor_wraps_like_integer_cast() {
    assert_eq!(<i8 as QuantElem>::score_floor(QuantParams::new(-128, 1.0)), -128);
    assert_eq!(<i8 as QuantElem>::score_floor(QuantParams::new(5, 1.0)), -5);
    assert_eq!(<u8 as QuantElem>::score_floor(QuantParams::new(0, 1.0)), 0);
    assert_eq!(<u8 as QuantElem>::score_floor(QuantParams::new(1, 1.0)), 255);
  }
}
