// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/detector.rs - 检测器生命周期：加载、推理、后处理
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

use std::path::{Path, PathBuf};

use image::RgbImage;
use tracing::{debug, error, info};
use url::Url;

use super::{
  DetectItem, DetectResult, DetectionParams, HeadOutputs, ImageRect, Model, ModelError,
  ModelFamily, OBJ_NUMB_MAX_SIZE,
};
use crate::{
  FromUrl,
  accelerator::{AcceleratorContext, CoreAllocator, NpuCore},
  decode::Candidate,
  letterbox::{Letterbox, letterbox},
  nms::suppress,
  tensor::{InputTensor, IoAttrs, ModelGeometry, TensorKind, TensorLayout},
};

/// 独占一个 NPU 上下文的检测器。
///
/// 同一时刻只能有一个推理调用，`&mut self` 保证了这一点。
pub struct Detector<C> {
  context: C,
  family: ModelFamily,
  params: DetectionParams,
  io: IoAttrs,
  geometry: ModelGeometry,
  quantized: bool,
  core: NpuCore,
}

impl<C: AcceleratorContext> Detector<C> {
  /// 加载完整权重并绑定下一个核心
  pub fn new(
    weights: &[u8],
    family: ModelFamily,
    params: DetectionParams,
    cores: &CoreAllocator,
  ) -> Result<Self, ModelError> {
    info!(
      "创建 {} 推理上下文, 权重大小: {:.2} MB",
      family,
      weights.len() as f64 / (1024.0 * 1024.0)
    );
    let context = C::load(weights)?;
    Self::init(context, family, params, cores)
  }

  /// 复用 `source` 的权重，绑定独立的核心
  pub fn with_shared_context(source: &Detector<C>, cores: &CoreAllocator) -> Result<Self, ModelError> {
    info!("复制 {} 推理上下文", source.family);
    let context = source.context.duplicate()?;
    Self::init(context, source.family, source.params.clone(), cores)
  }

  fn init(
    mut context: C,
    family: ModelFamily,
    params: DetectionParams,
    cores: &CoreAllocator,
  ) -> Result<Self, ModelError> {
    let io = match &params.layout {
      Some(layout) => {
        let (inputs, outputs) = context.io_counts()?;
        if (inputs, outputs) != (layout.inputs.len(), layout.outputs.len()) {
          return Err(ModelError::invalid(format!(
            "布局描述为 {} 输入 {} 输出, 模型实际为 {} 输入 {} 输出",
            layout.inputs.len(),
            layout.outputs.len(),
            inputs,
            outputs
          )));
        }
        layout.clone()
      }
      None => context.query_io()?,
    };
    debug!("模型输入数量: {}, 输出数量: {}", io.inputs.len(), io.outputs.len());
    for attrs in &io.inputs {
      debug!("输入: {}", attrs);
    }
    for attrs in &io.outputs {
      debug!("输出: {}", attrs);
    }

    let input = io
      .inputs
      .first()
      .ok_or_else(|| ModelError::invalid("模型没有输入张量"))?;
    let geometry = ModelGeometry::from_input(input)
      .ok_or_else(|| ModelError::invalid(format!("无法识别输入维度 {:?}", input.dims)))?;
    if geometry.channels != 3 || geometry.width == 0 || geometry.height == 0 {
      return Err(ModelError::invalid(format!(
        "仅支持 3 通道输入, 实际为 {}x{}x{}",
        geometry.height, geometry.width, geometry.channels
      )));
    }

    let output = io
      .outputs
      .first()
      .ok_or_else(|| ModelError::invalid("模型没有输出张量"))?;
    let quantized = output.is_affine_quantized();
    family.validate(&io, &params)?;

    let core = cores.next_core();
    context.bind_core(core)?;

    info!(
      "模型就绪: {}x{}x{}, {}, core {}",
      geometry.height,
      geometry.width,
      geometry.channels,
      if quantized { "量化输出" } else { "浮点输出" },
      core
    );

    Ok(Detector {
      context,
      family,
      params,
      io,
      geometry,
      quantized,
      core,
    })
  }

  pub fn context(&self) -> &C {
    &self.context
  }

  pub fn family(&self) -> ModelFamily {
    self.family
  }

  pub fn params(&self) -> &DetectionParams {
    &self.params
  }

  pub fn geometry(&self) -> ModelGeometry {
    self.geometry
  }

  pub fn io_attrs(&self) -> &IoAttrs {
    &self.io
  }

  pub fn is_quantized(&self) -> bool {
    self.quantized
  }

  pub fn core(&self) -> NpuCore {
    self.core
  }

  /// 预处理、执行、解码、抑制、映射回原图
  pub fn try_run(&mut self, image: &RgbImage) -> Result<DetectResult, ModelError> {
    let pad = self.params.pad_color;
    let boxed = letterbox(image, self.geometry.width, self.geometry.height, [pad, pad, pad]);
    let input = InputTensor {
      index: 0,
      data: boxed.as_nhwc(),
      layout: TensorLayout::Nhwc,
      kind: TensorKind::UInt8,
    };

    let outputs = self.context.execute(&[input], !self.quantized)?;

    let heads = HeadOutputs::new(&outputs, &self.io.outputs, self.quantized);
    let mut candidates = Vec::new();
    let valid_count = self
      .family
      .decode(&heads, self.geometry, &self.params, &mut candidates);
    debug!("解码得到 {} 个候选框", valid_count);

    let result = self.finalize(&candidates, &boxed);
    debug!("检测到 {} 个物体", result.count());
    Ok(result)
  }

  /// 与 `try_run` 相同，但失败时记录错误并返回空结果
  pub fn run(&mut self, image: &RgbImage) -> DetectResult {
    match self.try_run(image) {
      Ok(result) => result,
      Err(e) => {
        error!("推理失败 (core {}): {}", self.core, e);
        DetectResult::default()
      }
    }
  }

  fn finalize(&self, candidates: &[Candidate], boxed: &Letterbox) -> DetectResult {
    let kept = suppress(candidates, self.params.nms_threshold);
    let (model_w, model_h) = (self.geometry.width as i32, self.geometry.height as i32);
    let (pad_left, pad_top) = (boxed.pads.left as f32, boxed.pads.top as f32);
    let unscale = |v: i32| (v as f32 / boxed.scale) as i32;

    let items: Vec<DetectItem> = kept
      .into_iter()
      .take(OBJ_NUMB_MAX_SIZE)
      .map(|n| {
        let c = &candidates[n];
        let x1 = c.bbox.x - pad_left;
        let y1 = c.bbox.y - pad_top;
        let x2 = x1 + c.bbox.w;
        let y2 = y1 + c.bbox.h;
        DetectItem {
          class_id: c.class_id,
          score: c.confidence,
          bbox: ImageRect {
            left: unscale(clamp(x1, 0, model_w)),
            top: unscale(clamp(y1, 0, model_h)),
            right: unscale(clamp(x2, 0, model_w)),
            bottom: unscale(clamp(y2, 0, model_h)),
          },
        }
      })
      .collect();

    DetectResult {
      items: items.into_boxed_slice(),
    }
  }
}

impl<C: AcceleratorContext> Model for Detector<C> {
  type Input = RgbImage;
  type Output = DetectResult;
  type Error = ModelError;

  fn infer(&mut self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.try_run(input)
  }
}

// 夹紧后截断为整数
fn clamp(val: f32, min: i32, max: i32) -> i32 {
  if val > min as f32 {
    if val < max as f32 { val as i32 } else { max }
  } else {
    min
  }
}

/// 从 `yolo11:///path/model.rknn?confidence=0.3&nms=0.5` 形式的 URL 构造检测器。
/// `layout=/path/layout.json` 为无法查询张量属性的运行时提供布局。
#[derive(Debug, Clone)]
pub struct DetectorBuilder {
  model_path: PathBuf,
  family: ModelFamily,
  params: DetectionParams,
  core_count: usize,
}

impl FromUrl for DetectorBuilder {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let family = ModelFamily::from_scheme(url.scheme()).ok_or_else(|| {
      ModelError::ModelPath(format!(
        "不支持的模型方案 {}, 可选: yolo11, yolov5",
        url.scheme()
      ))
    })?;

    let model_path = match url.host_str() {
      Some(host) if !host.is_empty() => format!("{}{}", host, url.path()),
      _ => url.path().to_string(),
    };
    if model_path.is_empty() {
      return Err(ModelError::ModelPath("模型路径为空".to_string()));
    }

    let mut builder = DetectorBuilder {
      model_path: PathBuf::from(model_path),
      family,
      params: DetectionParams::default(),
      core_count: NpuCore::PHYSICAL_CORES,
    };

    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "confidence" => builder.params.confidence = parse_query(&key, &value)?,
        "nms" => builder.params.nms_threshold = parse_query(&key, &value)?,
        "classes" => builder.params.class_num = parse_query(&key, &value)?,
        "pad" => builder.params.pad_color = parse_query(&key, &value)?,
        "cores" => builder.core_count = parse_query(&key, &value)?,
        "layout" => builder.params.layout = Some(read_layout(Path::new(value.as_ref()))?),
        other => {
          return Err(ModelError::ModelPath(format!("未知的模型参数: {}", other)));
        }
      }
    }

    Ok(builder)
  }
}

fn parse_query<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ModelError> {
  value
    .parse()
    .map_err(|_| ModelError::ModelPath(format!("参数 {} 的值无效: {}", key, value)))
}

/// 读取 JSON 格式的张量布局描述
fn read_layout(path: &Path) -> Result<IoAttrs, ModelError> {
  info!("读取张量布局: {}", path.display());
  let data = std::fs::read(path)?;
  serde_json::from_slice(&data)
    .map_err(|e| ModelError::ModelPath(format!("张量布局 {} 无效: {}", path.display(), e)))
}

impl DetectorBuilder {
  pub fn new(model_path: impl Into<PathBuf>, family: ModelFamily) -> Self {
    DetectorBuilder {
      model_path: model_path.into(),
      family,
      params: DetectionParams::default(),
      core_count: NpuCore::PHYSICAL_CORES,
    }
  }

  pub fn params(mut self, params: DetectionParams) -> Self {
    self.params = params;
    self
  }

  pub fn core_count(mut self, core_count: usize) -> Self {
    self.core_count = core_count;
    self
  }

  pub fn model_path(&self) -> &Path {
    &self.model_path
  }

  pub fn family(&self) -> ModelFamily {
    self.family
  }

  pub fn detection_params(&self) -> &DetectionParams {
    &self.params
  }

  pub fn cores(&self) -> usize {
    self.core_count
  }

  pub fn build<C: AcceleratorContext>(&self) -> Result<Detector<C>, ModelError> {
    info!("加载模型文件: {}", self.model_path.display());
    let weights = std::fs::read(&self.model_path)?;
    Detector::new(
      &weights,
      self.family,
      self.params.clone(),
      &CoreAllocator::new(self.core_count),
    )
  }
}
