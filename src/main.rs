// 该文件是 Shanan （山南西风） 项目的一部分。
// src/main.rs - 多核推理计时程序
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

use anyhow::Result;
use clap::{Parser, ValueEnum};
use image::RgbImage;
use tracing::{Level, info};
use url::Url;

use shanan_pool::{
  FromUrl,
  accelerator::{AcceleratorContext, SimContext},
  labels::Labels,
  model::{DetectResult, DetectorBuilder},
  pool::InferencePool,
  replica::{ModelReplicaSet, ReplicaStrategy},
  task::{ParallelTask, RepeatShotTask, Task, TimingReport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
  /// 单个模型重复推理
  Single,
  /// 每个副本独立加载权重，多核并行
  MultiCore,
  /// 副本共享权重，多核并行
  WeightSharing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Runtime {
  /// 主机端模拟运行时，模型文件为 JSON 清单
  Sim,
  /// 板端 NPU，需要启用 rknpu 特性
  Rknpu,
}

/// Shanan 多核推理参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  #[arg(value_enum)]
  scenario: Scenario,
  /// 推理运行时
  #[arg(long, value_enum, default_value_t = Runtime::Sim)]
  runtime: Runtime,
  /// 模型地址，例如 yolo11:///path/model.json?confidence=0.25
  #[arg(long, value_name = "MODEL")]
  model: Url,
  /// 输入图片
  #[arg(long, value_name = "IMAGE")]
  image: PathBuf,
  /// 模型副本数量
  #[arg(long, default_value_t = 3)]
  replicas: usize,
  /// 工作线程数量，默认与副本数相同
  #[arg(long)]
  workers: Option<usize>,
  /// 推理次数（并行场景下为提交的帧数）
  #[arg(long, default_value_t = 10)]
  repeat: usize,
  /// 标签文件，每行一个类别名
  #[arg(long, value_name = "FILE")]
  labels: Option<PathBuf>,
  /// 结果图片输出路径
  #[arg(long, value_name = "FILE")]
  output: Option<PathBuf>,
  /// 标签字体文件，不指定时只绘制边框
  #[arg(long, value_name = "FILE")]
  font: Option<PathBuf>,
  #[arg(long, default_value_t = Level::INFO)]
  log_level: Level,
}

fn main() -> Result<()> {
  let args = Args::parse();
  tracing_subscriber::fmt().with_max_level(args.log_level).init();

  info!("场景: {:?}", args.scenario);
  info!("模型地址: {}", args.model);
  info!("输入图片: {}", args.image.display());

  let builder = DetectorBuilder::from_url(&args.model)?;
  let image = image::open(&args.image)?.to_rgb8();
  info!("图片尺寸: {}x{}", image.width(), image.height());

  let labels = match &args.labels {
    Some(path) => Labels::load(path, builder.detection_params().class_num),
    None => Labels::coco(),
  };

  let report = match args.runtime {
    Runtime::Sim => run_scenario::<SimContext>(&args, builder, &image)?,
    #[cfg(feature = "rknpu")]
    Runtime::Rknpu => {
      info!("NPU 核心由驱动自动调度");
      let builder = builder.core_count(0);
      run_scenario::<shanan_pool::accelerator::RknpuContext>(&args, builder, &image)?
    }
    #[cfg(not(feature = "rknpu"))]
    Runtime::Rknpu => anyhow::bail!("未启用 rknpu 特性, 无法使用板端运行时"),
  };

  info!(
    "完成 {} 次推理, 总耗时: {:.2?}, 平均: {:.2?}",
    report.runs, report.total, report.average
  );
  render(
    &image,
    &report.last,
    &labels,
    args.font.as_deref(),
    args.output.as_deref(),
  )?;

  Ok(())
}

fn run_scenario<C: AcceleratorContext + 'static>(
  args: &Args,
  builder: DetectorBuilder,
  image: &RgbImage,
) -> Result<TimingReport<DetectResult>> {
  let report = match args.scenario {
    Scenario::Single => {
      let detector = builder.build::<C>()?;
      RepeatShotTask {
        repeat: args.repeat,
      }
      .run_task(image, detector)?
    }
    Scenario::MultiCore | Scenario::WeightSharing => {
      let strategy = if args.scenario == Scenario::MultiCore {
        ReplicaStrategy::IndependentWeights
      } else {
        ReplicaStrategy::SharedWeights
      };
      let set = ModelReplicaSet::<C>::from_builder(&builder, args.replicas, strategy)?;
      let replicas = set.into_replicas();
      let workers = args.workers.unwrap_or(replicas.len());
      let pool = InferencePool::with_workers(replicas, workers)?;
      ParallelTask {
        frames: args.repeat,
      }
      .run_task(image, &pool)?
    }
  };
  Ok(report)
}

#[cfg(feature = "draw")]
fn render(
  image: &RgbImage,
  result: &DetectResult,
  labels: &Labels,
  font: Option<&Path>,
  output: Option<&Path>,
) -> Result<()> {
  use shanan_pool::draw::{Draw, Record};

  let draw = match font {
    Some(path) => Draw::default().font(path)?,
    None => Draw::default(),
  };
  let mut canvas = image.clone();
  draw.draw_result(&mut canvas, result, labels);
  if let Some(path) = output {
    draw.save(&canvas, path)?;
    Record {
      label_with_name: true,
    }
    .record(result, labels, path)?;
  }
  Ok(())
}

#[cfg(not(feature = "draw"))]
fn render(
  _image: &RgbImage,
  result: &DetectResult,
  labels: &Labels,
  _font: Option<&Path>,
  _output: Option<&Path>,
) -> Result<()> {
  for item in result.items.iter() {
    let r = item.bbox;
    info!(
      "{} @ ({} {} {} {}) {:.3}",
      labels.name(item.class_id),
      r.left,
      r.top,
      r.right,
      r.bottom,
      item.score
    );
  }
  Ok(())
}
