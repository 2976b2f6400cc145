// 该文件是 Shanan （山南西风） 项目的一部分。
// src/task.rs - 计时任务：单模型重复推理与任务池并行推理
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

use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::{
  model::{InferError, Model},
  pool::InferencePool,
};

/// 计入平均耗时前跳过的预热次数
const WARMUP_RUNS: usize = 2;

pub trait Task<I, M>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: &I, model: M) -> Result<Self::Output, Self::Error>;
}

#[derive(Debug, Clone)]
pub struct TimingReport<D> {
  pub runs: usize,
  pub total: Duration,
  /// 单次（或单帧）平均耗时
  pub average: Duration,
  /// 最后一次推理的结果
  pub last: D,
}

fn average(times: &[Duration]) -> Duration {
  let counted = if times.len() > WARMUP_RUNS {
    &times[WARMUP_RUNS..]
  } else {
    times
  };
  match counted.len() {
    0 => Duration::ZERO,
    n => counted.iter().sum::<Duration>() / n as u32,
  }
}

/// 单个模型重复推理同一帧，前两次作为预热不计入平均。
/// 非致命错误记录后以空结果计入，致命错误立即返回。
#[derive(Debug, Clone, Copy)]
pub struct RepeatShotTask {
  pub repeat: usize,
}

impl Default for RepeatShotTask {
  fn default() -> Self {
    Self { repeat: 10 }
  }
}

impl<F, D, ME, M> Task<F, M> for RepeatShotTask
where
  D: Default,
  ME: InferError,
  M: Model<Input = F, Output = D, Error = ME>,
{
  type Output = TimingReport<D>;
  type Error = anyhow::Error;

  fn run_task(self, frame: &F, mut model: M) -> Result<Self::Output, Self::Error> {
    info!("开始重复推理 {} 次...", self.repeat);
    let start = Instant::now();
    let mut times = Vec::with_capacity(self.repeat);
    let mut last = D::default();
    for i in 0..self.repeat {
      let now = Instant::now();
      last = match model.infer(frame) {
        Ok(result) => result,
        Err(e) if !e.is_fatal() => {
          error!("({})推理失败: {}", i, e);
          D::default()
        }
        Err(e) => return Err(e.into()),
      };
      let elapsed = now.elapsed();
      info!("({})推理完成，耗时: {:.2?}", i, elapsed);
      times.push(elapsed);
    }

    let report = TimingReport {
      runs: times.len(),
      total: start.elapsed(),
      average: average(&times),
      last,
    };
    warn!("平均推理时间: {:.2?}", report.average);
    Ok(report)
  }
}

/// 把同一帧提交 `frames` 次到任务池，再按顺序全部取回
#[derive(Debug, Clone, Copy)]
pub struct ParallelTask {
  pub frames: usize,
}

impl Default for ParallelTask {
  fn default() -> Self {
    Self { frames: 30 }
  }
}

impl<'a, F, D, M> Task<F, &'a InferencePool<M>> for ParallelTask
where
  F: Clone + Send + 'static,
  D: Default + Send + 'static,
  M: Model<Input = F, Output = D> + Send + 'static,
  M::Error: std::fmt::Display,
{
  type Output = TimingReport<D>;
  type Error = anyhow::Error;

  fn run_task(self, frame: &F, pool: &'a InferencePool<M>) -> Result<Self::Output, Self::Error> {
    info!(
      "开始并行推理 {} 帧, {} 个副本...",
      self.frames,
      pool.replica_count()
    );
    let start = Instant::now();
    for _ in 0..self.frames {
      pool.submit(frame.clone())?;
    }

    let mut runs = 0;
    let mut last = D::default();
    while let Some(result) = pool.retrieve() {
      last = result;
      runs += 1;
    }
    let total = start.elapsed();

    let report = TimingReport {
      runs,
      total,
      average: if runs == 0 {
        Duration::ZERO
      } else {
        total / runs as u32
      },
      last,
    };
    warn!(
      "总耗时: {:.2?}, 平均每帧: {:.2?}",
      report.total, report.average
    );
    Ok(report)
  }
}
