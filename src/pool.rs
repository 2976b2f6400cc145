// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pool.rs - 多副本推理任务池
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

//! 固定数量的工作线程执行推理任务，请求按提交计数轮询分配到副本，
//! 结果按提交顺序取回。
//!
//! 计数器与结果队列各有一把锁，只在入队、出队时持有，等待结果时不持锁。
//! 每个副本各自有一把互斥锁，轮询到同一副本的请求会依次执行。

use std::{
  collections::VecDeque,
  panic::{self, AssertUnwindSafe},
  sync::{Arc, Mutex, MutexGuard, PoisonError},
  thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
  accelerator::AcceleratorContext,
  model::{Detector, Model},
  replica::ModelReplicaSet,
};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Error, Debug)]
pub enum PoolError {
  #[error("没有可用的模型副本")]
  NoReplicas,
  #[error("工作线程数量必须大于 0")]
  ZeroWorkers,
  #[error("无法创建工作线程: {0}")]
  Spawn(std::io::Error),
  #[error("任务池已关闭")]
  Closed,
}

/// 一次提交的编号及其分配到的副本
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestId {
  pub seq: u64,
  pub replica: usize,
}

struct PendingRequest<O> {
  id: RequestId,
  result: Receiver<O>,
}

pub struct InferencePool<M: Model> {
  replicas: Arc<[Mutex<M>]>,
  counter: Mutex<u64>,
  queue: Mutex<VecDeque<PendingRequest<M::Output>>>,
  jobs: Option<Sender<Job>>,
  workers: Vec<JoinHandle<()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<M> InferencePool<M>
where
  M: Model + Send + 'static,
  M::Input: Send + 'static,
  M::Output: Default + Send + 'static,
  M::Error: std::fmt::Display,
{
  /// 工作线程数与副本数相同
  pub fn new(replicas: Vec<M>) -> Result<Self, PoolError> {
    let workers = replicas.len();
    Self::with_workers(replicas, workers)
  }

  pub fn with_workers(replicas: Vec<M>, worker_count: usize) -> Result<Self, PoolError> {
    if replicas.is_empty() {
      return Err(PoolError::NoReplicas);
    }
    if worker_count == 0 {
      return Err(PoolError::ZeroWorkers);
    }

    let replica_count = replicas.len();
    let replicas: Arc<[Mutex<M>]> = replicas.into_iter().map(Mutex::new).collect();

    let (jobs, rx) = crossbeam_channel::unbounded::<Job>();
    let mut workers = Vec::with_capacity(worker_count);
    for i in 0..worker_count {
      let rx = rx.clone();
      let spawned = thread::Builder::new()
        .name(format!("shanan-worker-{}", i))
        .spawn(move || worker_loop(rx));
      match spawned {
        Ok(handle) => workers.push(handle),
        Err(e) => {
          error!("创建工作线程 {} 失败: {}", i, e);
          drop(jobs);
          for handle in workers {
            let _ = handle.join();
          }
          return Err(PoolError::Spawn(e));
        }
      }
    }

    info!("任务池就绪: {} 个副本, {} 个工作线程", replica_count, worker_count);

    Ok(InferencePool {
      replicas,
      counter: Mutex::new(0),
      queue: Mutex::new(VecDeque::new()),
      jobs: Some(jobs),
      workers,
    })
  }

  /// 按轮询分配副本并提交推理，结果句柄排入队尾
  pub fn submit(&self, input: M::Input) -> Result<RequestId, PoolError> {
    let jobs = self.jobs.as_ref().ok_or(PoolError::Closed)?;

    let seq = {
      let mut counter = lock(&self.counter);
      let seq = *counter;
      *counter += 1;
      seq
    };
    let replica = (seq % self.replicas.len() as u64) as usize;
    let id = RequestId { seq, replica };

    let (tx, rx) = crossbeam_channel::bounded(1);
    let replicas = Arc::clone(&self.replicas);
    let job: Job = Box::new(move || {
      let output = {
        let mut model = lock(&replicas[replica]);
        match model.infer(&input) {
          Ok(output) => output,
          Err(e) => {
            error!("请求 {} 在副本 {} 上推理失败: {}", seq, replica, e);
            M::Output::default()
          }
        }
      };
      // 取回方可能已不存在
      let _ = tx.send(output);
    });

    let mut queue = lock(&self.queue);
    jobs.send(job).map_err(|_| PoolError::Closed)?;
    queue.push_back(PendingRequest { id, result: rx });
    debug!("提交请求 {} -> 副本 {}, 队列深度 {}", seq, replica, queue.len());

    Ok(id)
  }

  /// 取回最早提交的请求结果，队列为空时返回 `None`。
  ///
  /// 出队后立即释放队列锁，再阻塞等待该请求完成。
  pub fn retrieve(&self) -> Option<M::Output> {
    let pending = lock(&self.queue).pop_front()?;
    debug!("等待请求 {} (副本 {})", pending.id.seq, pending.id.replica);
    match pending.result.recv() {
      Ok(output) => Some(output),
      Err(_) => {
        error!("请求 {} 未返回结果", pending.id.seq);
        Some(M::Output::default())
      }
    }
  }

  pub fn pending_count(&self) -> usize {
    lock(&self.queue).len()
  }
}

impl<M: Model> InferencePool<M> {
  pub fn replica_count(&self) -> usize {
    self.replicas.len()
  }

  pub fn worker_count(&self) -> usize {
    self.workers.len()
  }
}

impl<C> InferencePool<Detector<C>>
where
  C: AcceleratorContext + 'static,
{
  pub fn from_replica_set(set: ModelReplicaSet<C>) -> Result<Self, PoolError> {
    Self::new(set.into_replicas())
  }
}

fn worker_loop(rx: Receiver<Job>) {
  for job in rx.iter() {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
      error!("推理任务异常退出");
    }
  }
}

impl<M: Model> Drop for InferencePool<M> {
  fn drop(&mut self) {
    let pending: Vec<PendingRequest<M::Output>> = self
      .queue
      .get_mut()
      .unwrap_or_else(PoisonError::into_inner)
      .drain(..)
      .collect();
    if !pending.is_empty() {
      info!("等待 {} 个未取回的请求完成", pending.len());
    }
    for request in pending {
      if request.result.recv().is_err() {
        error!("请求 {} 未返回结果", request.id.seq);
      }
    }

    drop(self.jobs.take());
    for handle in self.workers.drain(..) {
      if handle.join().is_err() {
        error!("工作线程异常退出");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
  };

  use super::*;

  /// 返回 (副本编号, 输入)，可配置每次调用的耗时
  struct EchoModel {
    id: usize,
    delay: Duration,
    finished: Arc<AtomicUsize>,
  }

  impl Model for EchoModel {
    type Input = u64;
    type Output = (usize, u64);
    type Error = String;

    fn infer(&mut self, input: &u64) -> Result<(usize, u64), String> {
      thread::sleep(self.delay);
      self.finished.fetch_add(1, Ordering::SeqCst);
      Ok((self.id, *input))
    }
  }

  fn echo_replicas(delays_ms: &[u64], finished: &Arc<AtomicUsize>) -> Vec<EchoModel> {
    delays_ms
      .iter()
      .enumerate()
      .map(|(id, &ms)| EchoModel {
        id,
        delay: Duration::from_millis(ms),
        finished: Arc::clone(finished),
      })
      .collect()
  }

  #[test]
  fn test_round_robin_assignment() {
    let finished = Arc::new(AtomicUsize::new(0));
    let pool = InferencePool::new(echo_replicas(&[0, 0, 0], &finished)).unwrap();

    let assigned: Vec<usize> = (0..7).map(|i| pool.submit(i).unwrap().replica).collect();
    assert_eq!(assigned, vec![0, 1, 2, 0, 1, 2, 0]);

    let served: Vec<usize> = std::iter::from_fn(|| pool.retrieve()).map(|(r, _)| r).collect();
    assert_eq!(served, vec![0, 1, 2, 0, 1, 2, 0]);
  }

  #[test]
  fn test_retrieve_in_submission_order() {
    // 副本 0 最慢，副本 2 最快，完成顺序与提交顺序相反
    let finished = Arc::new(AtomicUsize::new(0));
    let pool = InferencePool::new(echo_replicas(&[80, 40, 0], &finished)).unwrap();

    for i in 0..6 {
      pool.submit(i * 10).unwrap();
    }
    assert_eq!(pool.pending_count(), 6);

    let results: Vec<(usize, u64)> = std::iter::from_fn(|| pool.retrieve()).collect();
    assert_eq!(
      results,
      vec![(0, 0), (1, 10), (2, 20), (0, 30), (1, 40), (2, 50)]
    );
    assert_eq!(pool.pending_count(), 0);
    assert!(pool.retrieve().is_none());
  }

  #[test]
  fn test_drop_drains_pending_requests() {
    let finished = Arc::new(AtomicUsize::new(0));
    let pool = InferencePool::new(echo_replicas(&[10, 10], &finished)).unwrap();
    for i in 0..9 {
      pool.submit(i).unwrap();
    }
    drop(pool);
    assert_eq!(finished.load(Ordering::SeqCst), 9);
  }

  struct FlakyModel;

  impl Model for FlakyModel {
    type Input = u64;
    type Output = Vec<u64>;
    type Error = String;

    fn infer(&mut self, input: &u64) -> Result<Vec<u64>, String> {
      if input % 2 == 1 {
        Err(format!("odd input {}", input))
      } else {
        Ok(vec![*input])
      }
    }
  }

  #[test]
  fn test_failure_resolves_to_default() {
    let pool = InferencePool::new(vec![FlakyModel, FlakyModel]).unwrap();
    for i in 0..4 {
      pool.submit(i).unwrap();
    }
    let results: Vec<Vec<u64>> = std::iter::from_fn(|| pool.retrieve()).collect();
    assert_eq!(results, vec![vec![0], vec![], vec![2], vec![]]);
  }

  /// 检测同一副本是否被并发调用
  struct ExclusiveModel {
    busy: Arc<AtomicBool>,
    overlaps: Arc<AtomicUsize>,
  }

  impl Model for ExclusiveModel {
    type Input = ();
    type Output = ();
    type Error = String;

    fn infer(&mut self, _input: &()) -> Result<(), String> {
      if self.busy.swap(true, Ordering::SeqCst) {
        self.overlaps.fetch_add(1, Ordering::SeqCst);
      }
      thread::sleep(Duration::from_millis(5));
      self.busy.store(false, Ordering::SeqCst);
      Ok(())
    }
  }

  #[test]
  fn test_replica_calls_are_serialized() {
    let busy = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let model = ExclusiveModel {
      busy: Arc::clone(&busy),
      overlaps: Arc::clone(&overlaps),
    };
    // 单副本、多个工作线程
    let pool = InferencePool::with_workers(vec![model], 4).unwrap();
    assert_eq!(pool.worker_count(), 4);
    for _ in 0..12 {
      pool.submit(()).unwrap();
    }
    while pool.retrieve().is_some() {}
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_concurrent_submitters() {
    let finished = Arc::new(AtomicUsize::new(0));
    let pool = Arc::new(InferencePool::new(echo_replicas(&[1, 1, 1], &finished)).unwrap());

    let handles: Vec<_> = (0..4)
      .map(|t| {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
          for i in 0..10 {
            pool.submit(t * 100 + i).unwrap();
          }
        })
      })
      .collect();
    for handle in handles {
      handle.join().unwrap();
    }

    let mut seen: Vec<u64> = std::iter::from_fn(|| pool.retrieve()).map(|(_, v)| v).collect();
    seen.sort_unstable();
    let mut expected: Vec<u64> = (0..4).flat_map(|t| (0..10).map(move |i| t * 100 + i)).collect();
    expected.sort_unstable();
    assert_eq!(seen, expected);
  }

  #[test]
  fn test_invalid_configuration() {
    assert!(matches!(
      InferencePool::<FlakyModel>::new(Vec::new()),
      Err(PoolError::NoReplicas)
    ));
    assert!(matches!(
      InferencePool::with_workers(vec![FlakyModel], 0),
      Err(PoolError::ZeroWorkers)
    ));
  }
}
