// 该文件是 Qingmiao （青苗） 项目的一部分。
// src/task.rs - 分类任务执行
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

use std::{
  sync::mpsc::{self, RecvTimeoutError},
  thread::{self, JoinHandle},
  time::Duration,
};
use tracing::{error, info, warn};

use crate::{
  model::Model,
  output::Render,
  pipeline::{ClassificationOutcome, ClassificationRecord, ClassificationRequest, PipelineError},
};

pub trait Task<I, M, O>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<Self::Output, Self::Error>;
}

/// 处理第一个请求
pub struct OneShotTask;

impl<
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = ClassificationRequest>,
  M: Model<Input = ClassificationRequest, Output = ClassificationOutcome, Error = PipelineError>,
  O: Render<ClassificationRecord, Error = RE>,
> Task<I, M, O> for OneShotTask
{
  type Output = ClassificationOutcome;
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, model: M, output: O) -> Result<Self::Output, Self::Error> {
    info!("开始任务...");
    let request = input.next().ok_or_else(|| anyhow::anyhow!("没有输入请求"))?;
    let now = std::time::Instant::now();
    let outcome = model.infer(&request)?;
    info!("分类完成，耗时: {:.2?}", now.elapsed());
    output.render_result(&outcome.record())?;
    info!("记录输出完成");

    Ok(outcome)
  }
}

/// 在时限内处理第一个请求，超时后丢弃工作线程的结果
///
/// 超时的工作线程不会被中断，仍会运行到推理结束。
#[derive(Debug, Clone, Copy)]
pub struct DeadlineTask {
  budget: Duration,
}

impl DeadlineTask {
  pub fn with_budget(budget: Duration) -> Self {
    Self { budget }
  }

  /// 在工作线程上执行一次分类并等待至多 `budget`，超时的线程被分离
  pub fn run_one<M>(
    &self,
    model: M,
    request: ClassificationRequest,
  ) -> Result<ClassificationOutcome, PipelineError>
  where
    M: Model<Input = ClassificationRequest, Output = ClassificationOutcome, Error = PipelineError>
      + Send
      + 'static,
  {
    self.run_tracked(model, request).map_err(|(e, _)| e)
  }

  /// 同 [`DeadlineTask::run_one`]，超时时交还工作线程句柄
  fn run_tracked<M>(
    &self,
    model: M,
    request: ClassificationRequest,
  ) -> Result<ClassificationOutcome, (PipelineError, Option<JoinHandle<()>>)>
  where
    M: Model<Input = ClassificationRequest, Output = ClassificationOutcome, Error = PipelineError>
      + Send
      + 'static,
  {
    let (tx, rx) = mpsc::channel();
    let reference = request.image_reference.clone();
    let worker = thread::spawn(move || {
      let result = model.infer(&request);
      // 接收端可能已因超时退出
      let _ = tx.send(result);
    });

    match rx.recv_timeout(self.budget) {
      Ok(result) => result.map_err(|e| (e, None)),
      Err(RecvTimeoutError::Timeout) => {
        warn!("请求 {} 超过时限 {:.2?}, 丢弃结果", reference, self.budget);
        Err((
          PipelineError::Timeout {
            budget: self.budget,
          },
          Some(worker),
        ))
      }
      Err(RecvTimeoutError::Disconnected) => {
        error!("请求 {} 的工作线程异常退出", reference);
        Err((
          PipelineError::Inference {
            stage: "工作线程",
            source: "工作线程异常退出".into(),
          },
          None,
        ))
      }
    }
  }
}

impl<
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = ClassificationRequest>,
  M: Model<Input = ClassificationRequest, Output = ClassificationOutcome, Error = PipelineError>
    + Send
    + 'static,
  O: Render<ClassificationRecord, Error = RE>,
> Task<I, M, O> for DeadlineTask
{
  type Output = ClassificationOutcome;
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, model: M, output: O) -> Result<Self::Output, Self::Error> {
    info!("开始任务, 时限: {:.2?}", self.budget);
    let request = input.next().ok_or_else(|| anyhow::anyhow!("没有输入请求"))?;
    let outcome = self.run_one(model, request)?;
    output.render_result(&outcome.record())?;
    info!("记录输出完成");

    Ok(outcome)
  }
}

/// 批处理结果
#[derive(Debug, Default)]
pub struct BatchReport {
  pub succeeded: Vec<ClassificationOutcome>,
  pub failed: Vec<(String, PipelineError)>,
}

impl BatchReport {
  pub fn total(&self) -> usize {
    self.succeeded.len() + self.failed.len()
  }
}

/// 依次处理全部请求，单个请求失败不影响其余请求
///
/// 设置时限时，超时请求的工作线程在批处理结束前全部回收。
#[derive(Debug, Default, Clone, Copy)]
pub struct BatchTask {
  budget: Option<Duration>,
}

impl BatchTask {
  pub fn with_budget(mut self, budget: Option<Duration>) -> Self {
    self.budget = budget;
    self
  }
}

impl<
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = ClassificationRequest>,
  M: Model<Input = ClassificationRequest, Output = ClassificationOutcome, Error = PipelineError>
    + Clone
    + Send
    + 'static,
  O: Render<ClassificationRecord, Error = RE>,
> Task<I, M, O> for BatchTask
{
  type Output = BatchReport;
  type Error = anyhow::Error;

  fn run_task(self, input: I, model: M, output: O) -> Result<Self::Output, Self::Error> {
    info!("开始批处理任务...");
    let mut report = BatchReport::default();
    let mut stragglers = Vec::new();

    for (index, request) in input.enumerate() {
      info!("处理第 {} 个请求: {}", index + 1, request.image_reference);
      let reference = request.image_reference.clone();
      let result = match self.budget {
        Some(budget) => DeadlineTask::with_budget(budget)
          .run_tracked(model.clone(), request)
          .map_err(|(e, worker)| {
            stragglers.extend(worker);
            e
          }),
        None => model.infer(&request),
      };

      match result {
        Ok(outcome) => {
          output.render_result(&outcome.record())?;
          report.succeeded.push(outcome);
        }
        Err(e) => {
          error!("请求 {} 失败: {}", reference, e);
          report.failed.push((reference, e));
        }
      }
    }

    if !stragglers.is_empty() {
      info!("等待 {} 个超时的工作线程结束", stragglers.len());
      for worker in stragglers {
        if worker.join().is_err() {
          warn!("超时的工作线程异常退出");
        }
      }
    }

    info!(
      "批处理完成: 成功 {}, 失败 {}",
      report.succeeded.len(),
      report.failed.len()
    );
    Ok(report)
  }
}
