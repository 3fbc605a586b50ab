// 该文件是 Qingmiao （青苗） 项目的一部分。
// src/main.rs - 项目主程序
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

mod args;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use qingmiao::{
  FromUrl,
  lifecycle::Lifecycle,
  output::OutputWrapper,
  pipeline::{ClassificationRequest, Orchestrator},
  task::{BatchTask, DeadlineTask, OneShotTask, Task},
};

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = args::Args::parse();

  info!("模型路径: {}", args.model);
  for input in &args.input {
    info!("输入来源: {}", input);
  }
  info!("输出路径: {}", args.output);

  let lifecycle = Lifecycle::new();
  load_model(&lifecycle, &args.model)?;

  let config = args.pipeline_config();
  info!(
    "归一化策略: rgb={}, ndvi={}, webcam={}, NDVI 平滑: {}",
    config.rgb_policy, config.ndvi_policy, config.webcam_policy, config.ndvi_smoothing
  );
  let orchestrator = Orchestrator::new(lifecycle.classifier()?, config);

  let requests = args
    .input
    .iter()
    .map(ClassificationRequest::from_url)
    .collect::<Result<Vec<_>, _>>()?;
  let output = OutputWrapper::from_url(&args.output)?;

  if requests.len() == 1 {
    let outcome = match args.timeout() {
      Some(budget) => DeadlineTask::with_budget(budget).run_task(requests.into_iter(), orchestrator, output)?,
      None => OneShotTask.run_task(requests.into_iter(), orchestrator, output)?,
    };
    info!(
      "{}: {} ({:.2}%)",
      outcome.result.image_reference,
      outcome.result.label,
      outcome.result.confidence * 100.0
    );
    return Ok(());
  }

  let report = BatchTask::default()
    .with_budget(args.timeout())
    .run_task(requests.into_iter(), orchestrator, output)?;
  for (reference, e) in &report.failed {
    error!("{} 分类失败 ({:?}): {}", reference, e.kind(), e);
  }
  if !report.failed.is_empty() {
    anyhow::bail!("{} / {} 个请求失败", report.failed.len(), report.total());
  }

  Ok(())
}

#[cfg(feature = "model_onnx")]
fn load_model(lifecycle: &Lifecycle, model: &url::Url) -> Result<()> {
  lifecycle.start_onnx(model)?;
  Ok(())
}

#[cfg(not(feature = "model_onnx"))]
fn load_model(_lifecycle: &Lifecycle, model: &url::Url) -> Result<()> {
  anyhow::bail!("未启用模型后端, 无法加载 {}", model)
}
