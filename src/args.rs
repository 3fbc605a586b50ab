// 该文件是 Qingmiao （青苗） 项目的一部分。
// src/args.rs - 项目参数配置
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

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use url::Url;

use qingmiao::{normalize::NormalizationPolicy, pipeline::PipelineConfig};

/// Qingmiao 作物健康分类
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型路径，例如 onnx:///models/inception.onnx
  #[arg(long, value_name = "MODEL")]
  pub model: Url,

  /// 输入来源，可重复
  /// 例如 file:///data/field.tif?kind=ndvi&content_type=image/tiff&reference=42
  #[arg(long, value_name = "SOURCE", required = true)]
  pub input: Vec<Url>,

  /// 输出路径: stdout:// 或 folder:///records
  #[arg(long, value_name = "OUTPUT", default_value = "stdout://")]
  pub output: Url,

  /// 单个请求的时限（秒）
  #[arg(long, value_name = "SECONDS")]
  pub timeout_secs: Option<u64>,

  /// RGB 路径的归一化策略 (range-preserving | min-max)
  #[arg(long, default_value_t = NormalizationPolicy::RangePreserving)]
  pub rgb_policy: NormalizationPolicy,

  /// NDVI 路径的归一化策略 (range-preserving | min-max)
  #[arg(long, default_value_t = NormalizationPolicy::RangePreserving)]
  pub ndvi_policy: NormalizationPolicy,

  /// 摄像头路径的归一化策略 (range-preserving | min-max)
  #[arg(long, default_value_t = NormalizationPolicy::MinMaxRescale)]
  pub webcam_policy: NormalizationPolicy,

  /// 关闭 NDVI 文件的高斯平滑
  #[arg(long)]
  pub no_ndvi_smoothing: bool,

  /// 临时文件目录
  #[arg(long, value_name = "DIR")]
  pub staging_dir: Option<PathBuf>,
}

impl Args {
  pub fn pipeline_config(&self) -> PipelineConfig {
    PipelineConfig {
      rgb_policy: self.rgb_policy,
      ndvi_policy: self.ndvi_policy,
      webcam_policy: self.webcam_policy,
      ndvi_smoothing: !self.no_ndvi_smoothing,
      staging_dir: self.staging_dir.clone(),
    }
  }

  pub fn timeout(&self) -> Option<Duration> {
    self.timeout_secs.map(Duration::from_secs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_match_pipeline_config() {
    let args = Args::parse_from([
      "qingmiao",
      "--model",
      "onnx:///m.onnx",
      "--input",
      "file:///a.png",
    ]);
    assert_eq!(args.pipeline_config(), PipelineConfig::default());
    assert_eq!(args.output.scheme(), "stdout");
    assert!(args.timeout().is_none());
  }

  #[test]
  fn test_overrides() {
    let args = Args::parse_from([
      "qingmiao",
      "--model",
      "onnx:///m.onnx",
      "--input",
      "file:///a.tif",
      "--input",
      "file:///b.npy",
      "--ndvi-policy",
      "min-max",
      "--no-ndvi-smoothing",
      "--timeout-secs",
      "30",
    ]);
    let config = args.pipeline_config();
    assert_eq!(config.ndvi_policy, NormalizationPolicy::MinMaxRescale);
    assert!(!config.ndvi_smoothing);
    assert_eq!(args.input.len(), 2);
    assert_eq!(args.timeout(), Some(Duration::from_secs(30)));
  }
}
