// 该文件是 Qingmiao （青苗） 项目的一部分。
// src/normalize.rs - 单通道图到模型输入张量的归一化
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

use std::{fmt, str::FromStr};

use ndarray::{Array2, ArrayView2};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{frame::InputTensor, model::NAN_SENTINEL};

/// 全部为 NaN 时的填充值
pub const ALL_MISSING_FILL: f32 = 0.0;
const MIN_MAX_EPSILON: f32 = 1e-8;
/// OpenCV 在 ksize = 5、sigma <= 0 时使用的固定核
const GAUSSIAN_KERNEL_5: [f64; 5] = [0.0625, 0.25, 0.375, 0.25, 0.0625];

/// 归一化策略，由调用方显式选择
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NormalizationPolicy {
  /// 保留指数原始的 [-1, 1] 取值，NaN 先以有效均值修复
  #[default]
  RangePreserving,
  /// NaN 以哨兵值 -2 替换后线性拉伸到 [0, 1]
  MinMaxRescale,
}

impl fmt::Display for NormalizationPolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      NormalizationPolicy::RangePreserving => write!(f, "range-preserving"),
      NormalizationPolicy::MinMaxRescale => write!(f, "min-max"),
    }
  }
}

impl FromStr for NormalizationPolicy {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "range-preserving" | "range" => Ok(NormalizationPolicy::RangePreserving),
      "min-max" | "minmax" => Ok(NormalizationPolicy::MinMaxRescale),
      other => Err(format!("未知的归一化策略: {}", other)),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Smoothing {
  #[default]
  None,
  /// 5x5 高斯模糊
  Gaussian5x5,
}

#[derive(Error, Debug, PartialEq)]
pub enum NormalizeError {
  #[error("输入为空: {height}x{width}")]
  EmptyInput { height: usize, width: usize },
}

/// 将单通道图压缩为固定尺寸的三通道张量
#[derive(Debug, Clone, Copy)]
pub struct Normalizer<const W: u32, const H: u32> {
  policy: NormalizationPolicy,
  smoothing: Smoothing,
}

impl<const W: u32, const H: u32> Normalizer<W, H> {
  pub fn new(policy: NormalizationPolicy, smoothing: Smoothing) -> Self {
    Self { policy, smoothing }
  }

  pub fn range_preserving(smoothing: Smoothing) -> Self {
    Self::new(NormalizationPolicy::RangePreserving, smoothing)
  }

  pub fn min_max_rescale() -> Self {
    Self::new(NormalizationPolicy::MinMaxRescale, Smoothing::None)
  }

  pub fn policy(&self) -> NormalizationPolicy {
    self.policy
  }

  pub fn normalize(&self, plane: ArrayView2<f32>) -> Result<InputTensor<W, H>, NormalizeError> {
    let (height, width) = plane.dim();
    if height == 0 || width == 0 {
      return Err(NormalizeError::EmptyInput { height, width });
    }
    debug!(
      "归一化 {}x{} -> {}x{}, 策略: {}, 平滑: {:?}",
      height, width, H, W, self.policy, self.smoothing
    );

    let plane = match self.policy {
      NormalizationPolicy::RangePreserving => {
        let mut repaired = plane.to_owned();
        let fill = fill_missing_with_mean(&mut repaired);
        debug!("NaN 填充值: {}", fill);
        let smoothed = self.smooth(repaired);
        resize_area(smoothed.view(), H as usize, W as usize)
      }
      NormalizationPolicy::MinMaxRescale => {
        let smoothed = self.smooth(plane.to_owned());
        let mut resized = resize_area(smoothed.view(), H as usize, W as usize);
        resized.mapv_inplace(|v| if v.is_nan() { NAN_SENTINEL } else { v });
        rescale_min_max(&mut resized);
        resized
      }
    };

    Ok(InputTensor::from_plane(plane, self.policy))
  }

  fn smooth(&self, plane: Array2<f32>) -> Array2<f32> {
    match self.smoothing {
      Smoothing::None => plane,
      Smoothing::Gaussian5x5 => gaussian_blur_5x5(plane.view()),
    }
  }
}

/// 以有限值的均值替换 NaN，返回实际使用的填充值
///
/// 没有任何有限值时使用 [`ALL_MISSING_FILL`]。
pub fn fill_missing_with_mean(plane: &mut Array2<f32>) -> f32 {
  let (sum, count) = plane
    .iter()
    .filter(|v| v.is_finite())
    .fold((0.0f64, 0usize), |(s, c), &v| (s + v as f64, c + 1));

  let fill = if count == 0 {
    warn!("栅格不含有效值, 使用 {} 填充", ALL_MISSING_FILL);
    ALL_MISSING_FILL
  } else {
    (sum / count as f64) as f32
  };

  plane.mapv_inplace(|v| if v.is_nan() { fill } else { v });
  fill
}

/// 线性拉伸到 [0, 1]
pub fn rescale_min_max(plane: &mut Array2<f32>) {
  let (min, max) = plane
    .iter()
    .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
  let range = max - min + MIN_MAX_EPSILON;
  plane.mapv_inplace(|v| ((v - min) / range).clamp(0.0, 1.0));
}

fn reflect_101(index: isize, len: usize) -> usize {
  if len == 1 {
    return 0;
  }
  let period = 2 * (len as isize - 1);
  let mut i = index.rem_euclid(period);
  if i >= len as isize {
    i = period - i;
  }
  i as usize
}

/// 5x5 高斯模糊，边界按 reflect-101 延拓
///
/// NaN 像元不参与加权且保持为 NaN。
pub fn gaussian_blur_5x5(plane: ArrayView2<f32>) -> Array2<f32> {
  let (height, width) = plane.dim();
  let radius = (GAUSSIAN_KERNEL_5.len() / 2) as isize;

  let mut num = Array2::<f64>::zeros((height, width));
  let mut den = Array2::<f64>::zeros((height, width));
  for y in 0..height {
    for x in 0..width {
      let (mut n, mut d) = (0.0, 0.0);
      for (k, &w) in GAUSSIAN_KERNEL_5.iter().enumerate() {
        let sx = reflect_101(x as isize + k as isize - radius, width);
        let v = plane[[y, sx]];
        if !v.is_nan() {
          n += w * v as f64;
          d += w;
        }
      }
      num[[y, x]] = n;
      den[[y, x]] = d;
    }
  }

  Array2::from_shape_fn((height, width), |(y, x)| {
    if plane[[y, x]].is_nan() {
      return f32::NAN;
    }
    let (mut n, mut d) = (0.0, 0.0);
    for (k, &w) in GAUSSIAN_KERNEL_5.iter().enumerate() {
      let sy = reflect_101(y as isize + k as isize - radius, height);
      n += w * num[[sy, x]];
      d += w * den[[sy, x]];
    }
    if d > 0.0 { (n / d) as f32 } else { f32::NAN }
  })
}

/// 单轴重采样权重: 缩小时按面积覆盖，放大时按半像素中心线性插值
fn axis_weights(src: usize, dst: usize) -> Vec<Vec<(usize, f64)>> {
  let scale = src as f64 / dst as f64;
  (0..dst)
    .map(|d| {
      if scale >= 1.0 {
        let start = d as f64 * scale;
        let end = start + scale;
        let first = start.floor() as usize;
        let last = (end.ceil() as usize).min(src);
        (first..last)
          .filter_map(|s| {
            let covered = ((s + 1) as f64).min(end) - (s as f64).max(start);
            (covered > 1e-12).then_some((s, covered / scale))
          })
          .collect()
      } else {
        let center = ((d as f64 + 0.5) * scale - 0.5).clamp(0.0, (src - 1) as f64);
        let left = center.floor() as usize;
        let right = (left + 1).min(src - 1);
        let frac = center - left as f64;
        if right == left || frac == 0.0 {
          vec![(left, 1.0)]
        } else {
          vec![(left, 1.0 - frac), (right, frac)]
        }
      }
    })
    .collect()
}

/// 面积一致的重采样到 (out_h, out_w)
///
/// NaN 不参与平均; 覆盖区域内全部为 NaN 时输出 NaN。
pub fn resize_area(plane: ArrayView2<f32>, out_h: usize, out_w: usize) -> Array2<f32> {
  let (in_h, in_w) = plane.dim();
  let x_weights = axis_weights(in_w, out_w);
  let y_weights = axis_weights(in_h, out_h);

  let mut num = Array2::<f64>::zeros((in_h, out_w));
  let mut den = Array2::<f64>::zeros((in_h, out_w));
  for y in 0..in_h {
    for (ox, weights) in x_weights.iter().enumerate() {
      let (mut n, mut d) = (0.0, 0.0);
      for &(sx, w) in weights {
        let v = plane[[y, sx]];
        if !v.is_nan() {
          n += w * v as f64;
          d += w;
        }
      }
      num[[y, ox]] = n;
      den[[y, ox]] = d;
    }
  }

  let mut out = Array2::<f32>::zeros((out_h, out_w));
  for (oy, weights) in y_weights.iter().enumerate() {
    for ox in 0..out_w {
      let (mut n, mut d) = (0.0, 0.0);
      for &(sy, w) in weights {
        n += w * num[[sy, ox]];
        d += w * den[[sy, ox]];
      }
      out[[oy, ox]] = if d > 0.0 { (n / d) as f32 } else { f32::NAN };
    }
  }
  out
}
