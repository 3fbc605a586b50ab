// 该文件是 Qingmiao （青苗） 项目的一部分。
// src/index.rs - 植被指数计算
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

use ndarray::{Array2, ArrayView3, Axis, Zip, s};
use thiserror::Error;
use tracing::debug;

use crate::raster::VegetationIndexMap;

const RGB_CHANNELS: usize = 3;
/// VARI 分母为零时的替代值
pub const VARI_EPSILON: f32 = 1e-10;
/// 伪 NDVI 分母偏移
pub const PSEUDO_NDVI_EPSILON: f32 = 1e-8;

#[derive(Error, Debug, PartialEq)]
pub enum IndexError {
  #[error("输入形状无效: 期望最后一维为 {expected} 个通道, 实际形状 {actual:?}")]
  InvalidInputShape {
    expected: usize,
    actual: Vec<usize>,
  },
}

fn check_rgb(rgb: &ArrayView3<f32>) -> Result<(), IndexError> {
  if rgb.dim().2 != RGB_CHANNELS {
    return Err(IndexError::InvalidInputShape {
      expected: RGB_CHANNELS,
      actual: rgb.shape().to_vec(),
    });
  }
  Ok(())
}

/// Visible Atmospherically Resistant Index
///
/// `VARI = (G - R) / (R + G - B)`，通道顺序为 (R, G, B)。
/// 分母恰为零处以 [`VARI_EPSILON`] 代替，结果截断到 [-1, 1]。
pub fn vari(rgb: ArrayView3<f32>) -> Result<VegetationIndexMap, IndexError> {
  check_rgb(&rgb)?;

  let red = rgb.index_axis(Axis(2), 0);
  let green = rgb.index_axis(Axis(2), 1);
  let blue = rgb.index_axis(Axis(2), 2);

  let mut out = Array2::<f32>::zeros(red.dim());
  Zip::from(&mut out)
    .and(&red)
    .and(&green)
    .and(&blue)
    .for_each(|o, &r, &g, &b| {
      let mut denominator = r + g - b;
      if denominator == 0.0 {
        denominator = VARI_EPSILON;
      }
      *o = (g - r) / denominator;
    });

  debug!("VARI 计算完成: {:?}", out.dim());
  Ok(VegetationIndexMap::clamped(out))
}

/// 摄像头画面的伪 NDVI：以绿色通道代替近红外
///
/// `(G - R) / (G + R + 1e-8)`，截断到 [-1, 1]。
pub fn pseudo_ndvi(rgb: ArrayView3<f32>) -> Result<VegetationIndexMap, IndexError> {
  check_rgb(&rgb)?;

  let red = rgb.index_axis(Axis(2), 0);
  let green = rgb.index_axis(Axis(2), 1);

  let mut out = Array2::<f32>::zeros(red.dim());
  Zip::from(&mut out)
    .and(&red)
    .and(&green)
    .for_each(|o, &r, &g| *o = (g - r) / (g + r + PSEUDO_NDVI_EPSILON));

  debug!("伪 NDVI 计算完成: {:?}", out.dim());
  Ok(VegetationIndexMap::clamped(out))
}

/// 取居中的最大正方形区域
pub fn center_square_crop(rgb: ArrayView3<f32>) -> ArrayView3<f32> {
  let (h, w, _) = rgb.dim();
  let m = h.min(w);
  let top = (h - m) / 2;
  let left = (w - m) / 2;
  rgb.slice_move(s![top..top + m, left..left + m, ..])
}
