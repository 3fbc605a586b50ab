// 该文件是 Qingmiao （青苗） 项目的一部分。
// src/frame.rs - NHWC 模型输入张量定义
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

use ndarray::{Array2, Array3, ArrayView3};

use crate::normalize::NormalizationPolicy;

pub const TENSOR_CHANNELS: usize = 3;
pub const INCEPTION_INPUT_SIZE: u32 = 299;

pub trait AsNhwcTensor<const W: u32, const H: u32> {
  fn as_nhwc(&self) -> ArrayView3<'_, f32>;
}

/// (H, W, 3) 的模型输入，三个通道内容相同
#[derive(Debug, Clone)]
pub struct InputTensor<const W: u32, const H: u32> {
  data: Array3<f32>,
  policy: NormalizationPolicy,
}

/// 部署模型的输入尺寸
pub type InceptionTensor = InputTensor<INCEPTION_INPUT_SIZE, INCEPTION_INPUT_SIZE>;

impl<const W: u32, const H: u32> InputTensor<W, H> {
  /// 将单通道平面复制为三个通道
  ///
  /// 平面尺寸必须为 (H, W)。
  pub fn from_plane(plane: Array2<f32>, policy: NormalizationPolicy) -> Self {
    if plane.dim() != (H as usize, W as usize) {
      panic!(
        "平面尺寸不匹配: 期望 {}x{}, 实际 {:?}",
        H,
        W,
        plane.dim()
      );
    }
    let data = Array3::from_shape_fn((H as usize, W as usize, TENSOR_CHANNELS), |(y, x, _)| {
      plane[[y, x]]
    });
    Self { data, policy }
  }

  /// 生成该张量所用的归一化策略
  pub fn policy(&self) -> NormalizationPolicy {
    self.policy
  }
}

impl<const W: u32, const H: u32> AsNhwcTensor<W, H> for InputTensor<W, H> {
  fn as_nhwc(&self) -> ArrayView3<'_, f32> {
    self.data.view()
  }
}
