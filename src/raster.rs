// 该文件是 Qingmiao （青苗） 项目的一部分。
// src/raster.rs - 栅格与地理范围定义
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

use ndarray::Array2;
use serde::Serialize;
use serde_json::{Value, json};

/// 栅格的地理范围与坐标参考系
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoBounds {
  pub west: f64,
  pub south: f64,
  pub east: f64,
  pub north: f64,
  /// 形如 `EPSG:4326` 的坐标参考系标识
  pub crs: Option<String>,
}

impl GeoBounds {
  /// 转换为包含单个矩形要素的 GeoJSON FeatureCollection
  pub fn to_geojson(&self) -> Value {
    let ring = [
      [self.east, self.south],
      [self.east, self.north],
      [self.west, self.north],
      [self.west, self.south],
      [self.east, self.south],
    ];
    json!({
      "type": "FeatureCollection",
      "features": [{
        "type": "Feature",
        "geometry": {
          "type": "Polygon",
          "coordinates": [ring],
        },
        "properties": { "CRS": self.crs },
      }],
    })
  }
}

/// 单波段栅格，NaN 表示无数据
#[derive(Debug, Clone)]
pub struct Raster {
  data: Array2<f32>,
  bounds: Option<GeoBounds>,
}

impl Raster {
  pub fn new(data: Array2<f32>) -> Self {
    Self { data, bounds: None }
  }

  pub fn with_bounds(mut self, bounds: Option<GeoBounds>) -> Self {
    self.bounds = bounds;
    self
  }

  /// (height, width)
  pub fn shape(&self) -> (usize, usize) {
    self.data.dim()
  }

  pub fn data(&self) -> &Array2<f32> {
    &self.data
  }

  pub fn bounds(&self) -> Option<&GeoBounds> {
    self.bounds.as_ref()
  }

  pub fn into_parts(self) -> (Array2<f32>, Option<GeoBounds>) {
    (self.data, self.bounds)
  }
}

/// 植被指数图，有限值位于 [-1, 1]，NaN 留给归一化阶段修复
#[derive(Debug, Clone)]
pub struct VegetationIndexMap {
  data: Array2<f32>,
}

impl VegetationIndexMap {
  /// 按 [-1, 1] 截断后构造，NaN 原样保留
  pub fn clamped(mut data: Array2<f32>) -> Self {
    data.mapv_inplace(|v| if v.is_nan() { v } else { v.clamp(-1.0, 1.0) });
    Self { data }
  }

  /// NDVI 栅格直通
  pub fn from_ndvi(raster: Raster) -> Self {
    let (data, _) = raster.into_parts();
    Self::clamped(data)
  }

  pub fn data(&self) -> &Array2<f32> {
    &self.data
  }
}
