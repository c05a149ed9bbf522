// 该文件是 Yishang （衣裳） 项目的一部分。
// src/geometry.rs - 边界框坐标换算
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Yishang Contributors

use serde::{Deserialize, Serialize};

/// 归一化边界框 [cx, cy, w, h]，取值范围 [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct NormalizedBox {
  pub cx: f32,
  pub cy: f32,
  pub w: f32,
  pub h: f32,
}

impl NormalizedBox {
  pub fn new(cx: f32, cy: f32, w: f32, h: f32) -> Self {
    Self { cx, cy, w, h }
  }

  /// 按图像尺寸换算为绝对像素范围
  pub fn extents(&self, image_width: u32, image_height: u32) -> Extents {
    convert(image_width, image_height, self.cx, self.cy, self.w, self.h)
  }
}

impl From<[f32; 4]> for NormalizedBox {
  fn from([cx, cy, w, h]: [f32; 4]) -> Self {
    Self { cx, cy, w, h }
  }
}

impl From<NormalizedBox> for [f32; 4] {
  fn from(b: NormalizedBox) -> Self {
    [b.cx, b.cy, b.w, b.h]
  }
}

/// 绝对像素范围，顺序为 (left, right, top, bottom)
///
/// 这是 YOLO 标注换算的原始顺序，不能直接当作角点对使用，
/// 需要经过 [`Extents::to_pixel_box`] 转换。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extents {
  pub left: f32,
  pub right: f32,
  pub top: f32,
  pub bottom: f32,
}

/// 像素角点坐标 [x1, y1, x2, y2]，满足 x1 <= x2, y1 <= y2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u32; 4]", into = "[u32; 4]")]
pub struct PixelBox {
  pub x1: u32,
  pub y1: u32,
  pub x2: u32,
  pub y2: u32,
}

impl PixelBox {
  pub fn width(&self) -> u32 {
    self.x2 - self.x1
  }

  pub fn height(&self) -> u32 {
    self.y2 - self.y1
  }

  pub fn is_empty(&self) -> bool {
    self.width() == 0 || self.height() == 0
  }
}

impl From<[u32; 4]> for PixelBox {
  fn from([x1, y1, x2, y2]: [u32; 4]) -> Self {
    Self {
      x1: x1.min(x2),
      y1: y1.min(y2),
      x2: x1.max(x2),
      y2: y1.max(y2),
    }
  }
}

impl From<PixelBox> for [u32; 4] {
  fn from(b: PixelBox) -> Self {
    [b.x1, b.y1, b.x2, b.y2]
  }
}

/// 将归一化的中心点与宽高换算为绝对像素范围
pub fn convert(
  image_width: u32,
  image_height: u32,
  cx: f32,
  cy: f32,
  w: f32,
  h: f32,
) -> Extents {
  let (iw, ih) = (image_width as f32, image_height as f32);
  let (cx, cy) = (cx * iw, cy * ih);
  let (half_w, half_h) = (w * iw / 2.0, h * ih / 2.0);

  Extents {
    left: cx - half_w,
    right: cx + half_w,
    top: cy - half_h,
    bottom: cy + half_h,
  }
}

impl Extents {
  /// 转换为角点坐标，四舍五入并裁剪到图像范围内
  pub fn to_pixel_box(&self, image_width: u32, image_height: u32) -> PixelBox {
    let clamp = |v: f32, max: u32| -> u32 {
      if v.is_nan() {
        return 0;
      }
      v.round().clamp(0.0, max as f32) as u32
    };

    let (x1, x2) = (clamp(self.left, image_width), clamp(self.right, image_width));
    let (y1, y2) = (clamp(self.top, image_height), clamp(self.bottom, image_height));

    PixelBox::from([x1, y1, x2, y2])
  }
}
