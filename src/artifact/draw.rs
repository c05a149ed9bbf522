// 该文件是 Yishang （衣裳） 项目的一部分。
// src/artifact/draw.rs - 检测结果可视化
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

use std::path::{Path, PathBuf};

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use tracing::{debug, warn};

use crate::detector::Detection;

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_HEIGHT: i32 = 24;
const LABEL_CHAR_WIDTH: f32 = 11.0; // 每字符平均宽度（粗略估计）
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const LABEL_COLOR: [u8; 3] = [0, 0, 255]; // 蓝色
const BOX_THICKNESS: u32 = 2;

/// 未指定字体时依次尝试的系统字体
const SYSTEM_FONTS: &[&str] = &[
  "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
  "/usr/share/fonts/dejavu/DejaVuSans.ttf",
  "/usr/share/fonts/TTF/DejaVuSans.ttf",
  "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
  "/System/Library/Fonts/Supplemental/Arial.ttf",
  "C:\\Windows\\Fonts\\arial.ttf",
];

pub struct Draw {
  font_size: f32,
  label_text_height: i32,
  label_char_width: f32,
  label_text_vertical_padding: i32,
  label_color: [u8; 3],
  font: Option<FontVec>,
}

impl Default for Draw {
  fn default() -> Self {
    Self::with_font(None)
  }
}

impl Draw {
  /// 加载标签字体；找不到字体时仍然绘制边框与标签底色
  pub fn with_font(font_path: Option<&Path>) -> Self {
    let candidates: Vec<PathBuf> = match font_path {
      Some(path) => vec![path.to_path_buf()],
      None => SYSTEM_FONTS.iter().map(PathBuf::from).collect(),
    };

    let font = candidates.iter().find_map(|path| {
      let data = std::fs::read(path).ok()?;
      match FontVec::try_from_vec(data) {
        Ok(font) => {
          debug!("使用标签字体: {}", path.display());
          Some(font)
        }
        Err(e) => {
          warn!("无法解析字体 {}: {}", path.display(), e);
          None
        }
      }
    });
    if font.is_none() {
      warn!("未找到可用字体，标签将不含文字");
    }

    Self {
      font_size: LABEL_FONT_SIZE,
      label_text_height: LABEL_TEXT_HEIGHT,
      label_char_width: LABEL_CHAR_WIDTH,
      label_text_vertical_padding: LABEL_TEXT_VERTICAL_PADDING,
      label_color: LABEL_COLOR,
      font,
    }
  }

  /// 在图像上绘制一个检测框及其 "类别 置信度" 标签
  pub fn draw_detection(&self, image: &mut RgbImage, detection: &Detection) {
    let color = Rgb(self.label_color);
    let bbox = detection.bbox;
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
      return;
    }

    // 边框加粗，逐层向内收缩
    for t in 0..BOX_THICKNESS {
      let width = bbox.width().saturating_sub(2 * t);
      let height = bbox.height().saturating_sub(2 * t);
      if width == 0 || height == 0 {
        break;
      }
      let rect = Rect::at((bbox.x1 + t) as i32, (bbox.y1 + t) as i32).of_size(width, height);
      draw_hollow_rect_mut(image, rect, color);
    }

    let label = format!("{} {:.2}", detection.class_name, detection.confidence);

    // 标签放在边框上方，空间不足时贴近图像顶部
    let text_width = (label.chars().count() as f32 * self.label_char_width) as i32;
    let label_x = (bbox.x1 as i32).min(w - 1);
    let label_y = (bbox.y1 as i32 - self.label_text_height).max(0);
    let label_width = text_width.min(w - label_x).max(0) as u32;
    let label_height = self.label_text_height.min(h - label_y).max(0) as u32;

    if label_width == 0 || label_height == 0 {
      return;
    }

    let rect = Rect::at(label_x, label_y).of_size(label_width, label_height);
    draw_filled_rect_mut(image, rect, color);

    if let Some(font) = &self.font {
      draw_text_mut(
        image,
        Rgb([255u8, 255u8, 255u8]),
        label_x,
        label_y + self.label_text_vertical_padding,
        PxScale::from(self.font_size),
        font,
        &label,
      );
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::geometry::PixelBox;

  fn detection(bbox: [u32; 4]) -> Detection {
    Detection {
      class_name: "shirt".to_string(),
      confidence: 0.87,
      bbox: PixelBox::from(bbox),
      cropped_image: None,
    }
  }

  #[test]
  fn draws_box_edges() {
    let draw = Draw::with_font(Some(Path::new("/nonexistent/font.ttf")));
    let mut image = RgbImage::new(100, 200);
    draw.draw_detection(&mut image, &detection([40, 70, 60, 130]));

    assert_eq!(image.get_pixel(40, 100), &Rgb(LABEL_COLOR));
    assert_eq!(image.get_pixel(59, 100), &Rgb(LABEL_COLOR));
    assert_eq!(image.get_pixel(41, 100), &Rgb(LABEL_COLOR));
    assert_eq!(image.get_pixel(50, 100), &Rgb([0, 0, 0]));
  }

  #[test]
  fn zero_area_box_and_edge_labels_do_not_panic() {
    let draw = Draw::with_font(Some(Path::new("/nonexistent/font.ttf")));
    let mut image = RgbImage::new(100, 200);
    draw.draw_detection(&mut image, &detection([30, 30, 30, 30]));
    draw.draw_detection(&mut image, &detection([100, 200, 100, 200]));
    draw.draw_detection(&mut image, &detection([0, 0, 100, 200]));
  }
}
