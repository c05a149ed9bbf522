// 该文件是 Yishang （衣裳） 项目的一部分。
// src/artifact.rs - 单次运行的产物目录
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

//! 每次运行产生一个以时间戳命名的目录:
//!
//! ```text
//! runs/<run-id>/original_<name>
//! runs/<run-id>/detected_<name>
//! runs/<run-id>/cropped/cropped_<index>_<class>.<ext>
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, TimeZone};
use image::{DynamicImage, ImageFormat, ImageReader, RgbImage};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::detector::Detection;

pub mod draw;
use self::draw::Draw;

const ORIGINAL_PREFIX: &str = "original_";
const DETECTED_PREFIX: &str = "detected_";
const CROPPED_DIR: &str = "cropped";

#[derive(Error, Debug)]
pub enum ArtifactError {
  #[error("无法读取源图像 {path}: {source}")]
  SourceImage {
    path: PathBuf,
    #[source]
    source: image::ImageError,
  },
  #[error("源图像路径没有文件名: {0}")]
  SourceName(PathBuf),
  #[error("运行目录已存在: {0}")]
  RunDirectoryExists(PathBuf),
  #[error("I/O 错误 {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("图像写入错误 {path}: {source}")]
  ImageWrite {
    path: PathBuf,
    #[source]
    source: image::ImageError,
  },
}

impl ArtifactError {
  fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
    move |source| ArtifactError::Io {
      path: path.to_path_buf(),
      source,
    }
  }

  /// 是否由源图像本身引起
  pub fn is_source_error(&self) -> bool {
    matches!(
      self,
      ArtifactError::SourceImage { .. } | ArtifactError::SourceName(_)
    )
  }
}

/// 运行标识，精确到秒的本地时间
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunId(String);

impl RunId {
  pub fn now() -> Self {
    Self::at(&Local::now())
  }

  pub fn at<Tz: TimeZone>(time: &DateTime<Tz>) -> Self
  where
    Tz::Offset: fmt::Display,
  {
    RunId(time.format("%Y%m%d_%H%M%S").to_string())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for RunId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, Clone)]
pub struct RunArtifacts {
  pub run_id: RunId,
  pub run_directory: PathBuf,
  pub original_image_path: PathBuf,
  pub result_image_path: PathBuf,
  pub cropped_dir: PathBuf,
  pub detections: Vec<Detection>,
}

/// 已解码的源图像
struct SourceImage {
  path: PathBuf,
  name: String,
  extension: String,
  format: ImageFormat,
  image: DynamicImage,
}

impl SourceImage {
  fn open(path: &Path) -> Result<Self, ArtifactError> {
    let source_error = |source| ArtifactError::SourceImage {
      path: path.to_path_buf(),
      source,
    };

    let name = path
      .file_name()
      .map(|n| n.to_string_lossy().into_owned())
      .ok_or_else(|| ArtifactError::SourceName(path.to_path_buf()))?;

    let reader = ImageReader::open(path)
      .map_err(|e| source_error(image::ImageError::IoError(e)))?
      .with_guessed_format()
      .map_err(|e| source_error(image::ImageError::IoError(e)))?;
    let format = reader.format().unwrap_or(ImageFormat::Png);
    let image = reader.decode().map_err(source_error)?;

    let extension = path
      .extension()
      .map(|e| e.to_string_lossy().into_owned())
      .unwrap_or_else(|| format.extensions_str().first().unwrap_or(&"png").to_string());

    Ok(Self {
      path: path.to_path_buf(),
      name,
      extension,
      format,
      image,
    })
  }

  fn dimensions(&self) -> (u32, u32) {
    (self.image.width(), self.image.height())
  }
}

pub struct ArtifactManager {
  runs_dir: PathBuf,
  draw: Draw,
}

impl ArtifactManager {
  pub fn new(runs_dir: impl Into<PathBuf>, draw: Draw) -> Self {
    Self {
      runs_dir: runs_dir.into(),
      draw,
    }
  }

  pub fn runs_dir(&self) -> &Path {
    &self.runs_dir
  }

  /// 以当前时间为运行标识打包
  pub fn package(
    &self,
    image_path: &Path,
    detections: Vec<Detection>,
    detector_output_dir: &Path,
  ) -> Result<RunArtifacts, ArtifactError> {
    self.package_as(RunId::now(), image_path, detections, detector_output_dir)
  }

  pub fn package_as(
    &self,
    run_id: RunId,
    image_path: &Path,
    mut detections: Vec<Detection>,
    detector_output_dir: &Path,
  ) -> Result<RunArtifacts, ArtifactError> {
    let source = SourceImage::open(image_path)?;

    let run_directory = self.create_run_directory(&run_id)?;
    info!("运行目录: {}", run_directory.display());

    let original_image_path = run_directory.join(format!("{ORIGINAL_PREFIX}{}", source.name));
    std::fs::copy(&source.path, &original_image_path)
      .map_err(ArtifactError::io(&original_image_path))?;
    debug!("原图已保存: {}", original_image_path.display());

    let result_image_path = run_directory.join(format!("{DETECTED_PREFIX}{}", source.name));
    self.place_base_image(&source, detector_output_dir, &result_image_path)?;

    let cropped_dir = run_directory.join(CROPPED_DIR);
    std::fs::create_dir(&cropped_dir).map_err(ArtifactError::io(&cropped_dir))?;

    if !detections.is_empty() {
      let mut annotated = open_rgb(&result_image_path)?;
      let source_rgb = source.image.to_rgb8();

      for (index, detection) in detections.iter_mut().enumerate() {
        self.draw.draw_detection(&mut annotated, detection);
        let cropped = self.write_crop(&source, &source_rgb, &cropped_dir, index, detection)?;
        detection.cropped_image = cropped;
      }

      annotated
        .save_with_format(&result_image_path, source.format)
        .map_err(|source| ArtifactError::ImageWrite {
          path: result_image_path.clone(),
          source,
        })?;
    }
    info!(
      "结果图已保存: {}，共 {} 个目标",
      result_image_path.display(),
      detections.len()
    );

    Ok(RunArtifacts {
      run_id,
      run_directory,
      original_image_path,
      result_image_path,
      cropped_dir,
      detections,
    })
  }

  fn create_run_directory(&self, run_id: &RunId) -> Result<PathBuf, ArtifactError> {
    std::fs::create_dir_all(&self.runs_dir).map_err(ArtifactError::io(&self.runs_dir))?;

    let run_directory = self.runs_dir.join(run_id.as_str());
    match std::fs::create_dir(&run_directory) {
      Ok(()) => Ok(run_directory),
      Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
        Err(ArtifactError::RunDirectoryExists(run_directory))
      }
      Err(source) => Err(ArtifactError::Io {
        path: run_directory,
        source,
      }),
    }
  }

  /// 优先使用检测器写出的标注图作为底图，找不到时退回原图副本
  fn place_base_image(
    &self,
    source: &SourceImage,
    detector_output_dir: &Path,
    target: &Path,
  ) -> Result<(), ArtifactError> {
    let by_product = detector_output_dir.join(&source.name);

    let usable = if by_product.is_file() {
      match image::image_dimensions(&by_product) {
        Ok(dims) if dims == source.dimensions() => true,
        Ok(dims) => {
          warn!(
            "检测器标注图尺寸 {:?} 与原图 {:?} 不一致，改用原图",
            dims,
            source.dimensions()
          );
          false
        }
        Err(e) => {
          warn!("无法读取检测器标注图 {}: {}，改用原图", by_product.display(), e);
          false
        }
      }
    } else {
      warn!(
        "未找到检测器标注图 {}，改用原图作为底图",
        by_product.display()
      );
      false
    };

    let base = if usable { by_product.as_path() } else { source.path.as_path() };
    std::fs::copy(base, target).map_err(ArtifactError::io(target))?;
    debug!("底图来自: {}", base.display());
    Ok(())
  }

  fn write_crop(
    &self,
    source: &SourceImage,
    source_rgb: &RgbImage,
    cropped_dir: &Path,
    index: usize,
    detection: &Detection,
  ) -> Result<Option<String>, ArtifactError> {
    let bbox = detection.bbox;
    if bbox.is_empty() {
      warn!(
        "第 {} 个目标 {} 的边界框面积为零，跳过裁剪",
        index, detection.class_name
      );
      return Ok(None);
    }

    let filename = format!(
      "cropped_{}_{}.{}",
      index,
      sanitize(&detection.class_name),
      source.extension
    );
    let path = cropped_dir.join(&filename);

    let crop =
      image::imageops::crop_imm(source_rgb, bbox.x1, bbox.y1, bbox.width(), bbox.height()).to_image();
    crop
      .save_with_format(&path, source.format)
      .map_err(|source| ArtifactError::ImageWrite {
        path: path.clone(),
        source,
      })?;
    debug!("裁剪图已保存: {}", path.display());

    Ok(Some(filename))
  }
}

fn open_rgb(path: &Path) -> Result<RgbImage, ArtifactError> {
  let image = ImageReader::open(path)
    .map_err(ArtifactError::io(path))?
    .with_guessed_format()
    .map_err(ArtifactError::io(path))?
    .decode()
    .map_err(|source| ArtifactError::ImageWrite {
      path: path.to_path_buf(),
      source,
    })?;
  Ok(image.to_rgb8())
}

/// 类别名中只保留字母、数字、'-' 与 '_'
fn sanitize(class_name: &str) -> String {
  let name: String = class_name
    .chars()
    .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
    .collect();
  if name.is_empty() { "object".to_string() } else { name }
}
