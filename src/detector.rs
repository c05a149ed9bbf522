// 该文件是 Yishang （衣裳） 项目的一部分。
// src/detector.rs - 检测器门面
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

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, redirect_stdout};
use crate::geometry::{NormalizedBox, PixelBox};

mod exec;
pub use self::exec::{ExecBackend, ExecModel};

#[derive(Error, Debug)]
pub enum DetectorError {
  #[error("模型文件不可用: {path}: {source}")]
  ModelLoad {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("训练配置不存在: {0}")]
  TrainingConfigMissing(PathBuf),
  #[error("模型训练失败: {0}")]
  Bootstrap(String),
  #[error("推理失败: {0}")]
  Predict(String),
  #[error("获取训练锁失败: {path}: {source}")]
  Lock {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("启动检测程序失败: {0}")]
  Spawn(std::io::Error),
  #[error("无法清理检测器旧产物 {path}: {source}")]
  StaleOutput {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("检测结果格式错误: {0}")]
  Protocol(#[from] serde_json::Error),
  #[error("检测器地址方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error(transparent)]
  Channel(#[from] ChannelError),
}

/// 检测器直接给出的结果，边界框为归一化坐标
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
  #[serde(rename = "class")]
  pub class_name: String,
  pub confidence: f32,
  #[serde(rename = "box")]
  pub bbox: NormalizedBox,
}

/// 一个检测到的目标
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
  #[serde(rename = "class")]
  pub class_name: String,
  pub confidence: f32,
  pub bbox: PixelBox,
  pub cropped_image: Option<String>,
}

/// 外部检测器接口
///
/// 检测器在调用期间可能向 stdout 写入大量进度信息，
/// 调用方负责在 [`crate::channel::StdoutGuard`] 内调用这些方法。
pub trait DetectorBackend {
  type Handle;

  fn load(&self, model_path: &Path) -> Result<Self::Handle, DetectorError>;

  /// 从基础权重训练，并把结果保存到 `save_to`
  fn bootstrap(
    &self,
    weights_id: &str,
    training_config: &Path,
    epochs: u32,
    save_to: &Path,
  ) -> Result<Self::Handle, DetectorError>;

  /// `output_dir` 是检测器可以写入附带产物（例如标注图）的目录
  fn predict(
    &self,
    handle: &Self::Handle,
    image_path: &Path,
    confidence_threshold: f32,
    output_dir: &Path,
  ) -> Result<Vec<RawDetection>, DetectorError>;
}

/// 加载或训练模型所需的参数
#[derive(Debug, Clone)]
pub struct BootstrapPlan {
  pub model_path: PathBuf,
  pub fallback_weights: String,
  pub training_config: PathBuf,
  pub epochs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelOrigin {
  Loaded,
  Trained,
}

#[derive(Debug)]
pub struct DetectorHandle<H> {
  inner: H,
  origin: ModelOrigin,
}

impl<H> DetectorHandle<H> {
  pub fn origin(&self) -> ModelOrigin {
    self.origin
  }

  pub fn inner(&self) -> &H {
    &self.inner
  }
}

pub struct DetectorFacade<B> {
  backend: B,
  output_dir: PathBuf,
}

impl<B: DetectorBackend> DetectorFacade<B> {
  pub fn new(backend: B, output_dir: impl Into<PathBuf>) -> Self {
    Self {
      backend,
      output_dir: output_dir.into(),
    }
  }

  /// 检测器附带产物的默认输出目录
  pub fn output_dir(&self) -> &Path {
    &self.output_dir
  }

  pub fn load_or_bootstrap(
    &self,
    plan: &BootstrapPlan,
  ) -> Result<DetectorHandle<B::Handle>, DetectorError> {
    if plan.model_path.is_file() {
      return self.load(&plan.model_path);
    }

    info!("模型文件不存在，准备训练: {}", plan.model_path.display());
    let _lock = BootstrapLock::acquire(&plan.model_path)?;

    // 等锁期间可能已有其他进程完成训练
    if plan.model_path.is_file() {
      info!("其他进程已完成训练，直接加载模型");
      return self.load(&plan.model_path);
    }

    if !plan.training_config.is_file() {
      return Err(DetectorError::TrainingConfigMissing(
        plan.training_config.clone(),
      ));
    }

    info!(
      "从基础权重 {} 开始训练，共 {} 轮，配置: {}",
      plan.fallback_weights,
      plan.epochs,
      plan.training_config.display()
    );
    let now = std::time::Instant::now();
    let inner = redirect_stdout(|| {
      self.backend.bootstrap(
        &plan.fallback_weights,
        &plan.training_config,
        plan.epochs,
        &plan.model_path,
      )
    })?;
    info!(
      "训练完成，耗时: {:.2?}，模型已保存到 {}",
      now.elapsed(),
      plan.model_path.display()
    );

    Ok(DetectorHandle {
      inner,
      origin: ModelOrigin::Trained,
    })
  }

  fn load(&self, model_path: &Path) -> Result<DetectorHandle<B::Handle>, DetectorError> {
    info!("加载模型文件: {}", model_path.display());
    let inner = redirect_stdout(|| self.backend.load(model_path))?;
    info!("模型加载完成");

    Ok(DetectorHandle {
      inner,
      origin: ModelOrigin::Loaded,
    })
  }

  /// 对单张图像推理，返回按检测器顺序排列的像素坐标结果
  pub fn infer(
    &self,
    handle: &DetectorHandle<B::Handle>,
    image_path: &Path,
    (width, height): (u32, u32),
    confidence_threshold: f32,
  ) -> Result<Vec<Detection>, DetectorError> {
    info!("开始推理: {}", image_path.display());
    self.clear_by_product(image_path)?;

    let now = std::time::Instant::now();
    let raw = redirect_stdout(|| {
      self.backend.predict(
        &handle.inner,
        image_path,
        confidence_threshold,
        &self.output_dir,
      )
    })?;
    info!("推理完成，耗时: {:.2?}", now.elapsed());

    let detections = normalize(raw, (width, height), confidence_threshold);
    debug!("检测结果: {:?}", detections);
    Ok(detections)
  }
}

impl<B> DetectorFacade<B> {
  /// 删除上一次运行留在输出目录中的同名标注图，保证底图只来自本次推理
  fn clear_by_product(&self, image_path: &Path) -> Result<(), DetectorError> {
    let Some(name) = image_path.file_name() else {
      return Ok(());
    };
    let stale = self.output_dir.join(name);
    match std::fs::remove_file(&stale) {
      Ok(()) => {
        debug!("已删除旧的检测器产物: {}", stale.display());
        Ok(())
      }
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(source) => Err(DetectorError::StaleOutput {
        path: stale,
        source,
      }),
    }
  }
}

fn normalize(
  raw: Vec<RawDetection>,
  (width, height): (u32, u32),
  confidence_threshold: f32,
) -> Vec<Detection> {
  raw
    .into_iter()
    .filter_map(|item| {
      if item.confidence.is_nan() {
        warn!("丢弃置信度无效的检测结果: {}", item.class_name);
        return None;
      }
      let confidence = item.confidence.clamp(0.0, 1.0);
      if confidence < confidence_threshold {
        debug!(
          "丢弃低于阈值的检测结果: {} {:.2}",
          item.class_name, confidence
        );
        return None;
      }
      let bbox = item.bbox.extents(width, height).to_pixel_box(width, height);
      Some(Detection {
        class_name: item.class_name,
        confidence,
        bbox,
        cropped_image: None,
      })
    })
    .collect()
}

/// 训练期间持有的独占文件锁，释放时解锁
struct BootstrapLock {
  _file: File,
}

impl BootstrapLock {
  fn acquire(model_path: &Path) -> Result<Self, DetectorError> {
    let mut name = model_path.as_os_str().to_owned();
    name.push(".lock");
    let path = PathBuf::from(name);

    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent).map_err(|source| DetectorError::Lock {
        path: path.clone(),
        source,
      })?;
    }

    let file = OpenOptions::new()
      .create(true)
      .truncate(false)
      .write(true)
      .open(&path)
      .map_err(|source| DetectorError::Lock {
        path: path.clone(),
        source,
      })?;

    debug!("等待训练锁: {}", path.display());
    file
      .lock()
      .map_err(|source| DetectorError::Lock { path, source })?;

    Ok(Self { _file: file })
  }
}
