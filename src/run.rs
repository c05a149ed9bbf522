// 该文件是 Yishang （衣裳） 项目的一部分。
// src/run.rs - 单次检测运行
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

use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::artifact::{ArtifactError, ArtifactManager};
use crate::detector::{BootstrapPlan, DetectorBackend, DetectorError, DetectorFacade};
use crate::envelope::{EnvelopeEmitter, EnvelopeError, ResultEnvelope};

/// 参数错误的退出码
pub const EXIT_USAGE: u8 = 1;

#[derive(Error, Debug)]
pub enum RunError {
  #[error("模型不可用: {0}")]
  ModelUnavailable(#[source] DetectorError),
  #[error("无法读取图像 {path}: {source}")]
  ImageRead {
    path: PathBuf,
    #[source]
    source: image::ImageError,
  },
  #[error("推理失败: {0}")]
  DetectorFailure(#[source] DetectorError),
  #[error("写入运行产物失败: {0}")]
  Artifact(#[from] ArtifactError),
  #[error("输出结果信封失败: {0}")]
  Emit(#[from] EnvelopeError),
}

impl RunError {
  /// 错误类别名称，写入诊断日志
  pub fn kind(&self) -> &'static str {
    match self {
      RunError::ModelUnavailable(_) => "ModelUnavailable",
      RunError::ImageRead { .. } => "ImageReadError",
      RunError::Artifact(e) if e.is_source_error() => "ImageReadError",
      RunError::Artifact(_) => "ArtifactWriteError",
      RunError::DetectorFailure(_) => "DetectorFailure",
      RunError::Emit(_) => "EmitFailure",
    }
  }

  pub fn exit_code(&self) -> u8 {
    match self {
      RunError::ModelUnavailable(_) => 3,
      RunError::ImageRead { .. } => 4,
      RunError::Artifact(e) if e.is_source_error() => 4,
      RunError::Artifact(_) => 5,
      RunError::DetectorFailure(_) => 6,
      RunError::Emit(_) => 7,
    }
  }
}

/// 运行状态，严格按顺序推进，任一阶段出错进入 `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
  Idle,
  Resolving,
  Loading,
  Inferring,
  Packaging,
  Emitting,
  Done,
  Failed,
}

impl RunState {
  pub fn is_terminal(self) -> bool {
    matches!(self, RunState::Done | RunState::Failed)
  }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
  pub bootstrap: BootstrapPlan,
  pub confidence_threshold: f32,
}

pub struct RunController<B, W> {
  config: RunConfig,
  detector: DetectorFacade<B>,
  artifacts: ArtifactManager,
  emitter: EnvelopeEmitter<W>,
  state: RunState,
}

impl<B: DetectorBackend, W: Write> RunController<B, W> {
  pub fn new(
    config: RunConfig,
    detector: DetectorFacade<B>,
    artifacts: ArtifactManager,
    emitter: EnvelopeEmitter<W>,
  ) -> Self {
    Self {
      config,
      detector,
      artifacts,
      emitter,
      state: RunState::Idle,
    }
  }

  pub fn state(&self) -> RunState {
    self.state
  }

  pub fn into_emitter(self) -> EnvelopeEmitter<W> {
    self.emitter
  }

  /// 处理一张图像；失败时不输出结果信封
  pub fn run(&mut self, image_path: &Path) -> Result<ResultEnvelope, RunError> {
    let result = self.run_stages(image_path);
    match &result {
      Ok(_) => self.advance(RunState::Done),
      Err(e) => {
        self.advance(RunState::Failed);
        error!("运行失败 [{}]: {}", e.kind(), e);
      }
    }
    result
  }

  fn run_stages(&mut self, image_path: &Path) -> Result<ResultEnvelope, RunError> {
    self.advance(RunState::Resolving);
    let (image_path, dimensions) = resolve_image(image_path)?;
    info!(
      "输入图像: {} ({}x{})",
      image_path.display(),
      dimensions.0,
      dimensions.1
    );

    self.advance(RunState::Loading);
    let handle = self
      .detector
      .load_or_bootstrap(&self.config.bootstrap)
      .map_err(RunError::ModelUnavailable)?;

    self.advance(RunState::Inferring);
    let detections = self
      .detector
      .infer(
        &handle,
        &image_path,
        dimensions,
        self.config.confidence_threshold,
      )
      .map_err(RunError::DetectorFailure)?;
    info!("检测到 {} 个目标", detections.len());
    for d in &detections {
      info!(
        "  - {}: {:.2}% at {:?}",
        d.class_name,
        d.confidence * 100.0,
        <[u32; 4]>::from(d.bbox)
      );
    }

    self.advance(RunState::Packaging);
    let artifacts = self
      .artifacts
      .package(&image_path, detections, self.detector.output_dir())?;
    let envelope = ResultEnvelope::from(&artifacts);

    self.advance(RunState::Emitting);
    self.emitter.emit(&envelope)?;

    Ok(envelope)
  }

  fn advance(&mut self, next: RunState) {
    if self.state.is_terminal() {
      return;
    }
    debug!("运行状态: {:?} -> {:?}", self.state, next);
    self.state = next;
  }
}

/// 转为绝对路径并读取图像尺寸
fn resolve_image(image_path: &Path) -> Result<(PathBuf, (u32, u32)), RunError> {
  let absolute = std::path::absolute(image_path).map_err(|e| RunError::ImageRead {
    path: image_path.to_path_buf(),
    source: image::ImageError::IoError(e),
  })?;
  let dimensions = image::ImageReader::open(&absolute)
    .and_then(|reader| reader.with_guessed_format())
    .map_err(image::ImageError::IoError)
    .and_then(|reader| reader.into_dimensions())
    .map_err(|source| RunError::ImageRead {
      path: absolute.clone(),
      source,
    })?;
  Ok((absolute, dimensions))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::artifact::draw::Draw;
  use crate::detector::RawDetection;
  use crate::geometry::NormalizedBox;

  struct StaticBackend {
    fail_predict: bool,
  }

  impl DetectorBackend for StaticBackend {
    type Handle = ();

    fn load(&self, _model_path: &Path) -> Result<(), DetectorError> {
      Ok(())
    }

    fn bootstrap(
      &self,
      _weights_id: &str,
      _training_config: &Path,
      _epochs: u32,
      _save_to: &Path,
    ) -> Result<(), DetectorError> {
      Err(DetectorError::Bootstrap("不支持训练".to_string()))
    }

    fn predict(
      &self,
      _handle: &(),
      _image_path: &Path,
      _confidence_threshold: f32,
      _output_dir: &Path,
    ) -> Result<Vec<RawDetection>, DetectorError> {
      if self.fail_predict {
        return Err(DetectorError::Predict("模拟失败".to_string()));
      }
      Ok(vec![RawDetection {
        class_name: "shirt".to_string(),
        confidence: 0.87,
        bbox: NormalizedBox::new(0.5, 0.5, 0.2, 0.3),
      }])
    }
  }

  fn controller(dir: &Path, backend: StaticBackend, with_model: bool) -> RunController<StaticBackend, Vec<u8>> {
    let model_path = dir.join("model.pt");
    if with_model {
      std::fs::write(&model_path, b"weights").unwrap();
    }
    let config = RunConfig {
      bootstrap: BootstrapPlan {
        model_path,
        fallback_weights: "base.pt".to_string(),
        training_config: dir.join("data.yaml"),
        epochs: 1,
      },
      confidence_threshold: 0.4,
    };
    RunController::new(
      config,
      DetectorFacade::new(backend, dir.join("predict")),
      ArtifactManager::new(dir.join("runs"), Draw::with_font(Some(Path::new("/nonexistent.ttf")))),
      EnvelopeEmitter::new(Vec::new()),
    )
  }

  fn fixture(dir: &Path) -> PathBuf {
    let path = dir.join("input.jpg");
    image::RgbImage::new(100, 200).save(&path).unwrap();
    path
  }

  #[test]
  fn successful_run_reaches_done() {
    let _serial = crate::channel::serial_guard();
    let dir = tempfile::tempdir().unwrap();
    let image = fixture(dir.path());
    let mut run = controller(dir.path(), StaticBackend { fail_predict: false }, true);

    let envelope = run.run(&image).unwrap();
    assert_eq!(run.state(), RunState::Done);
    assert_eq!(envelope.detections.len(), 1);
    assert!(!run.into_emitter().into_inner().is_empty());
  }

  #[test]
  fn missing_image_fails_before_loading() {
    let dir = tempfile::tempdir().unwrap();
    let mut run = controller(dir.path(), StaticBackend { fail_predict: false }, false);

    let err = run.run(&dir.path().join("missing.jpg")).unwrap_err();
    assert_eq!(run.state(), RunState::Failed);
    assert_eq!(err.kind(), "ImageReadError");
    assert_eq!(err.exit_code(), 4);
    assert!(run.into_emitter().into_inner().is_empty());
  }

  #[test]
  fn model_and_detector_failures_have_distinct_codes() {
    let _serial = crate::channel::serial_guard();
    let dir = tempfile::tempdir().unwrap();
    let image = fixture(dir.path());

    let mut run = controller(dir.path(), StaticBackend { fail_predict: false }, false);
    let err = run.run(&image).unwrap_err();
    assert_eq!(err.exit_code(), 3);

    let mut run = controller(dir.path(), StaticBackend { fail_predict: true }, true);
    let err = run.run(&image).unwrap_err();
    assert_eq!(err.exit_code(), 6);
    assert!(run.into_emitter().into_inner().is_empty());
    assert!(!dir.path().join("runs").exists());
  }
}
