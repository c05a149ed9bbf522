#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use image::{Rgb, RgbImage};
use tempfile::TempDir;

use yishang::artifact::{ArtifactManager, draw::Draw};
use yishang::detector::{BootstrapPlan, DetectorBackend, DetectorError, DetectorFacade, RawDetection};
use yishang::envelope::EnvelopeEmitter;
use yishang::geometry::NormalizedBox;
use yishang::run::{RunConfig, RunController};

/// 进入标准输出守卫的用例需要串行执行
pub fn serial() -> MutexGuard<'static, ()> {
  static LOCK: Mutex<()> = Mutex::new(());
  LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// 像 YOLO 一样向 stdout 打印进度的假检测器
pub struct NoisyBackend {
  pub detections: Vec<RawDetection>,
  pub by_product: bool,
}

impl NoisyBackend {
  pub fn new(detections: Vec<RawDetection>) -> Self {
    Self {
      detections,
      by_product: false,
    }
  }

  fn noise(&self, text: &str) {
    let mut stdout = std::io::stdout();
    stdout.write_all(text.as_bytes()).unwrap();
    stdout.flush().unwrap();
  }
}

impl DetectorBackend for NoisyBackend {
  type Handle = PathBuf;

  fn load(&self, model_path: &Path) -> Result<PathBuf, DetectorError> {
    self.noise("Ultralytics YOLOv8.0 Python-3.11 torch-2.1 CPU\n");
    Ok(model_path.to_path_buf())
  }

  fn bootstrap(
    &self,
    _weights_id: &str,
    _training_config: &Path,
    epochs: u32,
    save_to: &Path,
  ) -> Result<PathBuf, DetectorError> {
    for epoch in 1..=epochs {
      self.noise(&format!("Epoch {epoch}/{epochs} box_loss 1.2\n"));
    }
    std::fs::write(save_to, b"weights").map_err(|e| DetectorError::Bootstrap(e.to_string()))?;
    Ok(save_to.to_path_buf())
  }

  fn predict(
    &self,
    _handle: &PathBuf,
    image_path: &Path,
    _confidence_threshold: f32,
    output_dir: &Path,
  ) -> Result<Vec<RawDetection>, DetectorError> {
    self.noise(&format!("image 1/1 {}: 640x480 Speed: 1.0ms\n", image_path.display()));
    if self.by_product {
      std::fs::create_dir_all(output_dir).unwrap();
      let name = image_path.file_name().unwrap();
      std::fs::copy(image_path, output_dir.join(name)).unwrap();
    }
    Ok(self.detections.clone())
  }
}

pub fn raw(class_name: &str, confidence: f32, bbox: [f32; 4]) -> RawDetection {
  RawDetection {
    class_name: class_name.to_string(),
    confidence,
    bbox: NormalizedBox::from(bbox),
  }
}

pub struct Workspace {
  pub dir: TempDir,
}

impl Workspace {
  pub fn new() -> Self {
    Self {
      dir: tempfile::tempdir().expect("create temp dir"),
    }
  }

  pub fn path(&self) -> &Path {
    self.dir.path()
  }

  /// 写一张带渐变的测试图
  pub fn image(&self, name: &str, width: u32, height: u32) -> PathBuf {
    let path = self.path().join(name);
    RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 200]))
      .save(&path)
      .expect("write fixture image");
    path
  }

  pub fn model(&self) -> PathBuf {
    let path = self.path().join("trained.pt");
    std::fs::write(&path, b"weights").expect("write model");
    path
  }

  pub fn artifacts(&self) -> ArtifactManager {
    self.artifacts_in("runs")
  }

  pub fn artifacts_in(&self, runs_dir: &str) -> ArtifactManager {
    ArtifactManager::new(self.path().join(runs_dir), Draw::with_font(None))
  }

  pub fn controller(&self, backend: NoisyBackend) -> RunController<NoisyBackend, Vec<u8>> {
    self.controller_in(backend, "runs")
  }

  /// 运行产物写入 `runs_dir`，检测器输出目录固定为 runs/detect/predict
  pub fn controller_in(
    &self,
    backend: NoisyBackend,
    runs_dir: &str,
  ) -> RunController<NoisyBackend, Vec<u8>> {
    let config = RunConfig {
      bootstrap: BootstrapPlan {
        model_path: self.path().join("trained.pt"),
        fallback_weights: "yolov8m.pt".to_string(),
        training_config: self.path().join("data.yaml"),
        epochs: 2,
      },
      confidence_threshold: 0.25,
    };
    RunController::new(
      config,
      DetectorFacade::new(backend, self.path().join("runs").join("detect").join("predict")),
      self.artifacts_in(runs_dir),
      EnvelopeEmitter::new(Vec::new()),
    )
  }
}
