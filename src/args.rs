// 该文件是 Yishang （衣裳） 项目的一部分。
// src/args.rs - 项目参数配置
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

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use url::Url;

use yishang::detector::BootstrapPlan;
use yishang::envelope::EnvelopeChannel;
use yishang::run::RunConfig;

/// 对单张图像运行目标检测，保存运行产物并输出结果信封
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入图像路径
  #[arg(value_name = "IMAGE")]
  pub image: PathBuf,

  /// 训练好的模型文件，不存在时会自动训练并保存到此处
  #[arg(long, env = "YISHANG_MODEL", default_value = "trained_YOLO8.pt", value_name = "FILE")]
  pub model: PathBuf,

  /// 自动训练使用的基础权重
  #[arg(long, env = "YISHANG_WEIGHTS", default_value = "yolov8m.pt", value_name = "WEIGHTS")]
  pub weights: String,

  /// 自动训练使用的数据集配置
  #[arg(long, env = "YISHANG_DATA", default_value = "data.yaml", value_name = "FILE")]
  pub data: PathBuf,

  /// 自动训练轮数
  #[arg(long, env = "YISHANG_EPOCHS", default_value = "5", value_name = "COUNT")]
  pub epochs: u32,

  /// 置信度阈值 (0.0 - 1.0)
  #[arg(
    long,
    env = "YISHANG_CONFIDENCE",
    default_value = "0.4",
    value_name = "THRESHOLD",
    value_parser = parse_confidence
  )]
  pub confidence: f32,

  /// 运行产物根目录
  #[arg(long, env = "YISHANG_RUNS_DIR", default_value = "runs", value_name = "DIR")]
  pub runs_dir: PathBuf,

  /// 检测器写出附带标注图的目录
  #[arg(
    long,
    env = "YISHANG_DETECTOR_OUTPUT_DIR",
    default_value = "runs/detect/predict",
    value_name = "DIR"
  )]
  pub detector_output_dir: PathBuf,

  /// 检测程序地址，例如 exec:///usr/bin/python3?arg=detect.py
  #[arg(long, env = "YISHANG_DETECTOR", default_value = "exec:yishang-yolo", value_name = "URL")]
  pub detector: Url,

  /// 标签字体文件，默认在系统字体目录中查找
  #[arg(long, env = "YISHANG_FONT", value_name = "FILE")]
  pub font: Option<PathBuf>,

  /// 结果信封写入的通道
  #[arg(
    long,
    env = "YISHANG_ENVELOPE_CHANNEL",
    value_enum,
    default_value_t = Channel::Primary
  )]
  pub envelope_channel: Channel,
}

fn parse_confidence(value: &str) -> Result<f32, String> {
  let confidence: f32 = value
    .parse()
    .map_err(|e| format!("无效的置信度 '{value}': {e}"))?;
  if (0.0..=1.0).contains(&confidence) {
    Ok(confidence)
  } else {
    Err(format!("置信度必须在 0.0 到 1.0 之间，实际为 {confidence}"))
  }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
  /// stdout
  Primary,
  /// stderr
  Diagnostic,
}

impl From<Channel> for EnvelopeChannel {
  fn from(channel: Channel) -> Self {
    match channel {
      Channel::Primary => EnvelopeChannel::Primary,
      Channel::Diagnostic => EnvelopeChannel::Diagnostic,
    }
  }
}

impl Args {
  pub fn run_config(&self) -> RunConfig {
    RunConfig {
      bootstrap: BootstrapPlan {
        model_path: self.model.clone(),
        fallback_weights: self.weights.clone(),
        training_config: self.data.clone(),
        epochs: self.epochs,
      },
      confidence_threshold: self.confidence,
    }
  }
}
