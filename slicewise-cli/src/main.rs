//! 选片管线命令行工具

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use slicewise_core::{SliceMapping, SlicewiseConfig, Study};
use slicewise_dicom::{DicomParser, StudyModelBuilder};
use slicewise_planning::{parse_selection_plan, PlanRepairer, SliceAddressResolver, SliceSampler};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use walkdir::WalkDir;

/// 命令行参数
#[derive(Parser, Debug)]
#[command(name = "slicewise")]
#[command(about = "多序列影像检查的选片、修复与切片寻址工具")]
struct Args {
    /// 配置文件路径
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// 日志级别，覆盖配置文件中的 logging.level
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 扫描目录并输出检查概要
    Inspect {
        /// DICOM文件目录
        dir: PathBuf,
    },

    /// 解析并修复选片方案，输出修复结果和采样到的实例号
    Repair {
        /// DICOM文件目录
        #[arg(short, long)]
        study: PathBuf,

        /// 推理服务返回的原始方案 (JSON)
        #[arg(short, long)]
        plan: PathBuf,
    },

    /// 把文本中的切片引用解析到映射
    Resolve {
        /// 切片映射文件 (JSON数组)
        #[arg(short, long)]
        mappings: PathBuf,

        /// 待解析的文本
        #[arg(short, long)]
        text: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = SlicewiseConfig::load(args.config.as_deref())
        .context("加载配置失败")?;

    // 初始化日志
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(level.as_str())
        .with_writer(std::io::stderr)
        .init();

    let result = match &args.command {
        Command::Inspect { dir } => inspect(dir),
        Command::Repair { study, plan } => repair(&config, study, plan),
        Command::Resolve { mappings, text } => resolve(mappings, text),
    };

    if let Err(e) = &result {
        error!("执行失败: {:#}", e);
    }
    result
}

fn inspect(dir: &Path) -> Result<()> {
    let study = load_study(dir)?;
    println!("{}", serde_json::to_string_pretty(&study.digest())?);
    Ok(())
}

fn repair(config: &SlicewiseConfig, dir: &Path, plan_path: &Path) -> Result<()> {
    let study = load_study(dir)?;
    let text = fs::read_to_string(plan_path)
        .with_context(|| format!("无法读取方案文件 {}", plan_path.display()))?;
    // 文件可能是JSON，也可能是带有JSON片段的自由文本
    let raw = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

    let plan = parse_selection_plan(&raw, &study)
        .with_context(|| format!("方案文件 {} 无法使用", plan_path.display()))?;

    let repairer = PlanRepairer::new(
        config.selection.max_images,
        config.selection.min_supplementary_images,
    );
    let outcome = repairer.repair(&plan, &study);
    for adjustment in &outcome.adjustments {
        info!("修正: {}", adjustment);
    }

    let sampler = SliceSampler::new(config.selection.max_images);
    // 与管线导出相同的采样：缺失序列改用主序列，所有选片共享预算
    let samples: Vec<Value> = sampler
        .sample_plan(&study, &outcome.plan)
        .iter()
        .map(|sampled| {
            let instances: Vec<i32> = sampled.slices.iter().map(|s| s.instance_number).collect();
            json!({
                "requestedSeries": sampled.selection.series_number,
                "seriesNumber": sampled.series.series_number,
                "instances": instances,
            })
        })
        .collect();

    let report = json!({
        "plan": outcome.plan,
        "adjustments": outcome.adjustments.iter().map(|a| a.to_string()).collect::<Vec<_>>(),
        "samples": samples,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn resolve(mappings_path: &Path, text: &str) -> Result<()> {
    let content = fs::read_to_string(mappings_path)
        .with_context(|| format!("无法读取映射文件 {}", mappings_path.display()))?;
    let mappings: Vec<SliceMapping> =
        serde_json::from_str(&content).context("映射文件格式错误")?;

    let resolver = SliceAddressResolver::new();
    let resolved: Vec<Value> = resolver
        .resolve_text(&mappings, text)
        .into_iter()
        .map(|(reference, mapping)| {
            json!({
                "text": &text[reference.span.clone()],
                "kind": reference.kind,
                "range": [reference.start, reference.end],
                "series": reference.series,
                "position": mapping.position,
                "instanceNumber": mapping.instance_number,
                "label": mapping.label,
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&resolved)?);
    Ok(())
}

/// 扫描目录中的全部文件并构建检查模型
fn load_study(dir: &Path) -> Result<Study> {
    let files: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy();
            !name.starts_with('.') && !name.eq_ignore_ascii_case("DICOMDIR")
        })
        .map(|entry| entry.into_path())
        .collect();
    info!("在 {} 中找到 {} 个文件", dir.display(), files.len());

    let (records, failures) = DicomParser::new().parse_files(&files);
    if records.is_empty() {
        anyhow::bail!(
            "目录 {} 中没有可解析的DICOM文件 ({} 个文件解析失败)",
            dir.display(),
            failures.len()
        );
    }

    Ok(StudyModelBuilder::new().build(&records))
}
