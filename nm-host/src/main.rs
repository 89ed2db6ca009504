//! NovelMind - Headless 播放器
//!
//! 挂载资源包，加载脚本并以固定步长推进，把对话、选项与音频请求打印到终端。
//! 对话自动继续，选项按 `--choice` 依次选择（缺省选第一项）。

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use nm_host::config::PackMount;
use nm_host::{AudioRequest, DebugEvent, HostConfig, Input, PackType, PlayMode, RuntimeHost};
use nm_runtime::RunState;

#[derive(Parser)]
#[command(name = "novelmind")]
#[command(about = "NovelMind headless 播放器")]
#[command(version)]
struct Cli {
    /// 配置文件（不存在时使用默认配置）
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// 额外挂载的资源包，格式 `path[:type[:priority]]`
    #[arg(short, long = "pack")]
    packs: Vec<String>,

    /// 入口脚本的资源 id
    #[arg(short, long, default_value = "scripts/main.nmb")]
    script: String,

    /// 最多推进的帧数
    #[arg(long, default_value_t = 100_000)]
    max_frames: u64,

    /// 依次使用的选项序号
    #[arg(long = "choice")]
    choices: Vec<usize>,

    /// 日志级别，覆盖配置文件
    #[arg(long)]
    log_level: Option<String>,
}

const FRAME_DT: f64 = 1.0 / 60.0;

fn main() {
    if let Err(e) = run(Cli::parse()) {
        eprintln!("❌ {:#}", e);
        std::process::exit(1);
    }
}

fn parse_pack_arg(arg: &str) -> Result<PackMount> {
    let (rest, priority) = match arg.rsplit_once(':') {
        Some((rest, p)) if p.parse::<i32>().is_ok() => (rest, p.parse::<i32>()?),
        _ => (arg, 0),
    };
    let (path, pack_type) = match rest.rsplit_once(':') {
        Some((path, t)) => match PackType::from_name(t) {
            Some(pack_type) => (path, pack_type),
            None => (rest, PackType::Base),
        },
        None => (rest, PackType::Base),
    };
    if path.is_empty() {
        bail!("资源包路径为空: {arg}");
    }
    Ok(PackMount {
        path: PathBuf::from(path),
        pack_type,
        priority,
    })
}

fn run(cli: Cli) -> Result<()> {
    let mut config = HostConfig::load(&cli.config);
    nm_host::logging::init(cli.log_level.as_deref().unwrap_or(&config.log_level));
    config.validate().context("配置无效")?;
    for arg in &cli.packs {
        config.packs.push(parse_pack_arg(arg)?);
    }

    let mut host = RuntimeHost::from_config(&config)?;
    host.load_script_resource(&cli.script)
        .with_context(|| format!("加载脚本 {}", cli.script))?;
    host.play()?;

    let mut choices = cli.choices.iter().copied();
    let mut frame = 0u64;
    while frame < cli.max_frames {
        frame += 1;
        host.tick(FRAME_DT);

        for event in host.drain_debug_events() {
            match event {
                DebugEvent::DialogueShown { speaker, text } if speaker.is_empty() => {
                    println!("{text}")
                }
                DebugEvent::DialogueShown { speaker, text } => println!("{speaker}: {text}"),
                DebugEvent::ChoicesShown(options) => {
                    for (i, option) in options.iter().enumerate() {
                        println!("  [{i}] {option}");
                    }
                }
                DebugEvent::SceneChanged(scene) => tracing::debug!(scene = %scene, "场景变化"),
                DebugEvent::RuntimeError(record) => {
                    let (severity, kind) = (record.severity.name(), record.kind.name());
                    eprintln!("⚠️ [{severity}] {kind}: {}", record.message)
                }
                _ => {}
            }
        }
        for request in host.drain_audio_requests() {
            match request {
                AudioRequest::PlayMusic(path) => println!("♪ {path}"),
                AudioRequest::PlaySound(path) => println!("♫ {path}"),
                AudioRequest::StopMusic => println!("♪ (停止)"),
            }
        }

        match host.vm().run_state() {
            RunState::WaitingForContinue => {
                host.handle_input(Input::Skip);
                host.handle_input(Input::Continue);
            }
            RunState::WaitingForChoice => {
                let count = host.vm().pending_choice_count();
                let index = choices.next().unwrap_or(0).min(count.saturating_sub(1));
                println!("> {index}");
                host.handle_input(Input::Choose(index));
            }
            _ => {}
        }

        if host.is_isolated() {
            bail!("运行时已隔离，第 {frame} 帧停止");
        }
        match host.play_mode() {
            PlayMode::Stopped => break,
            PlayMode::Paused => bail!("脚本在第 {frame} 帧因错误暂停"),
            PlayMode::Playing => {}
        }
    }

    println!("播放结束（{frame} 帧）");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pack_arg() {
        let mount = parse_pack_arg("packs/base.nmpack").unwrap();
        assert_eq!(mount.pack_type, PackType::Base);
        assert_eq!(mount.priority, 0);

        let mount = parse_pack_arg("dlc.nmpack:dlc").unwrap();
        assert_eq!(mount.pack_type, PackType::Dlc);

        let mount = parse_pack_arg("C:/games/mod.nmpack:mod:5").unwrap();
        assert_eq!(mount.path, PathBuf::from("C:/games/mod.nmpack"));
        assert_eq!(mount.pack_type, PackType::Mod);
        assert_eq!(mount.priority, 5);

        assert!(parse_pack_arg(":3").is_err());
    }
}
