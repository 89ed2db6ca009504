//! # NovelMind Runtime
//!
//! 视觉小说播放引擎的纯逻辑核心，不依赖任何 IO 或图形后端。
//!
//! ## 架构概述
//!
//! ```text
//! Host                              Runtime
//!   │                                  │
//!   │── load(bytecode) ──────────────►│ ScriptVm
//!   │── run_for(budget) ─────────────►│   │
//!   │◄── NativeCall (背景/角色/对话…) ──│◄──┘
//!   │                                  │
//!   │── SceneGraph 操作 ─────────────►│ SceneGraph ── update(dt) / render(&mut dyn Renderer)
//!   │── signal_continue / choice ────►│ ScriptVm
//! ```
//!
//! 宿主层负责资源包、文件存档与帧循环，本 crate 只定义数据模型与算法。
//!
//! ## 模块结构
//!
//! - [`bytecode`]：字节码格式、反汇编与构建器
//! - [`vm`]：栈式虚拟机
//! - [`scene`]：分层场景图、观察者与场景快照
//! - [`animation`]：补间、时间线与缓动
//! - [`text`]：富文本标记、排版与打字机
//! - [`transition`]：场景切换效果
//! - [`localization`]：多语言字符串表与文件格式
//! - [`save`]：存档数据模型与规范化负载
//! - [`render`]：渲染后端抽象
//! - [`error`]：错误分类

pub mod animation;
pub mod bytecode;
pub mod codec;
pub mod error;
pub mod geometry;
pub mod localization;
pub mod render;
pub mod save;
pub mod scene;
pub mod text;
pub mod transition;
pub mod vm;

pub use error::{ErrorKind, VnError, VnResult};
pub use geometry::{Color, Rect, Transform, Vec2};
pub use localization::{LocalizationManager, PluralCategory, PluralRule};
pub use render::{DrawCommand, RecordingRenderer, Renderer};
pub use save::{SaveData, SaveError, Thumbnail};
pub use scene::{LayerKind, SceneGraph, SceneObject, SceneObserver, SceneState};
pub use transition::{SceneTransition, TransitionKind};
pub use vm::{NativeCall, RunState, ScriptVm, Value, VmSnapshot};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ProgramBuilder;

    #[test]
    fn test_script_drives_scene() {
        let mut b = ProgramBuilder::new();
        b.node("start");
        b.show_background("bg/room.png");
        b.say("Alice", "Hi!");
        b.halt();
        let mut vm = ScriptVm::new();
        vm.load_program(b.build());

        let mut scene = SceneGraph::new();
        vm.run_for(100);
        for call in vm.drain_native_calls() {
            match call.opcode {
                bytecode::Opcode::ShowBackground => {
                    scene.show_background(call.text.as_deref().unwrap_or_default())
                }
                bytecode::Opcode::ShowText => scene.show_dialogue(
                    &call.arg_str(0).unwrap_or_default(),
                    call.text.as_deref().unwrap_or_default(),
                ),
                _ => {}
            }
        }
        assert_eq!(scene.save_state().active_background.as_deref(), Some("bg/room.png"));
        assert_eq!(scene.dialogue().map(|d| d.text.as_str()), Some("Hi!"));
    }
}
