//! # Render 模块
//!
//! 渲染后端抽象。场景图与过渡效果只通过 [`Renderer`] 输出绘制指令，
//! 具体的图形后端由宿主实现。

use crate::geometry::{Color, Rect, Vec2};
use crate::text::TextStyle;

/// 渲染后端
pub trait Renderer {
    /// 画布尺寸
    fn viewport(&self) -> Vec2;

    /// 填充纯色矩形
    fn fill_rect(&mut self, rect: Rect, color: Color);

    /// 绘制纹理
    ///
    /// `rotation` 单位为度，围绕 `rect` 中心旋转。
    fn draw_texture(&mut self, texture_id: &str, rect: Rect, rotation: f32, tint: Color);

    /// 绘制一段文本
    fn draw_text(&mut self, text: &str, position: Vec2, style: &TextStyle, alpha: f32);
}

/// 记录下来的绘制指令
#[derive(Debug, Clone, PartialEq)]
pub enum DrawCommand {
    FillRect {
        rect: Rect,
        color: Color,
    },
    Texture {
        texture_id: String,
        rect: Rect,
        rotation: f32,
        tint: Color,
    },
    Text {
        text: String,
        position: Vec2,
        color: Color,
    },
}

/// 只记录指令的渲染器（无头运行与测试）
#[derive(Debug, Clone)]
pub struct RecordingRenderer {
    size: Vec2,
    pub commands: Vec<DrawCommand>,
}

impl RecordingRenderer {
    pub fn new(width: f32, height: f32) -> Self {
        Self {
            size: Vec2::new(width, height),
            commands: Vec::new(),
        }
    }

    /// 取出并清空已记录的指令
    pub fn take(&mut self) -> Vec<DrawCommand> {
        std::mem::take(&mut self.commands)
    }

    /// 已绘制的全部文本
    pub fn texts(&self) -> Vec<&str> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                DrawCommand::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// 已绘制的纹理 id（按绘制顺序）
    pub fn textures(&self) -> Vec<&str> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                DrawCommand::Texture { texture_id, .. } => Some(texture_id.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl Renderer for RecordingRenderer {
    fn viewport(&self) -> Vec2 {
        self.size
    }

    fn fill_rect(&mut self, rect: Rect, color: Color) {
        self.commands.push(DrawCommand::FillRect { rect, color });
    }

    fn draw_texture(&mut self, texture_id: &str, rect: Rect, rotation: f32, tint: Color) {
        self.commands.push(DrawCommand::Texture {
            texture_id: texture_id.to_string(),
            rect,
            rotation,
            tint,
        });
    }

    fn draw_text(&mut self, text: &str, position: Vec2, style: &TextStyle, alpha: f32) {
        self.commands.push(DrawCommand::Text {
            text: text.to_string(),
            position,
            color: style.color.with_alpha(alpha),
        });
    }
}
