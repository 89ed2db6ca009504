//! 文本排版
//!
//! 在最大宽度内按词折行，字宽优先取字体图集中的字形步进。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::markup::{InlineCommand, Segment, TextStyle, parse_markup};

/// 字形度量
pub trait GlyphMetrics {
    /// 字符步进宽度
    fn advance(&self, ch: char, style: &TextStyle) -> f32;
    /// 行高
    fn line_height(&self) -> f32;
}

/// 等宽度量（没有字体图集时使用）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonospaceMetrics {
    pub advance: f32,
    pub line_height: f32,
}

impl Default for MonospaceMetrics {
    fn default() -> Self {
        Self {
            advance: 10.0,
            line_height: 20.0,
        }
    }
}

impl GlyphMetrics for MonospaceMetrics {
    fn advance(&self, ch: char, _style: &TextStyle) -> f32 {
        // 全角字符占两格
        if is_wide(ch) {
            self.advance * 2.0
        } else {
            self.advance
        }
    }

    fn line_height(&self) -> f32 {
        self.line_height
    }
}

/// 字体图集描述
///
/// 以 JSON 形式随资源包分发：
///
/// ```json
/// { "line_height": 24.0, "default_advance": 12.0, "glyphs": { "a": 11.0 } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FontAtlas {
    #[serde(default)]
    pub family: String,
    pub line_height: f32,
    pub default_advance: f32,
    /// 粗体额外宽度
    #[serde(default)]
    pub bold_extra: f32,
    #[serde(default)]
    pub glyphs: HashMap<char, f32>,
}

impl FontAtlas {
    /// 估算占用字节数
    pub fn approx_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.family.len() + self.glyphs.len() * 16
    }
}

impl GlyphMetrics for FontAtlas {
    fn advance(&self, ch: char, style: &TextStyle) -> f32 {
        let base = self.glyphs.get(&ch).copied().unwrap_or_else(|| {
            if is_wide(ch) {
                self.default_advance * 2.0
            } else {
                self.default_advance
            }
        });
        if style.bold { base + self.bold_extra } else { base }
    }

    fn line_height(&self) -> f32 {
        self.line_height
    }
}

fn is_wide(ch: char) -> bool {
    matches!(ch as u32,
        0x1100..=0x115F | 0x2E80..=0xA4CF | 0xAC00..=0xD7A3 | 0xF900..=0xFAFF
        | 0xFE30..=0xFE4F | 0xFF00..=0xFF60 | 0xFFE0..=0xFFE6)
}

/// 已排版的字形
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutGlyph {
    pub ch: char,
    /// 行内横坐标
    pub x: f32,
    pub advance: f32,
    pub style: TextStyle,
    /// 在字符流中的序号
    pub index: usize,
}

/// 一行
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LayoutLine {
    pub glyphs: Vec<LayoutGlyph>,
    /// 行宽（不含行尾空白）
    pub width: f32,
    pub y: f32,
}

/// 锚定在字符流某位置的指令
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandAnchor {
    /// 在此序号的字符显示之前执行
    pub char_index: usize,
    pub command: InlineCommand,
}

/// 排版结果
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TextLayout {
    pub lines: Vec<LayoutLine>,
    pub width: f32,
    pub height: f32,
    pub line_height: f32,
    /// 字符流总长（不含换行符）
    pub total_chars: usize,
    pub commands: Vec<CommandAnchor>,
}

impl TextLayout {
    /// 解析并排版；`max_width <= 0` 表示不折行
    pub fn new(input: &str, metrics: &dyn GlyphMetrics, max_width: f32) -> Self {
        layout_segments(&parse_markup(input), metrics, max_width)
    }

    /// 按序号查找字形
    pub fn glyph(&self, index: usize) -> Option<&LayoutGlyph> {
        self.lines
            .iter()
            .flat_map(|l| l.glyphs.iter())
            .find(|g| g.index == index)
    }

    /// 字符流中前 n 个字符组成的文本（行间以换行连接）
    pub fn text_prefix(&self, n: usize) -> String {
        let mut out = String::new();
        for (i, line) in self.lines.iter().enumerate() {
            if i > 0 && line.glyphs.first().is_some_and(|g| g.index < n) {
                out.push('\n');
            }
            for g in line.glyphs.iter().filter(|g| g.index < n) {
                out.push(g.ch);
            }
        }
        out
    }

    /// 完整纯文本
    pub fn plain_text(&self) -> String {
        self.text_prefix(self.total_chars)
    }
}

struct Item {
    ch: char,
    style: TextStyle,
}

/// 对已解析的片段排版
pub fn layout_segments(
    segments: &[Segment],
    metrics: &dyn GlyphMetrics,
    max_width: f32,
) -> TextLayout {
    let mut items: Vec<Option<Item>> = Vec::new();
    let mut commands = Vec::new();
    let mut index = 0usize;

    for seg in segments {
        match seg {
            Segment::Text { text, style } => {
                for ch in text.chars() {
                    if ch == '\n' {
                        items.push(None);
                    } else {
                        items.push(Some(Item { ch, style: *style }));
                        index += 1;
                    }
                }
            }
            Segment::Command(command) => commands.push(CommandAnchor {
                char_index: index,
                command: *command,
            }),
        }
    }

    let line_height = metrics.line_height();
    let mut lines: Vec<LayoutLine> = Vec::new();
    let mut current: Vec<LayoutGlyph> = Vec::new();
    let mut cursor = 0.0_f32;
    let mut index = 0usize;

    let finish_line = |glyphs: Vec<LayoutGlyph>, lines: &mut Vec<LayoutLine>| {
        let width = glyphs
            .iter()
            .rev()
            .skip_while(|g| g.ch.is_whitespace())
            .map(|g| g.x + g.advance)
            .next()
            .unwrap_or(0.0);
        let y = lines.len() as f32 * line_height;
        lines.push(LayoutLine { glyphs, width, y });
    };

    for item in items {
        let Some(item) = item else {
            finish_line(std::mem::take(&mut current), &mut lines);
            cursor = 0.0;
            continue;
        };

        let advance = metrics.advance(item.ch, &item.style);
        let overflow = max_width > 0.0 && cursor + advance > max_width;
        if overflow && !current.is_empty() && !item.ch.is_whitespace() {
            // 能在词边界断开就把当前词整体移到下一行，否则硬断
            let tail = match current.iter().rposition(|g| g.ch == ' ') {
                Some(pos) => current.split_off(pos + 1),
                None => Vec::new(),
            };
            finish_line(std::mem::take(&mut current), &mut lines);
            cursor = 0.0;
            for mut g in tail {
                g.x = cursor;
                cursor += g.advance;
                current.push(g);
            }
        }

        current.push(LayoutGlyph {
            ch: item.ch,
            x: cursor,
            advance,
            style: item.style,
            index,
        });
        cursor += advance;
        index += 1;
    }
    if !current.is_empty() || lines.is_empty() {
        finish_line(current, &mut lines);
    }

    let width = lines.iter().map(|l| l.width).fold(0.0_f32, f32::max);
    let height = lines.len() as f32 * line_height;
    TextLayout {
        lines,
        width,
        height,
        line_height,
        total_chars: index,
        commands,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono() -> MonospaceMetrics {
        MonospaceMetrics {
            advance: 10.0,
            line_height: 20.0,
        }
    }

    #[test]
    fn test_word_wrap_at_spaces() {
        let layout = TextLayout::new("hello big world", &mono(), 100.0);
        assert_eq!(layout.lines.len(), 2);
        assert_eq!(layout.plain_text(), "hello big \nworld");
        assert_eq!(layout.lines[0].width, 90.0);
        assert_eq!(layout.lines[1].glyphs[0].x, 0.0);
        assert_eq!(layout.total_chars, 15);
        assert_eq!(layout.height, 40.0);
    }

    #[test]
    fn test_long_word_hard_breaks() {
        let layout = TextLayout::new("abcdefghijkl", &mono(), 50.0);
        assert_eq!(layout.lines.len(), 3);
        assert_eq!(layout.lines[2].glyphs.len(), 2);
    }

    #[test]
    fn test_newline_forces_break_and_is_not_counted() {
        let layout = TextLayout::new("ab\ncd", &mono(), 0.0);
        assert_eq!(layout.lines.len(), 2);
        assert_eq!(layout.total_chars, 4);
        assert_eq!(layout.lines[1].glyphs[0].index, 2);
    }

    #[test]
    fn test_command_table_indexes_char_stream() {
        let layout = TextLayout::new("ab{w=1}c{p}d", &mono(), 0.0);
        assert_eq!(
            layout
                .commands
                .iter()
                .map(|c| (c.char_index, c.command))
                .collect::<Vec<_>>(),
            vec![(2, InlineCommand::Wait(1.0)), (3, InlineCommand::Pause)]
        );
    }

    #[test]
    fn test_font_atlas_advances() {
        let atlas: FontAtlas = serde_json::from_str(
            r#"{"line_height": 30.0, "default_advance": 8.0, "bold_extra": 1.0,
                "glyphs": {"W": 16.0}}"#,
        )
        .unwrap();
        let layout = TextLayout::new("W{b}a", &atlas, 0.0);
        assert_eq!(layout.width, 16.0 + 9.0);
        assert_eq!(layout.line_height, 30.0);
    }

    #[test]
    fn test_cjk_breaks_without_spaces() {
        let layout = TextLayout::new("这是一段很长的中文文本", &mono(), 60.0);
        assert!(layout.lines.len() > 1);
        assert!(layout.lines.iter().all(|l| l.width <= 60.0));
    }
}
