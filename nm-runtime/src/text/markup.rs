//! 内联指令解析
//!
//! 将带 `{…}` 指令的文本拆成带样式的文本片段与指令片段。
//! 无法识别或格式错误的指令按字面文本保留，`{{` 与 `}}` 转义为字面括号。

use crate::geometry::Color;

/// 文本样式
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextStyle {
    pub color: Color,
    pub bold: bool,
    pub italic: bool,
}

impl Default for TextStyle {
    fn default() -> Self {
        Self {
            color: Color::WHITE,
            bold: false,
            italic: false,
        }
    }
}

/// 内联指令
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InlineCommand {
    /// `{w=秒}` 停顿
    Wait(f32),
    /// `{s=cps}` 改变打字速度
    Speed(f32),
    /// `{p}` 等待玩家输入
    Pause,
    /// `{c=#RRGGBB[AA]}`
    Color(Color),
    /// `{/color}`
    ColorReset,
    /// `{b}` / `{/b}`
    Bold(bool),
    /// `{i}` / `{/i}`
    Italic(bool),
    /// `{reset}` 恢复默认样式、速度并结束逐字效果
    Reset,
    /// `{shake=强度,时长}`，时长为 0 表示持续到 `{reset}`
    Shake { intensity: f32, duration: f32 },
    /// `{wave=振幅,频率}`
    Wave { amplitude: f32, frequency: f32 },
}

impl InlineCommand {
    /// 解析花括号内的内容
    pub fn parse(content: &str) -> Option<Self> {
        let content = content.trim();
        match content {
            "p" => return Some(Self::Pause),
            "reset" => return Some(Self::Reset),
            "b" => return Some(Self::Bold(true)),
            "/b" => return Some(Self::Bold(false)),
            "i" => return Some(Self::Italic(true)),
            "/i" => return Some(Self::Italic(false)),
            "/color" | "/c" => return Some(Self::ColorReset),
            _ => {}
        }

        let (key, value) = content.split_once('=')?;
        let value = value.trim();
        match key.trim() {
            "w" => value.parse::<f32>().ok().filter(|v| *v >= 0.0).map(Self::Wait),
            "s" => value.parse::<f32>().ok().filter(|v| *v > 0.0).map(Self::Speed),
            "c" | "color" => Color::from_hex(value).map(Self::Color),
            "shake" => {
                let (a, b) = two_numbers(value)?;
                Some(Self::Shake {
                    intensity: a,
                    duration: b.unwrap_or(0.0),
                })
            }
            "wave" => {
                let (a, b) = two_numbers(value)?;
                Some(Self::Wave {
                    amplitude: a,
                    frequency: b.unwrap_or(1.0),
                })
            }
            _ => None,
        }
    }

    /// 是否改变文本样式
    pub fn is_style(&self) -> bool {
        matches!(
            self,
            Self::Color(_) | Self::ColorReset | Self::Bold(_) | Self::Italic(_) | Self::Reset
        )
    }
}

fn two_numbers(value: &str) -> Option<(f32, Option<f32>)> {
    let mut parts = value.split(',');
    let a = parts.next()?.trim().parse::<f32>().ok()?;
    let b = match parts.next() {
        Some(s) => Some(s.trim().parse::<f32>().ok()?),
        None => None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((a, b))
}

/// 解析结果片段
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text { text: String, style: TextStyle },
    Command(InlineCommand),
}

/// 解析带内联指令的文本
pub fn parse_markup(input: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut style = TextStyle::default();
    let mut buf = String::new();

    let flush = |buf: &mut String, style: TextStyle, segments: &mut Vec<Segment>| {
        if !buf.is_empty() {
            segments.push(Segment::Text {
                text: std::mem::take(buf),
                style,
            });
        }
    };

    let mut rest = input;
    while let Some(ch) = rest.chars().next() {
        match ch {
            '{' if rest.starts_with("{{") => {
                buf.push('{');
                rest = &rest[2..];
            }
            '}' if rest.starts_with("}}") => {
                buf.push('}');
                rest = &rest[2..];
            }
            '{' => {
                let body = &rest[1..];
                let close = body.find('}');
                let open = body.find('{');
                let command = match (close, open) {
                    (Some(c), Some(o)) if o < c => None,
                    (Some(c), _) => InlineCommand::parse(&body[..c]).map(|cmd| (cmd, c)),
                    (None, _) => None,
                };
                match command {
                    Some((cmd, c)) => {
                        flush(&mut buf, style, &mut segments);
                        apply_style(&mut style, &cmd);
                        segments.push(Segment::Command(cmd));
                        rest = &body[c + 1..];
                    }
                    None => {
                        buf.push('{');
                        rest = body;
                    }
                }
            }
            _ => {
                buf.push(ch);
                rest = &rest[ch.len_utf8()..];
            }
        }
    }
    flush(&mut buf, style, &mut segments);
    segments
}

/// 将样式指令作用于样式状态
pub fn apply_style(style: &mut TextStyle, command: &InlineCommand) {
    match command {
        InlineCommand::Color(c) => style.color = *c,
        InlineCommand::ColorReset => style.color = TextStyle::default().color,
        InlineCommand::Bold(b) => style.bold = *b,
        InlineCommand::Italic(i) => style.italic = *i,
        InlineCommand::Reset => *style = TextStyle::default(),
        _ => {}
    }
}

/// 去掉所有指令后的纯文本
pub fn strip_markup(input: &str) -> String {
    parse_markup(input)
        .into_iter()
        .filter_map(|seg| match seg {
            Segment::Text { text, .. } => Some(text),
            Segment::Command(_) => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_and_styles() {
        let segs = parse_markup("你{b}好{/b}{w=0.5}!");
        assert_eq!(segs.len(), 6);
        assert!(matches!(&segs[2], Segment::Text { text, style } if text == "好" && style.bold));
        assert_eq!(segs[4], Segment::Command(InlineCommand::Wait(0.5)));
        assert!(matches!(&segs[5], Segment::Text { style, .. } if !style.bold));
    }

    #[test]
    fn test_all_command_forms() {
        assert_eq!(InlineCommand::parse("s=40"), Some(InlineCommand::Speed(40.0)));
        assert_eq!(InlineCommand::parse("p"), Some(InlineCommand::Pause));
        assert_eq!(
            InlineCommand::parse("c=#FF0000"),
            Some(InlineCommand::Color(Color::rgba(1.0, 0.0, 0.0, 1.0)))
        );
        assert_eq!(InlineCommand::parse("/color"), Some(InlineCommand::ColorReset));
        assert_eq!(
            InlineCommand::parse("shake=2,0.5"),
            Some(InlineCommand::Shake {
                intensity: 2.0,
                duration: 0.5
            })
        );
        assert_eq!(
            InlineCommand::parse("wave=3,2"),
            Some(InlineCommand::Wave {
                amplitude: 3.0,
                frequency: 2.0
            })
        );
        assert_eq!(InlineCommand::parse("reset"), Some(InlineCommand::Reset));
        assert_eq!(InlineCommand::parse("s=0"), None);
        assert_eq!(InlineCommand::parse("shake=a,b"), None);
    }

    #[test]
    fn test_unknown_and_malformed_are_literal() {
        assert_eq!(strip_markup("a{unknown}b"), "a{unknown}b");
        assert_eq!(strip_markup("a{w=oops}b"), "a{w=oops}b");
        assert_eq!(strip_markup("open {brace"), "open {brace");
        assert_eq!(strip_markup("{{literal}}"), "{literal}");
        assert_eq!(strip_markup("x{ {b}y"), "x{ y");
    }

    #[test]
    fn test_reset_restores_default_style() {
        let segs = parse_markup("{c=#00FF00}{i}绿{reset}白");
        let last = segs.last().unwrap();
        assert!(matches!(last, Segment::Text { style, .. } if *style == TextStyle::default()));
    }
}
