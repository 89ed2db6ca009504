//! 打字机效果
//!
//! 按设定速度逐字揭示排版结果，并在锚点位置执行内联指令。
//!
//! 逐字的 shake/wave 偏移只由打字机计算；场景对象级动画作用于整个对象的变换，
//! 渲染时两者相加。

use std::f32::consts::TAU;

use super::layout::TextLayout;
use super::markup::{InlineCommand, TextStyle, apply_style};
use crate::geometry::Vec2;

/// 默认打字速度（字符/秒）
pub const DEFAULT_CPS: f32 = 30.0;

/// 默认标点停顿倍率（相对单字时间）
pub const DEFAULT_PUNCTUATION_MULTIPLIER: f32 = 6.0;

#[derive(Debug, Clone, Copy, PartialEq)]
enum EffectKind {
    Shake { intensity: f32, duration: f32 },
    Wave { amplitude: f32, frequency: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ActiveEffect {
    kind: EffectKind,
    start: usize,
    end: Option<usize>,
    started_at: f32,
}

/// 打字机动画
#[derive(Debug, Clone)]
pub struct Typewriter {
    layout: TextLayout,
    base_cps: f32,
    cps: f32,
    punctuation_multiplier: f32,
    visible: usize,
    timer: f32,
    wait: f32,
    waiting_for_input: bool,
    next_command: usize,
    style: TextStyle,
    effects: Vec<ActiveEffect>,
    time: f32,
    complete: bool,
}

impl Typewriter {
    /// 创建打字机；`cps <= 0` 表示立即显示全部
    pub fn new(layout: TextLayout, cps: f32) -> Self {
        Self {
            layout,
            base_cps: cps,
            cps,
            punctuation_multiplier: DEFAULT_PUNCTUATION_MULTIPLIER,
            visible: 0,
            timer: 0.0,
            wait: 0.0,
            waiting_for_input: false,
            next_command: 0,
            style: TextStyle::default(),
            effects: Vec::new(),
            time: 0.0,
            complete: false,
        }
    }

    pub fn with_punctuation_multiplier(mut self, multiplier: f32) -> Self {
        self.punctuation_multiplier = multiplier.max(0.0);
        self
    }

    /// 推进时间
    pub fn update(&mut self, dt: f32) {
        self.time += dt;
        if self.complete || self.waiting_for_input {
            return;
        }
        self.timer += dt;

        loop {
            if self.run_commands_at_cursor() {
                return;
            }

            if self.wait > 0.0 {
                if self.timer >= self.wait {
                    self.timer -= self.wait;
                    self.wait = 0.0;
                } else {
                    self.wait -= self.timer;
                    self.timer = 0.0;
                    return;
                }
            }

            if self.visible >= self.layout.total_chars {
                self.complete = true;
                self.timer = 0.0;
                return;
            }

            let char_time = if self.cps > 0.0 { 1.0 / self.cps } else { 0.0 };
            if self.timer < char_time {
                return;
            }
            self.timer -= char_time;

            let ch = self.layout.glyph(self.visible).map(|g| g.ch);
            self.visible += 1;
            if let Some(ch) = ch {
                self.wait += punctuation_factor(ch) * self.punctuation_multiplier * char_time;
            }
        }
    }

    /// 执行锚定在当前位置的指令；遇到 `{p}` 时返回 true
    fn run_commands_at_cursor(&mut self) -> bool {
        while let Some(anchor) = self.layout.commands.get(self.next_command).copied() {
            if anchor.char_index != self.visible {
                break;
            }
            self.next_command += 1;
            match anchor.command {
                InlineCommand::Wait(s) => self.wait += s,
                InlineCommand::Speed(cps) => self.cps = cps,
                InlineCommand::Pause => {
                    self.waiting_for_input = true;
                    self.timer = 0.0;
                    return true;
                }
                other => self.apply_visual(other),
            }
        }
        false
    }

    fn apply_visual(&mut self, command: InlineCommand) {
        apply_style(&mut self.style, &command);
        match command {
            InlineCommand::Reset => {
                self.cps = self.base_cps;
                for effect in self.effects.iter_mut().filter(|e| e.end.is_none()) {
                    effect.end = Some(self.visible);
                }
            }
            InlineCommand::Shake {
                intensity,
                duration,
            } => self.effects.push(ActiveEffect {
                kind: EffectKind::Shake {
                    intensity,
                    duration,
                },
                start: self.visible,
                end: None,
                started_at: self.time,
            }),
            InlineCommand::Wave {
                amplitude,
                frequency,
            } => self.effects.push(ActiveEffect {
                kind: EffectKind::Wave {
                    amplitude,
                    frequency,
                },
                start: self.visible,
                end: None,
                started_at: self.time,
            }),
            _ => {}
        }
    }

    /// 跳到末尾：可见字符数等于排版总数
    pub fn skip_to_end(&mut self) {
        while let Some(anchor) = self.layout.commands.get(self.next_command).copied() {
            self.next_command += 1;
            self.visible = anchor.char_index;
            match anchor.command {
                InlineCommand::Wait(_) | InlineCommand::Pause => {}
                InlineCommand::Speed(cps) => self.cps = cps,
                other => self.apply_visual(other),
            }
        }
        self.visible = self.layout.total_chars;
        self.wait = 0.0;
        self.timer = 0.0;
        self.waiting_for_input = false;
        self.complete = true;
    }

    /// 在 `{p}` 处继续；不在等待时返回 false
    pub fn continue_after_pause(&mut self) -> bool {
        if !self.waiting_for_input {
            return false;
        }
        self.waiting_for_input = false;
        true
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn is_waiting_for_input(&self) -> bool {
        self.waiting_for_input
    }

    pub fn visible_chars(&self) -> usize {
        self.visible
    }

    pub fn total_chars(&self) -> usize {
        self.layout.total_chars
    }

    pub fn layout(&self) -> &TextLayout {
        &self.layout
    }

    pub fn current_style(&self) -> TextStyle {
        self.style
    }

    pub fn cps(&self) -> f32 {
        self.cps
    }

    /// 已揭示的文本
    pub fn visible_text(&self) -> String {
        self.layout.text_prefix(self.visible)
    }

    /// 第 index 个字符当前的逐字偏移
    pub fn char_offset(&self, index: usize) -> Vec2 {
        let mut offset = Vec2::ZERO;
        for effect in &self.effects {
            if index < effect.start || effect.end.is_some_and(|end| index >= end) {
                continue;
            }
            let local = self.time - effect.started_at;
            match effect.kind {
                EffectKind::Shake {
                    intensity,
                    duration,
                } => {
                    if duration > 0.0 && local > duration {
                        continue;
                    }
                    let seed = index as f32 * 12.9898 + local * 78.233;
                    offset.x += (seed.sin() * 43758.547).fract() * intensity;
                    offset.y += ((seed * 1.7).cos() * 24634.635).fract() * intensity;
                }
                EffectKind::Wave {
                    amplitude,
                    frequency,
                } => {
                    offset.y += amplitude * (local * frequency * TAU + index as f32 * 0.5).sin();
                }
            }
        }
        offset
    }
}

fn punctuation_factor(ch: char) -> f32 {
    match ch {
        '.' | '!' | '?' | '。' | '！' | '？' => 1.0,
        ',' | ';' | ':' | '，' | '；' | '：' | '、' => 0.5,
        '-' => 0.25,
        _ => 0.0,
    }
}
