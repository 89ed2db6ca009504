//! # Text 模块
//!
//! 对话文本的内联指令解析、排版与打字机效果。
//!
//! ## 指令语法
//!
//! | 指令 | 作用 |
//! |------|------|
//! | `{w=0.5}` | 停顿 |
//! | `{s=40}` | 改变打字速度 |
//! | `{p}` | 等待玩家输入 |
//! | `{c=#FF0000}` `{/color}` | 颜色 |
//! | `{b}` `{/b}` `{i}` `{/i}` | 粗体/斜体 |
//! | `{shake=2,0.5}` `{wave=4,1}` | 逐字效果 |
//! | `{reset}` | 恢复默认 |

mod layout;
mod markup;
mod typewriter;

pub use layout::{
    CommandAnchor, FontAtlas, GlyphMetrics, LayoutGlyph, LayoutLine, MonospaceMetrics, TextLayout,
    layout_segments,
};
pub use markup::{InlineCommand, Segment, TextStyle, apply_style, parse_markup, strip_markup};
pub use typewriter::{DEFAULT_CPS, DEFAULT_PUNCTUATION_MULTIPLIER, Typewriter};
