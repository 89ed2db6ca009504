//! 日志初始化
//!
//! 进程级的 tracing 订阅者；重复调用是无害的。

use std::str::FromStr;

use tracing::Level;

/// 按级别名（`trace`/`debug`/`info`/`warn`/`error`）安装 fmt 订阅者
///
/// 返回是否由本次调用完成安装。无法识别的级别按 `info` 处理。
pub fn init(level: &str) -> bool {
    let level = parse_level(level);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .is_ok()
}

pub fn parse_level(level: &str) -> Level {
    Level::from_str(level.trim()).unwrap_or(Level::INFO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level(" warn "), Level::WARN);
        assert_eq!(parse_level("loud"), Level::INFO);
    }

    #[test]
    fn test_init_is_idempotent() {
        init("info");
        assert!(!init("debug"));
    }
}
