//! 复数规则

use serde::{Deserialize, Serialize};

/// 复数类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluralCategory {
    Zero,
    One,
    Two,
    Few,
    Many,
    Other,
}

impl PluralCategory {
    pub const ALL: [PluralCategory; 6] = [
        Self::Zero,
        Self::One,
        Self::Two,
        Self::Few,
        Self::Many,
        Self::Other,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Zero => "zero",
            Self::One => "one",
            Self::Two => "two",
            Self::Few => "few",
            Self::Many => "many",
            Self::Other => "other",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(name.trim()))
    }
}

/// 按语言族划分的复数规则
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PluralRule {
    /// n == 1 → One
    #[default]
    English,
    /// n ∈ {0, 1} → One
    French,
    /// 俄语、乌克兰语、白俄罗斯语
    EastSlavic,
    Polish,
    /// 捷克语、斯洛伐克语
    Czech,
    Arabic,
    /// 中日韩等无复数变化的语言
    NoPlural,
}

impl PluralRule {
    /// 根据语言代码选择规则，未知语言使用 English 规则
    pub fn for_locale(locale: &str) -> Self {
        let language = locale
            .split(['-', '_'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        match language.as_str() {
            "fr" | "pt" => Self::French,
            "ru" | "uk" | "be" => Self::EastSlavic,
            "pl" => Self::Polish,
            "cs" | "sk" => Self::Czech,
            "ar" => Self::Arabic,
            "zh" | "ja" | "ko" | "vi" | "th" | "id" | "ms" => Self::NoPlural,
            _ => Self::English,
        }
    }

    /// 数量对应的类别
    pub fn category(&self, count: i64) -> PluralCategory {
        use PluralCategory::*;
        let n = count.unsigned_abs();
        let (n10, n100) = (n % 10, n % 100);
        match self {
            Self::English => {
                if n == 1 {
                    One
                } else {
                    Other
                }
            }
            Self::French => {
                if n <= 1 {
                    One
                } else {
                    Other
                }
            }
            Self::EastSlavic => {
                if n10 == 1 && n100 != 11 {
                    One
                } else if (2..=4).contains(&n10) && !(12..=14).contains(&n100) {
                    Few
                } else {
                    Other
                }
            }
            Self::Polish => {
                if n == 1 {
                    One
                } else if (2..=4).contains(&n10) && !(12..=14).contains(&n100) {
                    Few
                } else {
                    Many
                }
            }
            Self::Czech => match n {
                1 => One,
                2..=4 => Few,
                _ => Other,
            },
            Self::Arabic => match n {
                0 => Zero,
                1 => One,
                2 => Two,
                _ if (3..=10).contains(&n100) => Few,
                _ if (11..=99).contains(&n100) => Many,
                _ => Other,
            },
            Self::NoPlural => Other,
        }
    }

    /// 规则使用的类别（PO 文件 `msgstr[n]` 的顺序）
    pub fn categories(&self) -> &'static [PluralCategory] {
        use PluralCategory::*;
        match self {
            Self::English | Self::French => &[One, Other],
            Self::EastSlavic | Self::Czech => &[One, Few, Other],
            Self::Polish => &[One, Few, Many],
            Self::Arabic => &[Zero, One, Two, Few, Many, Other],
            Self::NoPlural => &[Other],
        }
    }
}
