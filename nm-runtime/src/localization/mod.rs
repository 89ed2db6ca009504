//! # Localization 模块
//!
//! 多语言字符串表，支持复数与插值。
//!
//! ## 设计原则
//!
//! - 内存模型与文件格式无关，格式读写集中在 [`format`] 子模块
//! - 查找顺序：当前语言 → 默认语言 → 返回 id 本身并触发缺失回调
//! - 插值在复数选择之后进行，未知的 `{name}` 原样保留
//! - 缺失字符串每个 id 只记录一次日志
//!
//! 文本以 `loc:` 开头时视为字符串 id，见 [`LocalizationManager::resolve_text`]。

pub mod format;
mod plural;

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::ErrorKind;

pub use format::LocalizationFormat;
pub use plural::{PluralCategory, PluralRule};

/// 本地化引用前缀
pub const LOC_PREFIX: &str = "loc:";

/// 取出 `loc:` 引用中的字符串 id
pub fn localization_key(text: &str) -> Option<&str> {
    text.trim()
        .strip_prefix(LOC_PREFIX)
        .map(str::trim)
        .filter(|key| !key.is_empty())
}

/// 本地化错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LocalizationError {
    #[error("本地化文件读写失败 {path}: {message}")]
    Io { path: String, message: String },

    #[error("{format} 解析失败（第 {line} 行）: {message}")]
    Parse {
        format: String,
        line: usize,
        message: String,
    },

    #[error("不支持的本地化格式: {0}")]
    UnsupportedFormat(String),

    #[error("语言不存在: {0}")]
    LocaleNotFound(String),
}

impl LocalizationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::IOError,
            Self::Parse { .. } | Self::UnsupportedFormat(_) => ErrorKind::InvalidFormat,
            Self::LocaleNotFound(_) => ErrorKind::NotFound,
        }
    }

    pub(crate) fn parse(
        format: LocalizationFormat,
        line: usize,
        message: impl Into<String>,
    ) -> Self {
        Self::Parse {
            format: format.name().to_string(),
            line,
            message: message.into(),
        }
    }
}

/// 语言配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocaleConfig {
    pub code: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub right_to_left: bool,
    /// 未指定时按语言代码推断
    #[serde(default)]
    pub plural_rule: Option<PluralRule>,
}

impl LocaleConfig {
    pub fn new(code: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            display_name: code.clone(),
            code,
            right_to_left: false,
            plural_rule: None,
        }
    }

    pub fn with_plural_rule(mut self, rule: PluralRule) -> Self {
        self.plural_rule = Some(rule);
        self
    }

    pub fn rule(&self) -> PluralRule {
        self.plural_rule
            .unwrap_or_else(|| PluralRule::for_locale(&self.code))
    }
}

/// 单条字符串（可含多个复数形式）
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LocalizedString {
    pub id: String,
    pub context: String,
    pub forms: BTreeMap<PluralCategory, String>,
}

impl LocalizedString {
    pub fn new(id: impl Into<String>, value: impl Into<String>) -> Self {
        let mut forms = BTreeMap::new();
        forms.insert(PluralCategory::Other, value.into());
        Self {
            id: id.into(),
            context: String::new(),
            forms,
        }
    }

    pub fn with_form(mut self, category: PluralCategory, value: impl Into<String>) -> Self {
        self.forms.insert(category, value.into());
        self
    }

    /// 默认形式：Other，缺失时取第一个
    pub fn value(&self) -> &str {
        self.forms
            .get(&PluralCategory::Other)
            .or_else(|| self.forms.values().next())
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn form(&self, category: PluralCategory) -> Option<&str> {
        self.forms.get(&category).map(String::as_str)
    }

    /// 是否带有 Other 以外的形式
    pub fn is_plural(&self) -> bool {
        self.forms.keys().any(|c| *c != PluralCategory::Other)
    }
}

/// 单个语言的字符串表
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StringTable {
    pub locale: String,
    strings: BTreeMap<String, LocalizedString>,
}

impl StringTable {
    pub fn new(locale: impl Into<String>) -> Self {
        Self {
            locale: locale.into(),
            strings: BTreeMap::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&LocalizedString> {
        self.strings.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.strings.contains_key(id)
    }

    pub fn insert(&mut self, string: LocalizedString) {
        self.strings.insert(string.id.clone(), string);
    }

    /// 合并：同 id 的形式逐个覆盖
    pub fn merge(&mut self, string: LocalizedString) {
        match self.strings.get_mut(&string.id) {
            Some(existing) => {
                existing.forms.extend(string.forms);
                if !string.context.is_empty() {
                    existing.context = string.context;
                }
            }
            None => self.insert(string),
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<LocalizedString> {
        self.strings.remove(id)
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// 按 id 排序遍历
    pub fn iter(&self) -> impl Iterator<Item = &LocalizedString> {
        self.strings.values()
    }
}

/// 替换 `{name}`；未知变量原样保留
pub fn interpolate(text: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find(['}', '{']) {
            Some(close) if after.as_bytes()[close] == b'}' => {
                let name = &after[..close];
                match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

type MissingCallback = Box<dyn Fn(&str, &str)>;

/// 本地化管理器
///
/// 由运行时宿主持有，单线程使用。
pub struct LocalizationManager {
    default_locale: String,
    current_locale: String,
    locales: BTreeMap<String, LocaleConfig>,
    tables: BTreeMap<String, StringTable>,
    missing_logged: RefCell<HashSet<String>>,
    on_string_missing: Option<MissingCallback>,
}

impl std::fmt::Debug for LocalizationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalizationManager")
            .field("default_locale", &self.default_locale)
            .field("current_locale", &self.current_locale)
            .field("locales", &self.locales.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for LocalizationManager {
    fn default() -> Self {
        Self::new("en")
    }
}

impl LocalizationManager {
    pub fn new(default_locale: impl Into<String>) -> Self {
        let default_locale = default_locale.into();
        Self {
            current_locale: default_locale.clone(),
            default_locale,
            locales: BTreeMap::new(),
            tables: BTreeMap::new(),
            missing_logged: RefCell::new(HashSet::new()),
            on_string_missing: None,
        }
    }

    pub fn default_locale(&self) -> &str {
        &self.default_locale
    }

    pub fn current_locale(&self) -> &str {
        &self.current_locale
    }

    pub fn set_default_locale(&mut self, locale: impl Into<String>) {
        self.default_locale = locale.into();
    }

    pub fn set_current_locale(&mut self, locale: impl Into<String>) {
        let locale = locale.into();
        if !self.tables.contains_key(&locale) {
            debug!(locale = %locale, "切换到尚未加载字符串的语言");
        }
        self.current_locale = locale;
    }

    /// 注册语言（已存在时覆盖配置，保留字符串）
    pub fn register_locale(&mut self, locale: impl Into<String>, config: LocaleConfig) {
        let locale = locale.into();
        self.tables
            .entry(locale.clone())
            .or_insert_with(|| StringTable::new(locale.clone()));
        self.locales.insert(locale, config);
    }

    /// 已注册或已加载字符串的语言
    pub fn locales(&self) -> Vec<&str> {
        let mut all: Vec<&str> = self
            .locales
            .keys()
            .chain(self.tables.keys())
            .map(String::as_str)
            .collect();
        all.sort_unstable();
        all.dedup();
        all
    }

    pub fn locale_config(&self, locale: &str) -> Option<&LocaleConfig> {
        self.locales.get(locale)
    }

    pub fn plural_rule(&self, locale: &str) -> PluralRule {
        self.locales
            .get(locale)
            .map(LocaleConfig::rule)
            .unwrap_or_else(|| PluralRule::for_locale(locale))
    }

    pub fn table(&self, locale: &str) -> Option<&StringTable> {
        self.tables.get(locale)
    }

    fn table_mut(&mut self, locale: &str) -> &mut StringTable {
        self.tables
            .entry(locale.to_string())
            .or_insert_with(|| StringTable::new(locale))
    }

    /// 从文件加载；`format` 为空时按扩展名推断
    pub fn load_strings(
        &mut self,
        locale: &str,
        path: &Path,
        format: Option<LocalizationFormat>,
    ) -> Result<usize, LocalizationError> {
        let format = match format {
            Some(f) => f,
            None => LocalizationFormat::from_path(path).ok_or_else(|| {
                LocalizationError::UnsupportedFormat(path.display().to_string())
            })?,
        };
        let text = std::fs::read_to_string(path).map_err(|e| LocalizationError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        self.load_strings_from_memory(locale, &text, format)
    }

    /// 从文本加载并合并到该语言，返回读入的字符串数
    pub fn load_strings_from_memory(
        &mut self,
        locale: &str,
        text: &str,
        format: LocalizationFormat,
    ) -> Result<usize, LocalizationError> {
        let rule = self.plural_rule(locale);
        let strings = format::import(format, text, rule)?;
        let count = strings.len();
        self.merge_strings(locale, strings);
        debug!(locale, count, format = format.name(), "加载本地化字符串");
        Ok(count)
    }

    pub fn merge_strings(
        &mut self,
        locale: &str,
        strings: impl IntoIterator<Item = LocalizedString>,
    ) {
        let table = self.table_mut(locale);
        for string in strings {
            table.merge(string);
        }
    }

    /// 卸载语言（配置与字符串一并移除）
    pub fn unload_locale(&mut self, locale: &str) -> bool {
        let had_table = self.tables.remove(locale).is_some();
        let had_config = self.locales.remove(locale).is_some();
        had_table || had_config
    }

    pub fn clear_all(&mut self) {
        self.tables.clear();
        self.locales.clear();
        self.missing_logged.borrow_mut().clear();
    }

    /// 字符串缺失回调，参数为 `(id, 当前语言)`
    pub fn set_on_string_missing<F>(&mut self, callback: F)
    where
        F: Fn(&str, &str) + 'static,
    {
        self.on_string_missing = Some(Box::new(callback));
    }

    /// 先在回退链上找精确的复数形式，找不到再取第一个含该 id 的默认形式
    fn lookup(&self, id: &str, count: Option<i64>) -> Option<&str> {
        let mut chain = vec![self.current_locale.as_str()];
        if self.default_locale != self.current_locale {
            chain.push(self.default_locale.as_str());
        }
        let found: Vec<(&str, &LocalizedString)> = chain
            .into_iter()
            .filter_map(|locale| self.tables.get(locale)?.get(id).map(|s| (locale, s)))
            .collect();
        if let Some(n) = count {
            let exact = found
                .iter()
                .find_map(|(locale, string)| string.form(self.plural_rule(locale).category(n)));
            if exact.is_some() {
                return exact;
            }
        }
        found.first().map(|(_, string)| string.value())
    }

    fn report_missing(&self, id: &str) {
        if self.missing_logged.borrow_mut().insert(id.to_string()) {
            warn!(id, locale = %self.current_locale, "本地化字符串缺失");
        }
        if let Some(callback) = &self.on_string_missing {
            callback(id, &self.current_locale);
        }
    }

    fn resolve(&self, id: &str, count: Option<i64>) -> String {
        match self.lookup(id, count) {
            Some(text) => text.to_string(),
            None => {
                self.report_missing(id);
                id.to_string()
            }
        }
    }

    pub fn get(&self, id: &str) -> String {
        self.resolve(id, None)
    }

    pub fn get_with(&self, id: &str, vars: &BTreeMap<String, String>) -> String {
        interpolate(&self.resolve(id, None), vars)
    }

    pub fn get_plural(&self, id: &str, count: i64) -> String {
        self.get_plural_with(id, count, &BTreeMap::new())
    }

    /// 复数查找；变量表未提供 `count` 时自动补上
    pub fn get_plural_with(&self, id: &str, count: i64, vars: &BTreeMap<String, String>) -> String {
        let text = self.resolve(id, Some(count));
        if vars.contains_key("count") {
            interpolate(&text, vars)
        } else {
            let mut vars = vars.clone();
            vars.insert("count".to_string(), count.to_string());
            interpolate(&text, &vars)
        }
    }

    /// 只查指定语言，不回退
    pub fn get_for_locale(&self, locale: &str, id: &str) -> Option<String> {
        self.tables
            .get(locale)
            .and_then(|t| t.get(id))
            .map(|s| s.value().to_string())
    }

    pub fn has_string(&self, id: &str) -> bool {
        self.lookup(id, None).is_some()
    }

    pub fn set_string(&mut self, locale: &str, id: &str, value: &str) {
        self.table_mut(locale).insert(LocalizedString::new(id, value));
        self.missing_logged.borrow_mut().remove(id);
    }

    pub fn remove_string(&mut self, locale: &str, id: &str) -> bool {
        self.tables
            .get_mut(locale)
            .is_some_and(|t| t.remove(id).is_some())
    }

    /// `loc:` 开头时按 id 查找，否则原样返回
    pub fn resolve_text(&self, text: &str) -> String {
        match localization_key(text) {
            Some(id) => self.get(id),
            None => text.to_string(),
        }
    }

    /// 默认语言中存在、指定语言缺失的 id
    pub fn missing_strings(&self, locale: &str) -> Vec<String> {
        let Some(reference) = self.tables.get(&self.default_locale) else {
            return Vec::new();
        };
        let target = self.tables.get(locale);
        reference
            .iter()
            .filter(|s| !target.is_some_and(|t| t.contains(&s.id)))
            .map(|s| s.id.clone())
            .collect()
    }

    /// 以指定格式导出为文本
    pub fn export_to_string(
        &self,
        locale: &str,
        format: LocalizationFormat,
    ) -> Result<String, LocalizationError> {
        let table = self
            .tables
            .get(locale)
            .ok_or_else(|| LocalizationError::LocaleNotFound(locale.to_string()))?;
        Ok(format::export(format, table, self.plural_rule(locale)))
    }

    pub fn export_strings(
        &self,
        locale: &str,
        path: &Path,
        format: LocalizationFormat,
    ) -> Result<(), LocalizationError> {
        let text = self.export_to_string(locale, format)?;
        write_file(path, &text)
    }

    /// 导出缺失字符串（值取默认语言原文，供翻译），返回条数
    pub fn export_missing_strings(
        &self,
        locale: &str,
        path: &Path,
        format: LocalizationFormat,
    ) -> Result<usize, LocalizationError> {
        let mut table = StringTable::new(locale);
        if let Some(reference) = self.tables.get(&self.default_locale) {
            for id in self.missing_strings(locale) {
                if let Some(string) = reference.get(&id) {
                    table.insert(string.clone());
                }
            }
        }
        let text = format::export(format, &table, self.plural_rule(locale));
        write_file(path, &text)?;
        Ok(table.len())
    }
}

fn write_file(path: &Path, text: &str) -> Result<(), LocalizationError> {
    std::fs::write(path, text).map_err(|e| LocalizationError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}
