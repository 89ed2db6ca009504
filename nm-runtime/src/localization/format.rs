//! 本地化文件格式
//!
//! | 格式 | 单数 | 复数 |
//! |------|------|------|
//! | CSV | `id,value` 或 `id,context,value` | `id[one],...` |
//! | JSON | `"id": "value"` | `"id": {"one": "...", "other": "..."}` |
//! | PO | `msgid` / `msgstr` | `msgid_plural` / `msgstr[n]`，按语言的类别顺序 |
//! | XLIFF 1.2 | `trans-unit` 的 `target`（缺失时取 `source`） | `id[one]` |
//!
//! 导出与导入使用相同的约定，导出结果按 id 排序。

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use super::{LocalizationError, LocalizedString, PluralCategory, PluralRule, StringTable};

/// 文件格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalizationFormat {
    Csv,
    Json,
    Po,
    Xliff,
}

impl LocalizationFormat {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Csv => "CSV",
            Self::Json => "JSON",
            Self::Po => "PO",
            Self::Xliff => "XLIFF",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Po => "po",
            Self::Xliff => "xliff",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "csv" => Some(Self::Csv),
            "json" => Some(Self::Json),
            "po" | "pot" => Some(Self::Po),
            "xliff" | "xlf" => Some(Self::Xliff),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_name)
    }
}

/// 解析文本
pub fn import(
    format: LocalizationFormat,
    text: &str,
    rule: PluralRule,
) -> Result<Vec<LocalizedString>, LocalizationError> {
    let mut collector = Collector::default();
    match format {
        LocalizationFormat::Csv => import_csv(text, &mut collector)?,
        LocalizationFormat::Json => import_json(text, &mut collector)?,
        LocalizationFormat::Po => import_po(text, rule, &mut collector)?,
        LocalizationFormat::Xliff => import_xliff(text, &mut collector)?,
    }
    Ok(collector.finish())
}

/// 导出字符串表
pub fn export(format: LocalizationFormat, table: &StringTable, rule: PluralRule) -> String {
    match format {
        LocalizationFormat::Csv => export_csv(table),
        LocalizationFormat::Json => export_json(table),
        LocalizationFormat::Po => export_po(table, rule),
        LocalizationFormat::Xliff => export_xliff(table),
    }
}

/// 按出现顺序收集，同 id 的多个形式合并为一条
#[derive(Default)]
struct Collector {
    order: Vec<String>,
    strings: BTreeMap<String, LocalizedString>,
}

impl Collector {
    fn add(&mut self, id: &str, category: PluralCategory, context: &str, value: String) {
        let entry = self.strings.entry(id.to_string()).or_insert_with(|| {
            self.order.push(id.to_string());
            LocalizedString {
                id: id.to_string(),
                ..LocalizedString::default()
            }
        });
        if !context.is_empty() {
            entry.context = context.to_string();
        }
        entry.forms.insert(category, value);
    }

    /// 键可以带 `[category]` 后缀
    fn add_keyed(&mut self, key: &str, context: &str, value: String) {
        let (id, category) = split_plural_key(key);
        self.add(id, category, context, value);
    }

    fn finish(mut self) -> Vec<LocalizedString> {
        self.order
            .iter()
            .filter_map(|id| self.strings.remove(id))
            .collect()
    }
}

fn split_plural_key(key: &str) -> (&str, PluralCategory) {
    if let Some(stripped) = key.strip_suffix(']') {
        if let Some(open) = stripped.rfind('[') {
            if let Some(category) = PluralCategory::from_name(&stripped[open + 1..]) {
                return (&stripped[..open], category);
            }
        }
    }
    (key, PluralCategory::Other)
}

/// 条目导出时使用的键与值
fn keyed_forms(string: &LocalizedString) -> Vec<(String, &str)> {
    if !string.is_plural() {
        return vec![(string.id.clone(), string.value())];
    }
    string
        .forms
        .iter()
        .map(|(category, value)| (format!("{}[{}]", string.id, category.name()), value.as_str()))
        .collect()
}

// ===== CSV =====

/// 解析 CSV 记录，返回 (起始行号, 字段)
fn parse_csv(text: &str) -> Result<Vec<(usize, Vec<String>)>, LocalizationError> {
    let mut records = Vec::new();
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut line = 1;
    let mut record_line = 1;
    let mut chars = text.strip_prefix('\u{feff}').unwrap_or(text).chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(c);
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => in_quotes = true,
            ',' => fields.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                fields.push(std::mem::take(&mut field));
                records.push((record_line, std::mem::take(&mut fields)));
                line += 1;
                record_line = line;
            }
            _ => field.push(c),
        }
    }
    if in_quotes {
        return Err(LocalizationError::parse(
            LocalizationFormat::Csv,
            record_line,
            "引号未闭合",
        ));
    }
    if !field.is_empty() || !fields.is_empty() {
        fields.push(field);
        records.push((record_line, fields));
    }
    Ok(records)
}

fn import_csv(text: &str, out: &mut Collector) -> Result<(), LocalizationError> {
    for (index, (line, fields)) in parse_csv(text)?.into_iter().enumerate() {
        if fields.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        let first = fields[0].trim();
        if index == 0 && (first.eq_ignore_ascii_case("id") || first.eq_ignore_ascii_case("key")) {
            continue;
        }
        match fields.as_slice() {
            [id, value] => out.add_keyed(id.trim(), "", value.clone()),
            [id, context, value, ..] => out.add_keyed(id.trim(), context, value.clone()),
            _ => {
                return Err(LocalizationError::parse(
                    LocalizationFormat::Csv,
                    line,
                    "至少需要 id 与 value 两列",
                ));
            }
        }
    }
    Ok(())
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn export_csv(table: &StringTable) -> String {
    let mut out = String::from("id,context,value\n");
    for string in table.iter() {
        for (key, value) in keyed_forms(string) {
            let _ = writeln!(
                out,
                "{},{},{}",
                csv_field(&key),
                csv_field(&string.context),
                csv_field(value)
            );
        }
    }
    out
}

// ===== JSON =====

fn import_json(text: &str, out: &mut Collector) -> Result<(), LocalizationError> {
    let root: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| LocalizationError::parse(LocalizationFormat::Json, e.line(), e.to_string()))?;
    let serde_json::Value::Object(entries) = root else {
        return Err(LocalizationError::parse(
            LocalizationFormat::Json,
            1,
            "根节点必须是对象",
        ));
    };

    for (id, value) in entries {
        match value {
            serde_json::Value::String(s) => out.add_keyed(&id, "", s),
            serde_json::Value::Object(forms) => {
                let context = forms
                    .get("_context")
                    .and_then(|c| c.as_str())
                    .unwrap_or_default()
                    .to_string();
                for (name, form) in forms.iter().filter(|(k, _)| k.as_str() != "_context") {
                    let category = PluralCategory::from_name(name).ok_or_else(|| {
                        LocalizationError::parse(
                            LocalizationFormat::Json,
                            0,
                            format!("{} 的复数类别未知: {}", id, name),
                        )
                    })?;
                    let text = form.as_str().ok_or_else(|| {
                        LocalizationError::parse(
                            LocalizationFormat::Json,
                            0,
                            format!("{}[{}] 必须是字符串", id, name),
                        )
                    })?;
                    out.add(&id, category, &context, text.to_string());
                }
            }
            _ => {
                return Err(LocalizationError::parse(
                    LocalizationFormat::Json,
                    0,
                    format!("{} 的值必须是字符串或对象", id),
                ));
            }
        }
    }
    Ok(())
}

fn export_json(table: &StringTable) -> String {
    let mut root = serde_json::Map::new();
    for string in table.iter() {
        let value = if string.is_plural() || !string.context.is_empty() {
            let mut forms = serde_json::Map::new();
            if !string.context.is_empty() {
                forms.insert("_context".to_string(), string.context.clone().into());
            }
            for (category, text) in &string.forms {
                forms.insert(category.name().to_string(), text.clone().into());
            }
            serde_json::Value::Object(forms)
        } else {
            string.value().into()
        };
        root.insert(string.id.clone(), value);
    }
    let mut text =
        serde_json::to_string_pretty(&serde_json::Value::Object(root)).unwrap_or_default();
    text.push('\n');
    text
}

// ===== PO =====

#[derive(Clone, Copy)]
enum PoField {
    Context,
    Id,
    IdPlural,
    Str,
    StrN(usize),
}

#[derive(Default)]
struct PoEntry {
    line: usize,
    context: String,
    id: Option<String>,
    id_plural: Option<String>,
    str: String,
    str_n: BTreeMap<usize, String>,
}

impl PoEntry {
    fn field_mut(&mut self, field: PoField) -> &mut String {
        match field {
            PoField::Context => &mut self.context,
            PoField::Id => self.id.get_or_insert_with(String::new),
            PoField::IdPlural => self.id_plural.get_or_insert_with(String::new),
            PoField::Str => &mut self.str,
            PoField::StrN(n) => self.str_n.entry(n).or_default(),
        }
    }

    fn flush(self, rule: PluralRule, out: &mut Collector) -> Result<(), LocalizationError> {
        let Some(id) = self.id.filter(|id| !id.is_empty()) else {
            return Ok(());
        };
        if self.id_plural.is_some() {
            let categories = rule.categories();
            for (n, value) in self.str_n {
                let category = categories.get(n).copied().ok_or_else(|| {
                    LocalizationError::parse(
                        LocalizationFormat::Po,
                        self.line,
                        format!("msgstr[{}] 超出复数形式数量 {}", n, categories.len()),
                    )
                })?;
                if !value.is_empty() {
                    out.add(&id, category, &self.context, value);
                }
            }
        } else if !self.str.is_empty() {
            out.add(&id, PluralCategory::Other, &self.context, self.str);
        }
        Ok(())
    }
}

fn po_unquote(raw: &str, line: usize) -> Result<String, LocalizationError> {
    let inner = raw
        .trim()
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .ok_or_else(|| LocalizationError::parse(LocalizationFormat::Po, line, "字符串缺少引号"))?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    Ok(out)
}

fn po_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

fn import_po(text: &str, rule: PluralRule, out: &mut Collector) -> Result<(), LocalizationError> {
    let mut entry = PoEntry::default();
    let mut current: Option<PoField> = None;

    for (index, raw) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim();
        if line.is_empty() {
            std::mem::take(&mut entry).flush(rule, out)?;
            current = None;
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        if line.starts_with('"') {
            let field = current.ok_or_else(|| {
                LocalizationError::parse(LocalizationFormat::Po, line_no, "续行前没有关键字")
            })?;
            let value = po_unquote(line, line_no)?;
            entry.field_mut(field).push_str(&value);
            continue;
        }

        let (keyword, rest) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| LocalizationError::parse(LocalizationFormat::Po, line_no, "无法识别的行"))?;
        let field = match keyword {
            "msgctxt" => PoField::Context,
            "msgid" => PoField::Id,
            "msgid_plural" => PoField::IdPlural,
            "msgstr" => PoField::Str,
            _ => {
                let n = keyword
                    .strip_prefix("msgstr[")
                    .and_then(|s| s.strip_suffix(']'))
                    .and_then(|s| s.parse::<usize>().ok())
                    .ok_or_else(|| {
                        LocalizationError::parse(
                            LocalizationFormat::Po,
                            line_no,
                            format!("未知关键字: {}", keyword),
                        )
                    })?;
                PoField::StrN(n)
            }
        };

        // 新条目开始时先提交上一条
        let starts_entry = matches!(field, PoField::Context)
            || (matches!(field, PoField::Id) && entry.id.is_some());
        if starts_entry && (entry.id.is_some() || !entry.context.is_empty()) {
            std::mem::take(&mut entry).flush(rule, out)?;
        }
        if entry.id.is_none() && entry.context.is_empty() {
            entry.line = line_no;
        }

        let value = po_unquote(rest, line_no)?;
        *entry.field_mut(field) = value;
        current = Some(field);
    }
    entry.flush(rule, out)
}

fn export_po(table: &StringTable, rule: PluralRule) -> String {
    let mut out = String::new();
    out.push_str("msgid \"\"\nmsgstr \"\"\n");
    let _ = writeln!(out, "\"Language: {}\\n\"", table.locale);
    out.push_str("\"Content-Type: text/plain; charset=UTF-8\\n\"\n");

    for string in table.iter() {
        out.push('\n');
        if !string.context.is_empty() {
            let _ = writeln!(out, "msgctxt {}", po_quote(&string.context));
        }
        let id = po_quote(&string.id);
        if string.is_plural() {
            let _ = writeln!(out, "msgid {}", id);
            let _ = writeln!(out, "msgid_plural {}", id);
            for (n, category) in rule.categories().iter().enumerate() {
                let value = string.form(*category).unwrap_or_default();
                let _ = writeln!(out, "msgstr[{}] {}", n, po_quote(value));
            }
        } else {
            let _ = writeln!(out, "msgid {}", id);
            let _ = writeln!(out, "msgstr {}", po_quote(string.value()));
        }
    }
    out
}

// ===== XLIFF =====

fn element_text(node: roxmltree::Node<'_, '_>) -> String {
    node.descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect()
}

fn import_xliff(text: &str, out: &mut Collector) -> Result<(), LocalizationError> {
    let doc = roxmltree::Document::parse(text).map_err(|e| {
        LocalizationError::parse(LocalizationFormat::Xliff, e.pos().row as usize, e.to_string())
    })?;

    for unit in doc
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "trans-unit")
    {
        let line = doc.text_pos_at(unit.range().start).row as usize;
        let id = unit
            .attribute("id")
            .or_else(|| unit.attribute("resname"))
            .ok_or_else(|| {
                LocalizationError::parse(LocalizationFormat::Xliff, line, "trans-unit 缺少 id")
            })?;
        let child = |name: &str| {
            unit.children()
                .find(|c| c.is_element() && c.tag_name().name() == name)
                .map(element_text)
        };
        let value = child("target")
            .filter(|t| !t.is_empty())
            .or_else(|| child("source"))
            .unwrap_or_default();
        let context = child("note").unwrap_or_default();
        out.add_keyed(id, &context, value);
    }
    Ok(())
}

fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

fn export_xliff(table: &StringTable) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<xliff version=\"1.2\" xmlns=\"urn:oasis:names:tc:xliff:document:1.2\">\n");
    let _ = writeln!(
        out,
        "  <file original=\"novelmind\" datatype=\"plaintext\" target-language=\"{}\">",
        xml_escape(&table.locale)
    );
    out.push_str("    <body>\n");
    for string in table.iter() {
        for (key, value) in keyed_forms(string) {
            let value = xml_escape(value);
            let _ = writeln!(out, "      <trans-unit id=\"{}\">", xml_escape(&key));
            let _ = writeln!(out, "        <source>{}</source>", value);
            let _ = writeln!(out, "        <target>{}</target>", value);
            if !string.context.is_empty() {
                let _ = writeln!(out, "        <note>{}</note>", xml_escape(&string.context));
            }
            out.push_str("      </trans-unit>\n");
        }
    }
    out.push_str("    </body>\n  </file>\n</xliff>\n");
    out
}
