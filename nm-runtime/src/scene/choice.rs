//! 选项菜单

use serde::{Deserialize, Serialize};

/// 单个选项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceOption {
    pub id: String,
    pub text: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub visible: bool,
    /// 条件表达式（由宿主求值，菜单只保存）
    #[serde(default)]
    pub condition: String,
}

fn default_true() -> bool {
    true
}

impl ChoiceOption {
    /// 创建选项
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            enabled: true,
            visible: true,
            condition: String::new(),
        }
    }

    fn selectable(&self) -> bool {
        self.enabled && self.visible
    }
}

/// 选项菜单状态
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChoiceMenu {
    pub options: Vec<ChoiceOption>,
    selected: usize,
}

impl ChoiceMenu {
    /// 由选项文本创建，选项 id 为 `choice_<序号>`
    pub fn from_texts<S: AsRef<str>>(texts: &[S]) -> Self {
        let options = texts
            .iter()
            .enumerate()
            .map(|(i, t)| ChoiceOption::new(format!("choice_{}", i), t.as_ref()))
            .collect();
        Self::new(options)
    }

    pub fn new(options: Vec<ChoiceOption>) -> Self {
        let mut menu = Self {
            options,
            selected: 0,
        };
        if !menu.options.first().is_some_and(|o| o.selectable()) {
            menu.select_next();
        }
        menu
    }

    pub fn selected_index(&self) -> usize {
        self.selected
    }

    /// 直接设置当前选中项；越界返回 false
    pub fn set_selected(&mut self, index: usize) -> bool {
        if index >= self.options.len() {
            return false;
        }
        self.selected = index;
        true
    }

    /// 移到下一个可选项（循环）
    pub fn select_next(&mut self) -> bool {
        self.step(1)
    }

    /// 移到上一个可选项（循环）
    pub fn select_previous(&mut self) -> bool {
        self.step(self.options.len().saturating_sub(1))
    }

    fn step(&mut self, delta: usize) -> bool {
        let len = self.options.len();
        if len == 0 {
            return false;
        }
        let mut index = self.selected;
        for _ in 0..len {
            index = (index + delta) % len;
            if self.options[index].selectable() {
                self.selected = index;
                return true;
            }
        }
        false
    }

    /// 确认当前选项，返回 `(序号, 选项 id)`；不可选时返回 `None`
    pub fn confirm(&self) -> Option<(usize, String)> {
        let option = self.options.get(self.selected)?;
        option
            .selectable()
            .then(|| (self.selected, option.id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_navigation_skips_disabled() {
        let mut menu = ChoiceMenu::from_texts(&["a", "b", "c"]);
        menu.options[1].enabled = false;
        assert_eq!(menu.selected_index(), 0);
        menu.select_next();
        assert_eq!(menu.selected_index(), 2);
        menu.select_next();
        assert_eq!(menu.selected_index(), 0);
        menu.select_previous();
        assert_eq!(menu.selected_index(), 2);
    }

    #[test]
    fn test_initial_selection_skips_hidden() {
        let mut options = vec![ChoiceOption::new("x", "X"), ChoiceOption::new("y", "Y")];
        options[0].visible = false;
        let menu = ChoiceMenu::new(options);
        assert_eq!(menu.selected_index(), 1);
        assert_eq!(menu.confirm(), Some((1, "y".to_string())));
    }

    #[test]
    fn test_confirm_disabled_fails() {
        let mut menu = ChoiceMenu::from_texts(&["only"]);
        assert_eq!(menu.confirm(), Some((0, "choice_0".to_string())));
        menu.options[0].enabled = false;
        assert_eq!(menu.confirm(), None);
        assert!(!menu.select_next());
    }
}
