//! 场景对象
//!
//! 对象类型是封闭集合，类型相关字段在存档时写入字符串属性表，
//! 读档时再解析回来，因此属性表是对象对外的统一视图。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::choice::{ChoiceMenu, ChoiceOption};
use super::state::SceneObjectState;
use super::{LayerKind, SceneError};
use crate::animation::{Tween, TweenValue};
use crate::geometry::{Color, Transform, Vec2};
use crate::text::{GlyphMetrics, TextLayout, Typewriter};

/// 对象类型（不带数据）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SceneObjectType {
    Background,
    Character,
    DialogueUi,
    ChoiceUi,
    EffectOverlay,
    Sprite,
    TextLabel,
    Panel,
    Custom,
}

impl SceneObjectType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Background => "Background",
            Self::Character => "Character",
            Self::DialogueUi => "DialogueUI",
            Self::ChoiceUi => "ChoiceUI",
            Self::EffectOverlay => "EffectOverlay",
            Self::Sprite => "Sprite",
            Self::TextLabel => "TextLabel",
            Self::Panel => "Panel",
            Self::Custom => "Custom",
        }
    }
}

/// 角色站位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CharacterSlot {
    Left,
    #[default]
    Center,
    Right,
    /// 位置由对象变换决定
    Custom,
}

impl CharacterSlot {
    /// 大小写不敏感，未知名称视为 Custom
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "left" => Self::Left,
            "center" | "centre" | "middle" => Self::Center,
            "right" => Self::Right,
            _ => Self::Custom,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Left => "Left",
            Self::Center => "Center",
            Self::Right => "Right",
            Self::Custom => "Custom",
        }
    }

    /// 站位中心在画布宽度上的比例
    pub fn x_fraction(&self) -> Option<f32> {
        match self {
            Self::Left => Some(0.2),
            Self::Center => Some(0.5),
            Self::Right => Some(0.8),
            Self::Custom => None,
        }
    }
}

/// 全屏效果类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OverlayEffect {
    #[default]
    None,
    Fade,
    Flash,
    Shake,
    Rain,
    Snow,
    Custom,
}

impl OverlayEffect {
    pub fn from_name(name: &str) -> Option<Self> {
        let effect = match name.to_ascii_lowercase().as_str() {
            "none" => Self::None,
            "fade" => Self::Fade,
            "flash" => Self::Flash,
            "shake" => Self::Shake,
            "rain" => Self::Rain,
            "snow" => Self::Snow,
            "custom" => Self::Custom,
            _ => return None,
        };
        Some(effect)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Fade => "Fade",
            Self::Flash => "Flash",
            Self::Shake => "Shake",
            Self::Rain => "Rain",
            Self::Snow => "Snow",
            Self::Custom => "Custom",
        }
    }
}

/// 全屏效果状态
#[derive(Debug, Clone, PartialEq)]
pub struct EffectState {
    pub effect: OverlayEffect,
    pub intensity: f32,
    pub color: Color,
    /// 持续时间（秒），0 表示持续到被清除
    pub duration: f32,
    elapsed: f32,
}

impl EffectState {
    pub fn new(effect: OverlayEffect, intensity: f32, color: Color, duration: f32) -> Self {
        Self {
            effect,
            intensity: intensity.clamp(0.0, 1.0),
            color,
            duration: duration.max(0.0),
            elapsed: 0.0,
        }
    }

    pub fn elapsed(&self) -> f32 {
        self.elapsed
    }

    /// 推进时间，返回本次是否到期
    pub(crate) fn update(&mut self, dt: f32) -> bool {
        let was_finished = self.is_finished();
        self.elapsed += dt;
        !was_finished && self.is_finished()
    }

    pub fn is_finished(&self) -> bool {
        self.duration > 0.0 && self.elapsed >= self.duration
    }

    /// 剩余强度比例（Flash 与 Shake 随时间衰减）
    pub fn strength(&self) -> f32 {
        if self.is_finished() {
            return 0.0;
        }
        match self.effect {
            OverlayEffect::Flash | OverlayEffect::Shake if self.duration > 0.0 => {
                self.intensity * (1.0 - self.elapsed / self.duration)
            }
            _ => self.intensity,
        }
    }

    /// Shake 效果对背景层与角色层的整体偏移
    pub fn shake_offset(&self) -> Vec2 {
        if self.effect != OverlayEffect::Shake {
            return Vec2::ZERO;
        }
        let amplitude = self.strength() * 20.0;
        let t = self.elapsed * 60.0;
        Vec2::new(amplitude * (t * 1.3).sin(), amplitude * (t * 1.7).cos())
    }
}

/// 对话框
#[derive(Debug, Clone)]
pub struct DialogueBox {
    pub speaker: String,
    /// 带内联指令的原文
    pub text: String,
    /// 打字速度（字符/秒）
    pub cps: f32,
    /// 折行宽度，0 表示不折行
    pub max_width: f32,
    typewriter: Option<Typewriter>,
}

impl Default for DialogueBox {
    fn default() -> Self {
        Self {
            speaker: String::new(),
            text: String::new(),
            cps: crate::text::DEFAULT_CPS,
            max_width: 0.0,
            typewriter: None,
        }
    }
}

impl DialogueBox {
    pub fn new(speaker: impl Into<String>, text: impl Into<String>, cps: f32) -> Self {
        Self {
            speaker: speaker.into(),
            text: text.into(),
            cps,
            ..Self::default()
        }
    }

    /// 折行宽度
    pub fn with_max_width(mut self, max_width: f32) -> Self {
        self.max_width = max_width;
        self
    }

    /// 按当前文本重新排版并开始打字机
    pub fn start_typewriter(&mut self, metrics: &dyn GlyphMetrics) {
        let layout = TextLayout::new(&self.text, metrics, self.max_width);
        self.typewriter = Some(Typewriter::new(layout, self.cps));
    }

    /// 跳过打字机；没有进行中的打字机时返回 false
    pub fn skip_typewriter(&mut self) -> bool {
        match self.typewriter.as_mut() {
            Some(tw) if !tw.is_complete() => {
                tw.skip_to_end();
                true
            }
            _ => false,
        }
    }

    pub fn is_typewriter_complete(&self) -> bool {
        self.typewriter.as_ref().is_none_or(|tw| tw.is_complete())
    }

    /// 在 `{p}` 处继续
    pub fn continue_typewriter(&mut self) -> bool {
        self.typewriter
            .as_mut()
            .is_some_and(|tw| tw.continue_after_pause())
    }

    pub fn typewriter(&self) -> Option<&Typewriter> {
        self.typewriter.as_ref()
    }

    pub(crate) fn update(&mut self, dt: f32) {
        if let Some(tw) = self.typewriter.as_mut() {
            tw.update(dt);
        }
    }
}

/// 对象类型及其专属数据
#[derive(Debug, Clone)]
pub enum SceneObjectKind {
    Background {
        texture: String,
        tint: Color,
    },
    Character {
        character_id: String,
        expression: String,
        pose: String,
        slot: CharacterSlot,
        texture: String,
        highlighted: bool,
        name_color: Color,
    },
    DialogueUi(DialogueBox),
    ChoiceUi(ChoiceMenu),
    EffectOverlay(EffectState),
    Sprite {
        texture: String,
        tint: Color,
    },
    TextLabel {
        text: String,
        color: Color,
        font_size: f32,
    },
    Panel {
        color: Color,
    },
    Custom {
        type_name: String,
    },
}

impl SceneObjectKind {
    /// 指定类型的默认数据
    pub fn default_for(object_type: SceneObjectType) -> Self {
        match object_type {
            SceneObjectType::Background => Self::Background {
                texture: String::new(),
                tint: Color::WHITE,
            },
            SceneObjectType::Character => Self::character("", CharacterSlot::Center),
            SceneObjectType::DialogueUi => Self::DialogueUi(DialogueBox::default()),
            SceneObjectType::ChoiceUi => Self::ChoiceUi(ChoiceMenu::default()),
            SceneObjectType::EffectOverlay => Self::EffectOverlay(EffectState::new(
                OverlayEffect::None,
                0.0,
                Color::BLACK,
                0.0,
            )),
            SceneObjectType::Sprite => Self::Sprite {
                texture: String::new(),
                tint: Color::WHITE,
            },
            SceneObjectType::TextLabel => Self::TextLabel {
                text: String::new(),
                color: Color::WHITE,
                font_size: 24.0,
            },
            SceneObjectType::Panel => Self::Panel {
                color: Color::BLACK.with_alpha(0.5),
            },
            SceneObjectType::Custom => Self::Custom {
                type_name: String::new(),
            },
        }
    }

    /// 角色（纹理默认取角色 id）
    pub fn character(character_id: &str, slot: CharacterSlot) -> Self {
        Self::Character {
            character_id: character_id.to_string(),
            expression: "default".to_string(),
            pose: "default".to_string(),
            slot,
            texture: character_id.to_string(),
            highlighted: true,
            name_color: Color::WHITE,
        }
    }

    pub fn object_type(&self) -> SceneObjectType {
        match self {
            Self::Background { .. } => SceneObjectType::Background,
            Self::Character { .. } => SceneObjectType::Character,
            Self::DialogueUi(_) => SceneObjectType::DialogueUi,
            Self::ChoiceUi(_) => SceneObjectType::ChoiceUi,
            Self::EffectOverlay(_) => SceneObjectType::EffectOverlay,
            Self::Sprite { .. } => SceneObjectType::Sprite,
            Self::TextLabel { .. } => SceneObjectType::TextLabel,
            Self::Panel { .. } => SceneObjectType::Panel,
            Self::Custom { .. } => SceneObjectType::Custom,
        }
    }

    /// 可着色对象的颜色
    pub fn tint(&self) -> Option<Color> {
        match self {
            Self::Background { tint, .. } | Self::Sprite { tint, .. } => Some(*tint),
            Self::Panel { color } | Self::TextLabel { color, .. } => Some(*color),
            Self::EffectOverlay(e) => Some(e.color),
            _ => None,
        }
    }

    fn set_tint(&mut self, value: Color) -> bool {
        match self {
            Self::Background { tint, .. } | Self::Sprite { tint, .. } => *tint = value,
            Self::Panel { color } | Self::TextLabel { color, .. } => *color = value,
            Self::EffectOverlay(e) => e.color = value,
            _ => return false,
        }
        true
    }

    /// 类型专属字段的属性视图
    fn typed_properties(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::Background { texture, tint } | Self::Sprite { texture, tint } => {
                vec![("texture", texture.clone()), ("tint", tint.to_hex())]
            }
            Self::Character {
                character_id,
                expression,
                pose,
                slot,
                texture,
                highlighted,
                name_color,
            } => vec![
                ("characterId", character_id.clone()),
                ("expression", expression.clone()),
                ("pose", pose.clone()),
                ("slot", slot.name().to_string()),
                ("texture", texture.clone()),
                ("highlighted", highlighted.to_string()),
                ("nameColor", name_color.to_hex()),
            ],
            Self::DialogueUi(d) => vec![
                ("speaker", d.speaker.clone()),
                ("text", d.text.clone()),
                ("cps", d.cps.to_string()),
                ("maxWidth", d.max_width.to_string()),
            ],
            Self::ChoiceUi(menu) => vec![
                (
                    "options",
                    serde_json::to_string(&menu.options).unwrap_or_else(|_| "[]".to_string()),
                ),
                ("selected", menu.selected_index().to_string()),
            ],
            Self::EffectOverlay(e) => vec![
                ("effect", e.effect.name().to_string()),
                ("intensity", e.intensity.to_string()),
                ("color", e.color.to_hex()),
                ("duration", e.duration.to_string()),
            ],
            Self::TextLabel {
                text,
                color,
                font_size,
            } => vec![
                ("text", text.clone()),
                ("color", color.to_hex()),
                ("fontSize", font_size.to_string()),
            ],
            Self::Panel { color } => vec![("color", color.to_hex())],
            Self::Custom { type_name } => vec![("customType", type_name.clone())],
        }
    }

    /// 写入类型专属字段；不是专属键时返回 `Ok(false)`
    fn apply_typed(&mut self, key: &str, value: &str) -> Result<bool, ()> {
        fn color(v: &str) -> Result<Color, ()> {
            Color::from_hex(v).ok_or(())
        }
        fn float(v: &str) -> Result<f32, ()> {
            v.parse::<f32>().map_err(|_| ())
        }
        fn boolean(v: &str) -> Result<bool, ()> {
            v.parse::<bool>().map_err(|_| ())
        }

        match self {
            Self::Background { texture, tint } | Self::Sprite { texture, tint } => match key {
                "texture" => *texture = value.to_string(),
                "tint" => *tint = color(value)?,
                _ => return Ok(false),
            },
            Self::Character {
                character_id,
                expression,
                pose,
                slot,
                texture,
                highlighted,
                name_color,
            } => match key {
                "characterId" => *character_id = value.to_string(),
                "expression" => *expression = value.to_string(),
                "pose" => *pose = value.to_string(),
                "slot" => *slot = CharacterSlot::from_name(value),
                "texture" => *texture = value.to_string(),
                "highlighted" => *highlighted = boolean(value)?,
                "nameColor" => *name_color = color(value)?,
                _ => return Ok(false),
            },
            Self::DialogueUi(d) => match key {
                "speaker" => d.speaker = value.to_string(),
                "text" => d.text = value.to_string(),
                "cps" => d.cps = float(value)?,
                "maxWidth" => d.max_width = float(value)?,
                _ => return Ok(false),
            },
            Self::ChoiceUi(menu) => match key {
                "options" => {
                    let options: Vec<ChoiceOption> =
                        serde_json::from_str(value).map_err(|_| ())?;
                    *menu = ChoiceMenu::new(options);
                }
                "selected" => {
                    let index = value.parse::<usize>().map_err(|_| ())?;
                    if !menu.set_selected(index) && index != 0 {
                        return Err(());
                    }
                }
                _ => return Ok(false),
            },
            Self::EffectOverlay(e) => match key {
                "effect" => e.effect = OverlayEffect::from_name(value).ok_or(())?,
                "intensity" => e.intensity = float(value)?.clamp(0.0, 1.0),
                "color" => e.color = color(value)?,
                "duration" => e.duration = float(value)?.max(0.0),
                _ => return Ok(false),
            },
            Self::TextLabel {
                text,
                color: c,
                font_size,
            } => match key {
                "text" => *text = value.to_string(),
                "color" => *c = color(value)?,
                "fontSize" => *font_size = float(value)?,
                _ => return Ok(false),
            },
            Self::Panel { color: c } => match key {
                "color" => *c = color(value)?,
                _ => return Ok(false),
            },
            Self::Custom { type_name } => match key {
                "customType" => *type_name = value.to_string(),
                _ => return Ok(false),
            },
        }
        Ok(true)
    }
}

/// 可动画的对象属性
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnimatedProperty {
    X,
    Y,
    Position,
    Alpha,
    ScaleX,
    ScaleY,
    Rotation,
    Tint,
}

impl AnimatedProperty {
    pub fn from_name(name: &str) -> Option<Self> {
        let property = match name {
            "x" => Self::X,
            "y" => Self::Y,
            "position" => Self::Position,
            "alpha" => Self::Alpha,
            "scaleX" => Self::ScaleX,
            "scaleY" => Self::ScaleY,
            "rotation" => Self::Rotation,
            "tint" | "color" => Self::Tint,
            _ => return None,
        };
        Some(property)
    }

    /// 对象上该属性的当前值
    pub(crate) fn current(&self, object: &SceneObject) -> Option<TweenValue> {
        let t = &object.transform;
        let value = match self {
            Self::X => TweenValue::Float(t.position.x),
            Self::Y => TweenValue::Float(t.position.y),
            Self::Position => TweenValue::Position(t.position),
            Self::Alpha => TweenValue::Float(object.alpha),
            Self::ScaleX => TweenValue::Float(t.scale.x),
            Self::ScaleY => TweenValue::Float(t.scale.y),
            Self::Rotation => TweenValue::Float(t.rotation),
            Self::Tint => TweenValue::Color(object.kind.tint()?),
        };
        Some(value)
    }
}

/// 挂在对象上的属性动画
#[derive(Debug)]
pub(crate) struct ObjectAnimation {
    pub property: AnimatedProperty,
    pub tween: Tween,
}

/// 场景对象
#[derive(Debug)]
pub struct SceneObject {
    pub(crate) id: String,
    pub(crate) kind: SceneObjectKind,
    pub(crate) transform: Transform,
    /// 0 表示使用类型默认尺寸
    pub(crate) size: Vec2,
    pub(crate) alpha: f32,
    pub(crate) visible: bool,
    pub(crate) z_order: i32,
    pub(crate) parent: Option<String>,
    pub(crate) children: Vec<SceneObject>,
    pub(crate) tags: Vec<String>,
    pub(crate) properties: BTreeMap<String, String>,
    pub(crate) animations: Vec<ObjectAnimation>,
}

impl SceneObject {
    /// 创建对象
    pub fn new(id: impl Into<String>, kind: SceneObjectKind) -> Self {
        Self {
            id: id.into(),
            kind,
            transform: Transform::default(),
            size: Vec2::ZERO,
            alpha: 1.0,
            visible: true,
            z_order: 0,
            parent: None,
            children: Vec::new(),
            tags: Vec::new(),
            properties: BTreeMap::new(),
            animations: Vec::new(),
        }
    }

    pub fn with_position(mut self, x: f32, y: f32) -> Self {
        self.transform.position = Vec2::new(x, y);
        self
    }

    pub fn with_size(mut self, width: f32, height: f32) -> Self {
        self.size = Vec2::new(width, height);
        self
    }

    pub fn with_anchor(mut self, x: f32, y: f32) -> Self {
        self.transform.anchor = Vec2::new(x, y);
        self
    }

    pub fn with_z_order(mut self, z_order: i32) -> Self {
        self.z_order = z_order;
        self
    }

    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        if self.kind.apply_typed(&key, &value) != Ok(true) {
            self.properties.insert(key, value);
        }
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &SceneObjectKind {
        &self.kind
    }

    pub fn object_type(&self) -> SceneObjectType {
        self.kind.object_type()
    }

    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    pub fn position(&self) -> Vec2 {
        self.transform.position
    }

    pub fn size(&self) -> Vec2 {
        self.size
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn z_order(&self) -> i32 {
        self.z_order
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn children(&self) -> &[SceneObject] {
        &self.children
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn active_animation_count(&self) -> usize {
        self.animations.len()
    }

    /// 读取属性（类型专属字段优先）
    pub fn property(&self, name: &str) -> Option<String> {
        self.kind
            .typed_properties()
            .into_iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
            .or_else(|| self.properties.get(name).cloned())
    }

    /// 完整属性表（自由属性与类型专属字段合并）
    pub fn properties(&self) -> BTreeMap<String, String> {
        let mut map = self.properties.clone();
        for (k, v) in self.kind.typed_properties() {
            map.insert(k.to_string(), v);
        }
        map
    }

    /// 写入属性，返回旧值
    pub(crate) fn apply_property(
        &mut self,
        name: &str,
        value: &str,
    ) -> Result<Option<String>, SceneError> {
        let old = self.property(name);
        match self.kind.apply_typed(name, value) {
            Ok(true) => {}
            Ok(false) => {
                self.properties.insert(name.to_string(), value.to_string());
            }
            Err(()) => {
                return Err(SceneError::InvalidProperty {
                    id: self.id.clone(),
                    property: name.to_string(),
                    value: value.to_string(),
                });
            }
        }
        Ok(old)
    }

    pub(crate) fn set_tint(&mut self, color: Color) -> bool {
        self.kind.set_tint(color)
    }

    pub fn dialogue(&self) -> Option<&DialogueBox> {
        match &self.kind {
            SceneObjectKind::DialogueUi(d) => Some(d),
            _ => None,
        }
    }

    pub fn choice_menu(&self) -> Option<&ChoiceMenu> {
        match &self.kind {
            SceneObjectKind::ChoiceUi(menu) => Some(menu),
            _ => None,
        }
    }

    pub fn effect(&self) -> Option<&EffectState> {
        match &self.kind {
            SceneObjectKind::EffectOverlay(e) => Some(e),
            _ => None,
        }
    }

    /// 转为扁平记录
    pub fn to_state(&self, layer: LayerKind) -> SceneObjectState {
        let t = &self.transform;
        SceneObjectState {
            id: self.id.clone(),
            object_type: self.object_type(),
            layer,
            parent: self.parent.clone(),
            x: t.position.x,
            y: t.position.y,
            scale_x: t.scale.x,
            scale_y: t.scale.y,
            rotation: t.rotation,
            anchor_x: t.anchor.x,
            anchor_y: t.anchor.y,
            width: self.size.x,
            height: self.size.y,
            alpha: self.alpha,
            visible: self.visible,
            z_order: self.z_order,
            tags: self.tags.clone(),
            properties: self.properties(),
        }
    }

    /// 由扁平记录重建（不含子对象）
    pub fn from_state(state: &SceneObjectState) -> Result<Self, SceneError> {
        let mut object = Self::new(&state.id, SceneObjectKind::default_for(state.object_type));
        object.transform = Transform {
            position: Vec2::new(state.x, state.y),
            scale: Vec2::new(state.scale_x, state.scale_y),
            rotation: state.rotation,
            anchor: Vec2::new(state.anchor_x, state.anchor_y),
        };
        object.size = Vec2::new(state.width, state.height);
        object.alpha = state.alpha;
        object.visible = state.visible;
        object.z_order = state.z_order;
        object.parent = state.parent.clone();
        object.tags = state.tags.clone();
        // 选项表必须先于选中序号解析
        let mut entries: Vec<(&String, &String)> = state.properties.iter().collect();
        entries.sort_by_key(|(k, _)| k.as_str() == "selected");
        for (key, value) in entries {
            object.apply_property(key, value).map_err(|_| {
                SceneError::StateCorruption(format!(
                    "对象 {} 的属性 {} 无法解析: {}",
                    state.id, key, value
                ))
            })?;
        }
        Ok(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_and_free_properties_merge() {
        let object = SceneObject::new(
            "bg",
            SceneObjectKind::Background {
                texture: "bg/room.png".to_string(),
                tint: Color::WHITE,
            },
        )
        .with_property("mood", "calm")
        .with_property("texture", "bg/street.png");

        assert_eq!(object.property("texture").as_deref(), Some("bg/street.png"));
        assert_eq!(object.property("mood").as_deref(), Some("calm"));
        let props = object.properties();
        assert_eq!(props.get("tint").map(String::as_str), Some("#FFFFFFFF"));
        assert!(!object.properties.contains_key("texture"));
    }

    #[test]
    fn test_invalid_typed_value_rejected() {
        let mut object = SceneObject::new(
            "c",
            SceneObjectKind::character("alice", CharacterSlot::Left),
        );
        assert!(matches!(
            object.apply_property("highlighted", "maybe"),
            Err(SceneError::InvalidProperty { .. })
        ));
        assert_eq!(
            object.apply_property("expression", "smile").unwrap().as_deref(),
            Some("default")
        );
    }

    #[test]
    fn test_state_roundtrip_keeps_choice_selection() {
        let mut menu = ChoiceMenu::from_texts(&["a", "b", "c"]);
        menu.select_next();
        menu.select_next();
        let object = SceneObject::new("choices", SceneObjectKind::ChoiceUi(menu))
            .with_tag("ui")
            .with_position(10.0, 20.0);
        let state = object.to_state(LayerKind::Ui);
        let restored = SceneObject::from_state(&state).unwrap();
        assert_eq!(restored.choice_menu().unwrap().selected_index(), 2);
        assert_eq!(restored.to_state(LayerKind::Ui), state);
    }

    #[test]
    fn test_slot_names() {
        assert_eq!(CharacterSlot::from_name("LEFT"), CharacterSlot::Left);
        assert_eq!(CharacterSlot::from_name("stage_far"), CharacterSlot::Custom);
        assert_eq!(CharacterSlot::Right.x_fraction(), Some(0.8));
    }

    #[test]
    fn test_effect_expires_once() {
        let mut effect = EffectState::new(OverlayEffect::Flash, 1.0, Color::WHITE, 0.5);
        assert!(!effect.update(0.25));
        assert!((effect.strength() - 0.5).abs() < 1e-6);
        assert!(effect.update(0.5));
        assert!(!effect.update(0.5));
        assert_eq!(effect.strength(), 0.0);
    }
}
