//! 场景图

use std::collections::HashSet;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use tracing::warn;

use super::choice::{ChoiceMenu, ChoiceOption};
use super::draw;
use super::object::{
    AnimatedProperty, CharacterSlot, DialogueBox, EffectState, ObjectAnimation, OverlayEffect,
    SceneObject, SceneObjectKind, SceneObjectType,
};
use super::observer::{PropertyChange, SceneObserver};
use super::state::{LayerState, SceneState};
use super::{Layer, LayerKind, SceneError};
use crate::animation::{EasingFunction, Tween, TweenValue};
use crate::geometry::{Color, Vec2};
use crate::render::Renderer;
use crate::text::{GlyphMetrics, MonospaceMetrics};

/// 背景对象 id
pub const BACKGROUND_ID: &str = "background";
/// 对话框对象 id
pub const DIALOGUE_ID: &str = "dialogue";
/// 选项菜单对象 id
pub const CHOICES_ID: &str = "choices";

type ChoiceHandler = Box<dyn FnMut(usize, &str)>;

/// 场景图
pub struct SceneGraph {
    scene_id: String,
    layers: [Layer; 4],
    observers: Vec<Weak<dyn SceneObserver>>,
    metrics: Arc<dyn GlyphMetrics + Send + Sync>,
    viewport: Vec2,
    choice_handler: Option<ChoiceHandler>,
}

impl std::fmt::Debug for SceneGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneGraph")
            .field("scene_id", &self.scene_id)
            .field("layers", &self.layers)
            .field("observers", &self.observers.len())
            .field("viewport", &self.viewport)
            .finish()
    }
}

impl Default for SceneGraph {
    fn default() -> Self {
        Self::new()
    }
}

fn find_in<'a>(objects: &'a [SceneObject], id: &str) -> Option<&'a SceneObject> {
    for object in objects {
        if object.id == id {
            return Some(object);
        }
        if let Some(found) = find_in(&object.children, id) {
            return Some(found);
        }
    }
    None
}

fn find_in_mut<'a>(objects: &'a mut [SceneObject], id: &str) -> Option<&'a mut SceneObject> {
    for object in objects.iter_mut() {
        if object.id == id {
            return Some(object);
        }
        if let Some(found) = find_in_mut(&mut object.children, id) {
            return Some(found);
        }
    }
    None
}

fn visit<'a>(objects: &'a [SceneObject], out: &mut Vec<&'a SceneObject>) {
    for object in objects {
        out.push(object);
        visit(&object.children, out);
    }
}

fn sort_by_z(objects: &mut [SceneObject]) {
    objects.sort_by_key(|o| o.z_order);
    for object in objects.iter_mut() {
        sort_by_z(&mut object.children);
    }
}

/// 从对象树中取出指定 id 的对象
fn take_from(objects: &mut Vec<SceneObject>, id: &str) -> Option<SceneObject> {
    if let Some(pos) = objects.iter().position(|o| o.id == id) {
        return Some(objects.remove(pos));
    }
    objects
        .iter_mut()
        .find_map(|o| take_from(&mut o.children, id))
}

fn collect_ids(object: &SceneObject, out: &mut Vec<String>) {
    out.push(object.id.clone());
    for child in &object.children {
        collect_ids(child, out);
    }
}

type AnimationUpdate = (String, AnimatedProperty, TweenValue);

fn tick_object(
    object: &mut SceneObject,
    dt: f32,
    updates: &mut Vec<AnimationUpdate>,
    expired: &mut Vec<String>,
) {
    match &mut object.kind {
        SceneObjectKind::DialogueUi(dialogue) => dialogue.update(dt),
        SceneObjectKind::EffectOverlay(effect) => {
            if effect.update(dt) && object.visible {
                expired.push(object.id.clone());
            }
        }
        _ => {}
    }

    let id = &object.id;
    object.animations.retain_mut(|animation| {
        animation.tween.update(dt);
        if let Some(value) = animation.tween.value() {
            updates.push((id.clone(), animation.property, value));
        }
        !animation.tween.is_complete()
    });

    for child in object.children.iter_mut() {
        tick_object(child, dt, updates, expired);
    }
}

impl SceneGraph {
    /// 创建空场景（默认画布 1280x720）
    pub fn new() -> Self {
        Self {
            scene_id: String::new(),
            layers: LayerKind::ALL.map(Layer::new),
            observers: Vec::new(),
            metrics: Arc::new(MonospaceMetrics::default()),
            viewport: Vec2::new(1280.0, 720.0),
            choice_handler: None,
        }
    }

    pub fn with_viewport(mut self, width: f32, height: f32) -> Self {
        self.viewport = Vec2::new(width, height);
        self
    }

    pub fn viewport(&self) -> Vec2 {
        self.viewport
    }

    /// 对话排版使用的字形度量
    pub fn set_glyph_metrics(&mut self, metrics: Arc<dyn GlyphMetrics + Send + Sync>) {
        self.metrics = metrics;
    }

    // ===== 场景生命周期 =====

    pub fn scene_id(&self) -> &str {
        &self.scene_id
    }

    pub fn set_scene_id(&mut self, scene_id: impl Into<String>) {
        self.scene_id = scene_id.into();
    }

    /// 移除全部对象（逐个通知）
    pub fn clear(&mut self) {
        for kind in LayerKind::ALL {
            let objects = std::mem::take(&mut self.layers[kind.index()].objects);
            for object in &objects {
                let mut ids = Vec::new();
                collect_ids(object, &mut ids);
                for id in ids {
                    self.notify(|o| o.on_object_removed(&id, kind));
                }
            }
        }
    }

    pub fn layer(&self, kind: LayerKind) -> &Layer {
        &self.layers[kind.index()]
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn set_layer_visible(&mut self, kind: LayerKind, visible: bool) {
        self.layers[kind.index()].visible = visible;
    }

    pub fn set_layer_alpha(&mut self, kind: LayerKind, alpha: f32) {
        self.layers[kind.index()].alpha = alpha.clamp(0.0, 1.0);
    }

    // ===== 观察者 =====

    /// 订阅场景事件（只保存弱引用）
    pub fn add_observer<O: SceneObserver + 'static>(&mut self, observer: &Rc<O>) {
        let weak: Weak<dyn SceneObserver> = Rc::downgrade(observer) as Weak<dyn SceneObserver>;
        self.observers.push(weak);
    }

    /// 存活的观察者数量
    pub fn observer_count(&mut self) -> usize {
        self.observers.retain(|w| w.strong_count() > 0);
        self.observers.len()
    }

    fn notify(&mut self, f: impl Fn(&dyn SceneObserver)) {
        self.observers.retain(|weak| match weak.upgrade() {
            Some(observer) => {
                f(observer.as_ref());
                true
            }
            None => false,
        });
    }

    fn notify_change(&mut self, id: &str, property: &str, old: Option<String>, new: String) {
        let change = PropertyChange {
            object_id: id.to_string(),
            property: property.to_string(),
            old_value: old,
            new_value: new,
        };
        self.notify(|o| o.on_property_changed(&change));
    }

    // ===== 对象管理 =====

    fn ensure_unique(&self, object: &SceneObject) -> Result<(), SceneError> {
        let mut ids = Vec::new();
        collect_ids(object, &mut ids);
        let mut seen = HashSet::new();
        for id in ids {
            if !seen.insert(id.clone()) || self.contains(&id) {
                return Err(SceneError::DuplicateId { id });
            }
        }
        Ok(())
    }

    /// 加入层；对象与其子对象的 id 必须在整个场景中唯一
    pub fn add_to_layer(
        &mut self,
        kind: LayerKind,
        mut object: SceneObject,
    ) -> Result<(), SceneError> {
        self.ensure_unique(&object)?;
        object.parent = None;
        let mut ids = Vec::new();
        collect_ids(&object, &mut ids);
        let layer = &mut self.layers[kind.index()];
        layer.objects.push(object);
        sort_by_z(&mut layer.objects);
        for id in ids {
            self.notify(|o| o.on_object_added(&id, kind));
        }
        Ok(())
    }

    /// 作为子对象加入
    pub fn add_child(
        &mut self,
        parent_id: &str,
        mut object: SceneObject,
    ) -> Result<(), SceneError> {
        self.ensure_unique(&object)?;
        let kind = self.layer_of(parent_id).ok_or_else(|| SceneError::NotFound {
            id: parent_id.to_string(),
        })?;
        object.parent = Some(parent_id.to_string());
        let mut ids = Vec::new();
        collect_ids(&object, &mut ids);
        let parent = self.object_mut(parent_id)?;
        parent.children.push(object);
        sort_by_z(&mut parent.children);
        for id in ids {
            self.notify(|o| o.on_object_added(&id, kind));
        }
        Ok(())
    }

    /// 从指定层移除对象（连同子对象）
    pub fn remove_from_layer(
        &mut self,
        kind: LayerKind,
        id: &str,
    ) -> Result<SceneObject, SceneError> {
        let removed = take_from(&mut self.layers[kind.index()].objects, id).ok_or_else(|| {
            SceneError::NotFound { id: id.to_string() }
        })?;
        let mut ids = Vec::new();
        collect_ids(&removed, &mut ids);
        for removed_id in ids {
            self.notify(|o| o.on_object_removed(&removed_id, kind));
        }
        Ok(removed)
    }

    /// 从任意层移除对象
    pub fn remove_object(&mut self, id: &str) -> Result<SceneObject, SceneError> {
        let kind = self
            .layer_of(id)
            .ok_or_else(|| SceneError::NotFound { id: id.to_string() })?;
        self.remove_from_layer(kind, id)
    }

    /// 将顶层对象移动到另一层
    pub fn move_to_layer(&mut self, id: &str, kind: LayerKind) -> Result<(), SceneError> {
        let from = self
            .layer_of(id)
            .ok_or_else(|| SceneError::NotFound { id: id.to_string() })?;
        if from == kind {
            return Ok(());
        }
        let from_layer = &mut self.layers[from.index()].objects;
        let pos = from_layer
            .iter()
            .position(|o| o.id == id)
            .ok_or_else(|| SceneError::InvalidProperty {
                id: id.to_string(),
                property: "layer".to_string(),
                value: kind.name().to_string(),
            })?;
        let object = from_layer.remove(pos);
        let layer = &mut self.layers[kind.index()];
        layer.objects.push(object);
        sort_by_z(&mut layer.objects);
        self.notify(|o| o.on_layer_changed(id, kind));
        Ok(())
    }

    /// 查找对象；返回的引用在下一次修改场景前有效
    pub fn find_object(&self, id: &str) -> Option<&SceneObject> {
        self.layers.iter().find_map(|l| find_in(&l.objects, id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.find_object(id).is_some()
    }

    fn object_mut(&mut self, id: &str) -> Result<&mut SceneObject, SceneError> {
        self.layers
            .iter_mut()
            .find_map(|l| find_in_mut(&mut l.objects, id))
            .ok_or_else(|| SceneError::NotFound { id: id.to_string() })
    }

    /// 对象所在层
    pub fn layer_of(&self, id: &str) -> Option<LayerKind> {
        self.layers
            .iter()
            .find(|l| find_in(&l.objects, id).is_some())
            .map(|l| l.kind)
    }

    /// 全部对象（层顺序、深度优先）
    pub fn all_objects(&self) -> Vec<&SceneObject> {
        let mut out = Vec::new();
        for layer in &self.layers {
            visit(&layer.objects, &mut out);
        }
        out
    }

    pub fn find_objects_by_tag(&self, tag: &str) -> Vec<&SceneObject> {
        self.all_objects()
            .into_iter()
            .filter(|o| o.has_tag(tag))
            .collect()
    }

    pub fn find_objects_by_type(&self, object_type: SceneObjectType) -> Vec<&SceneObject> {
        self.all_objects()
            .into_iter()
            .filter(|o| o.object_type() == object_type)
            .collect()
    }

    // ===== 属性修改 =====

    /// 写入字符串属性
    pub fn set_property(&mut self, id: &str, name: &str, value: &str) -> Result<(), SceneError> {
        let old = self.object_mut(id)?.apply_property(name, value)?;
        self.notify_change(id, name, old, value.to_string());
        Ok(())
    }

    pub fn property(&self, id: &str, name: &str) -> Option<String> {
        self.find_object(id)?.property(name)
    }

    pub fn set_position(&mut self, id: &str, position: Vec2) -> Result<(), SceneError> {
        let object = self.object_mut(id)?;
        let old = object.transform.position;
        object.transform.position = position;
        self.notify_change(
            id,
            "position",
            Some(format!("{},{}", old.x, old.y)),
            format!("{},{}", position.x, position.y),
        );
        Ok(())
    }

    pub fn set_alpha(&mut self, id: &str, alpha: f32) -> Result<(), SceneError> {
        let object = self.object_mut(id)?;
        let old = object.alpha;
        object.alpha = alpha;
        self.notify_change(id, "alpha", Some(old.to_string()), alpha.to_string());
        Ok(())
    }

    pub fn set_visible(&mut self, id: &str, visible: bool) -> Result<(), SceneError> {
        let object = self.object_mut(id)?;
        let old = object.visible;
        object.visible = visible;
        self.notify_change(id, "visible", Some(old.to_string()), visible.to_string());
        Ok(())
    }

    /// 修改 zOrder 并立即重新排序
    pub fn set_z_order(&mut self, id: &str, z_order: i32) -> Result<(), SceneError> {
        let object = self.object_mut(id)?;
        let old = object.z_order;
        object.z_order = z_order;
        for layer in self.layers.iter_mut() {
            sort_by_z(&mut layer.objects);
        }
        self.notify_change(id, "zOrder", Some(old.to_string()), z_order.to_string());
        Ok(())
    }

    pub fn set_scale(&mut self, id: &str, scale: Vec2) -> Result<(), SceneError> {
        let object = self.object_mut(id)?;
        let old = object.transform.scale;
        object.transform.scale = scale;
        self.notify_change(
            id,
            "scale",
            Some(format!("{},{}", old.x, old.y)),
            format!("{},{}", scale.x, scale.y),
        );
        Ok(())
    }

    pub fn set_rotation(&mut self, id: &str, degrees: f32) -> Result<(), SceneError> {
        let object = self.object_mut(id)?;
        let old = object.transform.rotation;
        object.transform.rotation = degrees;
        self.notify_change(id, "rotation", Some(old.to_string()), degrees.to_string());
        Ok(())
    }

    pub fn set_tint(&mut self, id: &str, color: Color) -> Result<(), SceneError> {
        let object = self.object_mut(id)?;
        let old = object.kind.tint();
        if !object.set_tint(color) {
            return Err(SceneError::InvalidProperty {
                id: id.to_string(),
                property: "tint".to_string(),
                value: color.to_hex(),
            });
        }
        self.notify_change(id, "tint", old.map(|c| c.to_hex()), color.to_hex());
        Ok(())
    }

    // ===== 动画 =====

    /// 为对象属性附加补间；同一属性上已有的补间被替换
    pub fn animate_property(
        &mut self,
        id: &str,
        property: &str,
        to: TweenValue,
        duration: f32,
        easing: EasingFunction,
    ) -> Result<(), SceneError> {
        let not_animatable = || SceneError::NotAnimatable {
            id: id.to_string(),
            property: property.to_string(),
        };
        let target = AnimatedProperty::from_name(property).ok_or_else(not_animatable)?;
        let object = self.object_mut(id)?;
        let from = target.current(object).ok_or_else(not_animatable)?;
        if std::mem::discriminant(&from) != std::mem::discriminant(&to) {
            return Err(SceneError::InvalidProperty {
                id: id.to_string(),
                property: property.to_string(),
                value: format!("{:?}", to),
            });
        }
        object.animations.retain(|a| a.property != target);
        object.animations.push(ObjectAnimation {
            property: target,
            tween: Tween::new(from, to, duration, easing),
        });
        Ok(())
    }

    /// 是否有进行中的对象动画
    pub fn has_active_animations(&self) -> bool {
        self.all_objects()
            .iter()
            .any(|o| o.active_animation_count() > 0)
    }

    /// 立即完成全部对象动画
    pub fn finish_animations(&mut self) {
        let mut updates = Vec::new();
        for layer in self.layers.iter_mut() {
            let mut stack: Vec<&mut SceneObject> = layer.objects.iter_mut().collect();
            while let Some(object) = stack.pop() {
                for mut animation in object.animations.drain(..) {
                    animation.tween.finish();
                    if let Some(value) = animation.tween.value() {
                        updates.push((object.id.clone(), animation.property, value));
                    }
                }
                stack.extend(object.children.iter_mut());
            }
        }
        for (id, property, value) in updates {
            self.apply_animated(&id, property, value);
        }
    }

    fn apply_animated(&mut self, id: &str, property: AnimatedProperty, value: TweenValue) {
        let Some(object) = self.find_object(id) else {
            return;
        };
        let position = object.transform.position;
        let scale = object.transform.scale;
        let result = match (property, value) {
            (AnimatedProperty::X, TweenValue::Float(x)) => {
                self.set_position(id, Vec2::new(x, position.y))
            }
            (AnimatedProperty::Y, TweenValue::Float(y)) => {
                self.set_position(id, Vec2::new(position.x, y))
            }
            (AnimatedProperty::Position, TweenValue::Position(p)) => self.set_position(id, p),
            (AnimatedProperty::Alpha, TweenValue::Float(a)) => self.set_alpha(id, a),
            (AnimatedProperty::ScaleX, TweenValue::Float(s)) => {
                self.set_scale(id, Vec2::new(s, scale.y))
            }
            (AnimatedProperty::ScaleY, TweenValue::Float(s)) => {
                self.set_scale(id, Vec2::new(scale.x, s))
            }
            (AnimatedProperty::Rotation, TweenValue::Float(r)) => self.set_rotation(id, r),
            (AnimatedProperty::Tint, TweenValue::Color(c)) => self.set_tint(id, c),
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!(object = id, error = %e, "对象动画写回失败");
        }
    }

    // ===== 叙事操作 =====

    /// 显示背景（不存在时创建）
    pub fn show_background(&mut self, texture: &str) {
        if !self.contains(BACKGROUND_ID) {
            let kind = SceneObjectKind::default_for(SceneObjectType::Background);
            let object = SceneObject::new(BACKGROUND_ID, kind);
            if let Err(e) = self.add_to_layer(LayerKind::Background, object) {
                warn!(error = %e, "创建背景对象失败");
                return;
            }
        }
        self.set_property_logged(BACKGROUND_ID, "texture", texture);
        self.set_visible_logged(BACKGROUND_ID, true);
    }

    /// 显示角色；已存在时更新角色与站位
    pub fn show_character(&mut self, id: &str, character_id: &str, slot: &str) {
        let slot = CharacterSlot::from_name(slot);
        if self.contains(id) {
            self.set_property_logged(id, "characterId", character_id);
            self.set_property_logged(id, "texture", character_id);
            self.set_property_logged(id, "slot", slot.name());
        } else {
            let object = SceneObject::new(id, SceneObjectKind::character(character_id, slot))
                .with_anchor(0.5, 1.0)
                .with_position(self.viewport.x * 0.5, self.viewport.y);
            if let Err(e) = self.add_to_layer(LayerKind::Characters, object) {
                warn!(object = id, error = %e, "创建角色对象失败");
                return;
            }
        }
        if let Some(fraction) = slot.x_fraction() {
            let position = Vec2::new(self.viewport.x * fraction, self.viewport.y);
            if let Err(e) = self.set_position(id, position) {
                warn!(object = id, error = %e, "设置角色站位失败");
            }
        }
        self.set_visible_logged(id, true);
    }

    /// 移除角色
    pub fn hide_character(&mut self, id: &str) -> Result<(), SceneError> {
        match self.layer_of(id) {
            Some(LayerKind::Characters) => {
                self.remove_from_layer(LayerKind::Characters, id).map(|_| ())
            }
            _ => Err(SceneError::NotFound { id: id.to_string() }),
        }
    }

    /// 显示对话并开始打字机
    pub fn show_dialogue(&mut self, speaker: &str, text: &str) {
        if !self.contains(DIALOGUE_ID) {
            let (w, h) = (self.viewport.x, self.viewport.y);
            let dialogue = DialogueBox::default().with_max_width(w - 48.0);
            let object = SceneObject::new(DIALOGUE_ID, SceneObjectKind::DialogueUi(dialogue))
                .with_position(0.0, h * 0.72)
                .with_size(w, h * 0.28)
                .with_z_order(10);
            if let Err(e) = self.add_to_layer(LayerKind::Ui, object) {
                warn!(error = %e, "创建对话框失败");
                return;
            }
        }
        self.set_property_logged(DIALOGUE_ID, "speaker", speaker);
        self.set_property_logged(DIALOGUE_ID, "text", text);
        self.restart_typewriter();
        self.set_visible_logged(DIALOGUE_ID, true);
    }

    fn restart_typewriter(&mut self) {
        let metrics = self.metrics.clone();
        if let Ok(object) = self.object_mut(DIALOGUE_ID) {
            if let SceneObjectKind::DialogueUi(dialogue) = &mut object.kind {
                dialogue.start_typewriter(metrics.as_ref());
            }
        }
    }

    pub fn hide_dialogue(&mut self) {
        if self.contains(DIALOGUE_ID) {
            self.set_visible_logged(DIALOGUE_ID, false);
        }
    }

    pub fn dialogue(&self) -> Option<&DialogueBox> {
        self.find_object(DIALOGUE_ID)?.dialogue()
    }

    fn dialogue_mut(&mut self) -> Option<&mut DialogueBox> {
        match &mut self.object_mut(DIALOGUE_ID).ok()?.kind {
            SceneObjectKind::DialogueUi(dialogue) => Some(dialogue),
            _ => None,
        }
    }

    /// 跳过打字机；没有进行中的打字机时返回 false
    pub fn skip_typewriter(&mut self) -> bool {
        self.dialogue_mut().is_some_and(|d| d.skip_typewriter())
    }

    /// 在 `{p}` 处继续打字机
    pub fn continue_typewriter(&mut self) -> bool {
        self.dialogue_mut().is_some_and(|d| d.continue_typewriter())
    }

    pub fn is_typewriter_complete(&self) -> bool {
        self.dialogue().is_none_or(|d| d.is_typewriter_complete())
    }

    /// 显示选项菜单
    pub fn show_choices<S: AsRef<str>>(&mut self, options: &[S]) {
        self.show_choice_options(ChoiceMenu::from_texts(options).options);
    }

    /// 显示带完整属性的选项
    pub fn show_choice_options(&mut self, options: Vec<ChoiceOption>) {
        if self.contains(CHOICES_ID) {
            let json = serde_json::to_string(&options).unwrap_or_else(|_| "[]".to_string());
            self.set_property_logged(CHOICES_ID, "options", &json);
        } else {
            let menu = SceneObjectKind::ChoiceUi(ChoiceMenu::new(options));
            let object = SceneObject::new(CHOICES_ID, menu).with_z_order(20);
            if let Err(e) = self.add_to_layer(LayerKind::Ui, object) {
                warn!(error = %e, "创建选项菜单失败");
                return;
            }
        }
        self.set_visible_logged(CHOICES_ID, true);
    }

    pub fn hide_choices(&mut self) {
        if self.contains(CHOICES_ID) {
            self.set_visible_logged(CHOICES_ID, false);
        }
    }

    pub fn choice_menu(&self) -> Option<&ChoiceMenu> {
        self.find_object(CHOICES_ID)
            .filter(|o| o.is_visible())?
            .choice_menu()
    }

    fn navigate_choice(&mut self, forward: bool) -> bool {
        let Ok(object) = self.object_mut(CHOICES_ID) else {
            return false;
        };
        let SceneObjectKind::ChoiceUi(menu) = &mut object.kind else {
            return false;
        };
        let old = menu.selected_index();
        let moved = if forward {
            menu.select_next()
        } else {
            menu.select_previous()
        };
        let new = menu.selected_index();
        if moved {
            self.notify_change(CHOICES_ID, "selected", Some(old.to_string()), new.to_string());
        }
        moved
    }

    pub fn select_next_choice(&mut self) -> bool {
        self.navigate_choice(true)
    }

    pub fn select_previous_choice(&mut self) -> bool {
        self.navigate_choice(false)
    }

    /// 设置选项确认回调，参数为 `(序号, 选项 id)`
    pub fn set_choice_handler<F>(&mut self, handler: F)
    where
        F: FnMut(usize, &str) + 'static,
    {
        self.choice_handler = Some(Box::new(handler));
    }

    /// 确认当前选项；成功时触发回调
    pub fn confirm_choice(&mut self) -> bool {
        let Some((index, option_id)) = self.choice_menu().and_then(|m| m.confirm()) else {
            return false;
        };
        if let Some(handler) = self.choice_handler.as_mut() {
            handler(index, &option_id);
        }
        true
    }

    /// 显示全屏效果
    pub fn show_effect(
        &mut self,
        id: &str,
        effect: OverlayEffect,
        intensity: f32,
        color: Color,
        duration: f32,
    ) {
        if self.contains(id) {
            if let Err(e) = self.remove_object(id) {
                warn!(object = id, error = %e, "替换效果失败");
            }
        }
        let state = EffectState::new(effect, intensity, color, duration);
        let object = SceneObject::new(id, SceneObjectKind::EffectOverlay(state));
        if let Err(e) = self.add_to_layer(LayerKind::Effects, object) {
            warn!(object = id, error = %e, "创建效果失败");
        }
    }

    pub fn clear_effect(&mut self, id: &str) -> Result<(), SceneError> {
        self.remove_from_layer(LayerKind::Effects, id).map(|_| ())
    }

    fn set_property_logged(&mut self, id: &str, name: &str, value: &str) {
        if let Err(e) = self.set_property(id, name, value) {
            warn!(object = id, property = name, error = %e, "设置属性失败");
        }
    }

    fn set_visible_logged(&mut self, id: &str, visible: bool) {
        if let Err(e) = self.set_visible(id, visible) {
            warn!(object = id, error = %e, "设置可见性失败");
        }
    }

    // ===== 帧更新与渲染 =====

    /// 推进动画、打字机与效果计时
    pub fn update(&mut self, dt: f32) {
        let mut updates = Vec::new();
        let mut expired = Vec::new();
        for layer in self.layers.iter_mut() {
            for object in layer.objects.iter_mut() {
                tick_object(object, dt, &mut updates, &mut expired);
            }
        }
        for (id, property, value) in updates {
            self.apply_animated(&id, property, value);
        }
        for id in expired {
            self.set_visible_logged(&id, false);
        }
    }

    /// 按层顺序绘制
    pub fn render(&self, renderer: &mut dyn Renderer) {
        let shake = self.layers[LayerKind::Effects.index()]
            .objects
            .iter()
            .filter(|o| o.visible)
            .filter_map(|o| o.effect())
            .fold(Vec2::ZERO, |acc, e| {
                let s = e.shake_offset();
                Vec2::new(acc.x + s.x, acc.y + s.y)
            });

        for layer in &self.layers {
            if !layer.visible {
                continue;
            }
            let offset = match layer.kind {
                LayerKind::Background | LayerKind::Characters => shake,
                _ => Vec2::ZERO,
            };
            for object in &layer.objects {
                draw::draw_object(object, renderer, offset, layer.alpha, self.viewport);
            }
        }
    }

    // ===== 存档 =====

    /// 导出场景快照
    pub fn save_state(&self) -> SceneState {
        let mut objects = Vec::new();
        for layer in &self.layers {
            let mut flat = Vec::new();
            visit(&layer.objects, &mut flat);
            objects.extend(flat.into_iter().map(|o| o.to_state(layer.kind)));
        }

        let active_background = self.layers[LayerKind::Background.index()]
            .objects
            .iter()
            .filter(|o| o.visible)
            .find_map(|o| match &o.kind {
                SceneObjectKind::Background { texture, .. } if !texture.is_empty() => {
                    Some(texture.clone())
                }
                _ => None,
            });

        let visible_characters = self
            .find_objects_by_type(SceneObjectType::Character)
            .into_iter()
            .filter(|o| o.visible)
            .map(|o| o.id.clone())
            .collect();

        SceneState {
            scene_id: self.scene_id.clone(),
            objects,
            active_background,
            visible_characters,
            layers: self
                .layers
                .iter()
                .map(|l| LayerState {
                    kind: l.kind,
                    visible: l.visible,
                    alpha: l.alpha,
                })
                .collect(),
        }
    }

    /// 整体替换为快照内容
    ///
    /// 全部对象先构造并校验，失败时场景保持不变。
    pub fn load_state(&mut self, state: &SceneState) -> Result<(), SceneError> {
        let mut layers = LayerKind::ALL.map(Layer::new);
        let mut seen: HashSet<&str> = HashSet::new();

        for record in &state.objects {
            if !seen.insert(record.id.as_str()) {
                return Err(SceneError::StateCorruption(format!("对象 id 重复: {}", record.id)));
            }
            let mut object = SceneObject::from_state(record)?;
            let layer = &mut layers[record.layer.index()];
            match &record.parent {
                None => layer.objects.push(object),
                Some(parent_id) => {
                    let parent = find_in_mut(&mut layer.objects, parent_id).ok_or_else(|| {
                        SceneError::StateCorruption(format!(
                            "对象 {} 的父对象 {} 不存在于同一层",
                            record.id, parent_id
                        ))
                    })?;
                    object.parent = Some(parent_id.clone());
                    parent.children.push(object);
                }
            }
        }

        for layer_state in &state.layers {
            let layer = &mut layers[layer_state.kind.index()];
            layer.visible = layer_state.visible;
            layer.alpha = layer_state.alpha;
        }
        for layer in layers.iter_mut() {
            sort_by_z(&mut layer.objects);
        }

        self.layers = layers;
        self.scene_id = state.scene_id.clone();

        let metrics = self.metrics.clone();
        if let Ok(object) = self.object_mut(DIALOGUE_ID) {
            if let SceneObjectKind::DialogueUi(dialogue) = &mut object.kind {
                dialogue.start_typewriter(metrics.as_ref());
                dialogue.skip_typewriter();
            }
        }

        let scene_id = self.scene_id.clone();
        self.notify(|o| o.on_scene_loaded(&scene_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{DrawCommand, RecordingRenderer};
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder {
        events: RefCell<Vec<String>>,
    }

    impl SceneObserver for Recorder {
        fn on_object_added(&self, id: &str, layer: LayerKind) {
            self.events.borrow_mut().push(format!("add {} {}", id, layer.name()));
        }
        fn on_object_removed(&self, id: &str, _layer: LayerKind) {
            self.events.borrow_mut().push(format!("remove {}", id));
        }
        fn on_property_changed(&self, change: &PropertyChange) {
            let PropertyChange { object_id, property, new_value, .. } = change;
            let line = format!("prop {object_id}.{property}={new_value}");
            self.events.borrow_mut().push(line);
        }
        fn on_layer_changed(&self, id: &str, layer: LayerKind) {
            self.events.borrow_mut().push(format!("layer {} {}", id, layer.name()));
        }
        fn on_scene_loaded(&self, scene_id: &str) {
            self.events.borrow_mut().push(format!("loaded {}", scene_id));
        }
    }

    fn sprite(id: &str, z: i32) -> SceneObject {
        SceneObject::new(
            id,
            SceneObjectKind::Sprite {
                texture: format!("{}.png", id),
                tint: Color::WHITE,
            },
        )
        .with_z_order(z)
        .with_size(10.0, 10.0)
    }

    fn populated() -> SceneGraph {
        let mut scene = SceneGraph::new();
        scene.set_scene_id("intro");
        scene.show_background("bg/room.png");
        scene.show_character("alice", "alice", "left");
        scene.show_character("bob", "bob", "right");
        scene.show_dialogue("Alice", "Hello {b}there{/b}!");
        scene
            .add_to_layer(LayerKind::Effects, sprite("sparkle", 2).with_tag("fx"))
            .unwrap();
        scene.add_child("sparkle", sprite("sparkle_child", 0)).unwrap();
        scene.set_property("alice", "expression", "smile").unwrap();
        scene
    }

    #[test]
    fn test_z_order_sorted_on_insert_and_change() {
        let mut scene = SceneGraph::new();
        scene.add_to_layer(LayerKind::Characters, sprite("a", 5)).unwrap();
        scene.add_to_layer(LayerKind::Characters, sprite("b", 1)).unwrap();
        scene.add_to_layer(LayerKind::Characters, sprite("c", 3)).unwrap();
        let characters = |scene: &SceneGraph| -> Vec<String> {
            let layer = scene.layer(LayerKind::Characters);
            layer.objects().iter().map(|o| o.id().to_string()).collect()
        };
        assert_eq!(characters(&scene), ["b", "c", "a"]);

        scene.set_z_order("b", 9).unwrap();
        assert_eq!(characters(&scene), ["c", "a", "b"]);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut scene = SceneGraph::new();
        scene.add_to_layer(LayerKind::Ui, sprite("a", 0)).unwrap();
        let err = scene.add_to_layer(LayerKind::Effects, sprite("a", 0)).unwrap_err();
        assert_eq!(err, SceneError::DuplicateId { id: "a".to_string() });
        assert!(scene.add_child("missing", sprite("x", 0)).is_err());
    }

    #[test]
    fn test_observers_notified_synchronously_in_order() {
        let recorder = Rc::new(Recorder::default());
        let mut scene = SceneGraph::new();
        scene.add_observer(&recorder);

        scene.add_to_layer(LayerKind::Ui, sprite("a", 0)).unwrap();
        scene.set_alpha("a", 0.5).unwrap();
        scene.move_to_layer("a", LayerKind::Effects).unwrap();
        scene.remove_object("a").unwrap();

        assert_eq!(
            *recorder.events.borrow(),
            vec![
                "add a UI".to_string(),
                "prop a.alpha=0.5".to_string(),
                "layer a Effects".to_string(),
                "remove a".to_string(),
            ]
        );
    }

    #[test]
    fn test_dead_observers_pruned() {
        let mut scene = SceneGraph::new();
        let recorder = Rc::new(Recorder::default());
        scene.add_observer(&recorder);
        assert_eq!(scene.observer_count(), 1);
        drop(recorder);
        scene.add_to_layer(LayerKind::Ui, sprite("a", 0)).unwrap();
        assert_eq!(scene.observer_count(), 0);
    }

    #[test]
    fn test_find_by_tag_and_type() {
        let scene = populated();
        let fx: Vec<_> = scene.find_objects_by_tag("fx").iter().map(|o| o.id()).collect();
        assert_eq!(fx, ["sparkle"]);
        assert_eq!(scene.find_objects_by_type(SceneObjectType::Character).len(), 2);
        assert_eq!(
            scene.find_object("sparkle_child").and_then(|o| o.parent()),
            Some("sparkle")
        );
    }

    #[test]
    fn test_show_character_uses_slot_position() {
        let scene = populated();
        let alice = scene.find_object("alice").unwrap();
        assert_eq!(alice.position(), Vec2::new(1280.0 * 0.2, 720.0));
        assert_eq!(alice.property("expression").as_deref(), Some("smile"));
    }

    #[test]
    fn test_hide_character() {
        let mut scene = populated();
        scene.hide_character("bob").unwrap();
        assert!(!scene.contains("bob"));
        assert!(matches!(
            scene.hide_character("bob"),
            Err(SceneError::NotFound { .. })
        ));
        assert!(scene.hide_character(BACKGROUND_ID).is_err());
    }

    #[test]
    fn test_save_load_roundtrip_is_stable() {
        let scene = populated();
        let state = scene.save_state();
        assert_eq!(state.active_background.as_deref(), Some("bg/room.png"));
        assert_eq!(state.visible_characters, ["alice", "bob"]);

        let recorder = Rc::new(Recorder::default());
        let mut other = SceneGraph::new();
        other.add_to_layer(LayerKind::Ui, sprite("stale", 0)).unwrap();
        other.add_observer(&recorder);
        other.load_state(&state).unwrap();

        assert_eq!(other.save_state(), state);
        assert!(!other.contains("stale"));
        assert_eq!(*recorder.events.borrow(), vec!["loaded intro".to_string()]);
        assert!(other.is_typewriter_complete());
    }

    #[test]
    fn test_load_state_rejects_corruption_without_mutating() {
        let scene = populated();
        let mut state = scene.save_state();
        state.objects.push(state.objects[0].clone());

        let mut other = populated();
        other.set_scene_id("before");
        let err = other.load_state(&state).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::StateCorruption);
        assert_eq!(other.scene_id(), "before");

        let mut state = scene.save_state();
        let child = state.objects.iter_mut().find(|o| o.id == "sparkle_child").unwrap();
        child.parent = Some("nobody".to_string());
        assert!(matches!(
            other.load_state(&state),
            Err(SceneError::StateCorruption(_))
        ));
    }

    #[test]
    fn test_animate_property_goes_through_setters() {
        let recorder = Rc::new(Recorder::default());
        let mut scene = SceneGraph::new();
        scene.add_to_layer(LayerKind::Ui, sprite("a", 0)).unwrap();
        scene.add_observer(&recorder);
        scene
            .animate_property("a", "alpha", TweenValue::Float(0.0), 1.0, EasingFunction::Linear)
            .unwrap();
        scene.update(0.5);
        assert_eq!(scene.find_object("a").unwrap().alpha(), 0.5);
        scene.update(0.5);
        assert_eq!(scene.find_object("a").unwrap().alpha(), 0.0);
        assert!(!scene.has_active_animations());
        assert_eq!(recorder.events.borrow().len(), 2);

        let linear = EasingFunction::Linear;
        assert!(matches!(
            scene.animate_property("a", "width", TweenValue::Float(1.0), 1.0, linear),
            Err(SceneError::NotAnimatable { .. })
        ));
        let black = TweenValue::Color(Color::BLACK);
        assert!(scene.animate_property("a", "x", black, 1.0, linear).is_err());
    }

    #[test]
    fn test_choice_confirm_fires_handler() {
        let picked = Rc::new(RefCell::new(None));
        let p = picked.clone();
        let mut scene = SceneGraph::new();
        scene.set_choice_handler(move |index, id| *p.borrow_mut() = Some((index, id.to_string())));
        scene.show_choices(&["Go left", "Go right"]);
        assert!(scene.select_next_choice());
        assert!(scene.confirm_choice());
        assert_eq!(*picked.borrow(), Some((1, "choice_1".to_string())));

        scene.hide_choices();
        assert!(!scene.confirm_choice());
    }

    #[test]
    fn test_typewriter_skip() {
        let mut scene = SceneGraph::new();
        scene.show_dialogue("", "a fairly long line of text");
        assert!(!scene.is_typewriter_complete());
        scene.update(0.1);
        assert!(scene.skip_typewriter());
        assert!(scene.is_typewriter_complete());
        let tw = scene.dialogue().unwrap().typewriter().unwrap();
        assert_eq!(tw.visible_chars(), tw.total_chars());
    }

    #[test]
    fn test_render_walks_layers_in_order() {
        let mut scene = populated();
        scene.hide_dialogue();
        let mut renderer = RecordingRenderer::new(1280.0, 720.0);
        scene.render(&mut renderer);
        assert_eq!(
            renderer.textures(),
            ["bg/room.png", "alice", "bob", "sparkle.png", "sparkle_child.png"]
        );
        assert!(matches!(renderer.commands[0], DrawCommand::Texture { .. }));
    }

    #[test]
    fn test_flash_effect_expires() {
        let mut scene = SceneGraph::new();
        scene.show_effect("flash", OverlayEffect::Flash, 1.0, Color::WHITE, 0.2);
        scene.update(0.1);
        assert!(scene.find_object("flash").unwrap().is_visible());
        scene.update(0.2);
        assert!(!scene.find_object("flash").unwrap().is_visible());
    }
}
