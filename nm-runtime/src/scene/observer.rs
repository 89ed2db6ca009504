//! 场景观察者

use super::LayerKind;

/// 属性变更通知
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChange {
    pub object_id: String,
    pub property: String,
    pub old_value: Option<String>,
    pub new_value: String,
}

/// 场景事件订阅者
///
/// 回调在发生变更的线程上同步执行，调用返回前送达。
/// 图只持有观察者的弱引用，已释放的观察者在下一次通知时被移除。
pub trait SceneObserver {
    fn on_object_added(&self, _object_id: &str, _layer: LayerKind) {}

    fn on_object_removed(&self, _object_id: &str, _layer: LayerKind) {}

    fn on_property_changed(&self, _change: &PropertyChange) {}

    /// 对象被移动到另一层
    fn on_layer_changed(&self, _object_id: &str, _layer: LayerKind) {}

    /// `load_state` 完成整体替换
    fn on_scene_loaded(&self, _scene_id: &str) {}
}
