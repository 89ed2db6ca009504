//! 按对象类型输出绘制指令

use super::object::{DialogueBox, EffectState, OverlayEffect, SceneObject, SceneObjectKind};
use super::choice::ChoiceMenu;
use crate::geometry::{Color, Rect, Vec2};
use crate::render::Renderer;
use crate::text::TextStyle;

const DIALOGUE_PADDING: f32 = 24.0;
const SPEAKER_HEIGHT: f32 = 36.0;
const CHOICE_ROW_HEIGHT: f32 = 48.0;
const PARTICLE_COUNT: usize = 48;

/// 类型默认尺寸（对象尺寸为 0 时使用）
fn default_size(kind: &SceneObjectKind, viewport: Vec2) -> Vec2 {
    match kind {
        SceneObjectKind::Background { .. } | SceneObjectKind::EffectOverlay(_) => viewport,
        SceneObjectKind::Character { .. } => Vec2::new(viewport.x * 0.35, viewport.y * 0.9),
        SceneObjectKind::DialogueUi(_) => Vec2::new(viewport.x, viewport.y * 0.28),
        SceneObjectKind::ChoiceUi(menu) => {
            let rows = menu.options.iter().filter(|o| o.visible).count();
            Vec2::new(viewport.x * 0.5, rows as f32 * CHOICE_ROW_HEIGHT)
        }
        _ => Vec2::new(64.0, 64.0),
    }
}

fn bounds(object: &SceneObject, origin: Vec2, viewport: Vec2) -> Rect {
    let t = &object.transform;
    let base = if object.size == Vec2::ZERO {
        default_size(&object.kind, viewport)
    } else {
        object.size
    };
    let size = Vec2::new(base.x * t.scale.x, base.y * t.scale.y);
    Rect::new(
        origin.x + t.position.x - t.anchor.x * size.x,
        origin.y + t.position.y - t.anchor.y * size.y,
        size.x,
        size.y,
    )
}

/// 绘制对象及其子对象
///
/// `origin` 为父对象位置与层偏移之和，`alpha` 为累积的层与父对象透明度。
pub(super) fn draw_object(
    object: &SceneObject,
    renderer: &mut dyn Renderer,
    origin: Vec2,
    alpha: f32,
    viewport: Vec2,
) {
    if !object.visible {
        return;
    }
    let alpha = alpha * object.alpha.clamp(0.0, 1.0);
    let rect = bounds(object, origin, viewport);
    let rotation = object.transform.rotation;

    match &object.kind {
        SceneObjectKind::Background { texture, tint }
        | SceneObjectKind::Sprite { texture, tint } => {
            if texture.is_empty() {
                renderer.fill_rect(rect, tint.with_alpha(alpha));
            } else {
                renderer.draw_texture(texture, rect, rotation, tint.with_alpha(alpha));
            }
        }
        SceneObjectKind::Character {
            texture,
            highlighted,
            ..
        } => {
            let tint = if *highlighted {
                Color::WHITE
            } else {
                Color::rgba(0.6, 0.6, 0.6, 1.0)
            };
            renderer.draw_texture(texture, rect, rotation, tint.with_alpha(alpha));
        }
        SceneObjectKind::DialogueUi(dialogue) => draw_dialogue(dialogue, rect, renderer, alpha),
        SceneObjectKind::ChoiceUi(menu) => {
            let rect = if object.size == Vec2::ZERO && object.transform.position == Vec2::ZERO {
                Rect::new(
                    (viewport.x - rect.width) * 0.5,
                    (viewport.y - rect.height) * 0.5,
                    rect.width,
                    rect.height,
                )
            } else {
                rect
            };
            draw_choices(menu, rect, renderer, alpha);
        }
        SceneObjectKind::EffectOverlay(effect) => draw_effect(effect, viewport, renderer, alpha),
        SceneObjectKind::TextLabel { text, color, .. } => {
            let style = TextStyle {
                color: *color,
                ..TextStyle::default()
            };
            renderer.draw_text(text, Vec2::new(rect.x, rect.y), &style, alpha);
        }
        SceneObjectKind::Panel { color } => renderer.fill_rect(rect, color.with_alpha(alpha)),
        SceneObjectKind::Custom { .. } => {}
    }

    let child_origin = Vec2::new(
        origin.x + object.transform.position.x,
        origin.y + object.transform.position.y,
    );
    for child in &object.children {
        draw_object(child, renderer, child_origin, alpha, viewport);
    }
}

fn draw_dialogue(dialogue: &DialogueBox, rect: Rect, renderer: &mut dyn Renderer, alpha: f32) {
    renderer.fill_rect(rect, Color::BLACK.with_alpha(0.6 * alpha));

    let mut text_top = rect.y + DIALOGUE_PADDING;
    if !dialogue.speaker.is_empty() {
        renderer.draw_text(
            &dialogue.speaker,
            Vec2::new(rect.x + DIALOGUE_PADDING, text_top),
            &TextStyle {
                bold: true,
                ..TextStyle::default()
            },
            alpha,
        );
        text_top += SPEAKER_HEIGHT;
    }

    let Some(typewriter) = dialogue.typewriter() else {
        let plain = crate::text::strip_markup(&dialogue.text);
        renderer.draw_text(
            &plain,
            Vec2::new(rect.x + DIALOGUE_PADDING, text_top),
            &TextStyle::default(),
            alpha,
        );
        return;
    };

    let visible = typewriter.visible_chars();
    let mut buf = [0u8; 4];
    for line in &typewriter.layout().lines {
        for glyph in line.glyphs.iter().filter(|g| g.index < visible) {
            let offset = typewriter.char_offset(glyph.index);
            let position = Vec2::new(
                rect.x + DIALOGUE_PADDING + glyph.x + offset.x,
                text_top + line.y + offset.y,
            );
            renderer.draw_text(glyph.ch.encode_utf8(&mut buf), position, &glyph.style, alpha);
        }
    }
}

fn draw_choices(menu: &ChoiceMenu, rect: Rect, renderer: &mut dyn Renderer, alpha: f32) {
    let mut y = rect.y;
    for (index, option) in menu.options.iter().enumerate() {
        if !option.visible {
            continue;
        }
        let row = Rect::new(rect.x, y, rect.width, CHOICE_ROW_HEIGHT - 4.0);
        let background = if index == menu.selected_index() {
            Color::rgba(0.3, 0.4, 0.8, 0.85)
        } else {
            Color::rgba(0.0, 0.0, 0.0, 0.6)
        };
        renderer.fill_rect(row, background.with_alpha(alpha));

        let style = TextStyle {
            color: if option.enabled {
                Color::WHITE
            } else {
                Color::rgba(0.5, 0.5, 0.5, 1.0)
            },
            ..TextStyle::default()
        };
        renderer.draw_text(
            &option.text,
            Vec2::new(row.x + DIALOGUE_PADDING, row.y + 12.0),
            &style,
            alpha,
        );
        y += CHOICE_ROW_HEIGHT;
    }
}

/// 确定性的伪随机数，范围 [0, 1)
fn hash01(seed: usize) -> f32 {
    let mut x = (seed as u32).wrapping_mul(0x9E37_79B9) ^ 0x85EB_CA6B;
    x ^= x >> 15;
    x = x.wrapping_mul(0x2C1B_3C6D);
    x ^= x >> 12;
    (x % 10_000) as f32 / 10_000.0
}

fn draw_effect(effect: &EffectState, viewport: Vec2, renderer: &mut dyn Renderer, alpha: f32) {
    let strength = effect.strength();
    if strength <= 0.0 {
        return;
    }
    let full = Rect::new(0.0, 0.0, viewport.x, viewport.y);
    match effect.effect {
        OverlayEffect::Fade | OverlayEffect::Flash => {
            renderer.fill_rect(full, effect.color.with_alpha(strength * alpha));
        }
        OverlayEffect::Rain | OverlayEffect::Snow => {
            let rain = effect.effect == OverlayEffect::Rain;
            let (size, speed) = if rain {
                (Vec2::new(2.0, 18.0), 900.0)
            } else {
                (Vec2::new(5.0, 5.0), 120.0)
            };
            let count = (PARTICLE_COUNT as f32 * strength).ceil() as usize;
            let t = effect.elapsed();
            for i in 0..count {
                let x0 = hash01(i * 2) * viewport.x;
                let y0 = hash01(i * 2 + 1) * viewport.y;
                let sway = if rain { 0.0 } else { (t * 1.5 + i as f32).sin() * 12.0 };
                let x = (x0 + sway).rem_euclid(viewport.x.max(1.0));
                let y = (y0 + t * speed).rem_euclid(viewport.y.max(1.0));
                renderer.fill_rect(
                    Rect::new(x, y, size.x, size.y),
                    effect.color.with_alpha(alpha),
                );
            }
        }
        OverlayEffect::Shake | OverlayEffect::None | OverlayEffect::Custom => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{DrawCommand, RecordingRenderer};
    use crate::text::MonospaceMetrics;

    fn viewport() -> Vec2 {
        Vec2::new(800.0, 600.0)
    }

    #[test]
    fn test_background_fills_viewport_by_default() {
        let bg = SceneObject::new(
            "bg",
            SceneObjectKind::Background {
                texture: "room".to_string(),
                tint: Color::WHITE,
            },
        );
        let mut r = RecordingRenderer::new(800.0, 600.0);
        draw_object(&bg, &mut r, Vec2::ZERO, 1.0, viewport());
        assert_eq!(
            r.commands,
            vec![DrawCommand::Texture {
                texture_id: "room".to_string(),
                rect: Rect::new(0.0, 0.0, 800.0, 600.0),
                rotation: 0.0,
                tint: Color::WHITE,
            }]
        );
    }

    #[test]
    fn test_children_offset_by_parent() {
        let mut parent = SceneObject::new("p", SceneObjectKind::Panel { color: Color::BLACK })
            .with_position(100.0, 50.0)
            .with_size(10.0, 10.0)
            .with_alpha(0.5);
        parent.children.push(
            SceneObject::new("c", SceneObjectKind::Panel { color: Color::WHITE })
                .with_position(5.0, 5.0)
                .with_size(1.0, 1.0),
        );
        let mut r = RecordingRenderer::new(800.0, 600.0);
        draw_object(&parent, &mut r, Vec2::ZERO, 1.0, viewport());
        assert_eq!(
            r.commands[1],
            DrawCommand::FillRect {
                rect: Rect::new(105.0, 55.0, 1.0, 1.0),
                color: Color::WHITE.with_alpha(0.5),
            }
        );
    }

    #[test]
    fn test_dialogue_draws_only_revealed_glyphs() {
        let mut dialogue = DialogueBox::new("Alice", "abcdef", 10.0);
        dialogue.start_typewriter(&MonospaceMetrics::default());
        dialogue.update(0.35);
        let object = SceneObject::new("d", SceneObjectKind::DialogueUi(dialogue));
        let mut r = RecordingRenderer::new(800.0, 600.0);
        draw_object(&object, &mut r, Vec2::ZERO, 1.0, viewport());
        assert_eq!(r.texts(), ["Alice", "a", "b", "c"]);
    }

    #[test]
    fn test_hidden_object_skips_children() {
        let mut parent = SceneObject::new("p", SceneObjectKind::Panel { color: Color::BLACK });
        parent.visible = false;
        parent
            .children
            .push(SceneObject::new("c", SceneObjectKind::Panel { color: Color::WHITE }));
        let mut r = RecordingRenderer::new(800.0, 600.0);
        draw_object(&parent, &mut r, Vec2::ZERO, 1.0, viewport());
        assert!(r.commands.is_empty());
    }

    #[test]
    fn test_snow_particles_stay_on_screen() {
        let effect = EffectState::new(OverlayEffect::Snow, 0.5, Color::WHITE, 0.0);
        let mut r = RecordingRenderer::new(800.0, 600.0);
        draw_effect(&effect, viewport(), &mut r, 1.0);
        assert_eq!(r.commands.len(), PARTICLE_COUNT / 2);
        for command in &r.commands {
            let DrawCommand::FillRect { rect, .. } = command else {
                panic!("unexpected command");
            };
            assert!(rect.x >= 0.0 && rect.x < 800.0);
            assert!(rect.y >= 0.0 && rect.y < 600.0);
        }
    }
}
