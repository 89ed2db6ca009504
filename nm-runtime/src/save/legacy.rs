//! v1 存档负载
//!
//! ```text
//! sceneId str │ nodeId str
//! │ intCount u32   { key str, value i32 }
//! │ floatCount u32 { key str, value f32 }
//! │ stringCount u32 { key str, value str }
//! │ flagCount u32  { key str, value u8 }
//! ```
//!
//! v1 没有缩略图，数值会提升为 i64 / f64。

use super::{PayloadReader, SaveData, SaveError};
use crate::codec::ByteWriter;

/// 解码 v1 负载
pub fn decode_payload(payload: &[u8]) -> Result<SaveData, SaveError> {
    let mut r = PayloadReader::new(payload);
    let mut data = SaveData::new(r.string()?, r.string()?);

    for _ in 0..r.count("整数变量")? {
        let key = r.string()?;
        data.int_variables.insert(key, r.inner.i32()? as i64);
    }
    for _ in 0..r.count("浮点变量")? {
        let key = r.string()?;
        data.float_variables.insert(key, r.inner.f32()? as f64);
    }
    for _ in 0..r.count("字符串变量")? {
        let key = r.string()?;
        data.string_variables.insert(key, r.string()?);
    }
    for _ in 0..r.count("标记")? {
        let key = r.string()?;
        data.flags.insert(key, r.bool()?);
    }

    r.finish()?;
    Ok(data)
}

/// 编码 v1 负载（迁移测试与工具使用）
///
/// 超出 i32 / f32 表示范围的值会被截断，缩略图被丢弃。
pub fn encode_payload(data: &SaveData) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.str_u32(&data.scene_id).str_u32(&data.node_id);
    w.u32(data.int_variables.len() as u32);
    for (k, v) in &data.int_variables {
        w.str_u32(k).i32(*v as i32);
    }
    w.u32(data.float_variables.len() as u32);
    for (k, v) in &data.float_variables {
        w.str_u32(k).f32(*v as f32);
    }
    w.u32(data.string_variables.len() as u32);
    for (k, v) in &data.string_variables {
        w.str_u32(k).str_u32(v);
    }
    w.u32(data.flags.len() as u32);
    for (k, v) in &data.flags {
        w.str_u32(k).u8(*v as u8);
    }
    w.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_matches_current_model() {
        let mut data = super::super::tests::sample();
        data.thumbnail = None;
        let legacy = encode_payload(&data);
        assert_eq!(decode_payload(&legacy).unwrap(), data);
    }

    #[test]
    fn test_legacy_rejects_bad_bool() {
        let mut data = SaveData::new("s", "n");
        data.flags.insert("f".to_string(), true);
        let mut bytes = encode_payload(&data);
        let last = bytes.len() - 1;
        bytes[last] = 7;
        assert!(matches!(decode_payload(&bytes), Err(SaveError::Malformed(_))));
    }
}
