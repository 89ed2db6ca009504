//! # Codec 模块
//!
//! 定长小端二进制读写工具，字节码、存档负载和宿主侧文件头共用。
//!
//! 所有读取都先检查剩余长度，不会越界，也不会在校验前分配大块内存。

/// 读取越界
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortRead {
    /// 需要的字节数
    pub needed: usize,
    /// 实际剩余字节数
    pub available: usize,
}

/// 小端字节读取游标
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// 创建读取游标
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// 当前偏移
    pub fn position(&self) -> usize {
        self.pos
    }

    /// 剩余字节数
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// 是否已读完
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// 读取 n 个字节
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], ShortRead> {
        if n > self.remaining() {
            return Err(ShortRead {
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// 读取定长数组
    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], ShortRead> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, ShortRead> {
        Ok(self.array::<1>()?[0])
    }

    pub fn u16(&mut self) -> Result<u16, ShortRead> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, ShortRead> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64, ShortRead> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub fn i32(&mut self) -> Result<i32, ShortRead> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub fn i64(&mut self) -> Result<i64, ShortRead> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    pub fn f32(&mut self) -> Result<f32, ShortRead> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    pub fn f64(&mut self) -> Result<f64, ShortRead> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    /// 读取到下一个 NUL 字节（不含），游标跳过 NUL
    ///
    /// 找不到 NUL 时返回 `None`，游标不移动。
    pub fn nul_terminated(&mut self) -> Option<&'a [u8]> {
        let rest = &self.data[self.pos..];
        let end = rest.iter().position(|&b| b == 0)?;
        self.pos += end + 1;
        Some(&rest[..end])
    }
}

/// 小端字节写入器
#[derive(Debug, Clone, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(data);
        self
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    pub fn i64(&mut self, v: i64) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    pub fn f32(&mut self, v: f32) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    pub fn f64(&mut self, v: f64) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    /// 写入长度前缀（u32）字符串
    pub fn str_u32(&mut self, s: &str) -> &mut Self {
        self.u32(s.len() as u32);
        self.bytes(s.as_bytes())
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_reports_short_read() {
        let mut r = ByteReader::new(&[1, 0]);
        assert_eq!(r.u16(), Ok(1));
        assert_eq!(
            r.u32(),
            Err(ShortRead {
                needed: 4,
                available: 0
            })
        );
    }

    #[test]
    fn test_nul_terminated() {
        let mut r = ByteReader::new(b"ab\0c");
        assert_eq!(r.nul_terminated(), Some(&b"ab"[..]));
        assert_eq!(r.nul_terminated(), None);
        assert_eq!(r.position(), 3);
    }

    #[test]
    fn test_writer_little_endian() {
        let mut w = ByteWriter::new();
        w.u16(0x0102).u32(7).str_u32("hi");
        assert_eq!(w.into_inner(), vec![2, 1, 7, 0, 0, 0, 2, 0, 0, 0, b'h', b'i']);
    }
}
