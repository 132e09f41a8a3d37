//! 待发送音频块（Audio Buffer Cell）
//!
//! 渲染回调产出一个引用计数的内存块 + 读偏移 + 长度，
//! 传输循环在同一轮迭代内整块写出并释放引用。
//! 不变量：任意时刻至多一个块在途。

use std::sync::Arc;

/// 引用计数的只读内存块
#[derive(Clone)]
pub struct MemBlock {
    data: Arc<[u8]>,
}

impl MemBlock {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data: data.into() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// 当前引用计数（测试用：验证 write-then-release）
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }
}

/// 指向 MemBlock 一个区段的音频块
pub struct MemChunk {
    block: Option<MemBlock>,
    pub index: usize,
    pub length: usize,
}

impl MemChunk {
    /// 空块（无内存引用）
    pub const fn empty() -> Self {
        Self {
            block: None,
            index: 0,
            length: 0,
        }
    }

    pub fn new(block: MemBlock, index: usize, length: usize) -> Self {
        debug_assert!(index + length <= block.len());
        Self {
            block: Some(block),
            index,
            length,
        }
    }

    /// 覆盖整个内存块
    pub fn from_block(block: MemBlock) -> Self {
        let length = block.len();
        Self {
            block: Some(block),
            index: 0,
            length,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// 取得待写出的字节区段
    pub fn as_bytes(&self) -> &[u8] {
        match &self.block {
            Some(block) => &block.as_slice()[self.index..self.index + self.length],
            None => &[],
        }
    }

    pub fn block(&self) -> Option<&MemBlock> {
        self.block.as_ref()
    }

    /// 释放内存引用并清零偏移与长度
    pub fn reset(&mut self) {
        self.block = None;
        self.index = 0;
        self.length = 0;
    }
}

impl Default for MemChunk {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_chunk() {
        let chunk = MemChunk::empty();
        assert!(chunk.is_empty());
        assert_eq!(chunk.as_bytes(), &[] as &[u8]);
    }

    #[test]
    fn test_chunk_section() {
        let block = MemBlock::new(vec![1, 2, 3, 4, 5, 6]);
        let chunk = MemChunk::new(block, 2, 3);
        assert_eq!(chunk.as_bytes(), &[3, 4, 5]);
        assert!(!chunk.is_empty());
    }

    #[test]
    fn test_reset_releases_reference() {
        let block = MemBlock::new(vec![0u8; 16]);
        let held = block.clone();
        assert_eq!(held.ref_count(), 2);

        let mut chunk = MemChunk::from_block(block);
        assert_eq!(held.ref_count(), 2);

        chunk.reset();
        // reset 之后块引用必须归还
        assert_eq!(held.ref_count(), 1);
        assert!(chunk.is_empty());
        assert_eq!(chunk.index, 0);
        assert_eq!(chunk.length, 0);
    }
}
