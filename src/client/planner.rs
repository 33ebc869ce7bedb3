//! 分片规划：按固定分片大小把文件切成连续、互不重叠的字节区间。

use std::ops::Range;
use thiserror::Error;

use crate::config::MAX_PART_NUMBER;

/// 单个分片：编号从 1 开始，`offset` 为文件内的起始位置。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    pub part_number: u32,
    pub offset: u64,
    pub length: u64,
}

impl PartPlan {
    pub fn byte_range(&self) -> Range<u64> {
        self.offset..self.offset + self.length
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("file is empty")]
    EmptyFile,
    #[error("part size must be greater than zero")]
    ZeroPartSize,
    #[error("file needs {parts} parts, more than the limit of {max}")]
    TooManyParts { parts: u64, max: u32 },
}

/// 计算分片数 `ceil(size / part_size)`。
pub fn total_parts(size: u64, part_size: u64) -> Result<u32, PlanError> {
    if part_size == 0 {
        return Err(PlanError::ZeroPartSize);
    }
    if size == 0 {
        return Err(PlanError::EmptyFile);
    }
    let parts = size.div_ceil(part_size);
    u32::try_from(parts)
        .ok()
        .filter(|count| *count <= MAX_PART_NUMBER)
        .ok_or(PlanError::TooManyParts {
            parts,
            max: MAX_PART_NUMBER,
        })
}

/// 第 `index`（从 0 开始）个分片；最后一个分片可能较短。
pub fn plan_part(size: u64, part_size: u64, index: u32) -> PartPlan {
    let offset = u64::from(index) * part_size;
    PartPlan {
        part_number: index + 1,
        offset,
        length: part_size.min(size.saturating_sub(offset)),
    }
}

pub fn plan_parts(size: u64, part_size: u64) -> Result<Vec<PartPlan>, PlanError> {
    let count = total_parts(size, part_size)?;
    Ok((0..count)
        .map(|index| plan_part(size, part_size, index))
        .collect())
}
