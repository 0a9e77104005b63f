//! Wire-level tensor element types.
//!
//! The values mirror the host tensor library's type codes so MATMUL
//! requests can carry them through unchanged. Only `F32` is required
//! for conformance; the device layer rejects everything else.

/// Element type carried in MATMUL requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DataType {
    /// 32-bit IEEE float — the only type the reference backends execute.
    F32 = 0,
    /// 16-bit IEEE float.
    F16 = 1,
    /// 4-bit block quantization, 32 elements per block.
    Q4_0 = 2,
    /// 4-bit block quantization with per-block minimum.
    Q4_1 = 3,
    /// 8-bit block quantization, 32 elements per block.
    Q8_0 = 8,
}

impl DataType {
    /// Wire encoding.
    pub const fn wire(self) -> u32 {
        self as u32
    }

    /// Decode a wire value; `None` for codes outside the closed set.
    pub fn from_wire(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::F32,
            1 => Self::F16,
            2 => Self::Q4_0,
            3 => Self::Q4_1,
            8 => Self::Q8_0,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_are_stable() {
        assert_eq!(DataType::F32.wire(), 0);
        assert_eq!(DataType::F16.wire(), 1);
        assert_eq!(DataType::Q8_0.wire(), 8);
        assert_eq!(DataType::from_wire(8), Some(DataType::Q8_0));
        assert_eq!(DataType::from_wire(4), None);
    }
}
