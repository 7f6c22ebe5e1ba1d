//! Element precisions.
//!
//! [`Precision`] is the tag parameter files carry. [`Element`] is the storage
//! type behind an executable tag: values are held as `f32` or `f16` and all
//! arithmetic runs in `f32`.

use std::fmt;
use std::str::FromStr;

use half::f16;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TileError;

/// Element precision tag of a kernel invocation.
///
/// Mirrors the precision tags of the cluster toolchain. Only `FP32` and `FP16`
/// are executable; the others exist so that parameter files naming them are
/// rejected with a descriptive error instead of being misread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Precision {
    /// 64-bit IEEE 754 double
    FP64,
    /// 32-bit IEEE 754 single
    FP32,
    /// 16-bit IEEE 754 half
    FP16,
    /// 8-bit minifloat
    FP8,
}

impl Precision {
    /// Size in bytes of one element.
    pub fn size_bytes(&self) -> usize {
        match self {
            Precision::FP64 => 8,
            Precision::FP32 => 4,
            Precision::FP16 => 2,
            Precision::FP8 => 1,
        }
    }

    /// Whether kernels in this workspace can run at this precision.
    pub fn is_supported(&self) -> bool {
        matches!(self, Precision::FP32 | Precision::FP16)
    }

    /// Fail with [`TileError::UnsupportedPrecision`] for non-executable tags.
    pub fn ensure_supported(&self) -> crate::Result<()> {
        if self.is_supported() {
            Ok(())
        } else {
            Err(TileError::UnsupportedPrecision(*self))
        }
    }

    /// Look up a precision by element width in bytes.
    pub fn from_size_bytes(bytes: usize) -> Option<Self> {
        match bytes {
            8 => Some(Precision::FP64),
            4 => Some(Precision::FP32),
            2 => Some(Precision::FP16),
            1 => Some(Precision::FP8),
            _ => None,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precision::FP64 => write!(f, "FP64"),
            Precision::FP32 => write!(f, "FP32"),
            Precision::FP16 => write!(f, "FP16"),
            Precision::FP8 => write!(f, "FP8"),
        }
    }
}

impl FromStr for Precision {
    type Err = TileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FP64" | "F64" => Ok(Precision::FP64),
            "FP32" | "F32" => Ok(Precision::FP32),
            "FP16" | "F16" => Ok(Precision::FP16),
            "FP8" | "F8" => Ok(Precision::FP8),
            other => Err(TileError::InvalidConfig(format!("unknown precision '{other}'"))),
        }
    }
}

impl Serialize for Precision {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Parameter files name the precision either by tag or by byte width.
#[derive(Deserialize)]
#[serde(untagged)]
enum PrecisionRepr {
    Name(String),
    Width(u64),
}

impl<'de> Deserialize<'de> for Precision {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match PrecisionRepr::deserialize(deserializer)? {
            PrecisionRepr::Name(name) => name.parse().map_err(serde::de::Error::custom),
            PrecisionRepr::Width(width) => Precision::from_size_bytes(width as usize)
                .ok_or_else(|| serde::de::Error::custom(format!("no precision is {width} bytes wide"))),
        }
    }
}

/// A scalar type that tiles can hold.
///
/// Kernels store tiles in the element type and do arithmetic in `f32`,
/// rounding on every store. The FP16 variant therefore differs from FP32 only
/// in working precision.
pub trait Element: bytemuck::Pod + Default + fmt::Debug + Send + Sync + 'static {
    /// Precision tag matching this type.
    const PRECISION: Precision;

    fn from_f32(value: f32) -> Self;

    fn to_f32(self) -> f32;
}

impl Element for f32 {
    const PRECISION: Precision = Precision::FP32;

    #[inline]
    fn from_f32(value: f32) -> Self {
        value
    }

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }
}

impl Element for f16 {
    const PRECISION: Precision = Precision::FP16;

    #[inline]
    fn from_f32(value: f32) -> Self {
        f16::from_f32(value)
    }

    #[inline]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_bytes() {
        assert_eq!(Precision::FP64.size_bytes(), 8);
        assert_eq!(Precision::FP32.size_bytes(), 4);
        assert_eq!(Precision::FP16.size_bytes(), 2);
        assert_eq!(Precision::FP8.size_bytes(), 1);
        assert_eq!(<f16 as Element>::PRECISION.size_bytes(), std::mem::size_of::<f16>());
    }

    #[test]
    fn test_supported() {
        assert!(Precision::FP32.ensure_supported().is_ok());
        assert!(Precision::FP16.ensure_supported().is_ok());
        assert!(matches!(
            Precision::FP64.ensure_supported(),
            Err(TileError::UnsupportedPrecision(Precision::FP64))
        ));
        assert!(Precision::FP8.ensure_supported().is_err());
    }

    #[test]
    fn test_parse() {
        assert_eq!("FP32".parse::<Precision>().unwrap(), Precision::FP32);
        assert_eq!("fp16".parse::<Precision>().unwrap(), Precision::FP16);
        assert!("bf16".parse::<Precision>().is_err());
    }

    #[test]
    fn test_deserialize_name_or_width() {
        let by_name: Precision = serde_json::from_str("\"FP16\"").unwrap();
        let by_width: Precision = serde_json::from_str("4").unwrap();
        assert_eq!(by_name, Precision::FP16);
        assert_eq!(by_width, Precision::FP32);
        assert!(serde_json::from_str::<Precision>("3").is_err());
        assert_eq!(serde_json::to_string(&Precision::FP8).unwrap(), "\"FP8\"");
    }

    #[test]
    fn test_f16_rounding() {
        let x = <f16 as Element>::from_f32(0.1);
        assert!((x.to_f32() - 0.1).abs() < 1e-3);
        assert_ne!(x.to_f32(), 0.1);
    }
}
