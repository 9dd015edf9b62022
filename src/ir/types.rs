//! Element types and scalar values.

use std::fmt;

/// Scalar element type of an expression or buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    Int(u8),
    UInt(u8),
    Float(u8),
}

impl Type {
    pub const BOOL: Type = Type::UInt(1);

    pub fn i32() -> Self {
        Type::Int(32)
    }

    pub fn f32() -> Self {
        Type::Float(32)
    }

    pub fn bits(self) -> u8 {
        match self {
            Type::Int(b) | Type::UInt(b) | Type::Float(b) => b,
        }
    }

    /// Storage size of one element in bytes (booleans occupy a byte).
    pub fn bytes(self) -> usize {
        (self.bits() as usize).div_ceil(8)
    }

    pub fn is_float(self) -> bool {
        matches!(self, Type::Float(_))
    }

    /// The type both operands of a binary operator are coerced to.
    ///
    /// Floats win over integers, then the wider type wins, then signed
    /// wins over unsigned.
    pub fn unify(self, other: Type) -> Type {
        match (self, other) {
            (a, b) if a == b => a,
            (Type::Float(a), Type::Float(b)) => Type::Float(a.max(b)),
            (Type::Float(_), _) => self,
            (_, Type::Float(_)) => other,
            (a, b) if a.bits() != b.bits() => {
                if a.bits() > b.bits() {
                    a
                } else {
                    b
                }
            }
            (Type::Int(_), _) => self,
            _ => other,
        }
    }

    /// Whether buffers can hold elements of this type.
    pub fn is_storable(self) -> bool {
        matches!(self.bits(), 1 | 8 | 16 | 32 | 64)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Int(b) => write!(f, "i{}", b),
            Type::UInt(1) => write!(f, "bool"),
            Type::UInt(b) => write!(f, "u{}", b),
            Type::Float(b) => write!(f, "f{}", b),
        }
    }
}

/// A scalar value. The active variant follows the type's class; the value is
/// always kept wrapped (or rounded) to the type's width.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Scalar {
    Int(i64),
    UInt(u64),
    Float(f64),
}

impl Scalar {
    pub fn zero(ty: Type) -> Self {
        Scalar::Int(0).cast(ty)
    }

    pub fn one(ty: Type) -> Self {
        Scalar::Int(1).cast(ty)
    }

    /// Largest value of `ty`.
    pub fn max_of(ty: Type) -> Self {
        match ty {
            Type::Float(32) => Scalar::Float(f32::MAX as f64),
            Type::Float(_) => Scalar::Float(f64::MAX),
            Type::Int(bits) => Scalar::Int(i64::MAX >> (64 - bits.clamp(1, 64) as u32)),
            Type::UInt(bits) => Scalar::UInt(u64::MAX >> (64 - bits.clamp(1, 64) as u32)),
        }
    }

    /// Smallest value of `ty`; for floats, the most negative finite value.
    pub fn min_of(ty: Type) -> Self {
        match ty {
            Type::Float(32) => Scalar::Float(f32::MIN as f64),
            Type::Float(_) => Scalar::Float(f64::MIN),
            Type::Int(bits) => Scalar::Int(i64::MIN >> (64 - bits.clamp(1, 64) as u32)),
            Type::UInt(_) => Scalar::UInt(0),
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Scalar::Int(v) => v,
            Scalar::UInt(v) => v as i64,
            Scalar::Float(v) => v as i64,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Scalar::Int(v) => v as f64,
            Scalar::UInt(v) => v as f64,
            Scalar::Float(v) => v,
        }
    }

    pub fn is_true(self) -> bool {
        match self {
            Scalar::Int(v) => v != 0,
            Scalar::UInt(v) => v != 0,
            Scalar::Float(v) => v != 0.0,
        }
    }

    /// Convert to `ty`, wrapping integers and rounding 32-bit floats.
    pub fn cast(self, ty: Type) -> Self {
        match ty {
            Type::UInt(1) => Scalar::UInt(self.is_true() as u64),
            Type::Float(32) => Scalar::Float(self.as_f64() as f32 as f64),
            Type::Float(_) => Scalar::Float(self.as_f64()),
            Type::Int(bits) => {
                let raw = match self {
                    Scalar::Float(v) => v as i64,
                    other => other.as_i64(),
                };
                Scalar::Int(sign_extend(raw, bits))
            }
            Type::UInt(bits) => {
                let raw = match self {
                    Scalar::Float(v) => v as u64,
                    Scalar::Int(v) => v as u64,
                    Scalar::UInt(v) => v,
                };
                Scalar::UInt(truncate(raw, bits))
            }
        }
    }

    /// Read one element of type `ty` from little-endian bytes.
    pub fn load(ty: Type, bytes: &[u8]) -> Self {
        let mut raw = [0u8; 8];
        raw[..ty.bytes()].copy_from_slice(&bytes[..ty.bytes()]);
        let bits = u64::from_le_bytes(raw);
        match ty {
            Type::Float(32) => Scalar::Float(f32::from_bits(bits as u32) as f64),
            Type::Float(_) => Scalar::Float(f64::from_bits(bits)),
            Type::Int(b) => Scalar::Int(sign_extend(bits as i64, b.max(8))),
            Type::UInt(_) => Scalar::UInt(bits),
        }
    }

    /// Write this value as an element of type `ty` into `bytes`.
    pub fn store(self, ty: Type, bytes: &mut [u8]) {
        let bits = match self.cast(ty) {
            Scalar::Float(v) if ty.bits() == 32 => (v as f32).to_bits() as u64,
            Scalar::Float(v) => v.to_bits(),
            Scalar::Int(v) => v as u64,
            Scalar::UInt(v) => v,
        };
        bytes[..ty.bytes()].copy_from_slice(&bits.to_le_bytes()[..ty.bytes()]);
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Int(v) => write!(f, "{}", v),
            Scalar::UInt(v) => write!(f, "{}", v),
            Scalar::Float(v) => write!(f, "{:?}", v),
        }
    }
}

fn sign_extend(v: i64, bits: u8) -> i64 {
    if bits >= 64 {
        return v;
    }
    let shift = 64 - bits as u32;
    (v << shift) >> shift
}

fn truncate(v: u64, bits: u8) -> u64 {
    if bits >= 64 {
        v
    } else {
        v & ((1u64 << bits) - 1)
    }
}

/// Host element types that buffers can be viewed as.
pub trait Element: bytemuck::Pod + Send + Sync + 'static {
    const TYPE: Type;
}

macro_rules! element {
    ($($t:ty => $ty:expr),* $(,)?) => {
        $(impl Element for $t {
            const TYPE: Type = $ty;
        })*
    };
}

element! {
    u8 => Type::UInt(8),
    i8 => Type::Int(8),
    u16 => Type::UInt(16),
    i16 => Type::Int(16),
    u32 => Type::UInt(32),
    i32 => Type::Int(32),
    u64 => Type::UInt(64),
    i64 => Type::Int(64),
    f32 => Type::Float(32),
    f64 => Type::Float(64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unify() {
        assert_eq!(Type::i32().unify(Type::f32()), Type::f32());
        assert_eq!(Type::UInt(8).unify(Type::Int(16)), Type::Int(16));
        assert_eq!(Type::UInt(32).unify(Type::Int(32)), Type::Int(32));
        assert_eq!(Type::Float(32).unify(Type::Float(64)), Type::Float(64));
    }

    #[test]
    fn test_cast_wraps() {
        assert_eq!(Scalar::Int(300).cast(Type::UInt(8)), Scalar::UInt(44));
        assert_eq!(Scalar::Int(200).cast(Type::Int(8)), Scalar::Int(-56));
        assert_eq!(Scalar::Float(2.75).cast(Type::i32()), Scalar::Int(2));
        assert_eq!(Scalar::Int(2).cast(Type::BOOL), Scalar::UInt(1));
    }

    #[test]
    fn test_f32_rounding() {
        let v = Scalar::Float(0.1).cast(Type::f32());
        assert_eq!(v, Scalar::Float(0.1f32 as f64));
    }

    #[test]
    fn test_load_store() {
        let mut bytes = [0u8; 8];
        Scalar::Float(1.5).store(Type::f32(), &mut bytes);
        assert_eq!(Scalar::load(Type::f32(), &bytes), Scalar::Float(1.5));
        Scalar::Int(-3).store(Type::Int(16), &mut bytes);
        assert_eq!(Scalar::load(Type::Int(16), &bytes), Scalar::Int(-3));
    }

    #[test]
    fn test_display() {
        assert_eq!(Type::f32().to_string(), "f32");
        assert_eq!(Type::BOOL.to_string(), "bool");
        assert_eq!(Type::UInt(8).to_string(), "u8");
    }
}
