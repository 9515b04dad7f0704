use half::f16;

/// Execution backend of a variable or thread state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Cpu,
    Cuda,
}

/// Scalar type of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum VarType {
    #[default]
    Void,
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F16,
    F32,
    F64,
    Ptr,
}

impl VarType {
    pub fn size(self) -> usize {
        match self {
            VarType::Void => 0,
            VarType::Bool | VarType::I8 | VarType::U8 => 1,
            VarType::I16 | VarType::U16 | VarType::F16 => 2,
            VarType::I32 | VarType::U32 | VarType::F32 => 4,
            VarType::I64 | VarType::U64 | VarType::F64 | VarType::Ptr => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            VarType::Void => "void",
            VarType::Bool => "bool",
            VarType::I8 => "i8",
            VarType::U8 => "u8",
            VarType::I16 => "i16",
            VarType::U16 => "u16",
            VarType::I32 => "i32",
            VarType::U32 => "u32",
            VarType::I64 => "i64",
            VarType::U64 => "u64",
            VarType::F16 => "f16",
            VarType::F32 => "f32",
            VarType::F64 => "f64",
            VarType::Ptr => "ptr",
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, VarType::F16 | VarType::F32 | VarType::F64)
    }

    pub fn is_signed(self) -> bool {
        matches!(self, VarType::I8 | VarType::I16 | VarType::I32 | VarType::I64) || self.is_float()
    }

    pub fn is_int(self) -> bool {
        !self.is_float() && !matches!(self, VarType::Void | VarType::Bool | VarType::Ptr)
    }

    /// PTX operand type as used in instruction suffixes.
    pub fn ptx(self) -> &'static str {
        match self {
            VarType::Void => "??",
            VarType::Bool => "pred",
            VarType::I8 => "s8",
            VarType::U8 => "u8",
            VarType::I16 => "s16",
            VarType::U16 => "u16",
            VarType::I32 => "s32",
            VarType::U32 => "u32",
            VarType::I64 => "s64",
            VarType::U64 => "u64",
            VarType::F16 => "f16",
            VarType::F32 => "f32",
            VarType::F64 => "f64",
            VarType::Ptr => "u64",
        }
    }

    /// PTX memory type for global loads/stores (predicates travel as bytes).
    pub fn ptx_mem(self) -> &'static str {
        match self {
            VarType::Bool => "u8",
            other => other.ptx(),
        }
    }

    /// Register class prefix in generated PTX.
    pub fn reg_prefix(self) -> &'static str {
        match self {
            VarType::Void => "%_",
            VarType::Bool => "%p",
            VarType::I8 | VarType::U8 | VarType::I16 | VarType::U16 | VarType::F16 => "%w",
            VarType::I32 | VarType::U32 => "%r",
            VarType::I64 | VarType::U64 | VarType::Ptr => "%rd",
            VarType::F32 => "%f",
            VarType::F64 => "%d",
        }
    }

    /// Type spelling in the host IR listing.
    pub fn ir(self) -> &'static str {
        match self {
            VarType::Void => "void",
            VarType::Bool => "i1",
            VarType::I8 | VarType::U8 => "i8",
            VarType::I16 | VarType::U16 => "i16",
            VarType::I32 | VarType::U32 => "i32",
            VarType::I64 | VarType::U64 | VarType::Ptr => "i64",
            VarType::F16 => "half",
            VarType::F32 => "float",
            VarType::F64 => "double",
        }
    }

    /// Type spelling in generated CUDA C (builtin kernels).
    pub fn cuda(self) -> &'static str {
        match self {
            VarType::Void => "void",
            VarType::Bool | VarType::U8 => "unsigned char",
            VarType::I8 => "signed char",
            VarType::I16 => "short",
            VarType::U16 => "unsigned short",
            VarType::I32 => "int",
            VarType::U32 => "unsigned int",
            VarType::I64 => "long long",
            VarType::U64 | VarType::Ptr => "unsigned long long",
            VarType::F16 => "__half",
            VarType::F32 => "float",
            VarType::F64 => "double",
        }
    }

    pub fn from_code(code: u8) -> Option<VarType> {
        Some(match code {
            0 => VarType::Void,
            1 => VarType::Bool,
            2 => VarType::I8,
            3 => VarType::U8,
            4 => VarType::I16,
            5 => VarType::U16,
            6 => VarType::I32,
            7 => VarType::U32,
            8 => VarType::I64,
            9 => VarType::U64,
            10 => VarType::F16,
            11 => VarType::F32,
            12 => VarType::F64,
            13 => VarType::Ptr,
            _ => return None,
        })
    }

    pub fn make_unsigned(self) -> VarType {
        match self {
            VarType::I8 => VarType::U8,
            VarType::I16 => VarType::U16,
            VarType::I32 => VarType::U32,
            VarType::I64 => VarType::U64,
            other => other,
        }
    }
}

/// Horizontal reduction operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Add,
    Mul,
    Min,
    Max,
    And,
    Or,
}

impl ReduceOp {
    pub fn name(self) -> &'static str {
        match self {
            ReduceOp::Add => "sum",
            ReduceOp::Mul => "mul",
            ReduceOp::Min => "min",
            ReduceOp::Max => "max",
            ReduceOp::And => "and",
            ReduceOp::Or => "or",
        }
    }

    /// Bit pattern of the identity element for a given type.
    pub fn identity(self, ty: VarType) -> u64 {
        match self {
            ReduceOp::Add | ReduceOp::Or => 0,
            ReduceOp::Mul => match ty {
                VarType::F16 => f16::from_f32(1.0).to_bits() as u64,
                VarType::F32 => f32::to_bits(1.0) as u64,
                VarType::F64 => f64::to_bits(1.0),
                _ => 1,
            },
            ReduceOp::Min => match ty {
                VarType::I8 => i8::MAX as u8 as u64,
                VarType::U8 => u8::MAX as u64,
                VarType::I16 => i16::MAX as u16 as u64,
                VarType::U16 => u16::MAX as u64,
                VarType::I32 => i32::MAX as u32 as u64,
                VarType::U32 => u32::MAX as u64,
                VarType::I64 => i64::MAX as u64,
                VarType::U64 => u64::MAX,
                VarType::F16 => f16::INFINITY.to_bits() as u64,
                VarType::F32 => f32::INFINITY.to_bits() as u64,
                VarType::F64 => f64::INFINITY.to_bits(),
                _ => 0,
            },
            ReduceOp::Max => match ty {
                VarType::I8 => i8::MIN as u8 as u64,
                VarType::I16 => i16::MIN as u16 as u64,
                VarType::I32 => i32::MIN as u32 as u64,
                VarType::I64 => i64::MIN as u64,
                VarType::F16 => f16::NEG_INFINITY.to_bits() as u64,
                VarType::F32 => f32::NEG_INFINITY.to_bits() as u64,
                VarType::F64 => f64::NEG_INFINITY.to_bits(),
                _ => 0,
            },
            ReduceOp::And => match ty.size() {
                1 => 0xff,
                2 => 0xffff,
                4 => 0xffff_ffff,
                _ => u64::MAX,
            },
        }
    }
}

/// Kind of a launched kernel, recorded in the kernel history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelType {
    Jit,
    Reduce,
    CallReduce,
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_sizes() {
        assert_eq!(VarType::Bool.size(), 1);
        assert_eq!(VarType::F16.size(), 2);
        assert_eq!(VarType::U32.size(), 4);
        assert_eq!(VarType::Ptr.size(), 8);
    }

    #[test]
    fn reduce_identities() {
        assert_eq!(ReduceOp::Add.identity(VarType::U32), 0);
        assert_eq!(ReduceOp::Mul.identity(VarType::U32), 1);
        assert_eq!(ReduceOp::Min.identity(VarType::U32), u32::MAX as u64);
        assert_eq!(
            f32::from_bits(ReduceOp::Max.identity(VarType::F32) as u32),
            f32::NEG_INFINITY
        );
        assert_eq!(ReduceOp::And.identity(VarType::U32), 0xffff_ffff);
    }
}
