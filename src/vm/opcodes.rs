//! Opcode definitions and operand-kind metadata.

/// Operand kinds, used by the validator and by the JIT lookahead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Unused,
    /// One stack slot.
    Stack1,
    /// Four consecutive stack slots.
    Stack4,
    /// A variable number of stack slots (extcall argument window).
    StackN,
    /// Immediate value.
    Imm,
    /// A stack slot holding a runtime index.
    StackRef,
    /// Half of a def offset.
    DefPtr,
    /// Half of an instruction index.
    CodePtr,
}

macro_rules! opcodes {
    ($( $name:ident = $val:expr, $text:expr, ($a1:ident, $a2:ident, $a3:ident); )*) => {
        /// LMNT opcodes.
        #[repr(u16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $( $name = $val, )*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[ $( Opcode::$name, )* ];

            /// Decode a raw opcode value.
            pub fn from_u16(value: u16) -> Option<Opcode> {
                match value {
                    $( $val => Some(Opcode::$name), )*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $( Opcode::$name => $text, )*
                }
            }

            /// Operand kinds for `(arg1, arg2, arg3)`.
            pub fn operands(self) -> [Operand; 3] {
                match self {
                    $( Opcode::$name => [Operand::$a1, Operand::$a2, Operand::$a3], )*
                }
            }
        }
    };
}

opcodes! {
    Noop = 0, "NOOP", (Unused, Unused, Unused);
    Return = 1, "RETURN", (Unused, Unused, Unused);
    AssignSS = 2, "ASSIGNSS", (Stack1, Unused, Stack1);
    AssignVV = 3, "ASSIGNVV", (Stack4, Unused, Stack4);
    AssignSV = 4, "ASSIGNSV", (Stack1, Unused, Stack4);
    AssignIIS = 5, "ASSIGNIIS", (Imm, Imm, Stack1);
    AssignIBS = 6, "ASSIGNIBS", (Imm, Imm, Stack1);
    AssignIIV = 7, "ASSIGNIIV", (Imm, Imm, Stack4);
    AssignIBV = 8, "ASSIGNIBV", (Imm, Imm, Stack4);
    DloadIIS = 9, "DLOADIIS", (Imm, Imm, Stack1);
    DloadIIV = 10, "DLOADIIV", (Imm, Imm, Stack4);
    DloadIRS = 11, "DLOADIRS", (Imm, Stack1, Stack1);
    DloadIRV = 12, "DLOADIRV", (Imm, Stack1, Stack4);
    DsecLen = 13, "DSECLEN", (Imm, Unused, Stack1);
    AddSS = 14, "ADDSS", (Stack1, Stack1, Stack1);
    AddVV = 15, "ADDVV", (Stack4, Stack4, Stack4);
    SubSS = 16, "SUBSS", (Stack1, Stack1, Stack1);
    SubVV = 17, "SUBVV", (Stack4, Stack4, Stack4);
    MulSS = 18, "MULSS", (Stack1, Stack1, Stack1);
    MulVV = 19, "MULVV", (Stack4, Stack4, Stack4);
    DivSS = 20, "DIVSS", (Stack1, Stack1, Stack1);
    DivVV = 21, "DIVVV", (Stack4, Stack4, Stack4);
    ModSS = 22, "MODSS", (Stack1, Stack1, Stack1);
    ModVV = 23, "MODVV", (Stack4, Stack4, Stack4);
    Sin = 24, "SIN", (Stack1, Unused, Stack1);
    Cos = 25, "COS", (Stack1, Unused, Stack1);
    Tan = 26, "TAN", (Stack1, Unused, Stack1);
    Asin = 27, "ASIN", (Stack1, Unused, Stack1);
    Acos = 28, "ACOS", (Stack1, Unused, Stack1);
    Atan = 29, "ATAN", (Stack1, Unused, Stack1);
    Atan2 = 30, "ATAN2", (Stack1, Stack1, Stack1);
    SinCos = 31, "SINCOS", (Stack1, Stack1, Stack1);
    PowSS = 32, "POWSS", (Stack1, Stack1, Stack1);
    PowVV = 33, "POWVV", (Stack4, Stack4, Stack4);
    PowVS = 34, "POWVS", (Stack4, Stack1, Stack4);
    SqrtS = 35, "SQRTS", (Stack1, Unused, Stack1);
    SqrtV = 36, "SQRTV", (Stack4, Unused, Stack4);
    Log = 37, "LOG", (Stack1, Stack1, Stack1);
    Ln = 38, "LN", (Stack1, Unused, Stack1);
    Log2 = 39, "LOG2", (Stack1, Unused, Stack1);
    Log10 = 40, "LOG10", (Stack1, Unused, Stack1);
    AbsS = 41, "ABSS", (Stack1, Unused, Stack1);
    AbsV = 42, "ABSV", (Stack4, Unused, Stack4);
    SumV = 43, "SUMV", (Stack4, Unused, Stack1);
    MinSS = 44, "MINSS", (Stack1, Stack1, Stack1);
    MinVV = 45, "MINVV", (Stack4, Stack4, Stack4);
    MaxSS = 46, "MAXSS", (Stack1, Stack1, Stack1);
    MaxVV = 47, "MAXVV", (Stack4, Stack4, Stack4);
    MinVS = 48, "MINVS", (Stack4, Stack1, Stack4);
    MaxVS = 49, "MAXVS", (Stack4, Stack1, Stack4);
    FloorS = 50, "FLOORS", (Stack1, Unused, Stack1);
    FloorV = 51, "FLOORV", (Stack4, Unused, Stack4);
    RoundS = 52, "ROUNDS", (Stack1, Unused, Stack1);
    RoundV = 53, "ROUNDV", (Stack4, Unused, Stack4);
    CeilS = 54, "CEILS", (Stack1, Unused, Stack1);
    CeilV = 55, "CEILV", (Stack4, Unused, Stack4);
    TruncS = 56, "TRUNCS", (Stack1, Unused, Stack1);
    TruncV = 57, "TRUNCV", (Stack4, Unused, Stack4);
    IndexRIS = 58, "INDEXRIS", (StackRef, Imm, Stack1);
    IndexRIR = 59, "INDEXRIR", (StackRef, Imm, StackRef);
    Branch = 60, "BRANCH", (Unused, CodePtr, CodePtr);
    BranchZ = 61, "BRANCHZ", (Stack1, CodePtr, CodePtr);
    BranchNZ = 62, "BRANCHNZ", (Stack1, CodePtr, CodePtr);
    BranchPos = 63, "BRANCHPOS", (Stack1, CodePtr, CodePtr);
    BranchNeg = 64, "BRANCHNEG", (Stack1, CodePtr, CodePtr);
    BranchUn = 65, "BRANCHUN", (Stack1, CodePtr, CodePtr);
    Cmp = 66, "CMP", (Stack1, Stack1, Unused);
    CmpZ = 67, "CMPZ", (Stack1, Unused, Unused);
    BranchCEQ = 68, "BRANCHCEQ", (Unused, CodePtr, CodePtr);
    BranchCNE = 69, "BRANCHCNE", (Unused, CodePtr, CodePtr);
    BranchCLT = 70, "BRANCHCLT", (Unused, CodePtr, CodePtr);
    BranchCLE = 71, "BRANCHCLE", (Unused, CodePtr, CodePtr);
    BranchCGT = 72, "BRANCHCGT", (Unused, CodePtr, CodePtr);
    BranchCGE = 73, "BRANCHCGE", (Unused, CodePtr, CodePtr);
    BranchCUN = 74, "BRANCHCUN", (Unused, CodePtr, CodePtr);
    AssignCEQ = 75, "ASSIGNCEQ", (Imm, Imm, Stack1);
    AssignCNE = 76, "ASSIGNCNE", (Imm, Imm, Stack1);
    AssignCLT = 77, "ASSIGNCLT", (Imm, Imm, Stack1);
    AssignCLE = 78, "ASSIGNCLE", (Imm, Imm, Stack1);
    AssignCGT = 79, "ASSIGNCGT", (Imm, Imm, Stack1);
    AssignCGE = 80, "ASSIGNCGE", (Imm, Imm, Stack1);
    AssignCUN = 81, "ASSIGNCUN", (Imm, Imm, Stack1);
    Extcall = 82, "EXTCALL", (DefPtr, DefPtr, StackN);
}

impl Opcode {
    /// Number of opcodes; every raw value below this decodes.
    pub const COUNT: u16 = 83;

    /// Branch opcodes whose target is `COMBINE(arg2, arg3)`.
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Opcode::Branch
                | Opcode::BranchZ
                | Opcode::BranchNZ
                | Opcode::BranchPos
                | Opcode::BranchNeg
                | Opcode::BranchUn
                | Opcode::BranchCEQ
                | Opcode::BranchCNE
                | Opcode::BranchCLT
                | Opcode::BranchCLE
                | Opcode::BranchCGT
                | Opcode::BranchCGE
                | Opcode::BranchCUN
        )
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Combine two 16-bit halves into one 32-bit value.
#[inline]
pub fn combine(lo: u16, hi: u16) -> u32 {
    lo as u32 | ((hi as u32) << 16)
}

/// Split a 32-bit value into `(lo, hi)` halves.
#[inline]
pub fn split(value: u32) -> (u16, u16) {
    (value as u16, (value >> 16) as u16)
}

/// One decoded instruction.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Instruction {
    pub opcode: u16,
    pub arg1: u16,
    pub arg2: u16,
    pub arg3: u16,
}

impl Instruction {
    pub const SIZE: usize = 8;

    pub fn new(op: Opcode, arg1: u16, arg2: u16, arg3: u16) -> Self {
        Instruction { opcode: op as u16, arg1, arg2, arg3 }
    }

    pub fn op(&self) -> Option<Opcode> {
        Opcode::from_u16(self.opcode)
    }

    /// Target of a branch instruction.
    pub fn branch_target(&self) -> u32 {
        combine(self.arg2, self.arg3)
    }

    pub fn read(bytes: &[u8]) -> Instruction {
        let half = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]);
        Instruction { opcode: half(0), arg1: half(2), arg2: half(4), arg3: half(6) }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0..2].copy_from_slice(&self.opcode.to_le_bytes());
        out[2..4].copy_from_slice(&self.arg1.to_le_bytes());
        out[4..6].copy_from_slice(&self.arg2.to_le_bytes());
        out[6..8].copy_from_slice(&self.arg3.to_le_bytes());
        out
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.op() {
            Some(op) => write!(f, "{:<10} {:04X} {:04X} {:04X}", op.name(), self.arg1, self.arg2, self.arg3),
            None => write!(f, "<{:04X}>     {:04X} {:04X} {:04X}", self.opcode, self.arg1, self.arg2, self.arg3),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcodes_are_dense() {
        assert_eq!(Opcode::ALL.len(), Opcode::COUNT as usize);
        for (i, op) in Opcode::ALL.iter().enumerate() {
            assert_eq!(*op as u16, i as u16);
            assert_eq!(Opcode::from_u16(i as u16), Some(*op));
        }
        assert_eq!(Opcode::from_u16(Opcode::COUNT), None);
    }

    #[test]
    fn test_branch_operands() {
        for op in Opcode::ALL {
            if op.is_branch() {
                let [_, a2, a3] = op.operands();
                assert_eq!(a2, Operand::CodePtr);
                assert_eq!(a3, Operand::CodePtr);
            }
        }
        assert!(!Opcode::Cmp.is_branch());
    }

    #[test]
    fn test_instruction_bytes() {
        let ins = Instruction::new(Opcode::AddSS, 1, 2, 0x0302);
        let bytes = ins.to_bytes();
        assert_eq!(bytes, [14, 0, 1, 0, 2, 0, 0x02, 0x03]);
        assert_eq!(Instruction::read(&bytes), ins);
    }

    #[test]
    fn test_combine() {
        assert_eq!(combine(0x1234, 0x0001), 0x0001_1234);
        assert_eq!(split(0x0001_1234), (0x1234, 0x0001));
    }
}
