//! Instruction set and word encoding.
//!
//! Every instruction is one 32-bit word, `[OP:8 | 24 bits of operands]`.
//! The operand layout of an opcode is read off its mnemonic: each suffix
//! names a field (`A`, `B`, `C`, `AB`, `BC`, `ABC`) and its role (`r`
//! register, `i` immediate, `k` constant index).

mod disasm;
mod emit;
mod funcdef;

pub use disasm::{disassemble, format_instruction};
pub use emit::FuncDefBuilder;
pub use funcdef::{FuncDef, NativeFn};

use thiserror::Error;

macro_rules! opcodes {
    ($($name:ident),* $(,)?) => {
        #[allow(non_camel_case_types)]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($name),*
        }

        impl Opcode {
            /// Every opcode, indexed by its numeric value.
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name),*];

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$name => stringify!($name)),*
                }
            }
        }
    };
}

opcodes! {
    NOOP,
    LOAD_rA_rB,
    LOAD_rA_iBC,
    LOAD_rA_kBC,
    LOADNULL_rA,
    LOADV_rA_rB_kC,
    LOADC_rA_rB_kC,
    FUNCREF_iA_iBC,
    ASSIGN_rA_rB_kC,
    NAME_rA_kBC,
    ADD_rA_rB_rC,
    SUB_rA_rB_rC,
    MULT_rA_rB_rC,
    DIV_rA_rB_rC,
    MOD_rA_rB_rC,
    AND_rA_rB_rC,
    OR_rA_rB_rC,
    NOT_rA_rB,
    LIST_rA_iBC,
    MAP_rA_iBC,
    PUSH_rA_rB,
    INDEX_rA_rB_rC,
    IDXSET_rA_rB_rC,
    SLICE_rA_rB_rC,
    LOCALS_rA,
    OUTER_rA,
    GLOBALS_rA,
    JUMP_iABC,
    LT_rA_rB_rC,
    LT_rA_rB_iC,
    LT_rA_iB_rC,
    LE_rA_rB_rC,
    LE_rA_rB_iC,
    LE_rA_iB_rC,
    EQ_rA_rB_rC,
    EQ_rA_rB_iC,
    NE_rA_rB_rC,
    NE_rA_rB_iC,
    BRTRUE_rA_iBC,
    BRFALSE_rA_iBC,
    BRLT_rA_rB_iC,
    BRLT_rA_iB_iC,
    BRLT_iA_rB_iC,
    BRLE_rA_rB_iC,
    BRLE_rA_iB_iC,
    BRLE_iA_rB_iC,
    BREQ_rA_rB_iC,
    BREQ_rA_iB_iC,
    BRNE_rA_rB_iC,
    BRNE_rA_iB_iC,
    IFLT_rA_rB,
    IFLT_rA_iBC,
    IFLT_iAB_rC,
    IFLE_rA_rB,
    IFLE_rA_iBC,
    IFLE_iAB_rC,
    IFEQ_rA_rB,
    IFEQ_rA_iBC,
    IFNE_rA_rB,
    IFNE_rA_iBC,
    NEXT_rA_rB,
    ARGBLK_iABC,
    ARG_rA,
    ARG_iABC,
    CALLF_iA_iBC,
    CALLFN_iA_kBC,
    CALL_rA_rB_rC,
    NEW_rA_rB,
    ISA_rA_rB_rC,
    METHFIND_rA_rB_rC,
    SETSELF_rA,
    CALLIFREF_rA,
    ITERGET_rA_rB_rC,
    RETURN,
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Opcode> {
        Self::ALL.get(byte as usize).copied()
    }

    pub fn from_mnemonic(name: &str) -> Option<Opcode> {
        Self::ALL.iter().copied().find(|op| op.mnemonic().eq_ignore_ascii_case(name))
    }

    /// How the 24 operand bits are split.
    pub fn shape(self) -> Shape {
        let fields = self.fields();
        match fields.as_slice() {
            [] => Shape::None,
            [f] if f.width == 24 => Shape::Ax24,
            [_] => Shape::A,
            [_, f] if f.width == 16 => Shape::ABx,
            [f, _] if f.width == 16 => Shape::AxC,
            _ => Shape::ABC,
        }
    }

    /// Operand fields in encoding order.
    pub fn fields(self) -> Vec<Field> {
        self.mnemonic()
            .split('_')
            .skip(1)
            .filter_map(|part| {
                let mut chars = part.chars();
                let role = match chars.next()? {
                    'r' => Role::Reg,
                    'i' => Role::Imm,
                    'k' => Role::Const,
                    _ => return None,
                };
                Some(Field { role, width: 8 * chars.count() as u8 })
            })
            .collect()
    }

    pub fn operand_count(self) -> usize {
        self.fields().len()
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shape {
    /// No operands.
    None,
    /// One 8-bit field.
    A,
    /// 8-bit A plus 16-bit BC.
    ABx,
    /// 16-bit AB plus 8-bit C.
    AxC,
    /// Two or three 8-bit fields.
    ABC,
    /// One 24-bit signed field.
    Ax24,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Reg,
    Imm,
    Const,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Field {
    pub role: Role,
    pub width: u8,
}

impl Field {
    /// Accepts both the signed and the unsigned reading of an immediate.
    fn accepts(&self, v: i32) -> bool {
        let bits = self.width as u32;
        let max = (1i64 << bits) - 1;
        let min = if self.role == Role::Imm { -(1i64 << (bits - 1)) } else { 0 };
        (min..=max).contains(&(v as i64))
    }

    fn mask(&self) -> u32 {
        (1u32 << self.width) - 1
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EmitError {
    #[error("{op} takes {expected} operand(s), got {got}")]
    ShapeMismatch { op: Opcode, expected: usize, got: usize },
    #[error("operand {index} of {op} out of range: {value}")]
    OperandOutOfRange { op: Opcode, index: usize, value: i32 },
    #[error("constant pool full (limit {limit})")]
    ConstantPoolFull { limit: usize },
    #[error("unknown mnemonic: {0}")]
    UnknownMnemonic(String),
}

// ── Encoding ─────────────────────────────────────────────────────────

#[inline(always)]
pub const fn ins(op: Opcode) -> u32 {
    (op as u32) << 24
}

#[inline(always)]
pub const fn ins_a(op: Opcode, a: u8) -> u32 {
    (op as u32) << 24 | (a as u32) << 16
}

#[inline(always)]
pub const fn ins_abx(op: Opcode, a: u8, bc: u16) -> u32 {
    (op as u32) << 24 | (a as u32) << 16 | bc as u32
}

#[inline(always)]
pub const fn ins_axc(op: Opcode, ab: u16, c: u8) -> u32 {
    (op as u32) << 24 | (ab as u32) << 8 | c as u32
}

#[inline(always)]
pub const fn ins_abc(op: Opcode, a: u8, b: u8, c: u8) -> u32 {
    (op as u32) << 24 | (a as u32) << 16 | (b as u32) << 8 | c as u32
}

#[inline(always)]
pub const fn ins_sabc(op: Opcode, abc: i32) -> u32 {
    (op as u32) << 24 | (abc as u32 & 0x00FF_FFFF)
}

/// Encode `op` with operands in mnemonic order, checking count and range.
pub fn encode(op: Opcode, operands: &[i32]) -> Result<u32, EmitError> {
    let fields = op.fields();
    if fields.len() != operands.len() {
        return Err(EmitError::ShapeMismatch { op, expected: fields.len(), got: operands.len() });
    }
    for (index, (f, &v)) in fields.iter().zip(operands).enumerate() {
        if !f.accepts(v) {
            return Err(EmitError::OperandOutOfRange { op, index, value: v });
        }
    }
    Ok(encode_unchecked(op, operands))
}

/// Encode without validation; out-of-range operands are truncated.
pub fn encode_unchecked(op: Opcode, operands: &[i32]) -> u32 {
    let mut word = ins(op);
    let mut shift = 24u32;
    for (f, &v) in op.fields().iter().zip(operands) {
        shift -= f.width as u32;
        word |= (v as u32 & f.mask()) << shift;
    }
    word
}

// ── Decoding ─────────────────────────────────────────────────────────

#[inline(always)]
pub const fn op(word: u32) -> u8 {
    (word >> 24) as u8
}

#[inline(always)]
pub const fn a_u(word: u32) -> u8 {
    (word >> 16) as u8
}

#[inline(always)]
pub const fn a_s(word: u32) -> i8 {
    (word >> 16) as u8 as i8
}

#[inline(always)]
pub const fn b_u(word: u32) -> u8 {
    (word >> 8) as u8
}

#[inline(always)]
pub const fn b_s(word: u32) -> i8 {
    (word >> 8) as u8 as i8
}

#[inline(always)]
pub const fn c_u(word: u32) -> u8 {
    word as u8
}

#[inline(always)]
pub const fn c_s(word: u32) -> i8 {
    word as u8 as i8
}

#[inline(always)]
pub const fn ab_u(word: u32) -> u16 {
    (word >> 8) as u16
}

#[inline(always)]
pub const fn ab_s(word: u32) -> i16 {
    (word >> 8) as u16 as i16
}

#[inline(always)]
pub const fn bc_u(word: u32) -> u16 {
    word as u16
}

#[inline(always)]
pub const fn bc_s(word: u32) -> i16 {
    word as u16 as i16
}

/// The low 24 bits, sign-extended from bit 23.
#[inline(always)]
pub const fn abc_s(word: u32) -> i32 {
    ((word << 8) as i32) >> 8
}

/// Operands of `word` decoded per the opcode's fields, immediates signed.
pub fn decode_operands(word: u32) -> Option<(Opcode, Vec<i32>)> {
    let op = Opcode::from_u8(op(word))?;
    let mut shift = 24u32;
    let operands = op
        .fields()
        .iter()
        .map(|f| {
            shift -= f.width as u32;
            let raw = (word >> shift) & f.mask();
            if f.role == Role::Imm {
                let unused = 32 - f.width as u32;
                ((raw << unused) as i32) >> unused
            } else {
                raw as i32
            }
        })
        .collect();
    Some((op, operands))
}
