//! Opcode definitions for the Kestrel bytecode VM.
//!
//! Bytecode is stored as raw `Vec<u8>` for cache efficiency. The `Opcode` enum is a pure
//! discriminant with no data - operands are fetched separately from the byte stream.
//!
//! The unwinder never decodes operands; it only peeks the opcode byte at recorded
//! offsets (the raising instruction, a pre-live record's push offset, a call-prep
//! region's `fpush_off`). Classification predicates over discriminant subranges are
//! what matter here, so related instructions are kept contiguous:
//!
//! - member base/dim instructions: [`Opcode::BaseC`]..=[`Opcode::Dim`]
//! - member final instructions: [`Opcode::QueryM`]..=[`Opcode::UnsetM`]
//! - call-preparation instructions: [`Opcode::FPushFunc`]..=[`Opcode::FPushCtorD`]

use strum::FromRepr;

/// Opcode discriminant - just identifies the instruction type.
///
/// Operands (if any) follow in the bytecode stream and are fetched separately.
/// With `#[repr(u8)]`, each opcode is exactly 1 byte. Uses `strum::FromRepr` for
/// efficient byte-to-opcode conversion (bounds check + transmute).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, serde::Serialize, serde::Deserialize)]
pub enum Opcode {
    // === Stack Operations ===
    /// No operation (for patching/alignment).
    Nop,
    /// Discard top of stack.
    PopC,
    /// Duplicate top of stack.
    Dup,

    // === Constants & Literals ===
    /// Push null.
    Null,
    /// Push true.
    True,
    /// Push false.
    False,
    /// Push integer constant. Operand: i64 (8 bytes, little-endian).
    Int,
    /// Push float constant. Operand: f64 (8 bytes, little-endian).
    Double,

    // === Locals ===
    /// Push local variable. Operand: u8 slot.
    CGetL,
    /// Pop and store to local. Operand: u8 slot.
    SetL,
    /// Push local and unset it. Operand: u8 slot.
    PushL,
    /// Unset local variable. Operand: u8 slot.
    UnsetL,

    // === Member Instructions: base/dim subrange ===
    // These thread an intermediate base through the thread-local member state
    // cells; the unwinder must release those cells when one of them raises.
    /// Begin member op with base from stack top.
    BaseC,
    /// Begin member op with base from a local. Operand: u8 slot.
    BaseL,
    /// Begin member op with base `this`.
    BaseH,
    /// Intermediate dimension step. Operand: u8 member key kind.
    Dim,

    // === Member Instructions: final subrange ===
    /// Final query (read) step. Operand: u8 member key kind.
    QueryM,
    /// Final set step. Operand: u8 member key kind.
    SetM,
    /// Final increment/decrement step. Operands: u8 key kind, u8 op.
    IncDecM,
    /// Final compound-assignment step. Operands: u8 key kind, u8 op.
    SetOpM,
    /// Final unset step. Operand: u8 member key kind.
    UnsetM,

    // === Call Preparation ===
    // Each FPush* opcode pushes a pre-live activation record onto the
    // evaluation stack; the matching FCall enters it.
    /// Prepare call to a function value on the stack. Operand: u8 argc.
    FPushFunc,
    /// Prepare call to a named function. Operands: u8 argc, u16 func id.
    FPushFuncD,
    /// Prepare call to an object method by value. Operand: u8 argc.
    FPushObjMethod,
    /// Prepare call to a named object method. Operands: u8 argc, u16 name id.
    FPushObjMethodD,
    /// Prepare call to a named class method. Operands: u8 argc, u16 name id.
    FPushClsMethodD,
    /// Prepare constructor call, class from stack. Operand: u8 argc.
    FPushCtor,
    /// Prepare constructor call for a named class. Operands: u8 argc, u16 class id.
    FPushCtorD,

    // === Calls ===
    /// Enter the innermost pre-live record. Operand: u8 argc.
    FCall,
    /// Enter the innermost pre-live record, eagerly awaiting the result.
    /// Operand: u8 argc.
    FCallAwait,

    // === Control Flow ===
    /// Unconditional relative jump. Operand: i16 offset.
    Jmp,
    /// Jump if top of stack is falsy. Operand: i16 offset.
    JmpZ,
    /// Jump if top of stack is truthy. Operand: i16 offset.
    JmpNZ,

    // === Exceptions ===
    /// Raise top of stack as a guest exception.
    Throw,
    /// Resume unwinding at the end of a fault-handler funclet.
    Unwind,
    /// Raise a fatal host-level error. Operand: u8 fatal kind.
    Fatal,

    // === Coroutines ===
    /// Suspend an async function until the awaited handle finishes.
    Await,
    /// Yield a value from a generator.
    Yield,

    // === Return ===
    /// Return top of stack from the current function.
    RetC,
}

impl Opcode {
    /// True for member base/dim instructions, which may hold live intermediate
    /// values in the thread-local `tv_ref`/`tv_ref2` cells when they raise.
    #[inline]
    pub fn is_member_dim_op(self) -> bool {
        (Self::BaseC as u8..=Self::Dim as u8).contains(&(self as u8))
    }

    /// True for member final instructions; same intermediate-cell hazard as
    /// [`Opcode::is_member_dim_op`].
    #[inline]
    pub fn is_member_final_op(self) -> bool {
        (Self::QueryM as u8..=Self::UnsetM as u8).contains(&(self as u8))
    }

    /// True for call-preparation instructions (the ones that push a pre-live
    /// activation record).
    #[inline]
    pub fn is_call_prep_op(self) -> bool {
        (Self::FPushFunc as u8..=Self::FPushCtorD as u8).contains(&(self as u8))
    }

    /// True for the construct-preparation instructions. A pre-live record pushed
    /// by one of these owns a half-constructed receiver, which must be marked
    /// no-destruct before release.
    #[inline]
    pub fn is_construct_prep(self) -> bool {
        matches!(self, Self::FPushCtor | Self::FPushCtorD)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = InvalidOpcodeError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::from_repr(byte).ok_or(InvalidOpcodeError(byte))
    }
}

/// Error returned when attempting to convert an invalid byte to an Opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidOpcodeError(pub u8);

impl std::fmt::Display for InvalidOpcodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid opcode byte: {}", self.0)
    }
}

impl std::error::Error for InvalidOpcodeError {}
