//! Intrinsic call resolution.
//!
//! Calls whose receiver is statically a primitive (or a fixed-layout array)
//! and whose selector appears in the table below bypass normal call
//! emission entirely; the analysis pass records the resolution and the
//! emission pass expands it to a short instruction sequence. Resolution is
//! purely an internal decision and never changes observable behavior
//! versus a real call.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::ir::IrType;

/// The operation an intrinsic call lowers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    IntAdd,
    IntSub,
    IntMul,
    IntDiv,
    IntMod,
    IntNeg,
    IntEq,
    IntNe,
    IntLt,
    IntLe,
    IntGt,
    IntGe,
    IntToDouble,
    DoubleAdd,
    DoubleSub,
    DoubleMul,
    DoubleDiv,
    DoubleNeg,
    DoubleSqrt,
    DoubleEq,
    DoubleNe,
    DoubleLt,
    DoubleLe,
    DoubleGt,
    DoubleGe,
    DoubleToInt,
    BoolEq,
    ArrayGet,
    ArraySet,
    ArrayLength,
    BytesGet,
    BytesLength,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Receiver {
    Int,
    Double,
    Bool,
    Array,
    Bytes,
}

fn receiver_of(ty: &IrType) -> Option<Receiver> {
    match ty {
        IrType::Int => Some(Receiver::Int),
        IrType::Double => Some(Receiver::Double),
        IrType::Bool => Some(Receiver::Bool),
        IrType::Array { nullable: false, .. } => Some(Receiver::Array),
        IrType::Bytes => Some(Receiver::Bytes),
        _ => None,
    }
}

static TABLE: Lazy<HashMap<(Receiver, &'static str, usize), Intrinsic>> = Lazy::new(|| {
    use Intrinsic::*;
    use Receiver::*;
    let entries: &[(Receiver, &'static str, usize, Intrinsic)] = &[
        (Int, "+", 1, IntAdd),
        (Int, "-", 1, IntSub),
        (Int, "*", 1, IntMul),
        (Int, "~/", 1, IntDiv),
        (Int, "%", 1, IntMod),
        (Int, "unary-", 0, IntNeg),
        (Int, "==", 1, IntEq),
        (Int, "!=", 1, IntNe),
        (Int, "<", 1, IntLt),
        (Int, "<=", 1, IntLe),
        (Int, ">", 1, IntGt),
        (Int, ">=", 1, IntGe),
        (Int, "toDouble", 0, IntToDouble),
        (Double, "+", 1, DoubleAdd),
        (Double, "-", 1, DoubleSub),
        (Double, "*", 1, DoubleMul),
        (Double, "/", 1, DoubleDiv),
        (Double, "unary-", 0, DoubleNeg),
        (Double, "sqrt", 0, DoubleSqrt),
        (Double, "==", 1, DoubleEq),
        (Double, "!=", 1, DoubleNe),
        (Double, "<", 1, DoubleLt),
        (Double, "<=", 1, DoubleLe),
        (Double, ">", 1, DoubleGt),
        (Double, ">=", 1, DoubleGe),
        (Double, "toInt", 0, DoubleToInt),
        (Bool, "==", 1, BoolEq),
        (Array, "[]", 1, ArrayGet),
        (Array, "[]=", 2, ArraySet),
        (Array, "length", 0, ArrayLength),
        (Bytes, "[]", 1, BytesGet),
        (Bytes, "length", 0, BytesLength),
    ];
    entries
        .iter()
        .map(|&(recv, name, arity, intrinsic)| ((recv, name, arity), intrinsic))
        .collect()
});

/// Resolve an instance call against the intrinsic table.
pub fn resolve(receiver: &IrType, name: &str, arity: usize) -> Option<Intrinsic> {
    let receiver = receiver_of(receiver)?;
    TABLE.get(&(receiver, name, arity)).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_arithmetic_resolves() {
        assert_eq!(resolve(&IrType::Int, "+", 1), Some(Intrinsic::IntAdd));
        assert_eq!(resolve(&IrType::Double, "/", 1), Some(Intrinsic::DoubleDiv));
        assert_eq!(resolve(&IrType::Int, "unary-", 0), Some(Intrinsic::IntNeg));
    }

    #[test]
    fn array_access_resolves_only_for_non_nullable_receivers() {
        let array = IrType::array(IrType::Int);
        assert_eq!(resolve(&array, "[]", 1), Some(Intrinsic::ArrayGet));
        assert_eq!(resolve(&array.as_nullable(), "[]", 1), None);
    }

    #[test]
    fn unknown_selectors_fall_through_to_real_calls() {
        assert_eq!(resolve(&IrType::Int, "toString", 0), None);
        assert_eq!(resolve(&IrType::Bool, "+", 1), None);
    }
}
