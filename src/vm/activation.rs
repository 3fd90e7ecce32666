//! Call stack and catch stack records

use crate::gc::CellRef;
use bitflags::bitflags;

bitflags! {
    /// Flags on an activation record
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct ActivationFlags: u8 {
        const STRICT = 1 << 0;
        const TAILCALLED = 1 << 1;
        const CONSTRUCT = 1 << 2;
        /// A native frame that cannot be suspended across
        const PREVENT_YIELD = 1 << 3;
        const DIRECT_EVAL = 1 << 4;
    }
}

/// An entry on a thread's call stack
///
/// Owns one reference to each of `func`, `var_env`, `lex_env` and
/// `prev_caller`. Environments may be created lazily and start out `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationRecord {
    pub func: CellRef,
    pub var_env: Option<CellRef>,
    pub lex_env: Option<CellRef>,
    pub prev_caller: Option<CellRef>,
    pub pc: u32,
    pub flags: ActivationFlags,
    /// Value stack bottom for this frame
    pub idx_bottom: usize,
    /// Where the return value goes in the caller's frame
    pub idx_retval: usize,
}

impl ActivationRecord {
    pub fn new(func: CellRef) -> Self {
        ActivationRecord {
            func,
            var_env: None,
            lex_env: None,
            prev_caller: None,
            pc: 0,
            flags: ActivationFlags::empty(),
            idx_bottom: 0,
            idx_retval: 0,
        }
    }

    pub fn with_envs(mut self, var_env: Option<CellRef>, lex_env: Option<CellRef>) -> Self {
        self.var_env = var_env;
        self.lex_env = lex_env;
        self
    }

    pub fn with_flags(mut self, flags: ActivationFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_caller(mut self, caller: Option<CellRef>) -> Self {
        self.prev_caller = caller;
        self
    }

    pub fn with_stack(mut self, idx_bottom: usize, idx_retval: usize) -> Self {
        self.idx_bottom = idx_bottom;
        self.idx_retval = idx_retval;
        self
    }

    /// Visit every reference this record owns
    pub fn for_each_ref(&self, f: &mut impl FnMut(CellRef)) {
        f(self.func);
        for r in [self.var_env, self.lex_env, self.prev_caller]
            .into_iter()
            .flatten()
        {
            f(r);
        }
    }
}

/// Kind of catch stack entry
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchType {
    Unknown = 0,
    /// try/catch/finally
    Tcf = 1,
    /// labelled break/continue target
    Label = 2,
}

impl CatchType {
    fn from_bits(bits: u32) -> Self {
        match bits {
            1 => CatchType::Tcf,
            2 => CatchType::Label,
            _ => CatchType::Unknown,
        }
    }
}

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct CatchFlags: u8 {
        const CATCH_ENABLED = 1 << 0;
        const FINALLY_ENABLED = 1 << 1;
        const CATCH_BINDING_ENABLED = 1 << 2;
        const LEXENV_ACTIVE = 1 << 3;
    }
}

/// An entry on a thread's catch stack
///
/// `varname` is borrowed from the owning activation's function and holds no
/// count; it stays valid only while that activation is on the call stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchRecord {
    pub varname: Option<CellRef>,
    /// Index of the owning activation
    pub callstack_index: usize,
    pub idx_base: usize,
    pub pc_base: u32,
    /// Packed word (from LSB):
    /// - Bits 0-3: catch type
    /// - Bits 4-7: catch flags
    /// - Bits 8-31: label number
    flags: u32,
}

impl CatchRecord {
    const TYPE_MASK: u32 = 0x0f;
    const FLAGS_SHIFT: u32 = 4;
    const LABEL_SHIFT: u32 = 8;

    /// Largest label that fits the packed word
    pub const MAX_LABEL: u32 = (1 << (32 - Self::LABEL_SHIFT)) - 1;

    pub fn new(kind: CatchType, callstack_index: usize, idx_base: usize, pc_base: u32) -> Self {
        CatchRecord {
            varname: None,
            callstack_index,
            idx_base,
            pc_base,
            flags: kind as u32,
        }
    }

    #[inline]
    pub fn kind(&self) -> CatchType {
        CatchType::from_bits(self.flags & Self::TYPE_MASK)
    }

    #[inline]
    pub fn catch_flags(&self) -> CatchFlags {
        CatchFlags::from_bits_truncate((self.flags >> Self::FLAGS_SHIFT) as u8)
    }

    pub fn set_catch_flags(&mut self, flags: CatchFlags) {
        self.flags = (self.flags & !(0xf << Self::FLAGS_SHIFT))
            | ((flags.bits() as u32) << Self::FLAGS_SHIFT);
    }

    #[inline]
    pub fn label(&self) -> u32 {
        self.flags >> Self::LABEL_SHIFT
    }

    pub fn set_label(&mut self, label: u32) {
        debug_assert!(label <= Self::MAX_LABEL);
        self.flags = (self.flags & ((1 << Self::LABEL_SHIFT) - 1))
            | ((label & Self::MAX_LABEL) << Self::LABEL_SHIFT);
    }

    pub fn with_varname(mut self, varname: CellRef) -> Self {
        self.varname = Some(varname);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activation_refs() {
        let f = CellRef::from_parts(1, 0);
        let env = CellRef::from_parts(2, 0);
        let act = ActivationRecord::new(f).with_envs(Some(env), None);

        let mut refs = Vec::new();
        act.for_each_ref(&mut |r| refs.push(r));
        assert_eq!(refs, vec![f, env]);
    }

    #[test]
    fn test_catch_packing() {
        let mut rec = CatchRecord::new(CatchType::Tcf, 0, 4, 12);
        assert_eq!(rec.kind(), CatchType::Tcf);
        assert!(rec.catch_flags().is_empty());

        rec.set_catch_flags(CatchFlags::CATCH_ENABLED | CatchFlags::FINALLY_ENABLED);
        rec.set_label(1234);
        assert_eq!(rec.kind(), CatchType::Tcf);
        assert_eq!(rec.label(), 1234);
        assert!(rec.catch_flags().contains(CatchFlags::FINALLY_ENABLED));
        assert!(!rec.catch_flags().contains(CatchFlags::LEXENV_ACTIVE));

        rec.set_catch_flags(CatchFlags::LEXENV_ACTIVE);
        assert_eq!(rec.catch_flags(), CatchFlags::LEXENV_ACTIVE);
        assert_eq!(rec.label(), 1234);
    }

    #[test]
    fn test_max_label() {
        let mut rec = CatchRecord::new(CatchType::Label, 0, 0, 0);
        rec.set_label(CatchRecord::MAX_LABEL);
        assert_eq!(rec.label(), CatchRecord::MAX_LABEL);
        assert_eq!(rec.kind(), CatchType::Label);
    }
}
