//! Interned type signatures.
//!
//! A signature is a class plus an ordered list of sub-signatures, interned
//! into an arena so that id equality is type equality. Interning is a hash
//! lookup on `(class, subsigs, flags, template_pos)` keyed into the arena.
//!
//! Function signatures store the return signature first, parameters after.
//! Templates (generics) are signatures of the template class carrying
//! their position; substitution happens in the emitter at call sites.

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::symtab::ClassId;

/// Flag bit: a function signature whose final parameter collects varargs.
pub(crate) const SIG_IS_VARARGS: u8 = 0x1;
/// Flag bit: values of this signature can participate in reference cycles,
/// so they must be registered with the GC from creation.
pub(crate) const SIG_MAY_CIRCLE: u8 = 0x2;

/// Index into the signature arena. Equality of ids is equality of types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SigId(u32);

impl SigId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Sig {
    pub class: ClassId,
    /// For `List[T]` the element; for `Hash[K, V]` key then value; for
    /// functions the return followed by the parameters; for tuples the
    /// member types.
    pub subsigs: SmallVec<[SigId; 4]>,
    pub flags: u8,
    /// Position of a template signature (`A` = 0, `B` = 1, ...). Zero for
    /// everything that is not a template.
    pub template_pos: u16,
}

impl Sig {
    pub fn is_varargs(&self) -> bool {
        self.flags & SIG_IS_VARARGS != 0
    }

    pub fn may_circle(&self) -> bool {
        self.flags & SIG_MAY_CIRCLE != 0
    }

    /// The return signature of a function sig.
    ///
    /// # Panics
    /// Panics if called on a signature with no subsigs.
    pub fn func_return(&self) -> SigId {
        self.subsigs[0]
    }

    /// The parameter signatures of a function sig.
    pub fn func_params(&self) -> &[SigId] {
        &self.subsigs[1..]
    }
}

/// Arena of interned signatures.
///
/// Owned by the symbol table; everything else refers to signatures by
/// [`SigId`] only.
#[derive(Debug, Default)]
pub(crate) struct SigPool {
    sigs: Vec<Sig>,
    interned: AHashMap<Sig, SigId>,
}

impl SigPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the unique id for a signature with these structural
    /// contents, allocating it on first sight.
    pub fn intern(&mut self, sig: Sig) -> SigId {
        if let Some(&id) = self.interned.get(&sig) {
            return id;
        }
        let id = SigId(u32::try_from(self.sigs.len()).expect("signature arena exceeds u32"));
        self.sigs.push(sig.clone());
        self.interned.insert(sig, id);
        id
    }

    #[must_use]
    pub fn get(&self, id: SigId) -> &Sig {
        &self.sigs[id.index()]
    }

    pub fn len(&self) -> usize {
        self.sigs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple(class: ClassId) -> Sig {
        Sig {
            class,
            subsigs: SmallVec::new(),
            flags: 0,
            template_pos: 0,
        }
    }

    #[test]
    fn interning_is_structural() {
        let mut pool = SigPool::new();
        let a = pool.intern(simple(ClassId(0)));
        let b = pool.intern(simple(ClassId(0)));
        let c = pool.intern(simple(ClassId(1)));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn subsigs_distinguish() {
        let mut pool = SigPool::new();
        let int = pool.intern(simple(ClassId(0)));
        let dbl = pool.intern(simple(ClassId(1)));
        let list_int = pool.intern(Sig {
            class: ClassId(7),
            subsigs: SmallVec::from_slice(&[int]),
            flags: 0,
            template_pos: 0,
        });
        let list_dbl = pool.intern(Sig {
            class: ClassId(7),
            subsigs: SmallVec::from_slice(&[dbl]),
            flags: 0,
            template_pos: 0,
        });
        assert_ne!(list_int, list_dbl);
    }
}
