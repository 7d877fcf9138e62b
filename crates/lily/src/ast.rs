//! The expression tree pool and merge rules.
//!
//! Every tree is either a value or an operation to perform. Two positions
//! matter while an expression builds: `active`, which new trees merge
//! against, and `root`, which holds everything. Values merge by absorption
//! (the new tree swallows the current one as its first argument). Unary
//! trees are right-to-left, so new values descend to the lowest unary's
//! empty slot. Binary trees carry a priority: a higher (or right-assoc)
//! incomer steals the active tree's right child; a lower one walks up the
//! parent chain and inserts above.
//!
//! Nested calls, subscripts, and other argument collectors push a save
//! entry of `(root, active, entered)` so commas and closers restore the
//! outer expression. Lambda bodies freeze the whole pool state and thaw it
//! afterward, which is the one mechanism allowing recursive compilation.

use crate::{
    sig::SigId,
    symtab::{ClassId, VarId},
    value::FunctionId,
};

pub(crate) type AstId = usize;

/// Binary and unary operators as the parser saw them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExprOp {
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    LeftShift,
    RightShift,
    BitAnd,
    BitOr,
    BitXor,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    LogicalAnd,
    LogicalOr,
    Assign,
    PlusAssign,
    MinusAssign,
    MulAssign,
    DivAssign,
    ModAssign,
    LeftShiftAssign,
    RightShiftAssign,
    AndAssign,
    OrAssign,
    XorAssign,
    UnaryNot,
    UnaryMinus,
}

impl ExprOp {
    /// Higher binds tighter. Zero marks the right-associative assignment
    /// family. Bitwise ops sit above comparisons on purpose, so
    /// `a & 0x10 == x` reads as `(a & 0x10) == x` without parens.
    pub fn priority(self) -> u8 {
        match self {
            Self::Assign
            | Self::PlusAssign
            | Self::MinusAssign
            | Self::MulAssign
            | Self::DivAssign
            | Self::ModAssign
            | Self::LeftShiftAssign
            | Self::RightShiftAssign
            | Self::AndAssign
            | Self::OrAssign
            | Self::XorAssign => 0,
            Self::LogicalOr => 1,
            Self::LogicalAnd => 2,
            Self::EqEq | Self::NotEq => 3,
            Self::Lt | Self::LtEq | Self::Gt | Self::GtEq => 4,
            Self::BitOr => 5,
            Self::BitXor => 6,
            Self::BitAnd => 7,
            Self::LeftShift | Self::RightShift => 8,
            Self::Plus | Self::Minus => 9,
            Self::Multiply | Self::Divide | Self::Modulo => 10,
            Self::UnaryNot | Self::UnaryMinus => 11,
        }
    }

    pub fn is_assign_family(self) -> bool {
        self.priority() == 0
    }

    /// The arithmetic op a compound assignment expands into.
    pub fn compound_base(self) -> Option<Self> {
        match self {
            Self::PlusAssign => Some(Self::Plus),
            Self::MinusAssign => Some(Self::Minus),
            Self::MulAssign => Some(Self::Multiply),
            Self::DivAssign => Some(Self::Divide),
            Self::ModAssign => Some(Self::Modulo),
            Self::LeftShiftAssign => Some(Self::LeftShift),
            Self::RightShiftAssign => Some(Self::RightShift),
            Self::AndAssign => Some(Self::BitAnd),
            Self::OrAssign => Some(Self::BitOr),
            Self::XorAssign => Some(Self::BitXor),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
            Self::Modulo => "%",
            Self::LeftShift => "<<",
            Self::RightShift => ">>",
            Self::BitAnd => "&",
            Self::BitOr => "|",
            Self::BitXor => "^",
            Self::EqEq => "==",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::LogicalAnd => "&&",
            Self::LogicalOr => "||",
            Self::Assign => "=",
            Self::PlusAssign => "+=",
            Self::MinusAssign => "-=",
            Self::MulAssign => "*=",
            Self::DivAssign => "/=",
            Self::ModAssign => "%=",
            Self::LeftShiftAssign => "<<=",
            Self::RightShiftAssign => ">>=",
            Self::AndAssign => "&=",
            Self::OrAssign => "|=",
            Self::XorAssign => "^=",
            Self::UnaryNot => "!",
            Self::UnaryMinus => "-",
        }
    }
}

/// What a tree is. Value kinds carry what they refer to; enterable kinds
/// collect arguments.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TreeKind {
    LocalVar { var: VarId },
    GlobalVar { var: VarId },
    /// An interned literal.
    Readonly { literal: u16 },
    /// A `define`d method (or class constructor) referenced as a value.
    DefinedFunc { func: FunctionId },
    /// An upvalue: a local belonging to an enclosing method.
    Upvalue { var: VarId },
    /// An enum variant used as a constructor.
    VariantCtor { class: ClassId, variant: u16 },
    /// A registered package named in an expression; only its members can
    /// be used as values.
    PackageRef { package: u16 },
    Call,
    Subscript,
    ListTree,
    HashTree,
    TupleTree,
    Parenth,
    Typecast,
    /// A compiled lambda body waiting to be loaded as a value.
    Lambda { func: FunctionId },
    Binary,
    Unary,
    /// Dotted lookup: `value.name`. The member resolves at emit time.
    OoAccess { name: String },
    /// The target signature of a typecast.
    SigTree { sig: SigId },
}

impl TreeKind {
    fn is_enterable(&self) -> bool {
        matches!(
            self,
            Self::Call
                | Self::Subscript
                | Self::ListTree
                | Self::HashTree
                | Self::TupleTree
                | Self::Parenth
                | Self::Typecast
                | Self::OoAccess { .. }
        )
    }
}

#[derive(Debug)]
pub(crate) struct Ast {
    pub kind: TreeKind,
    pub line: u16,
    pub parent: Option<AstId>,
    /// Binary left / the unary operand.
    pub left: Option<AstId>,
    pub right: Option<AstId>,
    pub op: Option<ExprOp>,
    pub priority: u8,
    pub args: Vec<AstId>,
}

impl Ast {
    fn new(kind: TreeKind, line: u16) -> Self {
        Self {
            kind,
            line,
            parent: None,
            left: None,
            right: None,
            op: None,
            priority: 0,
            args: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct SaveEntry {
    root: Option<AstId>,
    active: Option<AstId>,
    entered: AstId,
}

/// Complete expression state, set aside while a lambda body compiles.
#[derive(Debug)]
struct FrozenState {
    nodes: Vec<Ast>,
    root: Option<AstId>,
    active: Option<AstId>,
    saves: Vec<SaveEntry>,
}

#[derive(Debug, Default)]
pub(crate) struct AstPool {
    nodes: Vec<Ast>,
    root: Option<AstId>,
    active: Option<AstId>,
    saves: Vec<SaveEntry>,
    frozen: Vec<FrozenState>,
}

impl AstPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: AstId) -> &Ast {
        &self.nodes[id]
    }

    pub fn get_mut(&mut self, id: AstId) -> &mut Ast {
        &mut self.nodes[id]
    }

    pub fn root(&self) -> Option<AstId> {
        self.root
    }

    /// Nesting depth of entered trees. Zero means a comma or closer would
    /// end the expression.
    pub fn save_depth(&self) -> usize {
        self.saves.len()
    }

    pub fn has_value(&self) -> bool {
        self.root.is_some()
    }

    /// Clears the pool for the next expression, keeping capacity.
    pub fn reset(&mut self) {
        self.nodes.clear();
        self.root = None;
        self.active = None;
        self.saves.clear();
    }

    /// Sets the whole expression state aside so a lambda body can compile
    /// with a fresh pool.
    pub fn freeze(&mut self) {
        let state = FrozenState {
            nodes: std::mem::take(&mut self.nodes),
            root: self.root.take(),
            active: self.active.take(),
            saves: std::mem::take(&mut self.saves),
        };
        self.frozen.push(state);
    }

    /// Restores the state saved by the matching [`freeze`](Self::freeze).
    pub fn thaw(&mut self) {
        let state = self.frozen.pop().expect("AstPool::thaw: nothing frozen");
        self.nodes = state.nodes;
        self.root = state.root;
        self.active = state.active;
        self.saves = state.saves;
    }

    fn alloc(&mut self, kind: TreeKind, line: u16) -> AstId {
        self.nodes.push(Ast::new(kind, line));
        self.nodes.len() - 1
    }

    // -- merging -----------------------------------------------------------

    /// The new tree swallows `given` as its first argument, taking over
    /// active/root if `given` held them.
    fn merge_absorb(&mut self, given: AstId, new_tree: AstId) {
        if Some(given) == self.active {
            self.active = Some(new_tree);
            if Some(given) == self.root {
                self.root = Some(new_tree);
            }
        }
        self.nodes[given].parent = Some(new_tree);
        self.nodes[new_tree].args.clear();
        self.nodes[new_tree].args.push(given);
    }

    /// Unary ops are right-to-left: descend to the lowest unary and merge
    /// against the value it holds.
    fn merge_unary(&mut self, mut given: AstId, new_tree: AstId) {
        while self.nodes[given].kind == TreeKind::Unary
            && self.nodes[given]
                .left
                .is_some_and(|left| self.nodes[left].kind == TreeKind::Unary)
        {
            given = self.nodes[given].left.expect("checked above");
        }

        match self.nodes[given].left {
            None => self.nodes[given].left = Some(new_tree),
            Some(left) => {
                // Not a unary or value below, so absorb the unary's value
                // and take its place.
                self.merge_absorb(left, new_tree);
                self.nodes[given].left = Some(new_tree);
            }
        }
        self.nodes[new_tree].parent = Some(given);
    }

    /// Merges any new tree against the current state.
    fn merge_value(&mut self, new_tree: AstId) {
        match self.active {
            Some(active) if self.nodes[active].kind == TreeKind::Binary => {
                match self.nodes[active].right {
                    None => {
                        self.nodes[active].right = Some(new_tree);
                        self.nodes[new_tree].parent = Some(active);
                    }
                    Some(right) if self.nodes[right].kind == TreeKind::Unary => {
                        // Unary merges right-to-left, so right stays put.
                        self.merge_unary(right, new_tree);
                    }
                    Some(right) => {
                        // Left-to-right merge: the new tree swallows the
                        // right child, and the parent link is refreshed.
                        self.merge_absorb(right, new_tree);
                        self.nodes[active].right = Some(new_tree);
                        self.nodes[new_tree].parent = Some(active);
                    }
                }
            }
            Some(active) if self.nodes[active].kind == TreeKind::Unary => {
                self.merge_unary(active, new_tree);
            }
            Some(active) => self.merge_absorb(active, new_tree),
            None => {
                self.root = Some(new_tree);
                self.active = Some(new_tree);
            }
        }
    }

    // -- pushes ------------------------------------------------------------

    /// Pushes a value tree.
    pub fn push_value(&mut self, kind: TreeKind, line: u16) {
        debug_assert!(!kind.is_enterable(), "use enter_tree for {kind:?}");
        let id = self.alloc(kind, line);
        self.merge_value(id);
    }

    /// Pushes a suffix tree (dotted access) that absorbs the value it
    /// follows as its object, without collecting further arguments.
    pub fn push_suffix(&mut self, kind: TreeKind, line: u16) {
        let id = self.alloc(kind, line);
        self.merge_value(id);
    }

    /// Converts an entered list literal into a hash literal when the
    /// first `=>` appears.
    pub fn morph_entered_to_hash(&mut self) {
        let entry = self.saves.last().expect("morph with no entered tree");
        let entered = entry.entered;
        if self.nodes[entered].kind == TreeKind::ListTree {
            self.nodes[entered].kind = TreeKind::HashTree;
        }
    }

    pub fn push_binary_op(&mut self, op: ExprOp, line: u16) {
        let new_ast = self.alloc(TreeKind::Binary, line);
        self.nodes[new_ast].op = Some(op);
        self.nodes[new_ast].priority = op.priority();

        // Binary always comes after a value of some kind.
        let active = self
            .active
            .expect("push_binary_op: no value before operator");

        if self.nodes[active].kind != TreeKind::Binary {
            // Only a value, unary, or call so far: the binary op takes over.
            if self.root == Some(active) {
                self.root = Some(new_ast);
            }
            self.nodes[new_ast].left = Some(active);
            self.nodes[active].parent = Some(new_ast);
            self.active = Some(new_ast);
            return;
        }

        let new_prio = self.nodes[new_ast].priority;
        let active_prio = self.nodes[active].priority;
        if new_prio > active_prio || new_prio == 0 {
            // The new tree binds tighter (or is right-assoc assignment), so
            // it steals the right side and becomes active.
            let stolen = self.nodes[active].right;
            self.nodes[new_ast].left = stolen;
            if let Some(stolen) = stolen {
                self.nodes[stolen].parent = Some(new_ast);
            }
            self.nodes[active].right = Some(new_ast);
            self.nodes[new_ast].parent = Some(active);
            self.active = Some(new_ast);
        } else {
            // This tree goes above the active one, and above any parent
            // with priority <= its own so equal ops run left-to-right.
            let mut tree = active;
            while let Some(parent) = self.nodes[tree].parent {
                if self.nodes[parent].kind != TreeKind::Binary
                    || new_prio > self.nodes[parent].priority
                {
                    break;
                }
                tree = parent;
            }
            match self.nodes[tree].parent {
                Some(parent) if self.nodes[parent].kind == TreeKind::Binary => {
                    // Linked-list style insertion between tree and parent.
                    if self.nodes[parent].left == Some(tree) {
                        self.nodes[parent].left = Some(new_ast);
                    } else {
                        self.nodes[parent].right = Some(new_ast);
                    }
                    self.nodes[new_ast].parent = Some(parent);
                }
                _ => {
                    self.root = Some(new_ast);
                    self.nodes[new_ast].parent = None;
                }
            }
            self.nodes[tree].parent = Some(new_ast);
            self.nodes[new_ast].left = Some(tree);
            self.active = Some(new_ast);
        }
    }

    pub fn push_unary_op(&mut self, op: ExprOp, line: u16) {
        let id = self.alloc(TreeKind::Unary, line);
        self.nodes[id].op = Some(op);
        self.nodes[id].priority = op.priority();
        self.merge_value(id);
    }

    // -- entered trees -----------------------------------------------------

    /// Begins a tree that collects comma-separated arguments.
    pub fn enter_tree(&mut self, kind: TreeKind, line: u16) {
        let id = self.alloc(kind, line);
        self.merge_value(id);
        self.saves.push(SaveEntry {
            root: self.root,
            active: self.active,
            entered: id,
        });
        self.root = None;
        self.active = None;
    }

    /// The kind of tree currently collecting arguments.
    pub fn caller_tree_kind(&self) -> &TreeKind {
        let entry = self.saves.last().expect("caller_tree_kind: no entered tree");
        &self.nodes[entry.entered].kind
    }

    fn push_tree_arg(&mut self, call: AstId, tree: Option<AstId>) {
        // Calls with zero args have no value, so tree may be absent.
        if let Some(tree) = tree {
            self.nodes[tree].parent = Some(call);
            self.nodes[call].args.push(tree);
        }
    }

    /// Takes the pool's root as the next argument of the entered tree and
    /// clears state for the argument after the comma.
    pub fn collect_arg(&mut self) {
        let entered = self.saves.last().expect("collect_arg: no entered tree").entered;
        let root = self.root;
        self.push_tree_arg(entered, root);
        self.root = None;
        self.active = None;
    }

    /// Closes the entered tree, restoring the outer expression state.
    pub fn leave_tree(&mut self) {
        let entry = self.saves.pop().expect("leave_tree: no entered tree");
        let root = self.root;
        self.push_tree_arg(entry.entered, root);
        self.root = entry.root;
        self.active = entry.active;
    }

    /// Enters a typecast, recording the target signature as its first
    /// argument. The value arrives as the second.
    pub fn enter_typecast(&mut self, sig: SigId, line: u16) {
        self.enter_tree(TreeKind::Typecast, line);
        let id = self.alloc(TreeKind::SigTree { sig }, line);
        self.merge_value(id);
        self.collect_arg();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn literal_pool() -> AstPool {
        AstPool::new()
    }

    fn lit(pool: &mut AstPool, n: u16) {
        pool.push_value(TreeKind::Readonly { literal: n }, 1);
    }

    /// 5 + 6 * 7 must nest the multiply under the add's right side.
    #[test]
    fn precedence_nests_tighter_ops_lower() {
        let mut pool = literal_pool();
        lit(&mut pool, 5);
        pool.push_binary_op(ExprOp::Plus, 1);
        lit(&mut pool, 6);
        pool.push_binary_op(ExprOp::Multiply, 1);
        lit(&mut pool, 7);

        let root = pool.root().unwrap();
        let root_node = pool.get(root);
        assert_eq!(root_node.op, Some(ExprOp::Plus));
        let right = pool.get(root_node.right.unwrap());
        assert_eq!(right.op, Some(ExprOp::Multiply));
        assert_eq!(
            pool.get(right.left.unwrap()).kind,
            TreeKind::Readonly { literal: 6 }
        );
        assert_eq!(
            pool.get(right.right.unwrap()).kind,
            TreeKind::Readonly { literal: 7 }
        );
    }

    /// 5 * 6 + 7 must hoist the add above the multiply.
    #[test]
    fn lower_priority_walks_up() {
        let mut pool = literal_pool();
        lit(&mut pool, 5);
        pool.push_binary_op(ExprOp::Multiply, 1);
        lit(&mut pool, 6);
        pool.push_binary_op(ExprOp::Plus, 1);
        lit(&mut pool, 7);

        let root = pool.get(pool.root().unwrap());
        assert_eq!(root.op, Some(ExprOp::Plus));
        assert_eq!(pool.get(root.left.unwrap()).op, Some(ExprOp::Multiply));
    }

    /// Equal priority runs left-to-right: 1 - 2 - 3 is (1 - 2) - 3.
    #[test]
    fn equal_priority_is_left_associative() {
        let mut pool = literal_pool();
        lit(&mut pool, 1);
        pool.push_binary_op(ExprOp::Minus, 1);
        lit(&mut pool, 2);
        pool.push_binary_op(ExprOp::Minus, 1);
        lit(&mut pool, 3);

        let root = pool.get(pool.root().unwrap());
        assert_eq!(root.op, Some(ExprOp::Minus));
        let left = pool.get(root.left.unwrap());
        assert_eq!(left.op, Some(ExprOp::Minus));
        assert_eq!(
            pool.get(root.right.unwrap()).kind,
            TreeKind::Readonly { literal: 3 }
        );
    }

    /// Assignment is right-associative: a = b = 1 nests to the right.
    #[test]
    fn assignment_is_right_associative() {
        let mut pool = literal_pool();
        lit(&mut pool, 10);
        pool.push_binary_op(ExprOp::Assign, 1);
        lit(&mut pool, 11);
        pool.push_binary_op(ExprOp::Assign, 1);
        lit(&mut pool, 12);

        let root = pool.get(pool.root().unwrap());
        assert_eq!(root.op, Some(ExprOp::Assign));
        let right = pool.get(root.right.unwrap());
        assert_eq!(right.op, Some(ExprOp::Assign));
    }

    /// Unary binds tighter than binary and is right-to-left.
    #[test]
    fn unary_descends_to_lowest() {
        let mut pool = literal_pool();
        lit(&mut pool, 1);
        pool.push_binary_op(ExprOp::Plus, 1);
        pool.push_unary_op(ExprOp::UnaryMinus, 1);
        pool.push_unary_op(ExprOp::UnaryNot, 1);
        lit(&mut pool, 2);

        let root = pool.get(pool.root().unwrap());
        assert_eq!(root.op, Some(ExprOp::Plus));
        let minus = pool.get(root.right.unwrap());
        assert_eq!(minus.op, Some(ExprOp::UnaryMinus));
        let not = pool.get(minus.left.unwrap());
        assert_eq!(not.op, Some(ExprOp::UnaryNot));
        assert_eq!(
            pool.get(not.left.unwrap()).kind,
            TreeKind::Readonly { literal: 2 }
        );
    }

    /// Entered trees save and restore the outer expression.
    #[test]
    fn save_stack_restores_outer_expression() {
        let mut pool = literal_pool();
        lit(&mut pool, 1);
        pool.push_binary_op(ExprOp::Plus, 1);
        pool.enter_tree(TreeKind::ListTree, 1);
        assert_eq!(pool.save_depth(), 1);
        lit(&mut pool, 2);
        pool.collect_arg();
        lit(&mut pool, 3);
        pool.leave_tree();
        assert_eq!(pool.save_depth(), 0);

        let root = pool.get(pool.root().unwrap());
        assert_eq!(root.op, Some(ExprOp::Plus));
        let list = pool.get(root.right.unwrap());
        assert_eq!(list.kind, TreeKind::ListTree);
        assert_eq!(list.args.len(), 2);
    }

    /// A call absorbs the value it follows as its first argument.
    #[test]
    fn call_absorbs_callee() {
        let mut pool = literal_pool();
        lit(&mut pool, 4);
        pool.enter_tree(TreeKind::Call, 1);
        lit(&mut pool, 5);
        pool.leave_tree();

        let root = pool.get(pool.root().unwrap());
        assert_eq!(root.kind, TreeKind::Call);
        assert_eq!(root.args.len(), 2);
        assert_eq!(
            pool.get(root.args[0]).kind,
            TreeKind::Readonly { literal: 4 }
        );
    }

    #[test]
    fn freeze_and_thaw_round_trip() {
        let mut pool = literal_pool();
        lit(&mut pool, 1);
        pool.push_binary_op(ExprOp::Plus, 1);
        pool.freeze();
        assert!(!pool.has_value());
        lit(&mut pool, 9);
        assert!(pool.has_value());
        pool.reset();
        pool.thaw();
        lit(&mut pool, 2);
        let root = pool.get(pool.root().unwrap());
        assert_eq!(root.op, Some(ExprOp::Plus));
    }
}
