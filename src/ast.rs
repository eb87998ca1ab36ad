// AST node definitions.
//
// The parser produces "raw" nodes in which path plumbing (`.`, infix `[`,
// `{`, `^`, `@`, `#`) appears as operator nodes; the normalizer folds those
// into Path nodes whose steps carry predicates, stages, grouping, sorting
// and focus/index/ancestor bindings directly.

use std::sync::Arc;

use crate::signature::Signature;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Concat,
    And,
    Or,
    In,
    Range,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Equal => "=",
            BinaryOp::NotEqual => "!=",
            BinaryOp::Less => "<",
            BinaryOp::LessEqual => "<=",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterEqual => ">=",
            BinaryOp::Concat => "&",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::In => "in",
            BinaryOp::Range => "..",
        }
    }
}

/// One term of an order-by clause: `^(expr, >expr, ...)`.
#[derive(Debug, Clone)]
pub struct SortTerm {
    pub expr: Node,
    pub descending: bool,
}

/// Grouping attached to a path: `expr{key: value, ...}`.
#[derive(Debug, Clone)]
pub struct GroupBy {
    pub pairs: Vec<(Node, Node)>,
    pub position: usize,
}

/// A post-binding operation on a step. Predicates that syntactically follow
/// a focus binding cannot be fused into the step itself; they run as stages
/// over the bound tuples.
#[derive(Debug, Clone)]
pub enum Stage {
    Filter(Node),
    Index(String),
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    // literals
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Regex(Arc<regex::Regex>),

    // terms
    Name(String),
    Variable(String),
    Wildcard,
    Descendant,
    /// Raw `%` before ancestor resolution.
    ParentOp,
    /// `%` resolved to an ancestor slot index.
    Parent(usize),

    // structure
    Block(Vec<Node>),
    ArrayCtor(Vec<Node>),
    ObjectCtor(Vec<(Node, Node)>),

    // operators
    Negate(Box<Node>),
    Binary(BinaryOp, Box<Node>, Box<Node>),
    Bind(String, Box<Node>),
    Condition {
        condition: Box<Node>,
        then_branch: Box<Node>,
        else_branch: Option<Box<Node>>,
    },
    Lambda {
        params: Vec<String>,
        signature: Option<Signature>,
        body: Arc<Node>,
        /// Marks a synthetic zero-parameter lambda wrapping a tail-position
        /// call; evaluating it yields a pending-call thunk.
        thunk: bool,
    },
    FunctionCall {
        procedure: Box<Node>,
        args: Vec<Node>,
    },
    /// A call with `?` placeholders among the args.
    PartialCall {
        procedure: Box<Node>,
        args: Vec<Node>,
    },
    Placeholder,
    /// `lhs ~> rhs` function application.
    Apply(Box<Node>, Box<Node>),
    Transform {
        pattern: Box<Node>,
        update: Box<Node>,
        delete: Option<Box<Node>>,
    },

    // raw path plumbing, folded by the normalizer
    PathOp(Box<Node>, Box<Node>),
    FilterOp(Box<Node>, Box<Node>),
    GroupOp(Box<Node>, Vec<(Node, Node)>),
    SortOp(Box<Node>, Vec<SortTerm>),
    FocusOp(Box<Node>, String),
    IndexOp(Box<Node>, String),

    // normalized
    Path {
        steps: Vec<Node>,
    },
    /// Sort appears as a dedicated step inside a normalized path.
    Sort(Vec<SortTerm>),

    /// Sentinel emitted in recovery mode where an expression was expected.
    ErrorStub,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub position: usize,

    /// `[]` keep-array marker on this step.
    pub keep_array: bool,
    /// Set on ArrayCtor steps so path flattening leaves the constructed
    /// array intact.
    pub cons_array: bool,
    /// On Path nodes: the final step carried the keep-array marker.
    pub keep_singleton_array: bool,
    /// This step (or path) participates in a tuple stream.
    pub tuple: bool,

    /// Filters fused into the step, applied per result item.
    pub predicates: Vec<Node>,
    /// Post-binding operations, applied to the step's tuple stream.
    pub stages: Vec<Stage>,
    /// Grouping attached to the whole path (or to this step's result).
    pub group: Option<GroupBy>,
    /// `@$var` focus binding on this step.
    pub focus: Option<String>,
    /// `#$var` index binding on this step.
    pub index: Option<String>,
    /// Ancestor slot this step must record for a downstream `%`.
    pub ancestor: Option<usize>,
}

impl Node {
    pub fn new(kind: NodeKind, position: usize) -> Node {
        Node {
            kind,
            position,
            keep_array: false,
            cons_array: false,
            keep_singleton_array: false,
            tuple: false,
            predicates: Vec::new(),
            stages: Vec::new(),
            group: None,
            focus: None,
            index: None,
            ancestor: None,
        }
    }
}
