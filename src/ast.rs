//! The AST shape consumed from the (out-of-scope) compiler (spec.md §6.1).
//!
//! These are plain data — the parser/resolver that produces them and the
//! bytecode compiler that lowers them are external collaborators (spec.md
//! §1). The engine itself only executes the bytecode in `program.rs`; this
//! module exists so a host can describe the external interface boundary in
//! one place, and so config-meta positions can be round-tripped through
//! fixtures in tests.

use crate::diagnostics::CodeRange;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Module {
    pub filename: String,
    pub pkgpath: String,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Node<T> {
    pub node: T,
    pub pos: CodeRange,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Stmt {
    Import(ImportStmt),
    Schema(SchemaStmt),
    Rule(RuleStmt),
    Assign(AssignStmt),
    AugAssign(AugAssignStmt),
    Assert(AssertStmt),
    If(IfStmt),
    Unification(UnificationStmt),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ImportStmt {
    pub path: String,
    pub asname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AssignOp {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    LShift,
    RShift,
    BitAnd,
    BitOr,
    BitXor,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AssignStmt {
    pub targets: Vec<String>,
    pub value: Expr,
    pub type_annotation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AugAssignStmt {
    pub target: String,
    pub op: AssignOp,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AssertStmt {
    pub test: Expr,
    pub if_cond: Option<Expr>,
    pub msg: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct IfStmt {
    pub cond: Expr,
    pub body: Vec<Stmt>,
    pub orelse: Vec<Stmt>,
}

/// `target: value` — the `:` unification operator (spec.md §4.3 `Unification`).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct UnificationStmt {
    pub target: String,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SchemaIndexSignature {
    pub key_name: Option<String>,
    pub key_type: String,
    pub value_type: String,
    pub value: Option<Expr>,
    pub any_other: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SchemaAttr {
    pub name: String,
    pub type_str: String,
    pub op: Option<AssignOp>,
    pub value: Option<Expr>,
    pub is_optional: bool,
    pub is_final: bool,
    pub decorators: Vec<Decorator>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Decorator {
    pub name: String,
    pub args: Vec<Expr>,
    pub kwargs: Vec<(String, Expr)>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SchemaStmt {
    pub name: String,
    pub parent_name: Option<String>,
    pub mixins: Vec<String>,
    pub args: Vec<String>,
    pub body: Vec<Stmt>,
    pub checks: Vec<AssertStmt>,
    pub decorators: Vec<Decorator>,
    pub index_signature: Option<SchemaIndexSignature>,
    /// Host-facing display name, distinct from `name` for schemas reached
    /// through a relaxed/for-host alias.
    pub for_host_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RuleStmt {
    pub name: String,
    pub parent_rules: Vec<String>,
    pub args: Vec<String>,
    pub checks: Vec<AssertStmt>,
    pub decorators: Vec<Decorator>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    LShift,
    RShift,
    BitAnd,
    BitOr,
    BitXor,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    In,
    NotIn,
    Is,
    IsNot,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UnaryOp {
    Pos,
    Neg,
    Invert,
    Not,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Literal {
    None,
    Undefined,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    NumberMultiplier(i64, String),
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ConfigEntry {
    pub key: Option<Expr>,
    pub value: Expr,
    pub op: ConfigOp,
    pub insert_index: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ConfigOp {
    Union,
    Override,
    Insert,
    Unique,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CompFor {
    pub targets: Vec<String>,
    pub iter: Expr,
    pub ifs: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FormattedString {
    pub parts: Vec<StringPart>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum StringPart {
    Literal(String),
    Formatted { expr: Box<Expr>, spec: String },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Expr {
    Literal(Literal),
    Identifier(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
    Call { func: Box<Expr>, args: Vec<Expr>, kwargs: Vec<(String, Expr)> },
    Subscript { value: Box<Expr>, index: Box<Expr> },
    Slice { value: Box<Expr>, start: Option<Box<Expr>>, stop: Option<Box<Expr>>, step: Option<Box<Expr>> },
    Selector { value: Box<Expr>, attr: String },
    List(Vec<Expr>),
    ListIfEntry { body: Box<Expr>, cond: Box<Expr>, orelse: Option<Box<Expr>> },
    Config(Vec<ConfigEntry>),
    ConfigIfEntry { cond: Box<Expr>, body: Vec<ConfigEntry>, orelse: Vec<ConfigEntry> },
    ListComp { elt: Box<Expr>, generators: Vec<CompFor> },
    DictComp { key: Box<Expr>, value: Box<Expr>, generators: Vec<CompFor> },
    Schema { name: String, config: Box<Expr>, args: Vec<Expr>, kwargs: Vec<(String, Expr)> },
    Lambda { params: Vec<String>, body: Vec<Stmt>, return_expr: Option<Box<Expr>> },
    Quantifier { op: QuantOp, targets: Vec<String>, iter: Box<Expr>, test: Box<Expr>, if_cond: Option<Box<Expr>> },
    JoinedString(FormattedString),
    Unpack(Box<Expr>, UnpackStar),
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum QuantOp {
    All,
    Any,
    Filter,
    Map,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UnpackStar {
    Single,
    Double,
}
