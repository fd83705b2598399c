//! The typed program tree handed to the SSA builder.
//!
//! This is the input contract with the external front end: every
//! expression carries a resolved type, every identifier is bound to a
//! declaration visible in scope, and every storage variable has a
//! pre-assigned numeric slot. Nothing here parses or checks anything.
use smol_str::SmolStr;

use crate::{
    inst::{BinOp, CastOp, EnvOp, UnOp},
    span::SourceSpan,
    types::Type,
    value::Immediate,
};

pub struct TypedProgram {
    pub storage: Vec<StorageVar>,
    /// Runtime entry point.
    pub main: TypedFunc,
    /// Optional constructor.
    pub create: Option<TypedFunc>,
    /// User-defined functions, in declaration order.
    pub funcs: Vec<TypedFunc>,
}

#[derive(Debug, Clone)]
pub struct StorageVar {
    pub name: SmolStr,
    pub slot: u32,
    pub ty: Type,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: SmolStr,
    pub ty: Type,
}

#[derive(Debug, Clone)]
pub struct TypedFunc {
    pub name: SmolStr,
    pub params: Vec<Param>,
    pub ret_ty: Type,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Let {
        name: SmolStr,
        ty: Type,
        init: Expr,
        span: SourceSpan,
    },
    Assign {
        name: SmolStr,
        value: Expr,
        span: SourceSpan,
    },
    StorageAssign {
        slot: u32,
        index: Option<Expr>,
        value: Expr,
        span: SourceSpan,
    },
    MemWrite {
        addr: Expr,
        value: Expr,
        span: SourceSpan,
    },
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
        span: SourceSpan,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
        span: SourceSpan,
    },
    Break {
        span: SourceSpan,
    },
    Continue {
        span: SourceSpan,
    },
    Return {
        value: Option<Expr>,
        span: SourceSpan,
    },
    Expr {
        expr: Expr,
    },
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: Type,
    pub span: SourceSpan,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Imm(Immediate),
    Str(Box<str>),
    Var(SmolStr),
    Bin(BinOp, Box<Expr>, Box<Expr>),
    Un(UnOp, Box<Expr>),
    Env(EnvOp),
    Hash {
        addr: Box<Expr>,
        len: Box<Expr>,
    },
    Cast(CastOp, Box<Expr>),
    Len(Box<Expr>),
    StorageLoad {
        slot: u32,
        index: Option<Box<Expr>>,
    },
    MemRead(Box<Expr>),
    Alloc(Box<Expr>),
    Call {
        callee: SmolStr,
        args: Vec<Expr>,
    },
}

impl Expr {
    pub fn new(kind: ExprKind, ty: Type, span: SourceSpan) -> Self {
        Self { kind, ty, span }
    }

    /// A word immediate.
    pub fn word(value: u64, span: SourceSpan) -> Self {
        Self::new(ExprKind::Imm(Immediate::from(value)), Type::I256, span)
    }

    pub fn boolean(value: bool, span: SourceSpan) -> Self {
        Self::new(ExprKind::Imm(Immediate::from(value)), Type::I1, span)
    }

    pub fn var(name: &str, ty: Type, span: SourceSpan) -> Self {
        Self::new(ExprKind::Var(name.into()), ty, span)
    }

    pub fn bin(code: BinOp, ty: Type, lhs: Expr, rhs: Expr, span: SourceSpan) -> Self {
        Self::new(ExprKind::Bin(code, lhs.into(), rhs.into()), ty, span)
    }
}
