//! Expression AST
//!
//! An expression is a tree of constants, port references and function calls.
//! Call nodes of stateful functions (HELD, DELAY, HYST) carry their state, so an
//! expression instance belongs to exactly one port.

use crate::deps::{Dep, DepSet};
use crate::error::{EvalError, EvalResult};
use crate::eval::EvalContext;
use crate::functions::{self, CallState, FuncKind, Function};
use crate::Value;

/// Reference to a port value
#[derive(Debug, Clone)]
pub struct PortRef {
    /// Referenced port id (the owning port's id for self references)
    pub id: String,
    /// Written as `$` or `$self`
    pub self_ref: bool,
    /// Byte offset in the source
    pub pos: usize,
}

/// Function call node
#[derive(Debug, Clone)]
pub struct Call {
    pub func: &'static Function,
    pub args: Vec<Expression>,
    pub pos: usize,
    state: CallState,
}

impl Call {
    pub(crate) fn new(func: &'static Function, args: Vec<Expression>, pos: usize) -> Self {
        Self {
            state: func.initial_state(),
            func,
            args,
            pos,
        }
    }

    fn eval(&mut self, ctx: &EvalContext) -> EvalResult<Value> {
        if self.func.kind == FuncKind::If {
            let cond = self.args[0].eval(ctx)?;
            let branch = if cond.as_bool() { 1 } else { 2 };
            return self.args[branch].eval(ctx);
        }

        let values = self
            .args
            .iter_mut()
            .map(|arg| arg.eval(ctx))
            .collect::<EvalResult<Vec<_>>>()?;

        functions::apply(self.func.kind, &values, &mut self.state, ctx)
    }
}

/// A parsed expression
#[derive(Debug, Clone)]
pub enum Expression {
    Constant(Value),
    PortRef(PortRef),
    Call(Call),
}

impl Expression {
    /// Dependencies of this expression; `asap` when nothing else applies
    pub fn deps(&self) -> DepSet {
        let mut deps = DepSet::new();
        self.collect_deps(&mut deps);
        if deps.is_empty() {
            deps.insert(Dep::Asap);
        }
        deps
    }

    fn collect_deps(&self, deps: &mut DepSet) {
        match self {
            Expression::Constant(_) => {}
            Expression::PortRef(r) => {
                deps.insert(Dep::Port(r.id.clone()));
            }
            Expression::Call(call) => {
                if let Some(dep) = call.func.clock_dep(call.args.len()) {
                    deps.insert(dep);
                }
                for arg in &call.args {
                    arg.collect_deps(deps);
                }
            }
        }
    }

    /// Ids of ports referenced other than through a self reference
    pub fn external_refs(&self) -> Vec<&PortRef> {
        let mut refs = Vec::new();
        self.collect_external(&mut refs);
        refs
    }

    fn collect_external<'a>(&'a self, refs: &mut Vec<&'a PortRef>) {
        match self {
            Expression::Constant(_) => {}
            Expression::PortRef(r) => {
                if !r.self_ref {
                    refs.push(r);
                }
            }
            Expression::Call(call) => {
                for arg in &call.args {
                    arg.collect_external(refs);
                }
            }
        }
    }

    /// Evaluate against a context, updating state of stateful nodes
    pub fn eval(&mut self, ctx: &EvalContext) -> EvalResult<Value> {
        match self {
            Expression::Constant(v) => Ok(*v),
            Expression::PortRef(r) => ctx.port_value(&r.id).ok_or(EvalError::ValueUnavailable),
            Expression::Call(call) => call.eval(ctx),
        }
    }
}

impl PartialEq for Expression {
    /// Structural equality; positions and evaluation state are ignored
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Expression::Constant(a), Expression::Constant(b)) => a == b,
            (Expression::PortRef(a), Expression::PortRef(b)) => {
                a.self_ref == b.self_ref && a.id == b.id
            }
            (Expression::Call(a), Expression::Call(b)) => {
                a.func.kind == b.func.kind && a.args == b.args
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expression::Constant(v) => write!(f, "{}", v),
            Expression::PortRef(r) if r.self_ref => f.write_str("$"),
            Expression::PortRef(r) => write!(f, "${}", r.id),
            Expression::Call(call) => {
                write!(f, "{}(", call.func.name)?;
                for (i, arg) in call.args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                f.write_str(")")
            }
        }
    }
}
