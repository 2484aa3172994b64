//! qToggle Expressions
//!
//! Parser and evaluator for the port expression language:
//!
//! ```text
//! MUL($nid1, 10)
//! IF(GT(HOUR(), 7), $heater, false)
//! HYST($temperature, 22.5, 21)
//! ```
//!
//! Expressions are prefix calls over constants (`true`, `false`, numbers) and
//! port references (`$id`, with `$`/`$self` meaning the owning port). Parsing
//! yields an [`Expression`] that reports its dependency set ([`Expression::deps`])
//! and can be evaluated repeatedly against an [`EvalContext`]. Stateful
//! functions (HELD, DELAY, HYST) keep their state inside the tree.

mod ast;
pub mod deps;
mod error;
mod eval;
pub mod functions;
mod parser;
mod value;

pub use ast::{Call, Expression, PortRef};
pub use deps::{Dep, DepSet, find_loop};
pub use error::{EvalError, EvalResult, ParseError, ParseErrorKind};
pub use eval::EvalContext;
pub use functions::Function;
pub use parser::{SELF_ID, parse, parse_transform};
pub use value::Value;
