//! Built-in Function Table
//!
//! Every function known to the parser, with its arity, the clock it depends on,
//! and its implementation.

use std::collections::VecDeque;

use chrono::{Datelike, Local, TimeZone, Timelike};

use crate::deps::Dep;
use crate::error::{EvalError, EvalResult};
use crate::eval::EvalContext;
use crate::Value;

/// Maximum number of pending transitions remembered by `DELAY`
pub const DELAY_HISTORY_CAPACITY: usize = 1024;

/// Identifies a built-in function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FuncKind {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitNot,
    BitXor,
    Shl,
    Shr,
    And,
    Or,
    Not,
    Xor,
    If,
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
    Abs,
    Sgn,
    Min,
    Max,
    Floor,
    Ceil,
    Round,
    Time,
    TimeMs,
    Millisecond,
    Year,
    Month,
    Day,
    Dow,
    Hour,
    Minute,
    Second,
    HmsInterval,
    Held,
    Delay,
    Hyst,
}

/// Which clock a function reads, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clock {
    None,
    /// Second granularity; only when called without an explicit timestamp
    Seconds,
    Millis,
}

/// Static description of a built-in function
#[derive(Debug)]
pub struct Function {
    pub name: &'static str,
    pub kind: FuncKind,
    pub min_args: usize,
    /// `None` means variadic
    pub max_args: Option<usize>,
    pub clock: Clock,
}

impl Function {
    const fn new(
        name: &'static str,
        kind: FuncKind,
        min_args: usize,
        max_args: Option<usize>,
        clock: Clock,
    ) -> Self {
        Self {
            name,
            kind,
            min_args,
            max_args,
            clock,
        }
    }

    pub fn accepts(&self, count: usize) -> bool {
        count >= self.min_args && self.max_args.map(|max| count <= max).unwrap_or(true)
    }

    /// Clock dependency contributed by a call with `arg_count` arguments
    pub fn clock_dep(&self, arg_count: usize) -> Option<Dep> {
        match self.clock {
            Clock::None => None,
            Clock::Seconds => {
                if arg_count == 0 || self.kind == FuncKind::HmsInterval {
                    Some(Dep::Time)
                } else {
                    None
                }
            }
            Clock::Millis => Some(Dep::TimeMs),
        }
    }

    /// Fresh per-node state for this function
    pub(crate) fn initial_state(&self) -> CallState {
        match self.kind {
            FuncKind::Held => CallState::Held(HeldState::default()),
            FuncKind::Delay => CallState::Delay(DelayState::default()),
            FuncKind::Hyst => CallState::Hyst(false),
            _ => CallState::Stateless,
        }
    }
}

static FUNCTIONS: &[Function] = &[
    // Arithmetic
    Function::new("ADD", FuncKind::Add, 2, None, Clock::None),
    Function::new("SUB", FuncKind::Sub, 2, Some(2), Clock::None),
    Function::new("MUL", FuncKind::Mul, 2, None, Clock::None),
    Function::new("DIV", FuncKind::Div, 2, Some(2), Clock::None),
    Function::new("MOD", FuncKind::Mod, 2, Some(2), Clock::None),
    // Bitwise
    Function::new("BITAND", FuncKind::BitAnd, 2, None, Clock::None),
    Function::new("BITOR", FuncKind::BitOr, 2, None, Clock::None),
    Function::new("BITNOT", FuncKind::BitNot, 1, Some(1), Clock::None),
    Function::new("BITXOR", FuncKind::BitXor, 2, Some(2), Clock::None),
    Function::new("SHL", FuncKind::Shl, 2, Some(2), Clock::None),
    Function::new("SHR", FuncKind::Shr, 2, Some(2), Clock::None),
    // Logic
    Function::new("AND", FuncKind::And, 2, None, Clock::None),
    Function::new("OR", FuncKind::Or, 2, None, Clock::None),
    Function::new("NOT", FuncKind::Not, 1, Some(1), Clock::None),
    Function::new("XOR", FuncKind::Xor, 2, Some(2), Clock::None),
    Function::new("IF", FuncKind::If, 3, Some(3), Clock::None),
    // Comparison
    Function::new("EQ", FuncKind::Eq, 2, Some(2), Clock::None),
    Function::new("GT", FuncKind::Gt, 2, Some(2), Clock::None),
    Function::new("GTE", FuncKind::Gte, 2, Some(2), Clock::None),
    Function::new("LT", FuncKind::Lt, 2, Some(2), Clock::None),
    Function::new("LTE", FuncKind::Lte, 2, Some(2), Clock::None),
    // Math
    Function::new("ABS", FuncKind::Abs, 1, Some(1), Clock::None),
    Function::new("SGN", FuncKind::Sgn, 1, Some(1), Clock::None),
    Function::new("MIN", FuncKind::Min, 2, None, Clock::None),
    Function::new("MAX", FuncKind::Max, 2, None, Clock::None),
    Function::new("FLOOR", FuncKind::Floor, 1, Some(1), Clock::None),
    Function::new("CEIL", FuncKind::Ceil, 1, Some(1), Clock::None),
    Function::new("ROUND", FuncKind::Round, 1, Some(2), Clock::None),
    // Time
    Function::new("TIME", FuncKind::Time, 0, Some(0), Clock::Seconds),
    Function::new("TIMEMS", FuncKind::TimeMs, 0, Some(0), Clock::Millis),
    Function::new("MILLISECOND", FuncKind::Millisecond, 0, Some(0), Clock::Millis),
    Function::new("YEAR", FuncKind::Year, 0, Some(1), Clock::Seconds),
    Function::new("MONTH", FuncKind::Month, 0, Some(1), Clock::Seconds),
    Function::new("DAY", FuncKind::Day, 0, Some(1), Clock::Seconds),
    Function::new("DOW", FuncKind::Dow, 0, Some(1), Clock::Seconds),
    Function::new("HOUR", FuncKind::Hour, 0, Some(1), Clock::Seconds),
    Function::new("MINUTE", FuncKind::Minute, 0, Some(1), Clock::Seconds),
    Function::new("SECOND", FuncKind::Second, 0, Some(1), Clock::Seconds),
    Function::new("HMSINTERVAL", FuncKind::HmsInterval, 6, Some(6), Clock::Seconds),
    // Stateful
    Function::new("HELD", FuncKind::Held, 3, Some(3), Clock::Millis),
    Function::new("DELAY", FuncKind::Delay, 2, Some(2), Clock::Millis),
    Function::new("HYST", FuncKind::Hyst, 3, Some(3), Clock::None),
];

/// Look up a function by name, ignoring case
pub fn lookup(name: &str) -> Option<&'static Function> {
    FUNCTIONS.iter().find(|f| f.name.eq_ignore_ascii_case(name))
}

/// All built-in functions
pub fn all() -> &'static [Function] {
    FUNCTIONS
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-node state
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct HeldState {
    last_value: Option<f64>,
    since_ms: i64,
}

#[derive(Debug, Clone, Default)]
pub struct DelayState {
    /// Transitions not yet old enough to be emitted, oldest first
    pending: VecDeque<(i64, Value)>,
    last_seen: Option<Value>,
    current: Option<Value>,
}

/// State owned by a call node and carried across evaluations
#[derive(Debug, Clone, Default)]
pub enum CallState {
    #[default]
    Stateless,
    Held(HeldState),
    Delay(DelayState),
    Hyst(bool),
}

// ─────────────────────────────────────────────────────────────────────────────
// Evaluation
// ─────────────────────────────────────────────────────────────────────────────

/// Apply a function to already-evaluated arguments
pub(crate) fn apply(
    kind: FuncKind,
    args: &[Value],
    state: &mut CallState,
    ctx: &EvalContext,
) -> EvalResult<Value> {
    let num = |i: usize| args[i].as_f64();
    let int = |i: usize| args[i].as_i64();

    let value = match kind {
        FuncKind::Add => Value::Number(args.iter().map(Value::as_f64).sum()),
        FuncKind::Sub => Value::Number(num(0) - num(1)),
        FuncKind::Mul => Value::Number(args.iter().map(Value::as_f64).product()),
        FuncKind::Div => {
            let b = num(1);
            if b == 0.0 {
                Value::Number(0.0)
            } else {
                Value::Number((num(0) / b).trunc())
            }
        }
        FuncKind::Mod => {
            let b = num(1);
            if b == 0.0 {
                Value::Number(0.0)
            } else {
                let a = num(0);
                Value::Number(a - b * (a / b).floor())
            }
        }

        FuncKind::BitAnd => Value::from(args.iter().map(Value::as_i64).fold(-1, |acc, v| acc & v)),
        FuncKind::BitOr => Value::from(args.iter().map(Value::as_i64).fold(0, |acc, v| acc | v)),
        FuncKind::BitNot => Value::from(!int(0)),
        FuncKind::BitXor => Value::from(int(0) ^ int(1)),
        FuncKind::Shl => Value::from(int(0).wrapping_shl(shift_amount(args, 1)?)),
        FuncKind::Shr => Value::from(int(0).wrapping_shr(shift_amount(args, 1)?)),

        FuncKind::And => Value::Bool(args.iter().all(Value::as_bool)),
        FuncKind::Or => Value::Bool(args.iter().any(Value::as_bool)),
        FuncKind::Not => Value::Bool(!args[0].as_bool()),
        FuncKind::Xor => Value::Bool(args[0].as_bool() ^ args[1].as_bool()),
        FuncKind::If => {
            if args[0].as_bool() {
                args[1]
            } else {
                args[2]
            }
        }

        FuncKind::Eq => Value::Bool(num(0) == num(1)),
        FuncKind::Gt => Value::Bool(num(0) > num(1)),
        FuncKind::Gte => Value::Bool(num(0) >= num(1)),
        FuncKind::Lt => Value::Bool(num(0) < num(1)),
        FuncKind::Lte => Value::Bool(num(0) <= num(1)),

        FuncKind::Abs => Value::Number(num(0).abs()),
        FuncKind::Sgn => {
            let v = num(0);
            Value::Number(if v > 0.0 {
                1.0
            } else if v < 0.0 {
                -1.0
            } else {
                0.0
            })
        }
        FuncKind::Min => Value::Number(args.iter().map(Value::as_f64).fold(f64::INFINITY, f64::min)),
        FuncKind::Max => {
            Value::Number(args.iter().map(Value::as_f64).fold(f64::NEG_INFINITY, f64::max))
        }
        FuncKind::Floor => Value::Number(num(0).floor()),
        FuncKind::Ceil => Value::Number(num(0).ceil()),
        FuncKind::Round => {
            let decimals = if args.len() > 1 { int(1) } else { 0 };
            if !(0..=15).contains(&decimals) {
                return Err(EvalError::ArgError {
                    index: 1,
                    value: args[1],
                });
            }
            let factor = 10f64.powi(decimals as i32);
            Value::Number((num(0) * factor).round() / factor)
        }

        FuncKind::Time => Value::from(ctx.now_ms().div_euclid(1000)),
        FuncKind::TimeMs => Value::from(ctx.now_ms()),
        FuncKind::Millisecond => Value::from(ctx.now_ms().rem_euclid(1000)),
        FuncKind::Year
        | FuncKind::Month
        | FuncKind::Day
        | FuncKind::Dow
        | FuncKind::Hour
        | FuncKind::Minute
        | FuncKind::Second => calendar(kind, args, ctx)?,
        FuncKind::HmsInterval => hms_interval(args, ctx)?,

        FuncKind::Held => held(args, state, ctx)?,
        FuncKind::Delay => delay(args, state, ctx)?,
        FuncKind::Hyst => hyst(args, state),
    };

    Ok(value)
}

fn shift_amount(args: &[Value], index: usize) -> EvalResult<u32> {
    let amount = args[index].as_i64();
    if !(0..64).contains(&amount) {
        return Err(EvalError::ArgError {
            index,
            value: args[index],
        });
    }
    Ok(amount as u32)
}

fn calendar(kind: FuncKind, args: &[Value], ctx: &EvalContext) -> EvalResult<Value> {
    let ts_ms = match args.first() {
        Some(ts) => (ts.as_f64() * 1000.0) as i64,
        None => ctx.now_ms(),
    };
    let dt = Local.timestamp_millis_opt(ts_ms).single().ok_or_else(|| EvalError::ArgError {
        index: 0,
        value: args.first().copied().unwrap_or(Value::Number(ts_ms as f64)),
    })?;

    let v = match kind {
        FuncKind::Year => dt.year() as i64,
        FuncKind::Month => dt.month() as i64,
        FuncKind::Day => dt.day() as i64,
        FuncKind::Dow => dt.weekday().num_days_from_monday() as i64,
        FuncKind::Hour => dt.hour() as i64,
        FuncKind::Minute => dt.minute() as i64,
        _ => dt.second() as i64,
    };
    Ok(Value::from(v))
}

fn hms_interval(args: &[Value], ctx: &EvalContext) -> EvalResult<Value> {
    let limits = [24, 60, 60, 24, 60, 60];
    for (index, limit) in limits.iter().enumerate() {
        let v = args[index].as_i64();
        if v < 0 || v >= *limit {
            return Err(EvalError::ArgError {
                index,
                value: args[index],
            });
        }
    }

    let start = args[0].as_i64() * 3600 + args[1].as_i64() * 60 + args[2].as_i64();
    let stop = args[3].as_i64() * 3600 + args[4].as_i64() * 60 + args[5].as_i64();

    let dt = Local
        .timestamp_millis_opt(ctx.now_ms())
        .single()
        .ok_or(EvalError::ValueUnavailable)?;
    let now = dt.num_seconds_from_midnight() as i64;

    let inside = if start <= stop {
        start <= now && now <= stop
    } else {
        now >= start || now <= stop
    };
    Ok(Value::Bool(inside))
}

fn held(args: &[Value], state: &mut CallState, ctx: &EvalContext) -> EvalResult<Value> {
    let duration = args[2].as_i64();
    if duration < 0 {
        return Err(EvalError::ArgError {
            index: 2,
            value: args[2],
        });
    }
    let CallState::Held(st) = state else {
        return Err(EvalError::ValueUnavailable);
    };

    let value = args[0].as_f64();
    let now = ctx.now_ms();
    if st.last_value != Some(value) {
        st.last_value = Some(value);
        st.since_ms = now;
    }

    Ok(Value::Bool(value == args[1].as_f64() && now - st.since_ms >= duration))
}

fn delay(args: &[Value], state: &mut CallState, ctx: &EvalContext) -> EvalResult<Value> {
    let delay_ms = args[1].as_i64();
    if delay_ms < 0 {
        return Err(EvalError::ArgError {
            index: 1,
            value: args[1],
        });
    }
    let CallState::Delay(st) = state else {
        return Err(EvalError::ValueUnavailable);
    };

    let now = ctx.now_ms();
    let value = args[0];
    if st.last_seen != Some(value) {
        st.last_seen = Some(value);
        if st.pending.len() >= DELAY_HISTORY_CAPACITY {
            st.pending.pop_front();
        }
        st.pending.push_back((now, value));
    }

    while let Some(&(t, v)) = st.pending.front() {
        if now - t < delay_ms {
            break;
        }
        st.current = Some(v);
        st.pending.pop_front();
    }

    st.current.ok_or(EvalError::ValueUnavailable)
}

fn hyst(args: &[Value], state: &mut CallState) -> Value {
    let value = args[0].as_f64();
    let (t1, t2) = (args[1].as_f64(), args[2].as_f64());

    if let CallState::Hyst(r) = state {
        if !*r && value > t1 {
            *r = true;
        } else if *r && value < t2 {
            *r = false;
        }
        Value::Bool(*r)
    } else {
        Value::Bool(false)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn call(kind: FuncKind, args: &[Value]) -> EvalResult<Value> {
        let ctx = EvalContext::new(0);
        apply(kind, args, &mut CallState::Stateless, &ctx)
    }

    fn n(v: f64) -> Value {
        Value::Number(v)
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert_eq!(lookup("mul").map(|f| f.kind), Some(FuncKind::Mul));
        assert_eq!(lookup("HmsInterval").map(|f| f.kind), Some(FuncKind::HmsInterval));
        assert!(lookup("NOPE").is_none());
    }

    #[test]
    fn test_arity() {
        let add = lookup("ADD").unwrap();
        assert!(!add.accepts(1));
        assert!(add.accepts(5));
        let sub = lookup("SUB").unwrap();
        assert!(sub.accepts(2));
        assert!(!sub.accepts(3));
    }

    #[test]
    fn test_div_truncates_toward_zero() {
        assert_eq!(call(FuncKind::Div, &[n(7.0), n(2.0)]), Ok(n(3.0)));
        assert_eq!(call(FuncKind::Div, &[n(-7.0), n(2.0)]), Ok(n(-3.0)));
        assert_eq!(call(FuncKind::Div, &[n(5.0), n(0.0)]), Ok(n(0.0)));
    }

    #[test]
    fn test_mod_is_floored() {
        assert_eq!(call(FuncKind::Mod, &[n(7.0), n(3.0)]), Ok(n(1.0)));
        assert_eq!(call(FuncKind::Mod, &[n(-7.0), n(3.0)]), Ok(n(2.0)));
        assert_eq!(call(FuncKind::Mod, &[n(7.0), n(-3.0)]), Ok(n(-2.0)));
        assert_eq!(call(FuncKind::Mod, &[n(7.0), n(0.0)]), Ok(n(0.0)));
    }

    #[test]
    fn test_bitwise() {
        assert_eq!(call(FuncKind::BitAnd, &[n(12.0), n(10.0)]), Ok(n(8.0)));
        assert_eq!(call(FuncKind::BitOr, &[n(12.0), n(10.0), n(1.0)]), Ok(n(15.0)));
        assert_eq!(call(FuncKind::BitXor, &[n(12.0), n(10.0)]), Ok(n(6.0)));
        assert_eq!(call(FuncKind::BitNot, &[n(0.0)]), Ok(n(-1.0)));
        assert_eq!(call(FuncKind::Shl, &[n(1.0), n(4.0)]), Ok(n(16.0)));
        assert_eq!(call(FuncKind::Shr, &[n(16.0), n(2.0)]), Ok(n(4.0)));
        assert_eq!(
            call(FuncKind::Shl, &[n(1.0), n(-1.0)]),
            Err(EvalError::ArgError { index: 1, value: n(-1.0) })
        );
    }

    #[test]
    fn test_booleans_as_numbers() {
        assert_eq!(call(FuncKind::Add, &[Value::Bool(true), n(2.0)]), Ok(n(3.0)));
        assert_eq!(call(FuncKind::Eq, &[Value::Bool(true), n(1.0)]), Ok(Value::Bool(true)));
    }

    #[test]
    fn test_math() {
        assert_eq!(call(FuncKind::Sgn, &[n(-4.0)]), Ok(n(-1.0)));
        assert_eq!(call(FuncKind::Min, &[n(3.0), n(-1.0), n(2.0)]), Ok(n(-1.0)));
        assert_eq!(call(FuncKind::Max, &[n(3.0), n(-1.0), n(2.0)]), Ok(n(3.0)));
        assert_eq!(call(FuncKind::Round, &[n(2.456), n(2.0)]), Ok(n(2.46)));
        assert_eq!(call(FuncKind::Round, &[n(2.5)]), Ok(n(3.0)));
        assert_eq!(call(FuncKind::Floor, &[n(-1.5)]), Ok(n(-2.0)));
        assert_eq!(call(FuncKind::Ceil, &[n(-1.5)]), Ok(n(-1.0)));
    }

    #[test]
    fn test_time_functions() {
        let ctx = EvalContext::new(1_700_000_123_456);
        let mut state = CallState::Stateless;
        assert_eq!(apply(FuncKind::Time, &[], &mut state, &ctx), Ok(n(1_700_000_123.0)));
        assert_eq!(apply(FuncKind::Millisecond, &[], &mut state, &ctx), Ok(n(456.0)));
        assert_eq!(
            apply(FuncKind::TimeMs, &[], &mut state, &ctx),
            Ok(n(1_700_000_123_456.0))
        );
    }

    #[test]
    fn test_hms_interval_validates_arguments() {
        let args = [n(25.0), n(0.0), n(0.0), n(1.0), n(0.0), n(0.0)];
        assert_eq!(
            call(FuncKind::HmsInterval, &args),
            Err(EvalError::ArgError { index: 0, value: n(25.0) })
        );

        // Whole day interval always matches
        let args = [n(0.0), n(0.0), n(0.0), n(23.0), n(59.0), n(59.0)];
        assert_eq!(call(FuncKind::HmsInterval, &args), Ok(Value::Bool(true)));
    }

    #[test]
    fn test_hyst_latches() {
        let mut state = CallState::Hyst(false);
        let ctx = EvalContext::new(0);
        let mut run = |v: f64| apply(FuncKind::Hyst, &[n(v), n(20.0), n(10.0)], &mut state, &ctx);

        assert_eq!(run(15.0), Ok(Value::Bool(false)));
        assert_eq!(run(21.0), Ok(Value::Bool(true)));
        // Between thresholds keeps the latch
        assert_eq!(run(15.0), Ok(Value::Bool(true)));
        assert_eq!(run(10.0), Ok(Value::Bool(true)));
        assert_eq!(run(9.0), Ok(Value::Bool(false)));
        assert_eq!(run(20.0), Ok(Value::Bool(false)));
    }

    #[test]
    fn test_held_requires_continuous_value() {
        let mut state = CallState::Held(HeldState::default());
        let mut run = |v: f64, t: i64| {
            let ctx = EvalContext::new(t);
            apply(FuncKind::Held, &[n(v), n(1.0), n(500.0)], &mut state, &ctx)
        };

        assert_eq!(run(1.0, 0), Ok(Value::Bool(false)));
        assert_eq!(run(1.0, 499), Ok(Value::Bool(false)));
        assert_eq!(run(1.0, 500), Ok(Value::Bool(true)));
        // Value changes: timer restarts
        assert_eq!(run(0.0, 600), Ok(Value::Bool(false)));
        assert_eq!(run(1.0, 700), Ok(Value::Bool(false)));
        assert_eq!(run(1.0, 1200), Ok(Value::Bool(true)));
    }

    #[test]
    fn test_delay_emits_old_transitions() {
        let mut state = CallState::Delay(DelayState::default());
        let mut run = |v: f64, t: i64| {
            let ctx = EvalContext::new(t);
            apply(FuncKind::Delay, &[n(v), n(100.0)], &mut state, &ctx)
        };

        assert_eq!(run(1.0, 0), Err(EvalError::ValueUnavailable));
        assert_eq!(run(1.0, 50), Err(EvalError::ValueUnavailable));
        assert_eq!(run(1.0, 100), Ok(n(1.0)));
        assert_eq!(run(2.0, 150), Ok(n(1.0)));
        assert_eq!(run(3.0, 200), Ok(n(1.0)));
        assert_eq!(run(3.0, 250), Ok(n(2.0)));
        assert_eq!(run(3.0, 300), Ok(n(3.0)));
    }

    #[test]
    fn test_delay_history_is_bounded() {
        let mut state = CallState::Delay(DelayState::default());
        for i in 0..(DELAY_HISTORY_CAPACITY as i64 + 10) {
            let ctx = EvalContext::new(i);
            let _ = apply(FuncKind::Delay, &[n(i as f64), n(1_000_000.0)], &mut state, &ctx);
        }
        let CallState::Delay(delay) = &state else {
            panic!("Expected delay state");
        };
        assert_eq!(delay.pending.len(), DELAY_HISTORY_CAPACITY);
        assert_eq!(delay.pending.front().map(|(t, _)| *t), Some(10));
    }
}
