//! Threshold Expression Sandbox
//!
//! Dynamic volume thresholds are user-authored scripts evaluated once per
//! trade print. They run inside a restricted [`rhai`] engine: no standard
//! library beyond arithmetic, logic and basic math, no loops, no `eval`, and
//! bounded operation count and nesting depth.
//!
//! Bindings with a dotted name (`trade.volume`) are grouped into read-only
//! object maps, so a script sees `trade` and `instrument` as objects:
//!
//! ```text
//! if trade.buy { 10.0 * instrument.lot } else { 1000 }
//! ```
//!
//! The result must be a finite number; booleans, strings and `()` are
//! rejected. The [`ExpressionEvaluator`] trait keeps the sandbox swappable.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use rhai::packages::{ArithmeticPackage, BasicMathPackage, LogicPackage, Package};
use rhai::{AST, Dynamic, Engine, EvalAltResult, FLOAT, INT, Map, Scope};

/// Upper bound on cached programs before the cache is reset.
const MAX_CACHED_PROGRAMS: usize = 64;

/// Operations a single evaluation may perform.
const MAX_OPERATIONS: u64 = 10_000;

/// Nesting depth for expressions, and for expressions inside functions.
const MAX_EXPR_DEPTH: usize = 32;
const MAX_FN_EXPR_DEPTH: usize = 16;

// =============================================================================
// Errors
// =============================================================================

/// Expression compile or evaluation failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvaluationError {
    /// Source text does not compile.
    #[error("syntax error: {0}")]
    Syntax(String),

    /// Script reads a variable or property that was not bound.
    #[error("unknown binding: {0}")]
    UnknownBinding(String),

    /// Script calls a function the sandbox does not provide.
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    /// Script hit the operation limit.
    #[error("expression exceeded {MAX_OPERATIONS} operations")]
    TooManyOperations,

    /// Any other runtime failure, such as integer division by zero.
    #[error("expression failed: {0}")]
    Runtime(String),

    /// Script produced a non-number, NaN or an infinite value.
    #[error("expression did not evaluate to a finite number")]
    NonNumeric,
}

impl From<Box<EvalAltResult>> for EvaluationError {
    fn from(err: Box<EvalAltResult>) -> Self {
        match *err {
            EvalAltResult::ErrorVariableNotFound(name, _)
            | EvalAltResult::ErrorPropertyNotFound(name, _) => Self::UnknownBinding(name),
            EvalAltResult::ErrorFunctionNotFound(signature, _) => Self::UnknownFunction(signature),
            EvalAltResult::ErrorTooManyOperations(_) => Self::TooManyOperations,
            other => Self::Runtime(other.to_string()),
        }
    }
}

// =============================================================================
// Bindings
// =============================================================================

/// Value of one binding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BindingValue {
    /// Numeric input.
    Number(f64),
    /// Boolean input.
    Flag(bool),
}

/// Named inputs visible to an expression.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bindings {
    values: BTreeMap<String, BindingValue>,
}

impl Bindings {
    /// Create an empty binding set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a numeric binding.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.values.insert(name.into(), BindingValue::Number(value));
        self
    }

    /// Add or replace a boolean binding.
    #[must_use]
    pub fn with_flag(mut self, name: impl Into<String>, value: bool) -> Self {
        self.values.insert(name.into(), BindingValue::Flag(value));
        self
    }

    /// Look up a binding.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<BindingValue> {
        self.values.get(name).copied()
    }

    /// Iterate bindings in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, BindingValue)> {
        self.values.iter().map(|(name, value)| (name.as_str(), *value))
    }
}

// =============================================================================
// Evaluator Capability
// =============================================================================

/// Sandboxed expression evaluation capability.
///
/// Implementations must be side-effect free: the same source and bindings
/// always produce the same result.
pub trait ExpressionEvaluator: Send + Sync {
    /// Check that `source` compiles without evaluating it.
    ///
    /// # Errors
    ///
    /// Returns [`EvaluationError::Syntax`] if the source cannot be compiled.
    fn check(&self, source: &str) -> Result<(), EvaluationError>;

    /// Evaluate `source` against `bindings`.
    ///
    /// # Errors
    ///
    /// Returns an error if the source is invalid, references unknown names,
    /// or does not produce a finite number.
    fn evaluate(&self, source: &str, bindings: &Bindings) -> Result<f64, EvaluationError>;
}

/// Default evaluator backed by a restricted Rhai engine.
///
/// Compiled scripts are cached by source text, so a threshold evaluated for
/// every print is compiled once.
#[derive(Debug)]
pub struct ScriptEvaluator {
    engine: Engine,
    cache: Mutex<HashMap<String, Arc<AST>>>,
}

impl Default for ScriptEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptEvaluator {
    /// Create an evaluator with an empty script cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            engine: sandboxed_engine(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn compile(&self, source: &str) -> Result<Arc<AST>, EvaluationError> {
        if let Some(ast) = self.cache.lock().get(source) {
            return Ok(Arc::clone(ast));
        }

        let ast = self
            .engine
            .compile(source)
            .map_err(|e| EvaluationError::Syntax(e.to_string()))?;
        let ast = Arc::new(ast);

        let mut cache = self.cache.lock();
        if cache.len() >= MAX_CACHED_PROGRAMS {
            cache.clear();
        }
        cache.insert(source.to_string(), Arc::clone(&ast));

        Ok(ast)
    }
}

impl ExpressionEvaluator for ScriptEvaluator {
    fn check(&self, source: &str) -> Result<(), EvaluationError> {
        self.compile(source).map(|_| ())
    }

    fn evaluate(&self, source: &str, bindings: &Bindings) -> Result<f64, EvaluationError> {
        let ast = self.compile(source)?;
        let mut scope = scope_for(bindings);

        let value = self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)?;

        to_finite(&value)
    }
}

fn sandboxed_engine() -> Engine {
    let mut engine = Engine::new_raw();

    engine.register_global_module(ArithmeticPackage::new().as_shared_module());
    engine.register_global_module(LogicPackage::new().as_shared_module());
    engine.register_global_module(BasicMathPackage::new().as_shared_module());
    engine
        .register_fn("min", |a: INT, b: INT| a.min(b))
        .register_fn("max", |a: INT, b: INT| a.max(b))
        .register_fn("min", |a: FLOAT, b: FLOAT| a.min(b))
        .register_fn("max", |a: FLOAT, b: FLOAT| a.max(b));

    engine.set_max_operations(MAX_OPERATIONS);
    engine.set_max_expr_depths(MAX_EXPR_DEPTH, MAX_FN_EXPR_DEPTH);
    engine.set_max_string_size(256);
    engine.set_allow_looping(false);
    engine.set_fail_on_invalid_map_property(true);
    engine.disable_symbol("eval");

    engine
}

/// Bind `a.b` names into an object map `a`; undotted names bind directly.
fn scope_for(bindings: &Bindings) -> Scope<'static> {
    let mut scope = Scope::new();
    let mut objects: BTreeMap<&str, Map> = BTreeMap::new();

    for (name, value) in bindings.iter() {
        let value = match value {
            BindingValue::Number(n) => Dynamic::from_float(n),
            BindingValue::Flag(b) => Dynamic::from_bool(b),
        };

        match name.split_once('.') {
            Some((object, field)) => {
                objects.entry(object).or_default().insert(field.into(), value);
            }
            None => {
                scope.push_constant_dynamic(name.to_string(), value);
            }
        }
    }

    for (object, fields) in objects {
        scope.push_constant(object.to_string(), fields);
    }

    scope
}

#[allow(clippy::cast_precision_loss)]
fn to_finite(value: &Dynamic) -> Result<f64, EvaluationError> {
    let number = value
        .as_float()
        .or_else(|_| value.as_int().map(|i| i as f64))
        .map_err(|_| EvaluationError::NonNumeric)?;

    if number.is_finite() {
        Ok(number)
    } else {
        Err(EvaluationError::NonNumeric)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn eval(source: &str) -> Result<f64, EvaluationError> {
        let bindings = Bindings::new()
            .with("trade.volume", 250.0)
            .with("trade.price", 101.5)
            .with_flag("trade.buy", true)
            .with("instrument.lot", 10.0);
        ScriptEvaluator::new().evaluate(source, &bindings)
    }

    #[test_case("42", 42.0 ; "integer literal")]
    #[test_case("2.5", 2.5 ; "float literal")]
    #[test_case("1 + 2 * 3", 7.0 ; "precedence")]
    #[test_case("(1 + 2) * 3", 9.0 ; "parentheses")]
    #[test_case("-4 + 10", 6.0 ; "unary minus")]
    #[test_case("10 % 4", 2.0 ; "remainder")]
    #[test_case("trade.volume / instrument.lot", 25.0 ; "object bindings")]
    #[test_case("if trade.price > 100 { 500 } else { 50 }", 500.0 ; "if expression true")]
    #[test_case("if trade.price > 200 { 500 } else { 50 }", 50.0 ; "if expression false")]
    #[test_case("if trade.buy && trade.volume >= 250 { 1 } else { 0 }", 1.0 ; "logical and")]
    #[test_case("if !trade.buy || false { 1 } else { 0 }", 0.0 ; "logical or with not")]
    #[test_case("max(1, 7) + min(4, 2)", 9.0 ; "min max")]
    #[test_case("max(trade.volume, 300.0)", 300.0 ; "float max")]
    #[test_case("abs(-3) + floor(2.7) + ceiling(0.2) + round(1.5)", 8.0 ; "math functions")]
    #[test_case("let lots = trade.volume / instrument.lot; lots * 2", 50.0 ; "local variable")]
    fn evaluates(source: &str, expected: f64) {
        assert_eq!(eval(source).unwrap(), expected);
    }

    #[test_case("1 +" ; "dangling operator")]
    #[test_case("(1 + 2" ; "unclosed paren")]
    #[test_case("1 2" ; "missing separator")]
    #[test_case("trade.volume > 10 ? 0 : 1" ; "c style conditional")]
    #[test_case("loop { 1 }" ; "looping disabled")]
    #[test_case("eval(\"1\")" ; "eval disabled")]
    #[test_case("#" ; "unknown symbol")]
    fn rejects_invalid_syntax(source: &str) {
        assert!(matches!(
            ScriptEvaluator::new().check(source),
            Err(EvaluationError::Syntax(_))
        ));
    }

    #[test]
    fn nesting_depth_is_bounded() {
        let deep = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert!(matches!(
            ScriptEvaluator::new().check(&deep),
            Err(EvaluationError::Syntax(_))
        ));
    }

    #[test]
    fn unknown_variable_is_an_error() {
        assert_eq!(
            eval("widget * 2"),
            Err(EvaluationError::UnknownBinding("widget".to_string()))
        );
    }

    #[test]
    fn unknown_property_is_an_error() {
        assert!(matches!(eval("trade.size * 2"), Err(EvaluationError::UnknownBinding(_))));
    }

    #[test]
    fn unknown_function_is_an_error() {
        assert!(matches!(eval("launch(4)"), Err(EvaluationError::UnknownFunction(_))));
    }

    #[test]
    fn bindings_are_read_only() {
        assert!(eval("trade.volume = 0; 1").is_err());
    }

    #[test]
    fn runaway_recursion_is_stopped() {
        assert!(eval("fn spin(x) { spin(x + 1) } spin(0)").is_err());
    }

    #[test]
    fn non_finite_and_non_numeric_results_are_rejected() {
        assert_eq!(eval("1.0 / 0.0"), Err(EvaluationError::NonNumeric));
        assert_eq!(eval("0.0 / 0.0"), Err(EvaluationError::NonNumeric));
        assert_eq!(eval("trade.buy"), Err(EvaluationError::NonNumeric));
        assert_eq!(eval("\"100\""), Err(EvaluationError::NonNumeric));
        assert_eq!(eval("let x = 1;"), Err(EvaluationError::NonNumeric));
    }

    #[test]
    fn integer_division_by_zero_is_a_runtime_error() {
        assert!(matches!(eval("1 / 0"), Err(EvaluationError::Runtime(_))));
    }

    #[test]
    fn short_circuit_skips_unknown_bindings() {
        assert_eq!(eval("if false && missing { 1 } else { 0 }").unwrap(), 0.0);
        assert_eq!(eval("if true || missing { 1 } else { 0 }").unwrap(), 1.0);
    }

    #[test]
    fn check_does_not_need_bindings() {
        let evaluator = ScriptEvaluator::new();
        assert!(evaluator.check("if trade.volume > 10 { 0 } else { 1 }").is_ok());
    }

    #[test]
    fn undotted_bindings_are_plain_variables() {
        let bindings = Bindings::new().with("depth", 4.0);
        let value = ScriptEvaluator::new().evaluate("depth * 2", &bindings).unwrap();
        assert_eq!(value, 8.0);
    }

    #[test]
    fn cache_reuses_compiled_script() {
        let evaluator = ScriptEvaluator::new();
        let bindings = Bindings::new().with("trade.volume", 3.0);

        for _ in 0..3 {
            assert_eq!(evaluator.evaluate("trade.volume * 2", &bindings).unwrap(), 6.0);
        }

        assert_eq!(evaluator.cache.lock().len(), 1);
    }

    #[test]
    fn cache_is_bounded() {
        let evaluator = ScriptEvaluator::new();

        for i in 0..(MAX_CACHED_PROGRAMS * 2) {
            evaluator.check(&format!("{i} + 1")).unwrap();
        }

        assert!(evaluator.cache.lock().len() <= MAX_CACHED_PROGRAMS);
    }

    #[test]
    fn evaluator_is_shareable_across_threads() {
        let evaluator = Arc::new(ScriptEvaluator::new());

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let evaluator = Arc::clone(&evaluator);
                std::thread::spawn(move || {
                    let bindings = Bindings::new().with("trade.volume", f64::from(i));
                    evaluator.evaluate("trade.volume + 1", &bindings).unwrap()
                })
            })
            .collect();

        let mut results: Vec<f64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        results.sort_by(f64::total_cmp);
        assert_eq!(results, vec![1.0, 2.0, 3.0, 4.0]);
    }
}
