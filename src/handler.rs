// src/handler.rs

use std::sync::Arc;

use rhai::{AST, Dynamic, Engine, EvalAltResult, Scope};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

/// Default per-invocation operation budget for compiled scripts.
pub const DEFAULT_MAX_OPERATIONS: u64 = 1_000_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Source text that cannot be turned into a callable.
    #[error("handler compile error: {0}")]
    Compile(String),

    /// The callable ran and failed. The message is what a requester sees.
    #[error("{0}")]
    Invocation(String),
}

/// What a piece of stored source text is expected to define.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Must define `fn process(input)`.
    Function,
    /// Either defines `fn handle(message)` / `fn process(message)`, or is a bare
    /// body that reads the variable `message`.
    Subscription,
}

/// A compiled unary transform.
pub trait Transform: Send + Sync {
    fn invoke(&self, input: Value) -> Result<Value, HandlerError>;
}

/// Turns source text into a [`Transform`].
pub trait Compiler: Send + Sync {
    fn compile(&self, source: &str, kind: SourceKind) -> Result<Arc<dyn Transform>, HandlerError>;
}

/// Run a transform off the async executor; a panic becomes an invocation error.
pub async fn invoke_blocking(transform: Arc<dyn Transform>, input: Value) -> Result<Value, HandlerError> {
    match tokio::task::spawn_blocking(move || transform.invoke(input)).await {
        Ok(result) => result,
        Err(e) => Err(HandlerError::Invocation(format!("transform aborted: {}", e))),
    }
}

/// [Rhai](https://rhai.rs) backed compiler.
///
/// A function node looks like
///
/// ```rhai
/// fn process(input) {
///     input * 2
/// }
/// ```
///
/// and a subscription handler may be a bare body:
///
/// ```rhai
/// print(message.topic);
/// message.payload
/// ```
///
/// Scripts are trusted. The only containment is the operation budget and the
/// conversion of script errors into [`HandlerError::Invocation`].
#[derive(Clone)]
pub struct ScriptCompiler {
    engine: Arc<Engine>,
}

impl ScriptCompiler {
    pub fn new(max_operations: u64) -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(max_operations);
        engine.on_print(|text| info!(target: "script", "{text}"));
        engine.on_debug(|text, source, pos| {
            debug!(target: "script", source = source.unwrap_or_default(), %pos, "{text}")
        });
        ScriptCompiler {
            engine: Arc::new(engine),
        }
    }
}

impl Default for ScriptCompiler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OPERATIONS)
    }
}

impl Compiler for ScriptCompiler {
    fn compile(&self, source: &str, kind: SourceKind) -> Result<Arc<dyn Transform>, HandlerError> {
        let ast = self
            .engine
            .compile(source)
            .map_err(|e| HandlerError::Compile(e.to_string()))?;

        let defines = |name: &str| ast.iter_functions().any(|f| f.name == name && f.params.len() == 1);
        let entry = match kind {
            SourceKind::Function if defines("process") => Entry::Call("process"),
            SourceKind::Function => {
                return Err(HandlerError::Compile(
                    "source must define `fn process(input)`".into(),
                ));
            }
            SourceKind::Subscription if defines("handle") => Entry::Call("handle"),
            SourceKind::Subscription if defines("process") => Entry::Call("process"),
            SourceKind::Subscription => Entry::Body("message"),
        };

        Ok(Arc::new(Script {
            engine: self.engine.clone(),
            ast,
            entry,
        }))
    }
}

#[derive(Debug, Clone, Copy)]
enum Entry {
    Call(&'static str),
    Body(&'static str),
}

struct Script {
    engine: Arc<Engine>,
    ast: AST,
    entry: Entry,
}

impl Transform for Script {
    fn invoke(&self, input: Value) -> Result<Value, HandlerError> {
        let input = rhai::serde::to_dynamic(&input)
            .map_err(|e| HandlerError::Invocation(format!("input conversion failed: {}", e)))?;
        let mut scope = Scope::new();
        let result = match self.entry {
            Entry::Call(name) => self
                .engine
                .call_fn::<Dynamic>(&mut scope, &self.ast, name, (input,)),
            Entry::Body(var) => {
                scope.push_dynamic(var, input);
                self.engine.eval_ast_with_scope::<Dynamic>(&mut scope, &self.ast)
            }
        }
        .map_err(|e| HandlerError::Invocation(script_error(*e)))?;

        rhai::serde::from_dynamic::<Value>(&result)
            .map_err(|e| HandlerError::Invocation(format!("output conversion failed: {}", e)))
    }
}

/// `throw "msg"` surfaces as just `msg`.
fn script_error(err: EvalAltResult) -> String {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => script_error(*inner),
        EvalAltResult::ErrorRuntime(value, _) => match value.into_string() {
            Ok(text) => text,
            Err(type_name) => format!("script threw a value of type {type_name}"),
        },
        other => other.to_string(),
    }
}
