//! Code providers: where the Python sent for a method comes from.
//!
//! Generating code from host-side method signatures is not this crate's
//! job. A [`CodeProvider`] hands the policy engine pre-rendered code, and
//! the engine decides whether to deploy it once and call it by name or to
//! send it whole on every call.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::classify::ClassifiedError;

/// Source of the device-side code for a registered method.
pub trait CodeProvider: Send + Sync {
    /// Parameter names, in call order.
    fn parameters(&self) -> &[String] {
        &[]
    }

    /// Identity of the generated code. Must change whenever the code does,
    /// so that a changed body is redeployed.
    fn fingerprint(&self) -> String;

    /// A definition binding the code to `symbol` on the device, or `None`
    /// when the code is sent whole on every call.
    fn definition(&self, symbol: &str) -> Option<String>;

    /// Code that runs the method with `args`.
    fn invocation(&self, symbol: &str, args: &[Value]) -> Result<String, ClassifiedError>;
}

/// A Python function: parameter names plus a body, deployed as a `def`.
///
/// The invocation prints the return value unless it is `None`.
///
/// # Example
///
/// ```
/// use libmpy::policy::{CodeProvider, PythonFunction};
///
/// let add = PythonFunction::new("return a + b").param("a").param("b");
/// let def = add.definition("_mpy_add").unwrap();
/// assert!(def.starts_with("def _mpy_add(a, b):\n    return a + b"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PythonFunction {
    parameters: Vec<String>,
    body: String,
}

impl PythonFunction {
    /// Create a function with the given body and no parameters.
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            parameters: Vec::new(),
            body: body.into(),
        }
    }

    /// Append a parameter.
    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.parameters.push(name.into());
        self
    }

    /// Replace the parameter list.
    pub fn params(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.parameters = names.into_iter().map(Into::into).collect();
        self
    }

    /// The function body, unindented.
    pub fn body(&self) -> &str {
        &self.body
    }
}

impl CodeProvider for PythonFunction {
    fn parameters(&self) -> &[String] {
        &self.parameters
    }

    fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.body.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn definition(&self, symbol: &str) -> Option<String> {
        if self.body.trim().is_empty() {
            return None;
        }
        let mut def = format!("def {symbol}({}):\n", self.parameters.join(", "));
        for line in self.body.lines() {
            if line.trim().is_empty() {
                def.push('\n');
            } else {
                def.push_str("    ");
                def.push_str(line);
                def.push('\n');
            }
        }
        Some(def)
    }

    fn invocation(&self, symbol: &str, args: &[Value]) -> Result<String, ClassifiedError> {
        if self.body.trim().is_empty() {
            return Err(ClassifiedError::invalid_request(format!(
                "{symbol} has an empty function body"
            )));
        }
        check_arity(self.parameters.len(), args)?;
        let args = args.iter().map(python_literal).collect::<Vec<_>>().join(", ");
        Ok(format!(
            "_mpy_r = {symbol}({args})\nif _mpy_r is not None:\n    print(_mpy_r)\ndel _mpy_r\n"
        ))
    }
}

type Render = dyn Fn(&[Value]) -> String + Send + Sync;

/// Code rendered by a closure and sent whole on every call.
///
/// Inline code is never deployed, so it suits setup and teardown snippets
/// and ad hoc tasks.
///
/// # Example
///
/// ```
/// use libmpy::policy::{CodeProvider, InlineCode};
/// use serde_json::json;
///
/// let blink = InlineCode::new(|args| format!("led.value({})", args[0]));
/// assert_eq!(blink.invocation("", &[json!(1)]).unwrap(), "led.value(1)");
/// ```
#[derive(Clone)]
pub struct InlineCode {
    render: Arc<Render>,
}

impl InlineCode {
    /// Render code from the call arguments.
    pub fn new<F>(render: F) -> Self
    where
        F: Fn(&[Value]) -> String + Send + Sync + 'static,
    {
        Self {
            render: Arc::new(render),
        }
    }

    /// The same code on every call.
    pub fn fixed(code: impl Into<String>) -> Self {
        let code = code.into();
        Self::new(move |_| code.clone())
    }
}

impl fmt::Debug for InlineCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InlineCode").finish_non_exhaustive()
    }
}

impl CodeProvider for InlineCode {
    fn fingerprint(&self) -> String {
        "inline".to_string()
    }

    fn definition(&self, _symbol: &str) -> Option<String> {
        None
    }

    fn invocation(&self, _symbol: &str, args: &[Value]) -> Result<String, ClassifiedError> {
        Ok((self.render)(args))
    }
}

/// Render a JSON value as a Python literal.
pub fn python_literal(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        // JSON string escapes are valid Python string escapes.
        Value::String(s) => Value::String(s.clone()).to_string(),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(python_literal).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Object(map) => {
            let entries: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", Value::String(k.clone()), python_literal(v)))
                .collect();
            format!("{{{}}}", entries.join(", "))
        }
    }
}

/// Render arguments as a Python tuple literal.
pub fn python_tuple(args: &[Value]) -> String {
    match args {
        [] => "()".to_string(),
        [single] => format!("({},)", python_literal(single)),
        _ => {
            let items: Vec<String> = args.iter().map(python_literal).collect();
            format!("({})", items.join(", "))
        }
    }
}

pub(crate) fn check_arity(expected: usize, args: &[Value]) -> Result<(), ClassifiedError> {
    if args.len() == expected {
        return Ok(());
    }
    Err(ClassifiedError::invalid_request(format!(
        "expected {expected} argument(s), got {}",
        args.len()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorKind;
    use serde_json::json;

    #[test]
    fn literals() {
        assert_eq!(python_literal(&json!(null)), "None");
        assert_eq!(python_literal(&json!(true)), "True");
        assert_eq!(python_literal(&json!(2.5)), "2.5");
        assert_eq!(python_literal(&json!("it's \"x\"\n")), "\"it's \\\"x\\\"\\n\"");
        assert_eq!(python_literal(&json!([1, false])), "[1, False]");
        assert_eq!(python_literal(&json!({"pin": 2})), "{\"pin\": 2}");
    }

    #[test]
    fn tuples() {
        assert_eq!(python_tuple(&[]), "()");
        assert_eq!(python_tuple(&[json!(1)]), "(1,)");
        assert_eq!(python_tuple(&[json!(1), json!("a")]), "(1, \"a\")");
    }

    #[test]
    fn function_definition_indents_body() {
        let f = PythonFunction::new("x = a * 2\n\nreturn x").param("a");
        assert_eq!(
            f.definition("_mpy_double").unwrap(),
            "def _mpy_double(a):\n    x = a * 2\n\n    return x\n"
        );
    }

    #[test]
    fn empty_body_is_rejected() {
        let f = PythonFunction::new("  \n");
        assert_eq!(f.definition("f"), None);
        let err = f.invocation("f", &[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
    }

    #[test]
    fn invocation_checks_arity() {
        let f = PythonFunction::new("return a").param("a");
        let err = f.invocation("f", &[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);

        let call = f.invocation("f", &[json!(3)]).unwrap();
        assert!(call.starts_with("_mpy_r = f(3)\n"));
    }

    #[test]
    fn fingerprint_tracks_body() {
        let a = PythonFunction::new("return 1");
        let b = PythonFunction::new("return 2");
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), a.clone().param("x").fingerprint());
    }

    #[test]
    fn inline_code_is_never_deployed() {
        let code = InlineCode::fixed("import machine");
        assert_eq!(code.definition("sym"), None);
        assert_eq!(code.invocation("sym", &[]).unwrap(), "import machine");
        assert!(code.parameters().is_empty());
    }
}
