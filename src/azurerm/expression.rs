use super::get_ci;
use super::parser::{ parse_template_string, Accessor, Expr, TemplateString };
use serde_json::{ Map, Value };
use std::cell::RefCell;
use std::collections::{ HashMap, HashSet };

// Deployment-time functions, rendered back as their own expression text
const OPAQUE_FUNCTIONS: &[&str] = &[
  "deployment",
  "environment",
  "guid",
  "listkeys",
  "reference",
  "resourcegroup",
  "resourceid",
  "subscription",
  "subscriptionresourceid",
  "uniquestring",
];

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
  #[error("field \"{0}\" not found in [\"parameters\"]")]
  UndeclaredParameter(String),

  #[error("field \"{0}\"'s value not found in [\"parameters\"] or the parameter file")]
  UnresolvedParameter(String),

  #[error("field \"{0}\" not found in [\"variables\"]")]
  UndeclaredVariable(String),

  #[error("\"{0}\" is defined in terms of itself")]
  CircularReference(String),

  #[error("unsupported template function {0}()")]
  UnsupportedFunction(String),

  #[error("{function}() expects {expected}")]
  InvalidArguments { function: String, expected: &'static str },

  #[error("property \"{0}\" not found")]
  MissingProperty(String),

  #[error("index {0} is out of range")]
  IndexOutOfRange(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
  pub name: String,
  pub default_value: Option<Value>,
  pub value: Option<Value>,
}

// Template parameter declarations merged with parameter file values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters(Vec<Parameter>);

impl Parameters {
  pub fn from_declarations(declarations: &Map<String, Value>) -> Self {
    Self(
      declarations
        .iter()
        .map(|(name, declaration)| Parameter {
          name: name.to_owned(),
          default_value: declaration
            .as_object()
            .and_then(|d| get_ci(d, "defaultValue"))
            .cloned(),
          value: None,
        })
        .collect(),
    )
  }

  pub fn get(&self, name: &str) -> Option<&Parameter> {
    self.0.iter().find(|p| p.name.eq_ignore_ascii_case(name))
  }

  // Returns false when the template does not declare `name`
  pub fn set_value(&mut self, name: &str, value: Value) -> bool {
    match self.0.iter_mut().find(|p| p.name.eq_ignore_ascii_case(name)) {
      Some(parameter) => {
        parameter.value = Some(value);
        true
      }
      None => false,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
enum Evaluated {
  Value(Value),
  Opaque(String),
}

impl Evaluated {
  fn into_value(self) -> Value {
    match self {
      Self::Value(value) => value,
      Self::Opaque(text) => Value::String(format!("[{}]", text)),
    }
  }
}

pub struct Evaluator<'a> {
  params: &'a Parameters,
  vars: &'a Map<String, Value>,
  resolved: RefCell<HashMap<String, Evaluated>>,
  in_progress: RefCell<HashSet<String>>,
}

impl<'a> Evaluator<'a> {
  pub fn new(params: &'a Parameters, vars: &'a Map<String, Value>) -> Self {
    Self {
      params,
      vars,
      resolved: RefCell::new(HashMap::new()),
      in_progress: RefCell::new(HashSet::new()),
    }
  }

  pub fn evaluate_str(&self, value: &str) -> Result<Value, EvalError> {
    Ok(self.evaluate_template_string(value)?.into_value())
  }

  // Evaluates every string inside `value`, keeping its shape
  pub fn resolve_value(&self, value: &Value) -> Result<Value, EvalError> {
    Ok(match value {
      Value::String(s) => self.evaluate_str(s)?,
      Value::Array(items) => Value::Array(
        items.iter().map(|item| self.resolve_value(item)).collect::<Result<_, _>>()?,
      ),
      Value::Object(map) => {
        let mut out = Map::new();
        for (key, item) in map {
          out.insert(key.clone(), self.resolve_value(item)?);
        }
        Value::Object(out)
      }
      other => other.clone(),
    })
  }

  fn evaluate_template_string(&self, value: &str) -> Result<Evaluated, EvalError> {
    match parse_template_string(value) {
      TemplateString::Literal(literal) => Ok(Evaluated::Value(Value::String(literal))),
      TemplateString::Expression(expr) => self.evaluate_expr(&expr),
    }
  }

  fn evaluate_node(&self, value: &Value) -> Result<Evaluated, EvalError> {
    match value {
      Value::String(s) => self.evaluate_template_string(s),
      other => Ok(Evaluated::Value(self.resolve_value(other)?)),
    }
  }

  fn evaluate_expr(&self, expr: &Expr) -> Result<Evaluated, EvalError> {
    match expr {
      Expr::String(s) => Ok(Evaluated::Value(Value::String(s.clone()))),
      Expr::Integer(n) => Ok(Evaluated::Value(Value::from(*n))),
      Expr::Call { name, args, accessors } => {
        let mut current = match self.evaluate_call(name, args)? {
          Evaluated::Opaque(_) => return Ok(Evaluated::Opaque(expr.to_string())),
          Evaluated::Value(value) => value,
        };

        for accessor in accessors {
          current = match accessor {
            Accessor::Property(property) => current
              .as_object()
              .and_then(|map| get_ci(map, property))
              .cloned()
              .ok_or_else(|| EvalError::MissingProperty(property.clone()))?,
            Accessor::Index(index) => match self.evaluate_expr(index)? {
              Evaluated::Opaque(_) => return Ok(Evaluated::Opaque(expr.to_string())),
              Evaluated::Value(index) => lookup_index(&current, &index)?,
            },
          };
        }

        Ok(Evaluated::Value(current))
      }
    }
  }

  fn evaluate_call(&self, name: &str, args: &[Expr]) -> Result<Evaluated, EvalError> {
    let function = name.to_ascii_lowercase();
    if OPAQUE_FUNCTIONS.contains(&function.as_str()) {
      return Ok(Evaluated::Opaque(name.to_owned()));
    }

    let mut values = Vec::with_capacity(args.len());
    for arg in args {
      match self.evaluate_expr(arg)? {
        Evaluated::Opaque(text) => return Ok(Evaluated::Opaque(text)),
        Evaluated::Value(value) => values.push(value),
      }
    }

    match function.as_str() {
      "parameters" => self.parameter(single_string(name, &values)?),
      "variables" => self.variable(single_string(name, &values)?),
      "concat" => Ok(Evaluated::Value(concat(values))),
      "format" => format_string(name, &values).map(Evaluated::Value),
      "tolower" => Ok(Evaluated::Value(Value::String(single_string(name, &values)?.to_lowercase()))),
      "toupper" => Ok(Evaluated::Value(Value::String(single_string(name, &values)?.to_uppercase()))),
      "string" => match values.as_slice() {
        [value] => Ok(Evaluated::Value(Value::String(to_text(value)))),
        _ => Err(EvalError::InvalidArguments { function: name.to_owned(), expected: "one argument" }),
      },
      "true" => Ok(Evaluated::Value(Value::Bool(true))),
      "false" => Ok(Evaluated::Value(Value::Bool(false))),
      _ => Err(EvalError::UnsupportedFunction(name.to_owned())),
    }
  }

  fn parameter(&self, name: &str) -> Result<Evaluated, EvalError> {
    let parameter = self
      .params
      .get(name)
      .ok_or_else(|| EvalError::UndeclaredParameter(name.to_owned()))?;

    // parameter file values are literal, defaults may be expressions
    if let Some(value) = &parameter.value {
      return Ok(Evaluated::Value(value.clone()));
    }

    let default_value = parameter
      .default_value
      .as_ref()
      .ok_or_else(|| EvalError::UnresolvedParameter(name.to_owned()))?;

    self.guarded(format!("parameters/{}", name.to_lowercase()), name, || {
      self.evaluate_node(default_value)
    })
  }

  fn variable(&self, name: &str) -> Result<Evaluated, EvalError> {
    let key = format!("variables/{}", name.to_lowercase());
    if let Some(hit) = self.resolved.borrow().get(&key) {
      return Ok(hit.clone());
    }

    let raw = get_ci(self.vars, name).ok_or_else(|| EvalError::UndeclaredVariable(name.to_owned()))?;
    let evaluated = self.guarded(key.clone(), name, || self.evaluate_node(raw))?;
    self.resolved.borrow_mut().insert(key, evaluated.clone());

    Ok(evaluated)
  }

  fn guarded<F>(&self, key: String, name: &str, f: F) -> Result<Evaluated, EvalError>
  where
    F: FnOnce() -> Result<Evaluated, EvalError>,
  {
    if !self.in_progress.borrow_mut().insert(key.clone()) {
      return Err(EvalError::CircularReference(name.to_owned()));
    }
    let result = f();
    self.in_progress.borrow_mut().remove(&key);

    result
  }
}

pub fn evaluate(expr: &str, params: &Parameters, vars: &Map<String, Value>) -> Result<Value, EvalError> {
  Evaluator::new(params, vars).evaluate_str(expr)
}

// The parameter name when `value` is nothing but `[parameters('name')]`
pub fn parameter_reference(value: &str) -> Option<String> {
  match parse_template_string(value) {
    TemplateString::Expression(Expr::Call { name, args, accessors })
      if name.eq_ignore_ascii_case("parameters") && accessors.is_empty() =>
    {
      match args.as_slice() {
        [Expr::String(parameter)] => Some(parameter.clone()),
        _ => None,
      }
    }
    _ => None,
  }
}

fn single_string<'v>(function: &str, values: &'v [Value]) -> Result<&'v str, EvalError> {
  match values {
    [Value::String(s)] => Ok(s),
    _ => Err(EvalError::InvalidArguments { function: function.to_owned(), expected: "a single string argument" }),
  }
}

fn to_text(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    Value::Null => String::new(),
    other => other.to_string(),
  }
}

fn concat(values: Vec<Value>) -> Value {
  if !values.is_empty() && values.iter().all(Value::is_array) {
    let items = values
      .into_iter()
      .flat_map(|v| match v {
        Value::Array(items) => items,
        _ => vec![],
      })
      .collect();
    return Value::Array(items);
  }

  Value::String(values.iter().map(to_text).collect())
}

fn format_string(function: &str, values: &[Value]) -> Result<Value, EvalError> {
  let (template, args) = match values.split_first() {
    Some((Value::String(template), args)) => (template, args),
    _ => return Err(EvalError::InvalidArguments { function: function.to_owned(), expected: "a format string" }),
  };

  let mut out = template.clone();
  for (i, arg) in args.iter().enumerate() {
    out = out.replace(&format!("{{{}}}", i), &to_text(arg));
  }

  Ok(Value::String(out))
}

fn lookup_index(container: &Value, index: &Value) -> Result<Value, EvalError> {
  let found = match (container, index) {
    (Value::Array(items), Value::Number(n)) => n.as_u64().and_then(|i| items.get(i as usize)),
    (Value::Object(map), Value::String(key)) => get_ci(map, key),
    _ => None,
  };

  found.cloned().ok_or_else(|| EvalError::IndexOutOfRange(to_text(index)))
}
