use nom::{
  branch::alt,
  bytes::complete::{ is_not, tag },
  character::complete::{ alpha1, alphanumeric1, char, digit1, multispace0 },
  combinator::{ all_consuming, map, map_res, opt, recognize },
  multi::{ many0, many0_count, separated_list0 },
  sequence::{ delimited, pair, preceded, tuple },
  IResult
};
use std::fmt;

type ParseResult<'a, T> = IResult<&'a str, T>;

// [concat(parameters('registry'), '/', variables('image')).name]
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
  String(String),
  Integer(i64),
  Call {
    name: String,
    args: Vec<Expr>,
    accessors: Vec<Accessor>,
  },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Accessor {
  Property(String),
  Index(Expr),
}

// A JSON string value from a template, classified before evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateString {
  Literal(String),
  Expression(Expr),
}

fn identifier(i: &str) -> ParseResult<&str> {
  recognize(pair(alt((alpha1, tag("_"))), many0_count(alt((alphanumeric1, tag("_"))))))(i)
}

fn string_literal(i: &str) -> ParseResult<String> {
  let mut parser = delimited(
    char('\''),
    many0(alt((map(tag("''"), |_| "'"), is_not("'")))),
    char('\''),
  );
  let (rest, parts) = parser(i)?;

  Ok((rest, parts.concat()))
}

fn integer(i: &str) -> ParseResult<i64> {
  map_res(recognize(pair(opt(char('-')), digit1)), |s: &str| s.parse::<i64>())(i)
}

fn argument_delim(i: &str) -> ParseResult<char> {
  let (rest, (_, comma, _)) = tuple((multispace0, char(','), multispace0))(i)?;

  Ok((rest, comma))
}

fn arguments(i: &str) -> ParseResult<Vec<Expr>> {
  delimited(
    pair(char('('), multispace0),
    separated_list0(argument_delim, expression),
    pair(multispace0, char(')')),
  )(i)
}

fn accessor(i: &str) -> ParseResult<Accessor> {
  alt((
    map(preceded(char('.'), identifier), |name: &str| Accessor::Property(name.to_owned())),
    map(
      delimited(pair(char('['), multispace0), expression, pair(multispace0, char(']'))),
      Accessor::Index,
    ),
  ))(i)
}

fn call(i: &str) -> ParseResult<Expr> {
  let mut parser = tuple((identifier, multispace0, arguments, many0(accessor)));
  let (rest, (name, _, args, accessors)) = parser(i)?;

  Ok((rest, Expr::Call { name: name.to_owned(), args, accessors }))
}

pub fn expression(i: &str) -> ParseResult<Expr> {
  alt((call, map(string_literal, Expr::String), map(integer, Expr::Integer)))(i)
}

// Only a value that is bracketed as a whole is an expression. Anything else,
// including text that merely contains a function call, is kept verbatim.
pub fn parse_template_string(value: &str) -> TemplateString {
  if let Some(escaped) = value.strip_prefix("[[") {
    return TemplateString::Literal(format!("[{}", escaped));
  }

  let inner = match value.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
    Some(inner) => inner,
    None => return TemplateString::Literal(value.to_owned()),
  };

  match all_consuming(delimited(multispace0, expression, multispace0))(inner) {
    Ok((_, expr)) => TemplateString::Expression(expr),
    Err(e) => {
      tracing::debug!("treating {:?} as a literal, it is not a well formed expression: {}", value, e);
      TemplateString::Literal(value.to_owned())
    }
  }
}

impl fmt::Display for Expr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
      Self::Integer(n) => write!(f, "{}", n),
      Self::Call { name, args, accessors } => {
        write!(f, "{}(", name)?;
        for (i, arg) in args.iter().enumerate() {
          if i > 0 {
            write!(f, ", ")?;
          }
          write!(f, "{}", arg)?;
        }
        write!(f, ")")?;
        for accessor in accessors {
          match accessor {
            Accessor::Property(name) => write!(f, ".{}", name)?,
            Accessor::Index(index) => write!(f, "[{}]", index)?,
          }
        }
        Ok(())
      }
    }
  }
}
