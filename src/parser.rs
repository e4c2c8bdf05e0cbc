use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::space0;
use nom::combinator::value;
use nom::error::{ Error, ErrorKind };
use nom::sequence::tuple;
use nom::IResult;

// containers := [
//   {"id": "python:3.6.14-slim-buster", ...}
// ]
//
// allow_dump_stacks := false

type ParseResult<'a, T> = IResult<&'a str, T>;

fn assignment<'a>(i: &'a str, name: &str) -> ParseResult<'a, ()> {
  let (rest, _) = tuple((tag(name), space0, tag(":="), space0))(i)?;

  Ok((rest, ()))
}

// Text following `name :=` where the binding starts a line
fn binding<'a>(text: &'a str, name: &str) -> Option<&'a str> {
  text
    .match_indices(name)
    .filter(|(start, _)| *start == 0 || text[..*start].ends_with('\n'))
    .find_map(|(start, _)| assignment(&text[start..], name).ok())
    .map(|(rest, _)| rest)
}

// A JSON array, skipping brackets that appear inside strings
fn balanced_array(i: &str) -> ParseResult<&str> {
  if !i.starts_with('[') {
    return Err(nom::Err::Error(Error::new(i, ErrorKind::Char)));
  }

  let mut depth = 0usize;
  let mut in_string = false;
  let mut escaped = false;

  for (index, c) in i.char_indices() {
    if in_string {
      match c {
        _ if escaped => escaped = false,
        '\\' => escaped = true,
        '"' => in_string = false,
        _ => (),
      }
      continue;
    }

    match c {
      '"' => in_string = true,
      '[' => depth += 1,
      ']' => {
        depth -= 1;
        if depth == 0 {
          let end = index + c.len_utf8();
          return Ok((&i[end..], &i[..end]));
        }
      }
      _ => (),
    }
  }

  Err(nom::Err::Error(Error::new(i, ErrorKind::Eof)))
}

fn boolean(i: &str) -> ParseResult<bool> {
  alt((value(true, tag("true")), value(false, tag("false"))))(i)
}

pub fn extract_array<'a>(text: &'a str, name: &str) -> Option<&'a str> {
  let rest = binding(text, name)?;
  let (_, array) = balanced_array(rest).ok()?;

  Some(array)
}

pub fn extract_flag(text: &str, name: &str) -> Option<bool> {
  let rest = binding(text, name)?;
  let (_, flag) = boolean(rest).ok()?;

  Some(flag)
}
