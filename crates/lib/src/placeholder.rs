//! Placeholder parsing and substitution for recipe strings.
//!
//! Formula descriptors cannot know where things will live at build time:
//! the installation prefix, the extracted source tree, or the prefix of a
//! dependency. Recipe arguments, shell steps and environment values refer to
//! those through placeholders that are substituted right before invocation.
//!
//! # Placeholder Formats
//!
//! - `$${prefix}` - installation prefix of the formula being built
//! - `$${name}` - formula name
//! - `$${version}` - formula version
//! - `$${version_suffix}` - `major.minor` part of the version
//! - `$${src}` - root of the extracted source tree
//! - `$${jobs}` - configured build parallelism
//! - `$${formula:<name>}` - installation prefix of another formula
//!
//! # Shell Variables
//!
//! Single `$` characters pass through unchanged, so shell variables like
//! `$HOME` and `$PATH` work naturally without any escaping.
//!
//! # Escaping
//!
//! Use `$$$` before `{` to produce a literal `$${` sequence.
//!
//! # Example
//!
//! ```
//! use kiln_lib::placeholder::{parse, Placeholder, Segment, Variable};
//!
//! let segments = parse("$${prefix}/bin:$PATH").unwrap();
//! assert_eq!(segments, vec![
//!     Segment::Placeholder(Placeholder::Var(Variable::Prefix)),
//!     Segment::Literal("/bin:$PATH".to_string()),
//! ]);
//! ```

use thiserror::Error;

/// Build-time values addressable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variable {
  Prefix,
  Name,
  Version,
  VersionSuffix,
  Src,
  Jobs,
}

impl Variable {
  fn from_name(name: &str) -> Option<Self> {
    match name {
      "prefix" => Some(Self::Prefix),
      "name" => Some(Self::Name),
      "version" => Some(Self::Version),
      "version_suffix" => Some(Self::VersionSuffix),
      "src" => Some(Self::Src),
      "jobs" => Some(Self::Jobs),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Prefix => "prefix",
      Self::Name => "name",
      Self::Version => "version",
      Self::VersionSuffix => "version_suffix",
      Self::Src => "src",
      Self::Jobs => "jobs",
    }
  }
}

/// A parsed placeholder reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
  /// `$${prefix}`, `$${version}`, ...
  Var(Variable),

  /// `$${formula:<name>}` - prefix of another formula
  Formula(String),
}

/// A segment of parsed text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
  /// Literal text (no placeholders)
  Literal(String),

  /// A placeholder to be resolved
  Placeholder(Placeholder),
}

/// Errors that can occur during placeholder parsing or resolution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaceholderError {
  #[error("unclosed placeholder at position {0}")]
  Unclosed(usize),

  #[error("unknown placeholder: {0}")]
  Unknown(String),

  #[error("malformed placeholder: {0}")]
  Malformed(String),

  #[error("unresolved variable: {0}")]
  UnresolvedVariable(&'static str),

  #[error("unresolved formula prefix: {0}")]
  UnresolvedFormula(String),
}

/// Trait for resolving placeholder values right before invocation.
pub trait Resolver {
  /// Resolve a named build variable.
  fn resolve_var(&self, var: Variable) -> Result<&str, PlaceholderError>;

  /// Resolve the installation prefix of another formula.
  fn resolve_formula(&self, name: &str) -> Result<&str, PlaceholderError>;
}

/// Parse a string containing placeholders into segments.
///
/// # Errors
///
/// Returns an error if a placeholder is malformed (unclosed, unknown name, etc.)
pub fn parse(input: &str) -> Result<Vec<Segment>, PlaceholderError> {
  let mut segments = Vec::new();
  let mut literal = String::new();
  let mut chars = input.char_indices().peekable();

  while let Some((pos, ch)) = chars.next() {
    if ch != '$' {
      literal.push(ch);
      continue;
    }

    match chars.peek() {
      Some((_, '$')) => {
        chars.next();

        match chars.peek() {
          Some((_, '$')) => {
            chars.next();

            match chars.peek() {
              Some((_, '{')) => {
                // Escaped: $$${ -> $${ (literal)
                literal.push_str("$${");
                chars.next();
              }
              _ => literal.push_str("$$$"),
            }
          }
          Some((_, '{')) => {
            chars.next();

            if !literal.is_empty() {
              segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }

            let mut content = String::new();
            let mut found_close = false;

            for (_, c) in chars.by_ref() {
              if c == '}' {
                found_close = true;
                break;
              }
              content.push(c);
            }

            if !found_close {
              return Err(PlaceholderError::Unclosed(pos));
            }

            segments.push(Segment::Placeholder(parse_placeholder_content(&content)?));
          }
          _ => literal.push_str("$$"),
        }
      }
      // A lone $ is a shell variable
      _ => literal.push('$'),
    }
  }

  if !literal.is_empty() {
    segments.push(Segment::Literal(literal));
  }

  Ok(segments)
}

/// Parse the content inside a placeholder (everything between `$${` and `}`).
fn parse_placeholder_content(content: &str) -> Result<Placeholder, PlaceholderError> {
  if let Some(var) = Variable::from_name(content) {
    return Ok(Placeholder::Var(var));
  }

  match content.split_once(':') {
    Some(("formula", name)) if !name.is_empty() && !name.contains(':') => Ok(Placeholder::Formula(name.to_string())),
    Some(("formula", _)) => Err(PlaceholderError::Malformed(format!("bad formula reference '{content}'"))),
    _ => Err(PlaceholderError::Unknown(content.to_string())),
  }
}

/// Substitute all placeholders in a string using the provided resolver.
///
/// # Errors
///
/// Returns an error if parsing fails or if any placeholder cannot be resolved.
pub fn substitute(input: &str, resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let segments = parse(input)?;
  let mut result = String::with_capacity(input.len());

  for segment in &segments {
    match segment {
      Segment::Literal(s) => result.push_str(s),
      Segment::Placeholder(Placeholder::Var(var)) => result.push_str(resolver.resolve_var(*var)?),
      Segment::Placeholder(Placeholder::Formula(name)) => result.push_str(resolver.resolve_formula(name)?),
    }
  }

  Ok(result)
}

/// Names of all formulas referenced through `$${formula:<name>}`.
pub fn formula_references(input: &str) -> Result<Vec<String>, PlaceholderError> {
  Ok(
    parse(input)?
      .into_iter()
      .filter_map(|segment| match segment {
        Segment::Placeholder(Placeholder::Formula(name)) => Some(name),
        _ => None,
      })
      .collect(),
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  struct TestResolver {
    vars: HashMap<Variable, String>,
    formulas: HashMap<String, String>,
  }

  impl TestResolver {
    fn new() -> Self {
      Self {
        vars: HashMap::new(),
        formulas: HashMap::new(),
      }
    }

    fn with_var(mut self, var: Variable, value: &str) -> Self {
      self.vars.insert(var, value.to_string());
      self
    }

    fn with_formula(mut self, name: &str, prefix: &str) -> Self {
      self.formulas.insert(name.to_string(), prefix.to_string());
      self
    }
  }

  impl Resolver for TestResolver {
    fn resolve_var(&self, var: Variable) -> Result<&str, PlaceholderError> {
      self
        .vars
        .get(&var)
        .map(|s| s.as_str())
        .ok_or(PlaceholderError::UnresolvedVariable(var.as_str()))
    }

    fn resolve_formula(&self, name: &str) -> Result<&str, PlaceholderError> {
      self
        .formulas
        .get(name)
        .map(|s| s.as_str())
        .ok_or_else(|| PlaceholderError::UnresolvedFormula(name.to_string()))
    }
  }

  #[test]
  fn configure_prefix_argument() {
    let resolver = TestResolver::new().with_var(Variable::Prefix, "/opt/kiln/avr-gcc/4.8.2");
    let result = substitute("--prefix=$${prefix}", &resolver).unwrap();
    assert_eq!(result, "--prefix=/opt/kiln/avr-gcc/4.8.2");
  }

  #[test]
  fn legacy_assembler_from_dependency_prefix() {
    let resolver = TestResolver::new().with_formula("cctools", "/opt/kiln/cctools/806");
    let result = substitute("$${formula:cctools}/bin/as", &resolver).unwrap();
    assert_eq!(result, "/opt/kiln/cctools/806/bin/as");
  }

  #[test]
  fn shell_step_mixes_placeholders_and_shell_variables() {
    let resolver = TestResolver::new()
      .with_var(Variable::Prefix, "/p")
      .with_var(Variable::Jobs, "8");

    let script = "make -j$${jobs} && make install DESTDIR=$DESTDIR prefix=$${prefix}";
    let result = substitute(script, &resolver).unwrap();

    assert_eq!(result, "make -j8 && make install DESTDIR=$DESTDIR prefix=/p");
  }

  #[test]
  fn program_suffix_argument() {
    let resolver = TestResolver::new().with_var(Variable::VersionSuffix, "4.8");
    assert_eq!(
      substitute("--program-suffix=-$${version_suffix}", &resolver).unwrap(),
      "--program-suffix=-4.8"
    );
  }

  #[test]
  fn formula_references_are_collected() {
    let refs = formula_references("$${formula:cctools}/bin/as:$${formula:binutils}/bin:$${prefix}").unwrap();
    assert_eq!(refs, vec!["cctools".to_string(), "binutils".to_string()]);
  }

  #[test]
  fn error_unclosed_placeholder() {
    let result = parse("./configure $${prefix");
    assert!(matches!(result, Err(PlaceholderError::Unclosed(12))));
  }

  #[test]
  fn error_unknown_placeholder() {
    let result = parse("$${out}");
    assert!(matches!(result, Err(PlaceholderError::Unknown(ref s)) if s == "out"));
  }

  #[test]
  fn error_empty_formula_reference() {
    assert!(matches!(parse("$${formula:}"), Err(PlaceholderError::Malformed(_))));
  }

  #[test]
  fn error_unresolved_formula() {
    let resolver = TestResolver::new();
    let result = substitute("$${formula:cctools}/bin/as", &resolver);
    assert!(matches!(result, Err(PlaceholderError::UnresolvedFormula(ref n)) if n == "cctools"));
  }

  #[test]
  fn shell_variables_pass_through() {
    let resolver = TestResolver::new();
    let result = substitute("echo $HOME $PATH $1 $? costs $5$", &resolver).unwrap();
    assert_eq!(result, "echo $HOME $PATH $1 $? costs $5$");
  }

  #[test]
  fn double_dollar_without_brace_preserved() {
    let resolver = TestResolver::new();
    assert_eq!(substitute("echo $$pid", &resolver).unwrap(), "echo $$pid");
  }

  #[test]
  fn escape_placeholder_syntax() {
    let resolver = TestResolver::new();
    let result = substitute("echo $$${prefix}", &resolver).unwrap();
    assert_eq!(result, "echo $${prefix}");
  }

  #[test]
  fn adjacent_placeholders_no_separator() {
    let resolver = TestResolver::new()
      .with_var(Variable::Name, "avr-gcc")
      .with_var(Variable::Version, "4.8.2");
    assert_eq!(
      substitute("$${name}-$${version}$${name}", &resolver).unwrap(),
      "avr-gcc-4.8.2avr-gcc"
    );
  }

  #[test]
  fn empty_input() {
    assert!(parse("").unwrap().is_empty());
  }
}
