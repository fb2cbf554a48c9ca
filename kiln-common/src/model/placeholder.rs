//! Symbolic placeholders inside recipe strings.
//!
//! A template is a string such as `-o={bin}/{name}` or `{dep:go}/libexec`.
//! `{{` and `}}` stand for literal braces. Bundle placeholders such as
//! `{std_go_args}` expand to several arguments and must make up a whole
//! argument on their own.

use std::fmt;
use std::str::FromStr;

use crate::error::{KilnError, Result};

/// Path-like and identity variables known for every build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathVar {
    Prefix,
    Bin,
    Sbin,
    Lib,
    Libexec,
    Include,
    Share,
    Pkgshare,
    Man,
    Etc,
    Opt,
    Buildpath,
    Name,
    Version,
    Root,
}

impl PathVar {
    pub const ALL: [PathVar; 15] = [
        Self::Prefix,
        Self::Bin,
        Self::Sbin,
        Self::Lib,
        Self::Libexec,
        Self::Include,
        Self::Share,
        Self::Pkgshare,
        Self::Man,
        Self::Etc,
        Self::Opt,
        Self::Buildpath,
        Self::Name,
        Self::Version,
        Self::Root,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prefix => "prefix",
            Self::Bin => "bin",
            Self::Sbin => "sbin",
            Self::Lib => "lib",
            Self::Libexec => "libexec",
            Self::Include => "include",
            Self::Share => "share",
            Self::Pkgshare => "pkgshare",
            Self::Man => "man",
            Self::Etc => "etc",
            Self::Opt => "opt",
            Self::Buildpath => "buildpath",
            Self::Name => "name",
            Self::Version => "version",
            Self::Root => "root",
        }
    }
}

impl FromStr for PathVar {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL.into_iter().find(|v| v.as_str() == s).ok_or(())
    }
}

/// Standard argument bundles of common build tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgBundle {
    StdGoArgs,
    StdCargoArgs,
    StdCmakeArgs,
    StdConfigureArgs,
}

impl ArgBundle {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StdGoArgs => "std_go_args",
            Self::StdCargoArgs => "std_cargo_args",
            Self::StdCmakeArgs => "std_cmake_args",
            Self::StdConfigureArgs => "std_configure_args",
        }
    }
}

impl FromStr for ArgBundle {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "std_go_args" => Ok(Self::StdGoArgs),
            "std_cargo_args" => Ok(Self::StdCargoArgs),
            "std_cmake_args" => Ok(Self::StdCmakeArgs),
            "std_configure_args" => Ok(Self::StdConfigureArgs),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Var(PathVar),
    Dep(String),
    Bundle(ArgBundle),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    raw: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Parses a template that may not contain bundle placeholders
    /// (environment values, ldflags, paths).
    pub fn parse_value(raw: &str) -> Result<Self> {
        let template = Self::parse(raw)?;
        if let Some(bundle) = template.segments.iter().find_map(|s| match s {
            Segment::Bundle(b) => Some(*b),
            _ => None,
        }) {
            return Err(KilnError::ValidationError(format!(
                "'{{{}}}' can only be used as a standalone tool argument (in '{raw}')",
                bundle.as_str()
            )));
        }
        Ok(template)
    }

    /// Parses a tool argument. Bundles are allowed only as the entire argument.
    pub fn parse_arg(raw: &str) -> Result<Self> {
        let template = Self::parse(raw)?;
        let has_bundle = template
            .segments
            .iter()
            .any(|s| matches!(s, Segment::Bundle(_)));
        if has_bundle && template.segments.len() != 1 {
            return Err(KilnError::ValidationError(format!(
                "argument bundles must form a whole argument, got '{raw}'"
            )));
        }
        Ok(template)
    }

    fn parse(raw: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = raw.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for inner in chars.by_ref() {
                        if inner == '}' {
                            closed = true;
                            break;
                        }
                        name.push(inner);
                    }
                    if !closed {
                        return Err(KilnError::ParseError(
                            "template",
                            format!("unterminated placeholder in '{raw}'"),
                        ));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Self::placeholder(raw, name.trim())?);
                }
                '}' => {
                    return Err(KilnError::ParseError(
                        "template",
                        format!("unmatched '}}' in '{raw}' (use '}}}}' for a literal brace)"),
                    ));
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    fn placeholder(raw: &str, name: &str) -> Result<Segment> {
        if let Some(dep) = name.strip_prefix("dep:") {
            let dep = dep.trim();
            if dep.is_empty() {
                return Err(KilnError::ValidationError(format!(
                    "empty dependency placeholder in '{raw}'"
                )));
            }
            return Ok(Segment::Dep(dep.to_string()));
        }
        if let Ok(var) = name.parse::<PathVar>() {
            return Ok(Segment::Var(var));
        }
        if let Ok(bundle) = name.parse::<ArgBundle>() {
            return Ok(Segment::Bundle(bundle));
        }
        Err(KilnError::ValidationError(format!(
            "unknown placeholder '{{{name}}}' in '{raw}'"
        )))
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The bundle this template consists of, if it is a bundle argument.
    pub fn bundle(&self) -> Option<ArgBundle> {
        match self.segments.as_slice() {
            [Segment::Bundle(b)] => Some(*b),
            _ => None,
        }
    }

    pub fn dependency_refs(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Dep(name) => Some(name.as_str()),
            _ => None,
        })
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_mixed_segments() {
        let t = Template::parse_arg("-o={bin}/{name}").unwrap();
        assert_eq!(
            t.segments(),
            &[
                Segment::Literal("-o=".into()),
                Segment::Var(PathVar::Bin),
                Segment::Literal("/".into()),
                Segment::Var(PathVar::Name),
            ]
        );
        assert_eq!(t.bundle(), None);
    }

    #[test]
    fn escapes_and_dependency_refs() {
        let t = Template::parse_value("{{literal}} {dep:go}/bin").unwrap();
        assert_eq!(
            t.segments(),
            &[
                Segment::Literal("{literal} ".into()),
                Segment::Dep("go".into()),
                Segment::Literal("/bin".into()),
            ]
        );
        assert_eq!(t.dependency_refs().collect::<Vec<_>>(), vec!["go"]);
    }

    #[test]
    fn bundles_must_stand_alone() {
        assert_eq!(
            Template::parse_arg("{std_go_args}").unwrap().bundle(),
            Some(ArgBundle::StdGoArgs)
        );
        assert!(Template::parse_arg("x{std_go_args}").is_err());
        assert!(Template::parse_value("{std_cmake_args}").is_err());
    }

    #[test]
    fn rejects_malformed_templates() {
        assert!(Template::parse_arg("{prefix").is_err());
        assert!(Template::parse_arg("a}b").is_err());
        assert!(Template::parse_arg("{nonsense}").is_err());
        assert!(Template::parse_arg("{dep:}").is_err());
    }
}
