use serde::{Deserialize, Serialize};

use super::placeholder::Template;
use crate::error::{KilnError, Result};

/// One step of an install recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstallStep {
    /// Run a build tool found on the sandbox `PATH`.
    Invoke {
        tool: String,
        #[serde(default)]
        args: Vec<String>,
        /// Linker flags handed to `{std_go_args}` and similar bundles.
        #[serde(default)]
        ldflags: Option<String>,
        /// Working directory relative to the source directory.
        #[serde(default)]
        cwd: Option<String>,
    },
    /// Set an environment variable for all following steps.
    SetEnv { name: String, value: String },
}

impl InstallStep {
    pub fn describe(&self) -> String {
        match self {
            Self::Invoke { tool, args, .. } if args.is_empty() => tool.clone(),
            Self::Invoke { tool, args, .. } => format!("{tool} {}", args.join(" ")),
            Self::SetEnv { name, value } => format!("set {name}={value}"),
        }
    }

    /// Parses every template of the step, so malformed recipes fail before anything runs.
    pub fn templates(&self) -> Result<Vec<Template>> {
        let mut out = Vec::new();
        match self {
            Self::Invoke {
                tool,
                args,
                ldflags,
                cwd,
            } => {
                if tool.trim().is_empty() {
                    return Err(KilnError::ValidationError(
                        "invoke step requires a tool".to_string(),
                    ));
                }
                out.push(Template::parse_value(tool)?);
                for arg in args {
                    out.push(Template::parse_arg(arg)?);
                }
                if let Some(flags) = ldflags {
                    out.push(Template::parse_value(flags)?);
                }
                if let Some(dir) = cwd {
                    out.push(Template::parse_value(dir)?);
                }
            }
            Self::SetEnv { name, value } => {
                let valid_name = !name.is_empty()
                    && !name.starts_with(|c: char| c.is_ascii_digit())
                    && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
                if !valid_name {
                    return Err(KilnError::ValidationError(format!(
                        "invalid environment variable name '{name}'"
                    )));
                }
                out.push(Template::parse_value(value)?);
            }
        }
        Ok(out)
    }
}

/// A post-install check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Assertion {
    /// Relative paths are taken relative to the install prefix.
    PathExists { path: String },
    Executable { path: String },
    /// The program must exit 0; when `output` is given, stdout must match it as a regex.
    InvokeSucceeds {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        output: Option<String>,
    },
}

impl Assertion {
    pub fn description(&self) -> String {
        match self {
            Self::PathExists { path } => format!("{path} exists"),
            Self::Executable { path } => format!("{path} is executable"),
            Self::InvokeSucceeds {
                program,
                args,
                output,
            } => {
                let command = std::iter::once(program.as_str())
                    .chain(args.iter().map(String::as_str))
                    .collect::<Vec<_>>()
                    .join(" ");
                match output {
                    Some(pattern) => format!("`{command}` outputs /{pattern}/"),
                    None => format!("`{command}` succeeds"),
                }
            }
        }
    }

    pub fn templates(&self) -> Result<Vec<Template>> {
        match self {
            Self::PathExists { path } | Self::Executable { path } => {
                Ok(vec![Template::parse_value(path)?])
            }
            Self::InvokeSucceeds {
                program,
                args,
                output,
            } => {
                if let Some(pattern) = output {
                    regex::Regex::new(pattern).map_err(|e| {
                        KilnError::ValidationError(format!(
                            "invalid output pattern '{pattern}': {e}"
                        ))
                    })?;
                }
                let mut out = vec![Template::parse_value(program)?];
                for arg in args {
                    out.push(Template::parse_value(arg)?);
                }
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Deserialize)]
    struct Recipe {
        install: Vec<InstallStep>,
        test: Vec<Assertion>,
    }

    #[test]
    fn parses_typed_steps_and_assertions() {
        let recipe: Recipe = toml::from_str(
            r#"
            [[install]]
            kind = "set_env"
            name = "CGO_ENABLED"
            value = "0"

            [[install]]
            kind = "invoke"
            tool = "go"
            args = ["build", "{std_go_args}", "./cmd/dvd"]
            ldflags = "-s -w"

            [[test]]
            kind = "path_exists"
            path = "bin/dvd"
            "#,
        )
        .unwrap();

        assert_eq!(recipe.install.len(), 2);
        assert_eq!(
            recipe.install[1].describe(),
            "go build {std_go_args} ./cmd/dvd"
        );
        assert_eq!(recipe.install[1].templates().unwrap().len(), 5);
        assert_eq!(recipe.test[0].description(), "bin/dvd exists");
    }

    #[test]
    fn rejects_bad_env_names_and_patterns() {
        let step = InstallStep::SetEnv {
            name: "1BAD".into(),
            value: "x".into(),
        };
        assert!(step.templates().is_err());

        let assertion = Assertion::InvokeSucceeds {
            program: "{bin}/dvd".into(),
            args: vec!["--version".into()],
            output: Some("(".into()),
        };
        assert!(assertion.templates().is_err());
        assert_eq!(
            Assertion::InvokeSucceeds {
                program: "{bin}/dvd".into(),
                args: vec!["--version".into()],
                output: None,
            }
            .description(),
            "`{bin}/dvd --version` succeeds"
        );
    }
}
