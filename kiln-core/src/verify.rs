// kiln-core/src/verify.rs
//! Test Runner & Verifier.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kiln_aio::fs::is_executable;
use kiln_aio::process::{run_command_async, CommandSpec};
use kiln_common::config::{join_paths_lossy, Config};
use kiln_common::dependency::DependencyPhase;
use kiln_common::error::{KilnError, Result};
use kiln_common::keg::{InstalledIndex, InstalledKeg};
use kiln_common::model::{Assertion, Formula};
use kiln_common::pipeline::{AssertionOutcome, VerificationResult};
use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::build::Substitutions;
use crate::sandbox::env::{build_env, path_dirs, EnvSpec};

/// Evaluates every assertion of `test_recipe` against `install_prefix`.
///
/// Assertions are independent: a failure does not stop the others. Missing paths and
/// programs that cannot be run are failed assertions, not errors.
#[instrument(skip_all, fields(prefix = %install_prefix.display()))]
pub async fn verify(
    test_recipe: &[Assertion],
    install_prefix: &Path,
    env: &BTreeMap<String, String>,
    substitutions: &Substitutions,
) -> VerificationResult {
    let mut outcomes = Vec::with_capacity(test_recipe.len());
    for assertion in test_recipe {
        let description = assertion.description();
        let outcome = match evaluate(assertion, install_prefix, env, substitutions).await {
            Ok(None) => AssertionOutcome {
                description,
                passed: true,
                detail: None,
            },
            Ok(Some(detail)) => AssertionOutcome {
                description,
                passed: false,
                detail: Some(detail),
            },
            Err(e) => AssertionOutcome {
                description,
                passed: false,
                detail: Some(e.to_string()),
            },
        };
        if outcome.passed {
            debug!("PASS {}", outcome.description);
        } else {
            warn!(
                "FAIL {}: {}",
                outcome.description,
                outcome.detail.as_deref().unwrap_or_default()
            );
        }
        outcomes.push(outcome);
    }
    VerificationResult::from_outcomes(outcomes)
}

/// Re-runs the test recipe of `formula` against its installed keg.
///
/// Dependencies that are no longer installed are left out; a placeholder that names
/// one fails the assertion using it.
#[instrument(skip_all, fields(formula = %formula.name, version = %keg.version))]
pub async fn verify_installed(
    config: &Config,
    formula: &Formula,
    keg: &InstalledKeg,
    index: &InstalledIndex,
) -> Result<VerificationResult> {
    let mut dependencies = BTreeMap::new();
    let mut runtime = Vec::new();
    let mut all = Vec::new();
    for dep in formula.dependencies() {
        let Some(installed) = index.get(&dep.name) else {
            debug!("{} is not installed, leaving it out", dep.name);
            continue;
        };
        dependencies.insert(dep.name.clone(), installed.prefix.clone());
        if dep.phase == DependencyPhase::Run {
            runtime.push((dep.name.clone(), installed.prefix.clone()));
        }
        all.push((dep.name.clone(), installed.prefix));
    }

    std::fs::create_dir_all(config.tmp_dir())?;
    let scratch = tempfile::Builder::new()
        .prefix(&format!("{}-test-", formula.name))
        .tempdir_in(config.tmp_dir())?;
    let home = scratch.path().join("home");
    let tmp = scratch.path().join("tmp");
    std::fs::create_dir_all(&home)?;
    std::fs::create_dir_all(&tmp)?;

    let mut env = build_env(&EnvSpec {
        formula: &formula.name,
        prefix: &keg.prefix,
        home: &home,
        tmp: &tmp,
        path_dependencies: &runtime,
        library_dependencies: &all,
        base_path: &config.base_path,
    });
    let mut path = vec![keg.prefix.join("bin")];
    path.extend(path_dirs(&runtime, &config.base_path));
    env.insert("PATH".to_string(), join_paths_lossy(&path));

    let substitutions = Substitutions::new(
        formula.name.clone(),
        keg.version.clone(),
        &keg.prefix,
        config.kiln_root(),
        &keg.prefix,
        dependencies,
    );
    let result = verify(&formula.test, &keg.prefix, &env, &substitutions).await;
    if let Err(e) = scratch.close() {
        warn!("Failed to remove test scratch directory: {}", e);
    }
    Ok(result)
}

/// `Ok(None)` when the assertion holds, `Ok(Some(detail))` when it does not.
async fn evaluate(
    assertion: &Assertion,
    install_prefix: &Path,
    env: &BTreeMap<String, String>,
    subs: &Substitutions,
) -> Result<Option<String>> {
    match assertion {
        Assertion::PathExists { path } => {
            let path = subs.resolve_path(path)?;
            Ok((path.symlink_metadata().is_err())
                .then(|| format!("{} does not exist", path.display())))
        }
        Assertion::Executable { path } => {
            let path = subs.resolve_path(path)?;
            Ok((!is_executable(&path))
                .then(|| format!("{} is not an executable file", path.display())))
        }
        Assertion::InvokeSucceeds {
            program,
            args,
            output,
        } => {
            let program = subs.expand_str(program)?;
            let Some(resolved) = locate_program(&program, install_prefix, env) else {
                return Ok(Some(format!("{program}: not found")));
            };
            let mut argv = Vec::with_capacity(args.len());
            for arg in args {
                argv.push(subs.expand_str(arg)?);
            }
            let spec = CommandSpec {
                program: resolved,
                args: argv,
                cwd: install_prefix.to_path_buf(),
                env: env.clone(),
            };
            let out = match run_command_async(&spec).await {
                Ok(out) => out,
                Err(e) => return Ok(Some(e.to_string())),
            };
            if !out.success() {
                return Ok(Some(format!(
                    "exited with {}: {}",
                    out.exit_code,
                    out.combined.trim_end()
                )));
            }
            if let Some(pattern) = output {
                let re = Regex::new(pattern).map_err(|e| {
                    KilnError::ValidationError(format!(
                        "invalid output pattern '{pattern}': {e}"
                    ))
                })?;
                if !re.is_match(&out.stdout) {
                    return Ok(Some(format!(
                        "output did not match /{pattern}/: {}",
                        out.stdout.trim_end()
                    )));
                }
            }
            Ok(None)
        }
    }
}

/// Paths are taken relative to the prefix; bare names are looked up on PATH.
fn locate_program(
    program: &str,
    install_prefix: &Path,
    env: &BTreeMap<String, String>,
) -> Option<PathBuf> {
    if program.contains('/') {
        let path = install_prefix.join(program);
        return is_executable(&path).then_some(path);
    }
    let path = env.get("PATH").map(String::as_str).unwrap_or_default();
    which::which_in(program, Some(path), install_prefix).ok()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::test_support::{fixture, write_tool};

    #[tokio::test]
    async fn evaluates_every_assertion_and_reports_the_first_failure() {
        let fx = fixture("1.0");
        let prefix = fx.context.prefix();
        write_tool(&prefix.join("bin"), "demo", "echo demo version 1.0");

        let recipe = vec![
            Assertion::PathExists {
                path: "bin/missing".into(),
            },
            Assertion::Executable {
                path: "{bin}/demo".into(),
            },
            Assertion::InvokeSucceeds {
                program: "demo".into(),
                args: vec!["--version".into()],
                output: Some(r"version \d+\.\d+".into()),
            },
            Assertion::InvokeSucceeds {
                program: "bin/demo".into(),
                args: Vec::new(),
                output: Some("^nope$".into()),
            },
        ];

        let result = verify(
            &recipe,
            prefix,
            &fx.context.test_env(),
            fx.context.substitutions(),
        )
        .await;

        assert!(!result.passed);
        assert_eq!(result.failure_reason.as_deref(), Some("bin/missing exists"));
        let passed: Vec<bool> = result.outcomes.iter().map(|o| o.passed).collect();
        assert_eq!(passed, vec![false, true, true, false]);
    }

    #[tokio::test]
    async fn installed_keg_is_verified_with_its_runtime_dependencies() {
        let fx = fixture("1.0");
        let jq = fx.config.formula_keg_path("jq", "1.7");
        write_tool(&jq.join("bin"), "jq", "echo jq-1.7");
        write_tool(&fx.context.prefix().join("bin"), "demo", "jq");

        let index = InstalledIndex::in_memory();
        let keg_for = |name: &str, prefix: &Path| InstalledKeg {
            name: name.to_string(),
            version: prefix.file_name().unwrap().to_string_lossy().into_owned(),
            source: kiln_common::model::source::SourceReference::Sha256("0".repeat(64)),
            prefix: prefix.to_path_buf(),
            installed_at: chrono::Utc::now(),
            runtime_dependencies: Vec::new(),
        };
        index.mark_installed(keg_for("jq", jq.as_path())).unwrap();
        let demo = keg_for("demo", fx.context.prefix());
        index.mark_installed(demo.clone()).unwrap();

        let formula = Formula::from_toml_str(
            r#"
name = "demo"
version = "1.0"
dependencies = ["jq"]
test = [{ kind = "invoke_succeeds", program = "demo", output = '^jq-1\.7' }]

[source]
kind = "archive"
url = "https://example.com/demo-1.0.tar.gz"
sha256 = "0000000000000000000000000000000000000000000000000000000000000000"
"#,
        )
        .unwrap();
        let result = verify_installed(&fx.config, &formula, &demo, &index)
            .await
            .unwrap();
        assert!(result.passed, "{:?}", result.outcomes);
    }

    #[tokio::test]
    async fn unreachable_program_is_a_failed_assertion() {
        let fx = fixture("1.0");
        let recipe = vec![Assertion::InvokeSucceeds {
            program: "definitely-not-installed".into(),
            args: Vec::new(),
            output: None,
        }];
        let result = verify(
            &recipe,
            fx.context.prefix(),
            &fx.context.test_env(),
            fx.context.substitutions(),
        )
        .await;
        assert!(!result.passed);
        assert!(result.outcomes[0]
            .detail
            .as_deref()
            .unwrap()
            .contains("not found"));
    }
}
