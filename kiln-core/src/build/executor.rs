// kiln-core/src/build/executor.rs
//! Install Recipe Executor.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use kiln_aio::process::{run_command_async, CommandSpec};
use kiln_common::error::{KilnError, Result};
use kiln_common::model::InstallStep;
use kiln_common::pipeline::{InstallResult, InstallStatus, PipelineEvent, StepOutcome};
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use crate::sandbox::{BuildContext, Confinement};

/// Exit code recorded when a tool cannot be found, as a shell would report it.
pub const EXIT_NOT_FOUND: i32 = 127;
/// Exit code recorded when a tool exists but cannot be started.
pub const EXIT_NOT_EXECUTABLE: i32 = 126;

/// Runs the recipe in order and stops at the first failing step.
///
/// A failing step is not an `Err`: it is reported in the returned `InstallResult`.
/// Errors are reserved for problems of the engine itself.
#[instrument(skip_all, fields(formula = %context.formula()))]
pub async fn execute(
    install_recipe: &[InstallStep],
    context: &BuildContext,
    confinement: &dyn Confinement,
    event_tx: &broadcast::Sender<PipelineEvent>,
) -> Result<InstallResult> {
    let subs = context.substitutions();
    let mut env = context.env().clone();
    let mut steps = Vec::with_capacity(install_recipe.len());

    for (index, step) in install_recipe.iter().enumerate() {
        let started = Instant::now();
        match step {
            InstallStep::SetEnv { name, value } => {
                let value = subs.expand_str(value)?;
                debug!("Step {}: {}={}", index, name, value);
                steps.push(StepOutcome {
                    index,
                    command: format!("set {name}={value}"),
                    exit_code: 0,
                    output: String::new(),
                    duration: started.elapsed(),
                });
                env.insert(name.clone(), value);
            }
            InstallStep::Invoke {
                tool,
                args,
                ldflags,
                cwd,
            } => {
                let tool = subs.expand_str(tool)?;
                let mut argv = Vec::new();
                for arg in args {
                    argv.extend(subs.expand_arg(arg, ldflags.as_deref())?);
                }
                let cwd = match cwd {
                    Some(dir) => context.source_dir().join(subs.expand_str(dir)?),
                    None => context.source_dir().to_path_buf(),
                };
                let command = std::iter::once(tool.as_str())
                    .chain(argv.iter().map(String::as_str))
                    .collect::<Vec<_>>()
                    .join(" ");

                debug!("Step {}: {}", index, command);
                let _ = event_tx.send(PipelineEvent::BuildStepStarted {
                    target_id: context.formula().to_string(),
                    index,
                    command: command.clone(),
                });

                let (exit_code, output) = match locate_tool(&tool, &env, &cwd) {
                    Some(program) => {
                        let spec = confinement.wrap(CommandSpec {
                            program,
                            args: argv,
                            cwd,
                            env: env.clone(),
                        });
                        match run_command_async(&spec).await {
                            Ok(out) => (out.exit_code, out.combined),
                            Err(KilnError::CommandExecError(msg)) => (EXIT_NOT_EXECUTABLE, msg),
                            Err(e) => return Err(e),
                        }
                    }
                    None => (EXIT_NOT_FOUND, format!("{tool}: command not found\n")),
                };

                steps.push(StepOutcome {
                    index,
                    command,
                    exit_code,
                    output,
                    duration: started.elapsed(),
                });

                if exit_code != 0 {
                    warn!(
                        "Install step {} of {} exited with {}",
                        index,
                        context.formula(),
                        exit_code
                    );
                    return Ok(InstallResult {
                        status: InstallStatus::Failed {
                            step: index,
                            exit_code,
                        },
                        steps,
                    });
                }
            }
        }
    }

    Ok(InstallResult {
        status: InstallStatus::Success,
        steps,
    })
}

/// Finds `tool` on the step's PATH, or relative to `cwd` when it names a path.
fn locate_tool(tool: &str, env: &BTreeMap<String, String>, cwd: &Path) -> Option<PathBuf> {
    if tool.contains('/') {
        let path = cwd.join(tool);
        return path.is_file().then_some(path);
    }
    let path = env.get("PATH").map(String::as_str).unwrap_or_default();
    which::which_in(tool, Some(path), cwd).ok()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::sandbox::PathAudit;
    use crate::test_support::{fixture, write_tool};

    fn invoke(tool: &str, args: &[&str]) -> InstallStep {
        InstallStep::Invoke {
            tool: tool.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            ldflags: None,
            cwd: None,
        }
    }

    #[tokio::test]
    async fn runs_steps_in_order_with_substitutions_and_env() {
        let fx = fixture("1.0");
        write_tool(
            &fx.tools,
            "record",
            "mkdir -p \"$KILN_PREFIX\"\necho \"$GREETING $*\" >> \"$KILN_PREFIX/log\"\necho done",
        );
        let recipe = vec![
            invoke("record", &["first"]),
            InstallStep::SetEnv {
                name: "GREETING".into(),
                value: "hi-{name}".into(),
            },
            invoke("record", &["{bin}"]),
        ];
        let (tx, _) = broadcast::channel(16);
        let audit = PathAudit::new(&fx.config);

        let result = execute(&recipe, &fx.context, &audit, &tx).await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.steps.len(), 3);
        assert_eq!(result.steps[0].output, "done\n");
        assert_eq!(result.steps[1].command, "set GREETING=hi-demo");
        let log = std::fs::read_to_string(fx.context.prefix().join("log")).unwrap();
        let bin = fx.context.prefix().join("bin");
        assert_eq!(log, format!(" first\nhi-demo {}\n", bin.display()));
    }

    #[tokio::test]
    async fn stops_at_first_failing_step() {
        let fx = fixture("1.0");
        write_tool(&fx.tools, "fail", "echo broken >&2\nexit 3");
        write_tool(&fx.tools, "touch-prefix", "mkdir -p \"$KILN_PREFIX\" && touch \"$KILN_PREFIX/ran\"");
        let recipe = vec![invoke("fail", &[]), invoke("touch-prefix", &[])];
        let (tx, _) = broadcast::channel(16);

        let result = execute(&recipe, &fx.context, &PathAudit::new(&fx.config), &tx)
            .await
            .unwrap();

        assert_eq!(
            result.status,
            InstallStatus::Failed {
                step: 0,
                exit_code: 3
            }
        );
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.failed_step().map(|s| s.output.as_str()), Some("broken\n"));
        assert!(!fx.context.prefix().join("ran").exists());
    }

    #[tokio::test]
    async fn missing_tool_exits_127() {
        let fx = fixture("1.0");
        let (tx, _) = broadcast::channel(16);
        let result = execute(&[invoke("no-such-tool", &[])], &fx.context, &PathAudit::new(&fx.config), &tx)
            .await
            .unwrap();
        assert_eq!(
            result.status,
            InstallStatus::Failed {
                step: 0,
                exit_code: EXIT_NOT_FOUND
            }
        );
    }
}
