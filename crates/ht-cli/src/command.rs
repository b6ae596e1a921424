//! Scorer backed by an external command.
//!
//! Each trial spawns the configured program once. The parameters arrive as a
//! JSON object on stdin and in `HT_PARAMS`; the trial id is in `HT_TRIAL_ID`.
//! The program talks back on stdout, one directive per line:
//!
//! ```text
//! report <step> <value>
//! score <value>
//! ```
//!
//! Other lines are passed through to the debug log. A non-zero exit fails
//! the trial, and so does exiting without a `score` line. When the pruner
//! stops a trial the child is killed.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use tracing::{debug, warn};

use ht_optimizer::{EvalContext, Params, Scorer, ScorerSettings};
use ht_types::EvalError;

pub const PARAMS_ENV: &str = "HT_PARAMS";
pub const TRIAL_ID_ENV: &str = "HT_TRIAL_ID";

#[derive(Debug, Clone, PartialEq)]
enum Directive {
    Report { step: u64, value: f64 },
    Score(f64),
}

fn parse_directive(line: &str) -> Option<Directive> {
    let mut words = line.split_whitespace();
    match (words.next()?, words.next(), words.next(), words.next()) {
        ("report", Some(step), Some(value), None) => Some(Directive::Report {
            step: step.parse().ok()?,
            value: value.parse().ok()?,
        }),
        ("score", Some(value), None, None) => value.parse().ok().map(Directive::Score),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct CommandScorer {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandScorer {
    pub fn new(settings: &ScorerSettings) -> Self {
        Self {
            program: settings.command.clone(),
            args: settings.args.clone(),
            working_dir: settings.working_dir.clone(),
        }
    }

    fn spawn(&self, payload: &str, trial_id: u64) -> Result<Child, EvalError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env(PARAMS_ENV, payload)
            .env(TRIAL_ID_ENV, trial_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
            .spawn()
            .map_err(|err| EvalError::failed(format!("failed to spawn {}: {err}", self.program)))
    }
}

fn kill(child: &mut Child) {
    if let Err(err) = child.kill() {
        warn!(error = %err, "failed to kill scorer process");
    }
    let _ = child.wait();
}

impl Scorer for CommandScorer {
    fn evaluate(&mut self, params: &Params, ctx: &mut EvalContext<'_>) -> Result<f64, EvalError> {
        let payload = serde_json::to_string(params)
            .map_err(|err| EvalError::failed(format!("cannot encode params: {err}")))?;
        let mut child = self.spawn(&payload, ctx.trial_id())?;

        if let Some(mut stdin) = child.stdin.take() {
            // The child may never read stdin
            match writeln!(stdin, "{payload}") {
                Err(err) if err.kind() != ErrorKind::BrokenPipe => {
                    kill(&mut child);
                    return Err(err.into());
                }
                _ => {}
            }
        }

        let Some(stdout) = child.stdout.take() else {
            kill(&mut child);
            return Err(EvalError::failed("scorer stdout not captured"));
        };

        let mut score = None;
        for line in BufReader::new(stdout).lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    kill(&mut child);
                    return Err(err.into());
                }
            };
            match parse_directive(&line) {
                Some(Directive::Report { step, value }) => {
                    if let Err(err) = ctx.report(step, value) {
                        kill(&mut child);
                        return Err(err);
                    }
                }
                Some(Directive::Score(value)) => score = Some(value),
                None => debug!(trial = ctx.trial_id(), "{line}"),
            }
        }

        let status = child.wait()?;
        if !status.success() {
            return Err(EvalError::failed(format!("{} exited with {status}", self.program)));
        }
        score.ok_or_else(|| EvalError::failed(format!("{} printed no score line", self.program)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ht_optimizer::{NopPruner, ParamValue, Pruner, Trial};

    struct AlwaysPrune;

    impl Pruner for AlwaysPrune {
        fn should_prune(&self, _: u64, _: u64, _: f64, _: &[Trial]) -> bool {
            true
        }

        fn name(&self) -> &str {
            "always"
        }
    }

    fn sh(script: &str) -> CommandScorer {
        CommandScorer::new(&ScorerSettings {
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            working_dir: None,
        })
    }

    fn params() -> Params {
        let mut params = Params::new();
        params.insert("lr0".into(), ParamValue::Float(0.001));
        params
    }

    #[test]
    fn parses_directives() {
        assert_eq!(
            parse_directive("report 10 0.5"),
            Some(Directive::Report { step: 10, value: 0.5 })
        );
        assert_eq!(parse_directive("  score   0.91 "), Some(Directive::Score(0.91)));
        assert_eq!(parse_directive("score"), None);
        assert_eq!(parse_directive("report ten 0.5"), None);
        assert_eq!(parse_directive("score 1 2"), None);
        assert_eq!(parse_directive("Epoch 3/10 loss=0.2"), None);
    }

    #[cfg(unix)]
    #[test]
    fn reads_params_and_score() {
        let mut scorer = sh(
            r#"read -r line; [ "$line" = "$HT_PARAMS" ] || exit 3; echo "report 1 0.25"; echo "score 0.75""#,
        );
        let pruner = NopPruner;
        let mut ctx = EvalContext::new(4, &pruner, &[]);
        assert_eq!(scorer.evaluate(&params(), &mut ctx), Ok(0.75));
        assert_eq!(ctx.intermediate_values(), &[(1, 0.25)]);
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_fails() {
        let mut scorer = sh("echo 'score 0.5'; exit 2");
        let pruner = NopPruner;
        let mut ctx = EvalContext::new(0, &pruner, &[]);
        assert!(matches!(
            scorer.evaluate(&params(), &mut ctx),
            Err(EvalError::Failed { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn missing_score_fails() {
        let mut scorer = sh("echo 'training done'");
        let pruner = NopPruner;
        let mut ctx = EvalContext::new(0, &pruner, &[]);
        let err = scorer.evaluate(&params(), &mut ctx).unwrap_err();
        assert!(err.to_string().contains("no score line"));
    }

    #[cfg(unix)]
    #[test]
    fn prune_kills_child() {
        let mut scorer = sh("echo 'report 1 0.1'; exec sleep 30");
        let pruner = AlwaysPrune;
        let mut ctx = EvalContext::new(0, &pruner, &[]);
        let started = std::time::Instant::now();
        assert_eq!(
            scorer.evaluate(&params(), &mut ctx),
            Err(EvalError::Pruned { step: 1, value: 0.1 })
        );
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[test]
    fn missing_program_fails() {
        let mut scorer = CommandScorer::new(&ScorerSettings {
            command: "/nonexistent/ht-scorer".into(),
            args: Vec::new(),
            working_dir: None,
        });
        let pruner = NopPruner;
        let mut ctx = EvalContext::new(0, &pruner, &[]);
        assert!(matches!(
            scorer.evaluate(&params(), &mut ctx),
            Err(EvalError::Failed { .. })
        ));
    }
}
