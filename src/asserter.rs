use core::fmt;
use std::fmt::Display;
use std::sync::Arc;

use console::style;
use flume::Receiver;
use flume::SendError;
use flume::Sender;
use reqwest::StatusCode;
use thiserror::Error;

use crate::runner::CapturedResponse;
use crate::runner::RunnerResult;
use crate::validator::Check;
use crate::validator::FieldCheck;
use crate::validator::FieldExpect;
use crate::validator::PathSeg;

#[derive(Error, Debug)]
pub enum AsserterError {
    #[error("channel error")]
    ChannelError(#[from] SendError<ScenarioReport>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
}

/// Outcome of a single check: the check itself as `expected` and what the
/// response actually held, so a failure line can always name both sides.
#[derive(Debug)]
pub struct AssertResult {
    pub verdict: Verdict,
    pub expected: Check,
    pub actual: Actual,
}

impl AssertResult {
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }
}

/// What the response actually held, at whatever point the check stopped.
#[derive(Debug)]
pub enum Actual {
    Status(StatusCode),
    Field(FieldActual),
    /// The round trip itself failed, so there was nothing to check.
    Transport(String),
}

#[derive(Debug)]
pub enum FieldActual {
    /// The walk fell off the document at `at`, a concrete path with every
    /// `[*]` pinned to the index that was being visited.
    Missing { at: String },
    Value { at: String, value: serde_json::Value },
    /// Every element behind a `[*]` satisfied the check. `count` is zero
    /// when the array was empty, which still passes.
    AllItems { at: String, count: usize },
    NotJson,
}

/// One scenario's verdicts, ready for the outputter. Results are shared so
/// the failed-scenario summary can reprint them without cloning.
#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub name: String,
    pub method: String,
    pub path: String,
    pub results: Arc<[AssertResult]>,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        self.results.iter().all(AssertResult::passed)
    }
}

pub trait Assert {
    fn assert(self) -> ScenarioReport;
}

impl Assert for RunnerResult {
    /// Evaluates every check against the captured response. When the round
    /// trip itself failed there is nothing to evaluate, so the scenario
    /// collapses to a single failure pairing the first check (always the
    /// status check) with the transport error.
    fn assert(self) -> ScenarioReport {
        let results: Vec<AssertResult> = match (self.response, self.error) {
            (Some(response), _) => self
                .checks
                .into_iter()
                .map(|check| match check {
                    Check::Status(expected) => assert_status(expected, &response),
                    Check::Field(check) => assert_field(check, &response),
                })
                .collect(),
            (None, error) => {
                let message = error.map_or_else(
                    || "no response captured".to_string(),
                    |error| error.to_string(),
                );

                self.checks
                    .into_iter()
                    .take(1)
                    .map(|check| AssertResult {
                        verdict: Verdict::Fail,
                        expected: check,
                        actual: Actual::Transport(message.clone()),
                    })
                    .collect()
            }
        };

        ScenarioReport {
            name: self.name,
            method: self.method,
            path: self.path,
            results: results.into(),
        }
    }
}

fn assert_status(expected: StatusCode, response: &CapturedResponse) -> AssertResult {
    let verdict = if response.status == expected {
        Verdict::Pass
    } else {
        Verdict::Fail
    };

    AssertResult {
        verdict,
        expected: Check::Status(expected),
        actual: Actual::Status(response.status),
    }
}

fn assert_field(check: FieldCheck, response: &CapturedResponse) -> AssertResult {
    let (verdict, actual) = match &response.body_json {
        Some(body) => walk(body, &check.path.segments, String::new(), &check.expect),
        None => (Verdict::Fail, FieldActual::NotJson),
    };

    AssertResult {
        verdict,
        expected: Check::Field(check),
        actual: Actual::Field(actual),
    }
}

/// Walks the remaining path segments down from `value`, carrying the
/// concrete path covered so far. A `[*]` fans out over every element and
/// passes only if all of them do; the reported path of a failing element
/// pins the star to its index.
fn walk(
    value: &serde_json::Value,
    segments: &[PathSeg],
    at: String,
    expect: &FieldExpect,
) -> (Verdict, FieldActual) {
    let Some((segment, rest)) = segments.split_first() else {
        return check_leaf(value, at, expect);
    };

    match segment {
        PathSeg::Key(key) => {
            let at = join_key(&at, key);
            match value.get(key) {
                Some(inner) => walk(inner, rest, at, expect),
                None => (Verdict::Fail, FieldActual::Missing { at }),
            }
        }
        PathSeg::Index(index) => {
            let at = format!("{at}[{index}]");
            match value.get(index) {
                Some(inner) => walk(inner, rest, at, expect),
                None => (Verdict::Fail, FieldActual::Missing { at }),
            }
        }
        PathSeg::Every => {
            let Some(items) = value.as_array() else {
                return (
                    Verdict::Fail,
                    FieldActual::Value {
                        at,
                        value: value.clone(),
                    },
                );
            };

            for (index, item) in items.iter().enumerate() {
                let item_at = format!("{at}[{index}]");
                let (verdict, actual) = walk(item, rest, item_at, expect);
                if verdict == Verdict::Fail {
                    return (verdict, actual);
                }
            }

            // An empty array has no element that violates the check
            (
                Verdict::Pass,
                FieldActual::AllItems {
                    at,
                    count: items.len(),
                },
            )
        }
    }
}

fn check_leaf(
    value: &serde_json::Value,
    at: String,
    expect: &FieldExpect,
) -> (Verdict, FieldActual) {
    let verdict = match expect {
        FieldExpect::Present => Verdict::Pass,
        FieldExpect::Equals(wanted) => {
            if value == wanted {
                Verdict::Pass
            } else {
                Verdict::Fail
            }
        }
        FieldExpect::TypeOf(wanted) => {
            if wanted.matches(value) {
                Verdict::Pass
            } else {
                Verdict::Fail
            }
        }
    };

    (
        verdict,
        FieldActual::Value {
            at,
            value: value.clone(),
        },
    )
}

fn join_key(at: &str, key: &str) -> String {
    if at.is_empty() {
        key.to_string()
    } else {
        format!("{at}.{key}")
    }
}

pub struct Asserter {}

impl Asserter {
    /// Turns runner results into scenario reports until the runner hangs up.
    pub async fn run(
        rx: Receiver<RunnerResult>,
        tx: Sender<ScenarioReport>,
    ) -> Result<(), AsserterError> {
        while let Ok(runner_result) = rx.recv_async().await {
            tx.send_async(runner_result.assert()).await?;
        }

        Ok(())
    }
}

impl Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Check::Status(code) => write!(f, "status {}", code.as_u16()),
            Check::Field(check) => write!(f, "{check}"),
        }
    }
}

impl Display for FieldCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.expect {
            FieldExpect::Present => write!(f, "field `{}` exists", self.path),
            FieldExpect::Equals(value) => {
                write!(f, "field `{}` equals {value}", self.path)
            }
            FieldExpect::TypeOf(wanted) => {
                write!(f, "field `{}` is of type {wanted}", self.path)
            }
        }
    }
}

impl Display for Actual {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actual::Status(code) => write!(f, "status {}", code.as_u16()),
            Actual::Field(actual) => write!(f, "{actual}"),
            Actual::Transport(message) => write!(f, "request failed: {message}"),
        }
    }
}

impl Display for FieldActual {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldActual::Missing { at } => write!(f, "missing field `{at}`"),
            FieldActual::Value { at, value } => {
                write!(f, "{} at `{at}`", preview(value))
            }
            FieldActual::AllItems { at, count } => {
                write!(f, "all {count} items at `{at}`")
            }
            FieldActual::NotJson => write!(f, "response body was not valid JSON"),
        }
    }
}

impl Display for AssertResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.verdict {
            Verdict::Pass => {
                write!(
                    f,
                    "{} {} {}",
                    style("✔").green().bold(),
                    style("PASS!").green().bold(),
                    self.expected,
                )
            }
            Verdict::Fail => {
                write!(
                    f,
                    "{} {}\n      Expected: {}\n      Actual:   {}",
                    style("✘").red().bold(),
                    style("FAIL!").red().bold(),
                    style(&self.expected).green(),
                    style(&self.actual).red(),
                )
            }
        }
    }
}

/// Keeps failure lines readable when the value at a path is a large subtree.
fn preview(value: &serde_json::Value) -> String {
    let rendered = value.to_string();

    if rendered.chars().count() > 80 {
        let cut: String = rendered.chars().take(80).collect();
        format!("{cut}...")
    } else {
        rendered
    }
}
