use console::Style;
use flume::Receiver;

use crate::asserter::ScenarioReport;
use crate::asserter::Verdict;

/// Final counts for the whole run. The caller turns a non-zero `failed`
/// into a non-zero exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    pub passed: usize,
    pub failed: usize,
}

impl Tally {
    pub fn seen(&self) -> usize {
        self.passed + self.failed
    }
}

pub struct OutPutter;

impl OutPutter {
    /// Prints scenario verdicts as they arrive and returns the final tally.
    /// With `json` set, every line is a machine-readable record instead of
    /// styled console output.
    pub async fn start(
        rx: Receiver<ScenarioReport>,
        suite_path: &str,
        n_scenarios: usize,
        json: bool,
    ) -> Tally {
        if json {
            return Self::start_json(rx, n_scenarios).await;
        }

        let style = Style::new().bold().cyan();
        let open_text =
            &format!("Running suite: {suite_path} Found {n_scenarios} scenarios: Running...");
        let open_text = style.apply_to(open_text);

        println!("{open_text}");

        let mut i = 1;
        let mut tally = Tally {
            passed: 0,
            failed: 0,
        };
        let mut failed_scenarios: Vec<ScenarioReport> = vec![];

        while let Ok(report) = rx.recv_async().await {
            for result in report.results.iter() {
                match result.verdict {
                    Verdict::Pass => {
                        println!(
                            "[{i}/{n_scenarios}] {}  {}: {} {}",
                            console::style("✔").green().bold(),
                            report.name,
                            result.actual,
                            console::style("PASS!").green().bold(),
                        )
                    }
                    Verdict::Fail => {
                        println!(
                            "[{i}/{n_scenarios}] {}  {}: {} {}",
                            console::style("╳").red().bold(),
                            report.name,
                            result.expected,
                            console::style("FAILED!").red().bold(),
                        )
                    }
                }
            }

            if report.passed() {
                tally.passed += 1;
            } else {
                tally.failed += 1;
                failed_scenarios.push(report);
            }

            i += 1;
        }

        if failed_scenarios.is_empty() {
            println!();
            println!(
                "{}",
                console::style("All scenarios passed! 🎉").bold().green()
            );
        } else {
            println!();
            println!(
                "{}",
                console::style("Summary of Failed Scenarios:").bold().red()
            );
            for (idx, report) in failed_scenarios.iter().enumerate() {
                println!(
                    "\n{}. {}  {} {}",
                    idx + 1,
                    report.name,
                    report.method,
                    report.path
                );
                for result in report.results.iter().filter(|result| !result.passed()) {
                    println!("   {result}");
                }
            }

            println!();
            println!(
                "{}",
                console::style(format!(
                    "{} passed, {} failed.",
                    tally.passed, tally.failed
                ))
                .bold()
            );
        }

        tally
    }

    /// One JSON record per scenario, then a summary record. `planned` and
    /// `seen` diverge when a run was cancelled partway.
    async fn start_json(rx: Receiver<ScenarioReport>, n_scenarios: usize) -> Tally {
        let mut tally = Tally {
            passed: 0,
            failed: 0,
        };

        while let Ok(report) = rx.recv_async().await {
            let checks: Vec<serde_json::Value> = report
                .results
                .iter()
                .map(|result| {
                    serde_json::json!({
                        "verdict": if result.passed() { "pass" } else { "fail" },
                        "expected": result.expected.to_string(),
                        "actual": result.actual.to_string(),
                    })
                })
                .collect();

            if report.passed() {
                tally.passed += 1;
            } else {
                tally.failed += 1;
            }

            let record = serde_json::json!({
                "scenario": report.name,
                "method": report.method,
                "path": report.path,
                "outcome": if report.passed() { "passed" } else { "failed" },
                "checks": checks,
            });

            println!("{record}");
        }

        let summary = serde_json::json!({
            "summary": {
                "planned": n_scenarios,
                "seen": tally.seen(),
                "passed": tally.passed,
                "failed": tally.failed,
            }
        });
        println!("{summary}");

        tally
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use reqwest::StatusCode;

    use super::OutPutter;
    use super::Tally;
    use crate::asserter::Actual;
    use crate::asserter::AssertResult;
    use crate::asserter::ScenarioReport;
    use crate::asserter::Verdict;
    use crate::validator::Check;

    fn report(name: &str, verdict: Verdict) -> ScenarioReport {
        let results: Vec<AssertResult> = vec![AssertResult {
            verdict,
            expected: Check::Status(StatusCode::OK),
            actual: Actual::Status(StatusCode::OK),
        }];

        ScenarioReport {
            name: name.into(),
            method: "GET".into(),
            path: "/books".into(),
            results: Arc::from(results),
        }
    }

    #[tokio::test]
    async fn tally_counts_scenarios_not_checks() {
        let (tx, rx) = flume::unbounded();
        tx.send_async(report("list books", Verdict::Pass))
            .await
            .unwrap();
        tx.send_async(report("checkout", Verdict::Fail))
            .await
            .unwrap();
        drop(tx);

        let tally = OutPutter::start(rx, "kontrakt.toml", 2, false).await;

        assert_eq!(
            tally,
            Tally {
                passed: 1,
                failed: 1
            }
        );
        assert_eq!(tally.seen(), 2);
    }

    #[tokio::test]
    async fn json_mode_returns_the_same_tally() {
        let (tx, rx) = flume::unbounded();
        tx.send_async(report("list books", Verdict::Pass))
            .await
            .unwrap();
        drop(tx);

        let tally = OutPutter::start(rx, "kontrakt.toml", 3, true).await;

        assert_eq!(
            tally,
            Tally {
                passed: 1,
                failed: 0
            }
        );
        assert_eq!(tally.seen(), 1);
    }
}
