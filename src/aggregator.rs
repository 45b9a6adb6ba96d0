use crate::types::{ExecutionResult, Host};
use serde::Serialize;
use std::collections::HashSet;
use std::io::{self, Write};
use tracing::info;

/// 每台主机输出块前的分隔线
pub const HOST_SEPARATOR: &str = "----------------------------------------";

/// 一次 dispatch 的汇总，只在内存中存在
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregateReport {
    pub attempted: usize,
    pub failed: usize,
    pub successful_hosts: Vec<Host>,
    pub failed_hosts: Vec<Host>,
}

impl AggregateReport {
    pub fn succeeded(&self) -> usize {
        self.attempted - self.failed
    }

    pub fn success_rate(&self) -> f32 {
        if self.attempted == 0 {
            return 0.0;
        }
        self.succeeded() as f32 / self.attempted as f32
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }

    /// 合并另一份汇总（多个步骤的总计）
    pub fn merge(&mut self, other: &AggregateReport) {
        self.attempted += other.attempted;
        self.failed += other.failed;
        self.successful_hosts.extend(other.successful_hosts.iter().cloned());
        self.failed_hosts.extend(other.failed_hosts.iter().cloned());
    }
}

/// 汇总结果，失败数与输入顺序无关
pub fn summarize<'a, I>(results: I) -> AggregateReport
where
    I: IntoIterator<Item = &'a ExecutionResult>,
{
    let mut report = AggregateReport::default();
    for result in results {
        report.attempted += 1;
        if result.is_success() {
            report.successful_hosts.push(result.host.clone());
        } else {
            report.failed += 1;
            report.failed_hosts.push(result.host.clone());
        }
    }
    report
}

/// 只保留指定主机的结果，例如只看 head 节点
pub fn restrict<'a>(results: &'a [ExecutionResult], hosts: &[Host]) -> Vec<&'a ExecutionResult> {
    let wanted: HashSet<&Host> = hosts.iter().collect();
    results.iter().filter(|r| wanted.contains(&r.host)).collect()
}

/// 逐台主机输出：分隔线 + 主机、成功/失败标记（失败时另起一行给出退出码）、stdout、stderr
///
/// 返回失败主机数。失败只是数据，这里从不报错（写出失败除外）。
pub fn write_report<'a, W, I>(writer: &mut W, results: I) -> io::Result<usize>
where
    W: Write,
    I: IntoIterator<Item = &'a ExecutionResult>,
{
    let mut failed = 0;
    for result in results {
        writeln!(writer, "{} {}", HOST_SEPARATOR, result.host)?;
        if result.is_success() {
            writeln!(writer, "SUCCEEDED!")?;
        } else {
            failed += 1;
            writeln!(writer, "FAILED!")?;
            writeln!(writer, "exit code: {}", result.exit_code())?;
        }
        writeln!(writer, "{}", result.stdout.trim_end_matches('\n'))?;
        writeln!(writer, "{}", result.stderr.trim_end_matches('\n'))?;
    }
    Ok(failed)
}

/// 把报告打印到标准输出并记录汇总日志，返回失败主机数
pub fn print_report(label: &str, results: &[ExecutionResult]) -> usize {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    if let Err(e) = write_report(&mut handle, results) {
        tracing::warn!("Failed to write report for {}: {}", label, e);
    }
    let report = summarize(results);
    log_summary(label, &report);
    report.failed
}

pub fn log_summary(label: &str, report: &AggregateReport) {
    info!(
        "{}: {} hosts attempted, {} failed. Success rate: {:.2}%",
        label,
        report.attempted,
        report.failed,
        report.success_rate() * 100.0
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CommandOutput, ExecutionStatus};
    use chrono::Utc;

    fn result(host: &str, exit_code: i32) -> ExecutionResult {
        ExecutionResult::from_output(
            Host::new(host),
            0,
            Utc::now(),
            CommandOutput {
                exit_code,
                stdout: format!("stdout of {}\n", host),
                stderr: if exit_code == 0 { String::new() } else { "boom\n".to_string() },
            },
        )
    }

    #[test]
    fn test_summarize_counts_failures_independent_of_order() {
        let mut results = vec![
            result("a", 0),
            result("b", 1),
            result("c", 0),
            result("d", 2),
            result("e", 0),
        ];
        let report = summarize(&results);
        assert_eq!(report.attempted, 5);
        assert_eq!(report.failed, 2);

        results.reverse();
        assert_eq!(summarize(&results).failed, 2);
        results.swap(0, 3);
        assert_eq!(summarize(&results).failed, 2);
    }

    #[test]
    fn test_summarize_empty() {
        let report = summarize(&[]);
        assert_eq!(report, AggregateReport::default());
        assert_eq!(report.success_rate(), 0.0);
        assert!(report.is_clean());
    }

    #[test]
    fn test_invocation_failure_and_timeout_count_as_failed() {
        let results = vec![
            ExecutionResult::failed(
                Host::new("a"),
                0,
                Utc::now(),
                ExecutionStatus::InvocationFailed("refused".to_string()),
            ),
            ExecutionResult::failed(Host::new("b"), 0, Utc::now(), ExecutionStatus::TimedOut),
            result("c", 0),
        ];
        let report = summarize(&results);
        assert_eq!(report.failed, 2);
        assert_eq!(report.failed_hosts, vec![Host::new("a"), Host::new("b")]);
    }

    #[test]
    fn test_write_report_format() {
        let results = vec![result("10.0.0.1", 0), result("10.0.0.2", 1)];
        let mut out = Vec::new();
        let failed = write_report(&mut out, &results).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert_eq!(failed, 1);
        assert_eq!(
            text,
            "---------------------------------------- 10.0.0.1\n\
             SUCCEEDED!\n\
             stdout of 10.0.0.1\n\
             \n\
             ---------------------------------------- 10.0.0.2\n\
             FAILED!\n\
             exit code: 1\n\
             stdout of 10.0.0.2\n\
             boom\n"
        );
    }

    #[test]
    fn test_restrict_to_head_host() {
        let results = vec![result("head", 1), result("w1", 1), result("w2", 0)];
        let head_only = restrict(&results, &[Host::new("head")]);
        assert_eq!(head_only.len(), 1);
        assert_eq!(summarize(head_only).failed, 1);
    }

    #[test]
    fn test_merge_reports() {
        let mut total = summarize(&[result("a", 0)]);
        total.merge(&summarize(&[result("b", 1), result("c", 0)]));
        assert_eq!(total.attempted, 3);
        assert_eq!(total.failed, 1);
        assert_eq!(total.succeeded(), 2);
    }
}
