//! Declarative acceptance test plans.
//!
//! A plan is an ordered list of UART steps loaded from JSON:
//!
//! ```json
//! {"test_plan": {"steps": [
//!   {"name": "Profile", "command": "SET SWICH_PROFILE=00", "expected_response": "SWICH_PROFILE=00"},
//!   {"name": "Status", "command": "GET STATUS", "wait_time": 0.5,
//!    "validation": {"expected_values": {"EN_12V": "ON"}, "ignore_fields": ["TEMP"]}}
//! ]}}
//! ```
//!
//! Every step runs even when an earlier one failed, so the report lists
//! all problems of a board at once.

use {
    crate::{
        error::{Error, Result},
        port::PortOpener,
        progress::ProgressSink,
        timing::{Timing, pause, pause_unless_stopped},
        uart::{UartSession, command},
    },
    log::{debug, info, warn},
    serde::{Deserialize, Deserializer, Serialize},
    std::{
        collections::{BTreeMap, BTreeSet},
        path::Path,
        time::Duration,
    },
};

/// Status checks attached to a `GET STATUS` step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validation {
    /// Values that must be reported, compared as trimmed strings.
    #[serde(default, deserialize_with = "stringly_map")]
    pub expected_values: BTreeMap<String, String>,
    /// Keys not checked even if listed in `expected_values`.
    #[serde(default)]
    pub ignore_fields: BTreeSet<String>,
}

fn stringly_map<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error> {
    let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(key, value)| {
            let text = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (key, text)
        })
        .collect())
}

/// One step of a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestStep {
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Command line sent to the controller.
    #[serde(default)]
    pub command: String,
    /// Acknowledgement that must come back.
    #[serde(default)]
    pub expected_response: Option<String>,
    /// Seconds to wait after the step.
    #[serde(default)]
    pub wait_time: f64,
    /// Free-text description.
    #[serde(default)]
    pub description: Option<String>,
    /// Status checks for `GET STATUS`.
    #[serde(default)]
    pub validation: Option<Validation>,
}

impl TestStep {
    fn display_name(&self, index: usize) -> String {
        if self.name.trim().is_empty() {
            format!("Step {}", index + 1)
        } else {
            self.name.trim().to_string()
        }
    }

    fn expected(&self) -> Option<&str> {
        self.expected_response.as_deref().map(str::trim).filter(|e| !e.is_empty())
    }
}

/// An ordered list of steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestPlan {
    /// Steps in execution order.
    pub steps: Vec<TestStep>,
}

impl TestPlan {
    /// Parse a plan, either wrapped in `{"test_plan": ...}` or bare.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| Error::TestPlan(format!("invalid JSON: {e}")))?;
        let body = value.get("test_plan").unwrap_or(&value);
        let plan = Self::deserialize(body).map_err(|e| Error::TestPlan(format!("invalid test plan: {e}")))?;
        if plan.steps.is_empty() {
            return Err(Error::TestPlan("test plan has no steps".into()));
        }
        Ok(plan)
    }

    /// Load a plan file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::TestPlan(format!("cannot read {}: {e}", path.display())))?;
        let plan = Self::from_json(&text)?;
        info!("Loaded test plan {} ({} steps)", path.display(), plan.steps.len());
        Ok(plan)
    }
}

/// Parse a `GET STATUS` dump into key/value pairs.
///
/// Each line splits on its first `:`, or failing that its first `=`. Keys
/// and values are trimmed, later duplicates win, and lines without a
/// separator or with an empty key are skipped.
pub fn parse_status(text: &str) -> BTreeMap<String, String> {
    let mut status = BTreeMap::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some((key, value)) = line.split_once(':').or_else(|| line.split_once('=')) else {
            debug!("Skipping status line without separator: '{line}'");
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        if let Some(old) = status.insert(key.to_string(), value.trim().to_string()) {
            debug!("Duplicate status key '{key}', replacing '{old}'");
        }
    }
    status
}

/// Check a parsed status against a validation; returns one message per
/// problem.
pub fn validate_status(status: &BTreeMap<String, String>, validation: &Validation) -> Vec<String> {
    validation
        .expected_values
        .iter()
        .filter(|(key, _)| !validation.ignore_fields.contains(*key))
        .filter_map(|(key, expected)| {
            let expected = expected.trim();
            match status.get(key) {
                None => Some(format!("Parameter '{key}' not found in response")),
                Some(actual) if actual.trim() != expected => Some(format!(
                    "Parameter '{key}': expected '{expected}', got '{}'",
                    actual.trim()
                )),
                Some(_) => None,
            }
        })
        .collect()
}

/// Outcome of a plan run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestReport {
    /// No step failed.
    pub all_passed: bool,
    /// Human-readable summary listing every failure.
    pub report: String,
    /// One entry per failure.
    pub failures: Vec<String>,
}

impl TestReport {
    fn new(total: usize, failures: Vec<String>) -> Self {
        let report = if failures.is_empty() {
            format!("All {total} test steps passed")
        } else {
            format!("Testing finished with errors:\n{}", failures.join("\n"))
        };
        Self {
            all_passed: failures.is_empty(),
            report,
            failures,
        }
    }
}

enum StatusCheck {
    Passed,
    Failed(Vec<String>),
    NoResponse,
}

/// Runs plans against an open UART session.
pub struct TestRunner<'a, O: PortOpener> {
    session: &'a mut UartSession<O>,
    should_stop: &'a dyn Fn() -> bool,
    timing: Timing,
}

impl<'a, O: PortOpener> TestRunner<'a, O> {
    /// Runner over an open session.
    pub fn new(session: &'a mut UartSession<O>, should_stop: &'a dyn Fn() -> bool) -> Self {
        let timing = session.timing().clone();
        Self {
            session,
            should_stop,
            timing,
        }
    }

    /// Send a command until it is acknowledged. Returns the last reply on
    /// failure.
    fn command_step(&mut self, cmd: &str, expected: &str) -> std::result::Result<(), String> {
        let window = cmd
            .starts_with("SET")
            .then_some(self.timing.set_command_timeout);
        let attempts = self.timing.test_command_delays.len();
        for attempt in 1..=attempts {
            if attempt > 1 {
                pause(self.timing.test_command_delays[attempt - 2]);
            }
            match self.session.send_and_expect_recovering(cmd, expected, window) {
                Ok(true) => {
                    if cmd.contains(command::SWITCH_MODE) || cmd.contains(command::PROFILE) {
                        pause(self.timing.profile_settle);
                    }
                    return Ok(());
                },
                Ok(false) => warn!(
                    "'{cmd}' not acknowledged (attempt {attempt}/{attempts}): got '{}'",
                    self.session.last_response()
                ),
                Err(e) => warn!("'{cmd}' failed (attempt {attempt}/{attempts}): {e}"),
            }
        }
        Err(self.session.last_response().to_string())
    }

    /// `GET STATUS` with retries; `None` if nothing ever came back.
    pub fn read_status(&mut self) -> Result<Option<String>> {
        let delays = self.timing.status_attempt_delays.clone();
        for attempt in 1..=delays.len() {
            if attempt > 1 {
                pause(delays[attempt - 2]);
            }
            let text = self.session.query(
                command::GET_STATUS,
                self.timing.status_idle,
                self.timing.status_total,
                self.timing.status_poll,
            )?;
            if !text.trim().is_empty() {
                return Ok(Some(text));
            }
            warn!("No reply to GET STATUS (attempt {attempt}/{})", delays.len());
        }
        Ok(None)
    }

    fn check_status(
        &mut self,
        validation: &Validation,
        resend: Option<&TestStep>,
        sink: &mut dyn ProgressSink,
    ) -> StatusCheck {
        let delays = self.timing.validation_delays.clone();
        let mut last = StatusCheck::NoResponse;
        for attempt in 1..=delays.len() {
            if attempt > 1 {
                if (self.should_stop)() {
                    break;
                }
                pause(delays[attempt - 2]);
                if let Some(step) = resend {
                    let cmd = step.command.trim();
                    let acked = match step.expected() {
                        Some(expected) => self.session.send_and_expect(cmd, expected).unwrap_or(false),
                        None => self.session.send_raw(cmd).is_ok(),
                    };
                    debug!("Re-sent '{cmd}' before status check: {acked}");
                    if acked {
                        pause(self.timing.validation_resend_settle);
                    }
                }
            }
            let text = match self.read_status() {
                Ok(Some(text)) => text,
                Ok(None) => continue,
                Err(e) => {
                    warn!("GET STATUS failed: {e}");
                    continue;
                },
            };
            for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
                sink.line(&format!("<<- {line}"));
            }
            let errors = validate_status(&parse_status(&text), validation);
            if errors.is_empty() {
                return StatusCheck::Passed;
            }
            for error in &errors {
                warn!("Validation attempt {attempt}/{}: {error}", delays.len());
            }
            last = StatusCheck::Failed(errors);
        }
        last
    }

    /// Run every step and aggregate failures.
    pub fn run(&mut self, plan: &TestPlan, sink: &mut dyn ProgressSink) -> TestReport {
        let total = plan.steps.len();
        let mut failures = Vec::new();
        sink.test_percent(0);

        for (index, step) in plan.steps.iter().enumerate() {
            // steps before this one are finished
            if index > 0 {
                sink.test_percent(u8::try_from(index * 100 / total).unwrap_or(100));
            }
            if (self.should_stop)() {
                failures.push("Test run cancelled".to_string());
                break;
            }
            let name = step.display_name(index);
            sink.status(&format!("Test {}/{total}: {name}", index + 1));

            let cmd = step.command.trim();
            if cmd.is_empty() {
                warn!("Step '{name}' has no command, skipping");
                continue;
            }
            info!("Test step '{name}': {cmd}");
            sink.line(&format!("->> {cmd}"));

            if let Some(expected) = step.expected() {
                if let Err(actual) = self.command_step(cmd, expected) {
                    let message = if actual.is_empty() {
                        format!("Step '{name}': no response, expected '{expected}'")
                    } else {
                        sink.line(&format!("<<- {actual}"));
                        format!("Step '{name}': expected '{expected}', got '{actual}'")
                    };
                    warn!("{message}");
                    failures.push(message);
                    continue;
                }
                sink.line(&format!("<<- {expected}"));
            } else if let Err(e) = self.session.send_raw(cmd) {
                failures.push(format!("Step '{name}': {e}"));
                continue;
            }

            if step.wait_time > 0.0 {
                let wait = Duration::try_from_secs_f64(step.wait_time).unwrap_or_default();
                if !pause_unless_stopped(wait, self.timing.stop_slice, self.should_stop) {
                    failures.push("Test run cancelled".to_string());
                    break;
                }
            }

            let Some(validation) = step.validation.as_ref().filter(|_| cmd == command::GET_STATUS) else {
                continue;
            };
            let resend = index
                .checked_sub(1)
                .map(|i| &plan.steps[i])
                .filter(|prev| command::is_mode_setting(&prev.command));
            if resend.is_some() {
                pause(self.timing.status_pre_delay);
            }
            match self.check_status(validation, resend, sink) {
                StatusCheck::Passed => info!("Step '{name}': status checks passed"),
                StatusCheck::Failed(errors) => {
                    failures.extend(errors.into_iter().map(|e| format!("{name}: {e}")));
                },
                StatusCheck::NoResponse => failures.push(format!(
                    "Step '{name}': no response to GET STATUS after {} attempts",
                    self.timing.validation_delays.len()
                )),
            }
        }

        sink.test_percent(100);
        let report = TestReport::new(total, failures);
        if report.all_passed {
            info!("{}", report.report);
        } else {
            warn!("{}", report.report);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        port::mock::{MockOpener, Reply, echo_board},
        progress::{NoProgress, RecordingSink},
        uart::UartSettings,
    };

    const NEVER: &dyn Fn() -> bool = &|| false;

    fn open(opener: &MockOpener) -> UartSession<MockOpener> {
        UartSession::open(opener.clone(), "COM9", UartSettings::default(), Timing::immediate()).unwrap()
    }

    fn status_board(status: &'static str) -> impl FnMut(&str) -> Reply + Send + 'static {
        move |line| {
            if line == command::GET_STATUS {
                Reply::Raw(status.as_bytes().to_vec())
            } else {
                echo_board(line)
            }
        }
    }

    #[test]
    fn test_parse_status_separators() {
        let status = parse_status("EN_12V: ON\r\nSWICH_SWD1__2=LV\r\nTEMP : 31.5 \r\nbanner line\r\n: orphan\r\n");
        assert_eq!(status.get("EN_12V").map(String::as_str), Some("ON"));
        assert_eq!(status.get("SWICH_SWD1__2").map(String::as_str), Some("LV"));
        assert_eq!(status.get("TEMP").map(String::as_str), Some("31.5"));
        assert_eq!(status.len(), 3);
    }

    #[test]
    fn test_parse_status_colon_wins_and_duplicates_replace() {
        let status = parse_status("A=x: y\nB: 1\nB: 2\n");
        assert_eq!(status.get("A=x").map(String::as_str), Some("y"));
        assert_eq!(status.get("B").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_validate_status_messages() {
        let status = parse_status("EN_12V: OFF\nTEMP: 40\n");
        let validation = Validation {
            expected_values: [("EN_12V", "ON"), ("MODE", "01"), ("TEMP", "25")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ignore_fields: ["TEMP".to_string()].into_iter().collect(),
        };
        let errors = validate_status(&status, &validation);
        assert_eq!(
            errors,
            vec![
                "Parameter 'EN_12V': expected 'ON', got 'OFF'".to_string(),
                "Parameter 'MODE' not found in response".to_string(),
            ]
        );
    }

    #[test]
    fn test_plan_wrapped_and_bare() {
        let wrapped = r#"{"test_plan":{"steps":[{"name":"P","command":"SET EN_12V=ON","expected_response":"EN_12V=ON","wait_time":1}]}}"#;
        let plan = TestPlan::from_json(wrapped).unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert!((plan.steps[0].wait_time - 1.0).abs() < f64::EPSILON);

        let bare = r#"{"steps":[{"command":"GET STATUS","validation":{"expected_values":{"MODE":1}}}]}"#;
        let plan = TestPlan::from_json(bare).unwrap();
        let validation = plan.steps[0].validation.as_ref().unwrap();
        assert_eq!(validation.expected_values.get("MODE").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_plan_errors() {
        assert!(matches!(TestPlan::from_json("{"), Err(Error::TestPlan(_))));
        assert!(matches!(TestPlan::from_json(r#"{"steps":[]}"#), Err(Error::TestPlan(_))));
        assert!(matches!(TestPlan::from_json(r#"{"steps":"no"}"#), Err(Error::TestPlan(_))));
        assert!(matches!(TestPlan::from_file("/nonexistent/plan.json"), Err(Error::TestPlan(_))));
    }

    #[test]
    fn test_all_steps_pass() {
        let opener = MockOpener::new(status_board("EN_12V: ON\r\nSWICH_PROFILE: 00\r\n"));
        let mut session = open(&opener);
        let plan = TestPlan::from_json(
            r#"{"steps":[
                {"name":"Power","command":"SET EN_12V=ON","expected_response":"EN_12V=ON"},
                {"name":"Profile","command":"SET SWICH_PROFILE=00","expected_response":"SWICH_PROFILE=00"},
                {"name":"Status","command":"GET STATUS","validation":{"expected_values":{"EN_12V":"ON","SWICH_PROFILE":"00"}}}
            ]}"#,
        )
        .unwrap();
        let mut sink = RecordingSink::default();
        let report = TestRunner::new(&mut session, NEVER).run(&plan, &mut sink);
        assert!(report.all_passed, "{}", report.report);
        assert_eq!(report.report, "All 3 test steps passed");
        assert!(sink.lines.contains(&"->> SET EN_12V=ON".to_string()));
        assert!(sink.lines.contains(&"<<- EN_12V: ON".to_string()));
        assert_eq!(sink.test_percents, vec![0, 33, 66, 100]);
    }

    #[test]
    fn test_percent_follows_finished_steps() {
        #[derive(Default)]
        struct Ordered(Vec<String>);
        impl ProgressSink for Ordered {
            fn line(&mut self, text: &str) {
                self.0.push(text.to_string());
            }
            fn test_percent(&mut self, value: u8) {
                self.0.push(format!("{value}%"));
            }
        }

        let opener = MockOpener::new(|line| {
            if line == "SET SWICH_MODE=01" {
                Reply::Line("ERR".into())
            } else {
                echo_board(line)
            }
        });
        let mut session = open(&opener);
        let plan = TestPlan::from_json(
            r#"{"steps":[
                {"name":"Mode","command":"SET SWICH_MODE=01","expected_response":"SWICH_MODE=01"},
                {"name":"Power","command":"SET EN_12V=ON","expected_response":"EN_12V=ON"}
            ]}"#,
        )
        .unwrap();
        let mut sink = Ordered::default();
        TestRunner::new(&mut session, NEVER).run(&plan, &mut sink);

        assert_eq!(
            sink.0,
            vec![
                "0%",
                "->> SET SWICH_MODE=01",
                "<<- ERR",
                "50%",
                "->> SET EN_12V=ON",
                "<<- EN_12V=ON",
                "100%",
            ]
        );
    }

    #[test]
    fn test_failed_step_does_not_stop_plan() {
        let opener = MockOpener::new(|line| {
            if line == "SET SWICH_MODE=01" {
                Reply::Line("ERR".into())
            } else {
                echo_board(line)
            }
        });
        let mut session = open(&opener);
        let plan = TestPlan::from_json(
            r#"{"steps":[
                {"name":"Mode","command":"SET SWICH_MODE=01","expected_response":"SWICH_MODE=01"},
                {"name":"Power","command":"SET EN_12V=OFF","expected_response":"EN_12V=OFF"}
            ]}"#,
        )
        .unwrap();
        let report = TestRunner::new(&mut session, NEVER).run(&plan, &mut NoProgress);
        assert!(!report.all_passed);
        assert_eq!(
            report.report,
            "Testing finished with errors:\nStep 'Mode': expected 'SWICH_MODE=01', got 'ERR'"
        );
        assert_eq!(opener.transcript().count("SET SWICH_MODE=01"), 5);
        assert_eq!(opener.transcript().count("SET EN_12V=OFF"), 1);
    }

    #[test]
    fn test_stale_status_retried_with_mode_resend() {
        let mut status_calls = 0;
        let opener = MockOpener::new(move |line| {
            if line == command::GET_STATUS {
                status_calls += 1;
                // the step's own send and the first check see the old relay state
                let text = if status_calls <= 2 { "SWICH_SWD1__2: LV\r\n" } else { "SWICH_SWD1__2: HV\r\n" };
                Reply::Raw(text.as_bytes().to_vec())
            } else {
                echo_board(line)
            }
        });
        let mut session = open(&opener);
        let plan = TestPlan::from_json(
            r#"{"steps":[
                {"name":"HV","command":"SET SWICH_SWD1__2=HV","expected_response":"SWICH_SWD1__2=HV"},
                {"name":"Check","command":"GET STATUS","validation":{"expected_values":{"SWICH_SWD1__2":"HV"}}}
            ]}"#,
        )
        .unwrap();
        let report = TestRunner::new(&mut session, NEVER).run(&plan, &mut NoProgress);
        assert!(report.all_passed, "{}", report.report);
        assert_eq!(opener.transcript().count("SET SWICH_SWD1__2=HV"), 2);
    }

    #[test]
    fn test_validation_failure_reports_last_errors() {
        let opener = MockOpener::new(status_board("EN_12V: OFF\r\n"));
        let mut session = open(&opener);
        let plan = TestPlan::from_json(
            r#"{"steps":[{"name":"Check","command":"GET STATUS","validation":{"expected_values":{"EN_12V":"ON"}}}]}"#,
        )
        .unwrap();
        let report = TestRunner::new(&mut session, NEVER).run(&plan, &mut NoProgress);
        assert_eq!(report.failures, vec!["Check: Parameter 'EN_12V': expected 'ON', got 'OFF'".to_string()]);
        // raw send of the step plus five validation attempts
        assert_eq!(opener.transcript().count(command::GET_STATUS), 6);
    }

    #[test]
    fn test_silent_status_is_no_response() {
        let opener = MockOpener::new(echo_board);
        let mut session = open(&opener);
        let plan = TestPlan::from_json(
            r#"{"steps":[{"name":"Check","command":"GET STATUS","validation":{"expected_values":{"EN_12V":"ON"}}}]}"#,
        )
        .unwrap();
        let report = TestRunner::new(&mut session, NEVER).run(&plan, &mut NoProgress);
        assert_eq!(
            report.failures,
            vec!["Step 'Check': no response to GET STATUS after 5 attempts".to_string()]
        );
    }

    #[test]
    fn test_stop_before_first_step() {
        let opener = MockOpener::new(echo_board);
        let mut session = open(&opener);
        let plan = TestPlan::from_json(r#"{"steps":[{"command":"SET EN_12V=ON","expected_response":"EN_12V=ON"}]}"#).unwrap();
        let stop = || true;
        let report = TestRunner::new(&mut session, &stop).run(&plan, &mut NoProgress);
        assert!(!report.all_passed);
        assert!(opener.transcript().lines().is_empty());
    }
}
