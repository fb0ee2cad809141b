//! UART control commands: mode switch, raw commands, status and tests.

use {
    super::{ensure_not_interrupted, open_session, select_target},
    crate::{
        Cli,
        config::{Config, State},
        was_interrupted,
    },
    anyhow::{Context, Result, bail},
    console::style,
    dualprog::{
        Mode, ModeSwitcher, ProgressSink, TestPlan, TestRunner,
        testplan::parse_status,
        uart::command,
    },
    log::warn,
    std::path::Path,
};

/// Mode command implementation.
pub(crate) fn cmd_mode(cli: &Cli, config: &Config, state: &mut State, mode: Mode) -> Result<()> {
    let target = select_target(cli, config, state)?;
    let mut session = open_session(cli, config, &target.port.name)?;

    let result = {
        let mut switcher = ModeSwitcher::new(&mut session, &target.registry, &was_interrupted);
        switcher.select_mode(mode).and_then(|()| switcher.query_mode())
    };
    session.close();
    let reported = result?;

    match reported {
        Some(actual) if actual != mode => bail!("Controller acknowledged {mode} but reports {actual}"),
        Some(_) => eprintln!("{} Mode {mode} active", style("✓").green()),
        None => eprintln!("{} Mode {mode} acknowledged", style("✓").green()),
    }

    let identity = target.probe.identity_key();
    state.remember_pairing(&identity, &target.port.name);
    state.remember_mode(&identity, mode.as_str());
    if let Err(e) = state.save() {
        warn!("Could not save state: {e:#}");
    }
    Ok(())
}

/// Send command implementation.
pub(crate) fn cmd_send(cli: &Cli, config: &Config, state: &State, line: &str, expect: Option<&str>) -> Result<()> {
    let target = select_target(cli, config, state)?;
    let mut session = open_session(cli, config, &target.port.name)?;

    let expected = expect
        .map(str::to_string)
        .or_else(|| command::expected_ack(line));
    let result = match &expected {
        Some(expected) => session
            .send_and_expect(line, expected)
            .map(|ok| (ok, session.last_response().to_string())),
        None => {
            let timing = session.timing().clone();
            session
                .query(line, timing.status_idle, timing.status_total, timing.status_poll)
                .map(|reply| (true, reply))
        },
    };
    session.close();
    let (ok, reply) = result?;

    println!("{reply}");
    if ok {
        Ok(())
    } else {
        bail!(
            "Expected '{}', got '{reply}'",
            expected.as_deref().unwrap_or_default()
        )
    }
}

/// Status command implementation.
pub(crate) fn cmd_status(cli: &Cli, config: &Config, state: &State, json: bool) -> Result<()> {
    let target = select_target(cli, config, state)?;
    let mut session = open_session(cli, config, &target.port.name)?;
    let result = TestRunner::new(&mut session, &was_interrupted).read_status();
    session.close();
    let Some(text) = result? else {
        bail!("No response to {}", command::GET_STATUS);
    };

    let status = parse_status(&text);
    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "port": target.port.name,
                "status": status,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if status.is_empty() {
        println!("{text}");
    } else {
        for (key, value) in &status {
            println!("{key}: {value}");
        }
    }
    Ok(())
}

/// Echoes the exchange as it happens.
struct ConsoleSink {
    quiet: bool,
}

impl ProgressSink for ConsoleSink {
    fn line(&mut self, text: &str) {
        if !self.quiet {
            eprintln!("{}", style(text).dim());
        }
    }
}

/// Test command implementation.
pub(crate) fn cmd_test(cli: &Cli, config: &Config, state: &State, plan_path: &Path) -> Result<()> {
    let plan = TestPlan::from_file(plan_path)
        .with_context(|| format!("Failed to load test plan {}", plan_path.display()))?;
    let target = select_target(cli, config, state)?;
    ensure_not_interrupted()?;
    let mut session = open_session(cli, config, &target.port.name)?;

    eprintln!(
        "{} Running {} test steps on {}",
        style("ℹ").blue(),
        plan.steps.len(),
        target.port.name
    );
    let mut sink = ConsoleSink { quiet: cli.quiet };
    let report = TestRunner::new(&mut session, &was_interrupted).run(&plan, &mut sink);
    session.close();

    ensure_not_interrupted()?;
    if report.all_passed {
        eprintln!("{} {}", style("✓").green(), report.report);
        Ok(())
    } else {
        bail!("{}", report.report)
    }
}
