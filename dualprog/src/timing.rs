//! Timing tunables for the whole run.
//!
//! Every delay, read window, retry count and backoff schedule used by the
//! UART engine, the mode switcher, the orchestrator and the test runner is
//! a field here. [`Timing::default`] picks the platform profile; tests use
//! [`Timing::immediate`] so nothing sleeps.

use std::{
    thread,
    time::{Duration, Instant},
};

const fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

const fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}

/// Centralized delays, read windows and retry schedules.
#[derive(Debug, Clone)]
pub struct Timing {
    /// Response window of `send_and_expect` when the session has no
    /// explicit read timeout.
    pub response_timeout: Duration,
    /// Poll interval inside a response read loop.
    pub poll_interval: Duration,
    /// Pause between writing a command and the first read.
    pub post_write_delay: Duration,
    /// Pause before the late-arrival read window.
    pub late_arrival_delay: Duration,
    /// Length of the late-arrival read window.
    pub late_arrival_window: Duration,
    /// Poll interval inside the late-arrival window.
    pub late_arrival_poll: Duration,

    /// Settle time between opening a port and clearing its buffers.
    pub open_settle: Duration,
    /// Pause before the single retry of a busy/denied open.
    pub open_retry_delay: Duration,
    /// Pause after closing a port.
    pub close_delay: Duration,
    /// Pause between close and reopen when recovering a dead handle.
    pub reopen_delay: Duration,
    /// Close/reopen cycles allowed per command.
    pub max_reopen_attempts: usize,

    /// Backoff of the `SET SWICH_SWD1__2` retries; one attempt per entry.
    pub mode_set_delays: Vec<Duration>,
    /// Independent confirmation checks after a mode SET.
    pub mode_confirm_checks: usize,
    /// Pause between confirmation checks.
    pub mode_confirm_delay: Duration,
    /// Query attempts inside one confirmation check.
    pub mode_query_tries: usize,
    /// Pause between query attempts.
    pub mode_query_delay: Duration,
    /// Relay settle time after switching to LV.
    pub stabilize_lv: Duration,
    /// Relay settle time after switching to HV.
    pub stabilize_hv: Duration,
    /// Granularity of cancellable waits.
    pub stop_slice: Duration,
    /// Probe re-discovery attempts after a mode switch.
    pub reenumerate_attempts: usize,
    /// Pause between re-discovery attempts.
    pub reenumerate_delay: Duration,
    /// Settle time after re-selecting the probe in LV mode.
    pub post_select_lv: Duration,
    /// Settle time after re-selecting the probe in HV mode.
    pub post_select_hv: Duration,

    /// UART stabilization before the first power command.
    pub power_on_warmup: Duration,
    /// Attempts of each `EN_12V` command.
    pub power_attempts: usize,
    /// Pause between `EN_12V` attempts.
    pub power_retry_delay: Duration,
    /// Settle time after the board reports power on.
    pub power_settle: Duration,
    /// Gap between OFF and ON of a power cycle.
    pub power_cycle_gap: Duration,
    /// Wait after the LV image before re-discovering the probe.
    pub post_lv_wait: Duration,
    /// Probe re-discovery attempts after the LV image.
    pub post_lv_reconnect_attempts: usize,
    /// Pause between those attempts.
    pub post_lv_reconnect_delay: Duration,
    /// Settle time after the probe was found again.
    pub post_lv_select_wait: Duration,
    /// Extra wait when the probe did not come back.
    pub post_lv_fallback_wait: Duration,

    /// Settle time between a flash write and its read-back.
    pub verify_settle: Duration,

    /// Backoff of test plan command steps; one attempt per entry.
    pub test_command_delays: Vec<Duration>,
    /// Read window for `SET` commands in the test plan.
    pub set_command_timeout: Duration,
    /// Wait after `SWICH_MODE`/`SWICH_PROFILE` steps.
    pub profile_settle: Duration,
    /// Wait before a status validation that follows a mode-setting step.
    pub status_pre_delay: Duration,
    /// Backoff of `GET STATUS` queries; one attempt per entry.
    pub status_attempt_delays: Vec<Duration>,
    /// Idle gap that ends a status read.
    pub status_idle: Duration,
    /// Upper bound of a status read.
    pub status_total: Duration,
    /// Poll interval of a status read.
    pub status_poll: Duration,
    /// Backoff of status validations; one attempt per entry.
    pub validation_delays: Vec<Duration>,
    /// Wait after re-sending the mode-setting step before a validation retry.
    pub validation_resend_settle: Duration,

    /// Timeout of a `--version` style tool probe.
    pub tool_probe_timeout: Duration,
    /// Timeout of an external tool write.
    pub tool_write_timeout: Duration,
    /// Timeout of an external tool read or erase.
    pub tool_read_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        let windows = cfg!(windows);
        Self {
            response_timeout: if windows { secs(3) } else { ms(2500) },
            poll_interval: ms(10),
            post_write_delay: ms(10),
            late_arrival_delay: ms(500),
            late_arrival_window: secs(2),
            late_arrival_poll: ms(50),

            open_settle: ms(200),
            open_retry_delay: ms(500),
            close_delay: if windows { ms(500) } else { ms(100) },
            reopen_delay: if windows { ms(500) } else { ms(200) },
            max_reopen_attempts: 2,

            mode_set_delays: vec![ms(100), ms(200), ms(300), ms(500), secs(1)],
            mode_confirm_checks: 3,
            mode_confirm_delay: secs(1),
            mode_query_tries: 2,
            mode_query_delay: ms(300),
            stabilize_lv: secs(5),
            stabilize_hv: secs(4),
            stop_slice: ms(100),
            reenumerate_attempts: 5,
            reenumerate_delay: secs(2),
            post_select_lv: secs(5),
            post_select_hv: secs(4),

            power_on_warmup: secs(1),
            power_attempts: 3,
            power_retry_delay: ms(300),
            power_settle: secs(1),
            power_cycle_gap: secs(1),
            post_lv_wait: secs(5),
            post_lv_reconnect_attempts: 5,
            post_lv_reconnect_delay: secs(2),
            post_lv_select_wait: secs(3),
            post_lv_fallback_wait: secs(5),

            verify_settle: ms(500),

            test_command_delays: vec![ms(100), ms(200), ms(300), ms(500), secs(1)],
            set_command_timeout: if windows { secs(5) } else { secs(4) },
            profile_settle: ms(500),
            status_pre_delay: secs(1),
            status_attempt_delays: vec![ms(200), ms(300), ms(500)],
            status_idle: ms(500),
            status_total: secs(5),
            status_poll: ms(50),
            validation_delays: vec![secs(1), secs(2), secs(3), secs(5), secs(10)],
            validation_resend_settle: secs(1),

            tool_probe_timeout: secs(5),
            tool_write_timeout: secs(60),
            tool_read_timeout: secs(30),
        }
    }
}

impl Timing {
    /// Profile without any waiting; retry counts stay as in the default.
    pub fn immediate() -> Self {
        let zero = Duration::ZERO;
        let base = Self::default();
        Self {
            response_timeout: zero,
            poll_interval: zero,
            post_write_delay: zero,
            late_arrival_delay: zero,
            late_arrival_window: zero,
            late_arrival_poll: zero,
            open_settle: zero,
            open_retry_delay: zero,
            close_delay: zero,
            reopen_delay: zero,
            mode_set_delays: vec![zero; base.mode_set_delays.len()],
            mode_confirm_delay: zero,
            mode_query_delay: zero,
            stabilize_lv: zero,
            stabilize_hv: zero,
            stop_slice: zero,
            reenumerate_delay: zero,
            post_select_lv: zero,
            post_select_hv: zero,
            power_on_warmup: zero,
            power_retry_delay: zero,
            power_settle: zero,
            power_cycle_gap: zero,
            post_lv_wait: zero,
            post_lv_reconnect_delay: zero,
            post_lv_select_wait: zero,
            post_lv_fallback_wait: zero,
            verify_settle: zero,
            test_command_delays: vec![zero; base.test_command_delays.len()],
            set_command_timeout: zero,
            profile_settle: zero,
            status_pre_delay: zero,
            status_attempt_delays: vec![zero; base.status_attempt_delays.len()],
            status_idle: zero,
            status_total: zero,
            status_poll: zero,
            validation_delays: vec![zero; base.validation_delays.len()],
            validation_resend_settle: zero,
            ..base
        }
    }
}

/// Sleep unless the duration is zero.
pub(crate) fn pause(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}

/// Wait `total` in `slice` steps, returning `false` as soon as `should_stop`
/// reports a stop request.
pub(crate) fn pause_unless_stopped(
    total: Duration,
    slice: Duration,
    should_stop: &dyn Fn() -> bool,
) -> bool {
    if should_stop() {
        return false;
    }
    if total.is_zero() {
        return true;
    }
    let slice = if slice.is_zero() { total } else { slice };
    let deadline = Instant::now() + total;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(slice.min(deadline - now));
        if should_stop() {
            return false;
        }
    }
}
