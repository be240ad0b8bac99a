//! Command model: the immutable description of an executable task and the
//! result kinds a run can produce.

use std::collections::HashMap;
use std::fmt;

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

use crate::server::dispatcher::Alert;
use crate::{Error, Result};

/// Per-command policy for what happens when the triggering alert resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingMode {
    #[default]
    Regular,
    Sawtooth,
}

impl SchedulingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulingMode::Regular => "regular",
            SchedulingMode::Sawtooth => "sawtooth",
        }
    }
}

/// A command that could be run based on what labels match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Only execute this command when all of the given labels are present in
    /// the alert's labels with equal values.
    #[serde(default)]
    pub match_labels: HashMap<String, String>,
    /// How many instances of this command can run at the same time for one
    /// fingerprint. A zero or negative value is interpreted as 'no limit'.
    #[serde(default)]
    pub max: i64,
    /// Whether we should let the caller know if a command failed.
    /// Defaults to true. Kept optional so an unset value is distinguishable
    /// from an explicit false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_on_failure: Option<bool>,
    /// Whether the command ignores a 'resolved' notification and continues
    /// running to completion. Defaults to false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_resolved: Option<bool>,
    #[serde(default)]
    pub resolved_signal: String,
    /// Whether the driver destroy sub-command should run when the alert
    /// resolves. Defaults to true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destroy_on_resolved: Option<bool>,
    #[serde(default)]
    pub scheduling: SchedulingMode,
}

impl Command {
    /// Returns true if every entry of `match_labels` is present in the
    /// alert's labels with an equal value. Empty `match_labels` matches
    /// everything.
    pub fn matches(&self, alert: &Alert) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| alert.labels.get(k) == Some(v))
    }

    /// Returns the alert's fingerprint together with whether the command's
    /// labels matched it.
    pub fn fingerprint(&self, alert: &Alert) -> (String, bool) {
        let matched = self
            .match_labels
            .iter()
            .filter(|&(k, v)| alert.labels.get(k) == Some(v))
            .count();
        if matched == self.match_labels.len() {
            (alert.fingerprint.clone(), true)
        } else {
            (String::new(), false)
        }
    }

    /// Structural equality over binary, argv and match labels.
    pub fn equal(&self, other: &Command) -> bool {
        self.cmd == other.cmd && self.args == other.args && self.match_labels == other.match_labels
    }

    pub fn should_notify(&self) -> bool {
        self.notify_on_failure.unwrap_or(true)
    }

    pub fn should_ignore_resolved(&self) -> bool {
        self.ignore_resolved.unwrap_or(false)
    }

    pub fn should_destroy(&self) -> bool {
        self.destroy_on_resolved.unwrap_or(true)
    }

    /// Returns the signal meant to notify the command that its triggering
    /// condition has resolved. An empty configuration value means SIGKILL;
    /// a decimal value is used as the raw signal number; anything else is an
    /// uppercased name lookup.
    pub fn parse_signal(&self) -> Result<Signal> {
        if self.resolved_signal.is_empty() {
            return Ok(Signal::SIGKILL);
        }

        if is_digit(&self.resolved_signal) {
            let n: i32 = self
                .resolved_signal
                .parse()
                .map_err(|e| Error::Signal(format!("invalid signal number: {}", e)))?;
            return Signal::try_from(n)
                .map_err(|e| Error::Signal(format!("unknown signal number {}: {}", n, e)));
        }

        let want = self.resolved_signal.to_uppercase();
        lookup_signal(&want).ok_or_else(|| Error::Signal(format!("unknown signal {}", want)))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            write!(f, "{}", self.cmd)
        } else {
            write!(f, "{} {}", self.cmd, self.args.join(" "))
        }
    }
}

fn lookup_signal(name: &str) -> Option<Signal> {
    let sig = match name {
        "SIGABRT" => Signal::SIGABRT,
        "SIGALRM" => Signal::SIGALRM,
        "SIGBUS" => Signal::SIGBUS,
        "SIGCHLD" => Signal::SIGCHLD,
        "SIGCONT" => Signal::SIGCONT,
        "SIGFPE" => Signal::SIGFPE,
        "SIGHUP" => Signal::SIGHUP,
        "SIGINT" => Signal::SIGINT,
        "SIGIO" => Signal::SIGIO,
        // SIGIOT is the historical name for SIGABRT.
        "SIGIOT" => Signal::SIGABRT,
        "SIGKILL" => Signal::SIGKILL,
        "SIGPIPE" => Signal::SIGPIPE,
        "SIGPROF" => Signal::SIGPROF,
        "SIGQUIT" => Signal::SIGQUIT,
        "SIGSEGV" => Signal::SIGSEGV,
        "SIGSTOP" => Signal::SIGSTOP,
        "SIGSYS" => Signal::SIGSYS,
        "SIGTERM" => Signal::SIGTERM,
        "SIGTRAP" => Signal::SIGTRAP,
        "SIGTSTP" => Signal::SIGTSTP,
        "SIGTTIN" => Signal::SIGTTIN,
        "SIGTTOU" => Signal::SIGTTOU,
        "SIGURG" => Signal::SIGURG,
        "SIGUSR1" => Signal::SIGUSR1,
        "SIGUSR2" => Signal::SIGUSR2,
        "SIGVTALRM" => Signal::SIGVTALRM,
        "SIGWINCH" => Signal::SIGWINCH,
        "SIGXCPU" => Signal::SIGXCPU,
        "SIGXFSZ" => Signal::SIGXFSZ,
        _ => return None,
    };
    Some(sig)
}

/// Returns true if the string is non-empty and consists only of digits.
pub fn is_digit(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

/// Bitmask of the kinds of results a single run can produce. One run may
/// emit several kinds serially, e.g. Ok followed by SigOk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResultKind(u8);

impl ResultKind {
    pub const OK: ResultKind = ResultKind(1);
    pub const FAIL: ResultKind = ResultKind(1 << 1);
    pub const SIG_OK: ResultKind = ResultKind(1 << 2);
    pub const SIG_FAIL: ResultKind = ResultKind(1 << 3);
    pub const SKIP_SIG: ResultKind = ResultKind(1 << 4);

    pub fn has(self, flag: ResultKind) -> bool {
        self.0 & flag.0 != 0
    }
}

impl std::ops::BitOr for ResultKind {
    type Output = ResultKind;

    fn bitor(self, rhs: ResultKind) -> ResultKind {
        ResultKind(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for ResultKind {
    fn bitor_assign(&mut self, rhs: ResultKind) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (ResultKind::OK, "Ok"),
            (ResultKind::FAIL, "Fail"),
            (ResultKind::SIG_OK, "SigOk"),
            (ResultKind::SIG_FAIL, "SigFail"),
            (ResultKind::SKIP_SIG, "SkipSig"),
        ];
        let has: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.has(*flag))
            .map(|(_, n)| *n)
            .collect();
        write!(f, "{}", has.join("|"))
    }
}

/// One tagged result emitted by a run.
#[derive(Debug)]
pub struct CommandResult {
    pub kind: ResultKind,
    pub err: Option<Error>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert_with_labels(labels: &[(&str, &str)]) -> Alert {
        let mut a = Alert::default();
        a.fingerprint = "f1".to_string();
        for (k, v) in labels {
            a.labels.insert(k.to_string(), v.to_string());
        }
        a
    }

    fn command_with_match(labels: &[(&str, &str)]) -> Command {
        let mut c = Command {
            cmd: "echo".to_string(),
            args: vec![],
            match_labels: HashMap::new(),
            max: 0,
            notify_on_failure: None,
            ignore_resolved: None,
            resolved_signal: String::new(),
            destroy_on_resolved: None,
            scheduling: SchedulingMode::Regular,
        };
        for (k, v) in labels {
            c.match_labels.insert(k.to_string(), v.to_string());
        }
        c
    }

    #[test]
    fn empty_match_labels_matches_everything() {
        let cmd = command_with_match(&[]);
        let alert = alert_with_labels(&[("env", "prod")]);
        assert!(cmd.matches(&alert));
        let (fp, ok) = cmd.fingerprint(&alert);
        assert!(ok);
        assert_eq!(fp, "f1");
    }

    #[test]
    fn mismatched_labels_yield_no_fingerprint() {
        let cmd = command_with_match(&[("env", "prod")]);
        let alert = alert_with_labels(&[("env", "dev")]);
        assert!(!cmd.matches(&alert));
        let (fp, ok) = cmd.fingerprint(&alert);
        assert!(!ok);
        assert_eq!(fp, "");
    }

    #[test]
    fn missing_label_key_does_not_match() {
        let cmd = command_with_match(&[("env", "prod"), ("team", "sre")]);
        let alert = alert_with_labels(&[("env", "prod")]);
        assert!(!cmd.matches(&alert));
    }

    #[test]
    fn parse_signal_defaults_to_kill() {
        let cmd = command_with_match(&[]);
        assert_eq!(cmd.parse_signal().unwrap(), Signal::SIGKILL);
    }

    #[test]
    fn parse_signal_accepts_numbers_and_names() {
        let mut cmd = command_with_match(&[]);
        cmd.resolved_signal = "15".to_string();
        assert_eq!(cmd.parse_signal().unwrap(), Signal::SIGTERM);

        cmd.resolved_signal = "sigterm".to_string();
        assert_eq!(cmd.parse_signal().unwrap(), Signal::SIGTERM);

        cmd.resolved_signal = "SIGIOT".to_string();
        assert_eq!(cmd.parse_signal().unwrap(), Signal::SIGABRT);
    }

    #[test]
    fn parse_signal_rejects_unknown_names() {
        let mut cmd = command_with_match(&[]);
        cmd.resolved_signal = "SIGBOGUS".to_string();
        assert!(cmd.parse_signal().is_err());
    }

    #[test]
    fn result_kind_accumulates_and_formats() {
        let mut state = ResultKind::default();
        state |= ResultKind::OK;
        state |= ResultKind::SIG_OK;
        assert!(state.has(ResultKind::OK));
        assert!(state.has(ResultKind::SIG_OK));
        assert!(!state.has(ResultKind::FAIL));
        assert_eq!(state.to_string(), "Ok|SigOk");
    }

    #[test]
    fn equal_compares_structure() {
        let a = command_with_match(&[("env", "prod")]);
        let mut b = command_with_match(&[("env", "prod")]);
        assert!(a.equal(&b));
        b.args.push("-v".to_string());
        assert!(!a.equal(&b));
    }
}
