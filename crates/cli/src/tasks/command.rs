//! Capabilities backed by an external program.
//!
//! The program connects to the account's browser context itself. It gets:
//!
//! | Variable                   | Value                                     |
//! |----------------------------|-------------------------------------------|
//! | `PW_FLEET_ACCOUNT`         | account id                                |
//! | `PW_FLEET_CAPABILITY`      | capability name                           |
//! | `PW_FLEET_CDP_ENDPOINT`    | browser-level `ws://` DevTools URL        |
//! | `PW_FLEET_BROWSER_CONTEXT` | CDP `browserContextId` to open pages in   |
//! | `PW_FLEET_TEMPLATE`        | per-account template, when configured     |
//!
//! and reports back by printing one JSON object as its last stdout line:
//!
//! ```json
//! {"status": "completed", "nextDueInMs": 900000, "info": {"followers": 12}}
//! {"status": "challenge_detected", "kind": "captcha"}
//! ```
//!
//! Empty output counts as `completed`; a non-zero exit is a transient failure.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use fleet::{
	Account, Capability, CapabilityOutcome, CapabilitySettings, FleetError, Result, SessionContext, TaskStatus,
};
use pw_fleet_runtime::CdpContext;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::process::Command;
use tracing::debug;

use crate::config::CommandSpec;

pub const ENV_ACCOUNT: &str = "PW_FLEET_ACCOUNT";
pub const ENV_CAPABILITY: &str = "PW_FLEET_CAPABILITY";
pub const ENV_CDP_ENDPOINT: &str = "PW_FLEET_CDP_ENDPOINT";
pub const ENV_BROWSER_CONTEXT: &str = "PW_FLEET_BROWSER_CONTEXT";
pub const ENV_TEMPLATE: &str = "PW_FLEET_TEMPLATE";

pub struct CommandCapability {
	name: String,
	spec: CommandSpec,
}

impl CommandCapability {
	pub fn new(name: impl Into<String>, spec: CommandSpec) -> Self {
		Self { name: name.into(), spec }
	}

	fn command(&self, account: &Account, settings: &CapabilitySettings, endpoint: &str, context_id: &str) -> Command {
		let mut cmd = Command::new(&self.spec.program);
		cmd.args(&self.spec.args)
			.envs(&self.spec.env)
			.env(ENV_ACCOUNT, &account.id)
			.env(ENV_CAPABILITY, &self.name)
			.env(ENV_CDP_ENDPOINT, endpoint)
			.env(ENV_BROWSER_CONTEXT, context_id)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true);
		if let Some(template) = &settings.template {
			cmd.env(ENV_TEMPLATE, template);
		}
		if let Some(dir) = &self.spec.working_dir {
			cmd.current_dir(dir);
		}
		cmd
	}
}

#[async_trait]
impl Capability for CommandCapability {
	fn name(&self) -> &str {
		&self.name
	}

	async fn run(&self, session: &SessionContext, account: &Account, settings: &CapabilitySettings) -> Result<CapabilityOutcome> {
		let context = session
			.downcast::<CdpContext>()
			.ok_or_else(|| FleetError::Driver("command tasks need a Chromium session".into()))?;

		let output = self
			.command(account, settings, context.endpoint(), context.browser_context_id())
			.output()
			.await
			.map_err(|e| FleetError::Transient(format!("{}: {}", self.spec.program, e)))?;

		let stderr = String::from_utf8_lossy(&output.stderr);
		if !output.status.success() {
			let last = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
			return Err(FleetError::Transient(format!("{} exited with {}: {}", self.spec.program, output.status, last)));
		}
		if !stderr.trim().is_empty() {
			debug!(target = "pw.fleet.task", account = %account.id, capability = %self.name, stderr = %stderr.trim(), "command stderr");
		}

		parse_report(&String::from_utf8_lossy(&output.stdout))
	}
}

/// What a command prints on its last stdout line.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Report {
	#[serde(flatten)]
	status: TaskStatus,
	#[serde(default)]
	next_due_in_ms: Option<u64>,
	#[serde(default)]
	persist_auth: bool,
	#[serde(default)]
	info: Option<Map<String, Value>>,
}

fn parse_report(stdout: &str) -> Result<CapabilityOutcome> {
	let Some(line) = stdout.lines().rev().map(str::trim).find(|l| !l.is_empty()) else {
		return Ok(CapabilityOutcome::completed());
	};
	let report: Report = serde_json::from_str(line)
		.map_err(|e| FleetError::Transient(format!("unreadable task report '{}': {}", line, e)))?;

	let mut outcome = CapabilityOutcome {
		status: report.status,
		next_due_in: report.next_due_in_ms.map(Duration::from_millis),
		persist_auth: report.persist_auth,
		account_info: None,
	};
	if let Some(info) = report.info.filter(|i| !i.is_empty()) {
		outcome = outcome.with_info(info);
	}
	Ok(outcome)
}

#[cfg(test)]
mod tests {
	use fleet::ChallengeKind;

	use super::*;

	#[test]
	fn empty_output_completes() {
		assert_eq!(parse_report("").unwrap(), CapabilityOutcome::completed());
		assert_eq!(parse_report("\n  \n").unwrap(), CapabilityOutcome::completed());
	}

	#[test]
	fn last_line_is_the_report() {
		let stdout = "connecting...\nscrolled 3 pages\n{\"status\":\"completed\",\"nextDueInMs\":900000,\"persistAuth\":true,\"info\":{\"followers\":12}}\n";
		let outcome = parse_report(stdout).unwrap();
		assert_eq!(outcome.status, TaskStatus::Completed);
		assert_eq!(outcome.next_due_in, Some(Duration::from_secs(900)));
		assert!(outcome.persist_auth);
		assert_eq!(outcome.account_info.unwrap()["followers"], 12);
	}

	#[test]
	fn challenge_reports_escalate() {
		let outcome = parse_report(r#"{"status":"challenge_detected","kind":"captcha"}"#).unwrap();
		assert_eq!(
			outcome.status,
			TaskStatus::ChallengeDetected {
				kind: ChallengeKind::Captcha
			}
		);
		assert!(outcome.status.needs_escalation());

		let rejected = parse_report(r#"{"status":"authentication_rejected"}"#).unwrap();
		assert_eq!(rejected.status, TaskStatus::AuthenticationRejected);
	}

	#[test]
	fn garbage_is_a_transient_failure() {
		let err = parse_report("done!").unwrap_err();
		assert!(matches!(err, FleetError::Transient(ref m) if m.contains("done!")));
		assert!(parse_report(r#"{"status":"exploded"}"#).is_err());
	}

	#[test]
	fn empty_info_is_dropped() {
		let outcome = parse_report(r#"{"status":"skipped","info":{}}"#).unwrap();
		assert_eq!(outcome.status, TaskStatus::Skipped);
		assert!(outcome.account_info.is_none());
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn command_sees_fleet_environment() {
		let spec = CommandSpec {
			program: "sh".into(),
			args: vec![
				"-c".into(),
				"printf '{\"status\":\"completed\",\"info\":{\"seen\":\"%s|%s|%s|%s|%s\"}}\\n' \"$PW_FLEET_ACCOUNT\" \"$PW_FLEET_CAPABILITY\" \"$PW_FLEET_CDP_ENDPOINT\" \"$PW_FLEET_BROWSER_CONTEXT\" \"$PW_FLEET_TEMPLATE\"".into(),
			],
			..CommandSpec::default()
		};
		let capability = CommandCapability::new("feed", spec);
		let settings = CapabilitySettings {
			enabled: true,
			template: Some("tpl".into()),
		};

		let output = capability
			.command(&Account::new("alice"), &settings, "ws://127.0.0.1:9/devtools/browser/x", "ctx-1")
			.output()
			.await
			.unwrap();
		let outcome = parse_report(&String::from_utf8_lossy(&output.stdout)).unwrap();
		assert_eq!(
			outcome.account_info.unwrap()["seen"],
			"alice|feed|ws://127.0.0.1:9/devtools/browser/x|ctx-1|tpl"
		);
	}
}
