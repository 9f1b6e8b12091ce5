//! Task bodies and the challenge detection seam.
//!
//! A [`Capability`] is one kind of periodic work performed per account. The
//! engine treats its body as opaque: it receives an isolated session and the
//! account, and reports back how the run went and when it wants to run again.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::account::{Account, CapabilitySettings};
use crate::error::Result;
use crate::pool::SessionContext;

/// Kind of anti-automation challenge recognised on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
	Captcha,
	Checkpoint,
	RateLimited,
	Banned,
	Unknown,
}

impl ChallengeKind {
	/// Parses the display name; anything unrecognised is [`ChallengeKind::Unknown`].
	pub fn from_name(name: &str) -> Self {
		match name.trim().to_ascii_lowercase().as_str() {
			"captcha" => ChallengeKind::Captcha,
			"checkpoint" => ChallengeKind::Checkpoint,
			"rate_limited" => ChallengeKind::RateLimited,
			"banned" => ChallengeKind::Banned,
			_ => ChallengeKind::Unknown,
		}
	}
}

impl fmt::Display for ChallengeKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			ChallengeKind::Captcha => "captcha",
			ChallengeKind::Checkpoint => "checkpoint",
			ChallengeKind::RateLimited => "rate_limited",
			ChallengeKind::Banned => "banned",
			ChallengeKind::Unknown => "unknown",
		};
		f.write_str(name)
	}
}

/// How a task body ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
	Completed,
	/// Nothing to do this cycle; still reschedules.
	Skipped,
	ChallengeDetected { kind: ChallengeKind },
	AuthenticationRejected,
}

impl TaskStatus {
	/// Whether the account must be handed to an operator.
	pub fn needs_escalation(&self) -> bool {
		matches!(self, TaskStatus::ChallengeDetected { .. } | TaskStatus::AuthenticationRejected)
	}
}

/// Report returned by a task body.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityOutcome {
	pub status: TaskStatus,
	/// Interval until the account is due again; `None` uses the capability default.
	pub next_due_in: Option<Duration>,
	/// Persist the session's auth state even if the capability does not do so by default.
	pub persist_auth: bool,
	/// Fields merged into the account's stored info.
	pub account_info: Option<Map<String, Value>>,
}

impl CapabilityOutcome {
	pub fn completed() -> Self {
		Self::with_status(TaskStatus::Completed)
	}

	pub fn skipped() -> Self {
		Self::with_status(TaskStatus::Skipped)
	}

	pub fn challenge(kind: ChallengeKind) -> Self {
		Self::with_status(TaskStatus::ChallengeDetected { kind })
	}

	pub fn auth_rejected() -> Self {
		Self::with_status(TaskStatus::AuthenticationRejected)
	}

	fn with_status(status: TaskStatus) -> Self {
		Self {
			status,
			next_due_in: None,
			persist_auth: false,
			account_info: None,
		}
	}

	pub fn due_in(mut self, interval: Duration) -> Self {
		self.next_due_in = Some(interval);
		self
	}

	pub fn persisting_auth(mut self) -> Self {
		self.persist_auth = true;
		self
	}

	pub fn with_info(mut self, info: Map<String, Value>) -> Self {
		self.account_info = Some(info);
		self
	}
}

/// A periodically executed automation action.
#[async_trait]
pub trait Capability: Send + Sync {
	/// Name used for configuration lookup, due-time keys, and logs.
	fn name(&self) -> &str;

	async fn run(&self, session: &SessionContext, account: &Account, settings: &CapabilitySettings) -> Result<CapabilityOutcome>;
}

/// The part of a rendered page a detector inspects.
#[derive(Debug, Clone, Default)]
pub struct RenderedPage {
	pub url: String,
	pub title: String,
	pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
	pub detected: bool,
	pub kind: Option<ChallengeKind>,
}

impl Detection {
	pub const CLEAR: Detection = Detection {
		detected: false,
		kind: None,
	};

	pub fn found(kind: ChallengeKind) -> Self {
		Self {
			detected: true,
			kind: Some(kind),
		}
	}
}

/// Recognises challenge and ban pages. Task bodies consult it before reporting success.
pub trait ChallengeDetector: Send + Sync {
	fn detect(&self, page: &RenderedPage) -> Detection;
}

/// Case-insensitive substring matching over URL, title, and content.
#[derive(Debug, Clone)]
pub struct MarkerDetector {
	url_markers: Vec<(String, ChallengeKind)>,
	text_markers: Vec<(String, ChallengeKind)>,
}

impl Default for MarkerDetector {
	fn default() -> Self {
		let url = [
			("/checkpoint", ChallengeKind::Checkpoint),
			("/challenge", ChallengeKind::Checkpoint),
			("captcha", ChallengeKind::Captcha),
			("/suspended", ChallengeKind::Banned),
		];
		let text = [
			("verify you are human", ChallengeKind::Captcha),
			("recaptcha", ChallengeKind::Captcha),
			("hcaptcha", ChallengeKind::Captcha),
			("unusual activity", ChallengeKind::Checkpoint),
			("confirm your identity", ChallengeKind::Checkpoint),
			("too many requests", ChallengeKind::RateLimited),
			("try again later", ChallengeKind::RateLimited),
			("account has been suspended", ChallengeKind::Banned),
			("account has been disabled", ChallengeKind::Banned),
		];
		Self {
			url_markers: url.iter().map(|(m, k)| (m.to_string(), *k)).collect(),
			text_markers: text.iter().map(|(m, k)| (m.to_string(), *k)).collect(),
		}
	}
}

impl MarkerDetector {
	/// A detector with no markers; extend it with the `with_*` builders.
	pub fn empty() -> Self {
		Self {
			url_markers: Vec::new(),
			text_markers: Vec::new(),
		}
	}

	pub fn with_url_marker(mut self, marker: impl AsRef<str>, kind: ChallengeKind) -> Self {
		self.url_markers.push((marker.as_ref().to_lowercase(), kind));
		self
	}

	pub fn with_text_marker(mut self, marker: impl AsRef<str>, kind: ChallengeKind) -> Self {
		self.text_markers.push((marker.as_ref().to_lowercase(), kind));
		self
	}
}

impl ChallengeDetector for MarkerDetector {
	fn detect(&self, page: &RenderedPage) -> Detection {
		let url = page.url.to_lowercase();
		if let Some((_, kind)) = self.url_markers.iter().find(|(m, _)| url.contains(m.as_str())) {
			return Detection::found(*kind);
		}

		let text = format!("{}\n{}", page.title, page.content).to_lowercase();
		self.text_markers
			.iter()
			.find(|(m, _)| text.contains(m.as_str()))
			.map(|(_, kind)| Detection::found(*kind))
			.unwrap_or(Detection::CLEAR)
	}
}
