//! Built-in capability that loads a page and looks for challenges.

use async_trait::async_trait;
use fleet::{
	Account, Capability, CapabilityOutcome, CapabilitySettings, ChallengeDetector, FleetError, MarkerDetector,
	RenderedPage, Result, SessionContext,
};
use pw_fleet_runtime::CdpContext;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::VisitSpec;

pub struct VisitCapability {
	name: String,
	spec: VisitSpec,
	detector: Box<dyn ChallengeDetector>,
}

impl VisitCapability {
	pub fn new(name: impl Into<String>, spec: VisitSpec) -> Self {
		Self {
			name: name.into(),
			spec,
			detector: Box::new(MarkerDetector::default()),
		}
	}

	pub fn with_detector(mut self, detector: impl ChallengeDetector + 'static) -> Self {
		self.detector = Box::new(detector);
		self
	}

	fn judge(&self, page: &RenderedPage) -> CapabilityOutcome {
		let detection = self.detector.detect(page);
		if let Some(kind) = detection.kind.filter(|_| detection.detected) {
			return CapabilityOutcome::challenge(kind);
		}
		if let Some(login) = self.spec.login_url.as_deref() {
			if page.url.contains(login) {
				return CapabilityOutcome::auth_rejected();
			}
		}

		let mut info = Map::new();
		info.insert("lastVisitUrl".into(), Value::String(page.url.clone()));
		info.insert("lastVisitTitle".into(), Value::String(page.title.clone()));
		CapabilityOutcome::completed().persisting_auth().with_info(info)
	}
}

#[async_trait]
impl Capability for VisitCapability {
	fn name(&self) -> &str {
		&self.name
	}

	async fn run(&self, session: &SessionContext, account: &Account, _settings: &CapabilitySettings) -> Result<CapabilityOutcome> {
		let context = session
			.downcast::<CdpContext>()
			.ok_or_else(|| FleetError::Driver("visit tasks need a Chromium session".into()))?;

		let page = context
			.new_page(&self.spec.url)
			.await
			.map_err(|e| FleetError::Transient(e.to_string()))?;
		let rendered = page.rendered().await;
		if let Err(err) = page.close().await {
			debug!(target = "pw.fleet.task", account = %account.id, error = %err, "page close failed");
		}
		let rendered = rendered.map_err(|e| FleetError::Transient(e.to_string()))?;

		debug!(target = "pw.fleet.task", account = %account.id, capability = %self.name, url = %rendered.url, "page visited");
		Ok(self.judge(&rendered))
	}
}
