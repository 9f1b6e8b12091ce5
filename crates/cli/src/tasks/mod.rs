//! Task bodies available to the binary.

mod command;
mod visit;

use std::collections::HashMap;
use std::sync::Arc;

use fleet::Capability;

pub use command::{
	CommandCapability, ENV_ACCOUNT, ENV_BROWSER_CONTEXT, ENV_CAPABILITY, ENV_CDP_ENDPOINT, ENV_TEMPLATE,
};
pub use visit::VisitCapability;

use crate::config::TaskSpec;

/// One capability per configured task, ordered by name.
pub fn build(tasks: &HashMap<String, TaskSpec>) -> Vec<Arc<dyn Capability>> {
	let mut names: Vec<&String> = tasks.keys().collect();
	names.sort();
	names
		.into_iter()
		.map(|name| -> Arc<dyn Capability> {
			match &tasks[name] {
				TaskSpec::Command(spec) => Arc::new(CommandCapability::new(name.clone(), spec.clone())),
				TaskSpec::Visit(spec) => Arc::new(VisitCapability::new(name.clone(), spec.clone())),
			}
		})
		.collect()
}
