//! Chrome/Chromium executable discovery.

use std::path::{Path, PathBuf};

use crate::error::{Result, RuntimeError};

/// Resolves the browser to launch: `explicit` if given, otherwise the first installed candidate.
pub fn resolve_executable(explicit: Option<&Path>) -> Result<PathBuf> {
	if let Some(path) = explicit {
		if path.components().count() > 1 || path.is_absolute() {
			if path.exists() {
				return Ok(path.to_path_buf());
			}
			return Err(RuntimeError::ExecutableMissing(path.display().to_string()));
		}
		return which::which(path).map_err(|_| RuntimeError::ExecutableMissing(path.display().to_string()));
	}
	find_chromium_executable().ok_or(RuntimeError::BrowserNotFound)
}

pub fn find_chromium_executable() -> Option<PathBuf> {
	candidates().into_iter().find_map(|candidate| {
		if is_path_like(&candidate) {
			let path = PathBuf::from(&candidate);
			path.exists().then_some(path)
		} else {
			which::which(&candidate).ok()
		}
	})
}

fn is_path_like(candidate: &str) -> bool {
	candidate.starts_with('/') || candidate.contains('\\') || candidate.contains(':')
}

fn candidates() -> Vec<String> {
	if cfg!(target_os = "macos") {
		[
			"/Applications/Chromium.app/Contents/MacOS/Chromium",
			"/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
			"/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
		]
		.into_iter()
		.map(str::to_string)
		.collect()
	} else if cfg!(target_os = "windows") {
		windows_candidates()
	} else {
		[
			"chromium",
			"chromium-browser",
			"google-chrome-stable",
			"google-chrome",
			"brave-browser",
			"/usr/bin/chromium",
			"/usr/bin/chromium-browser",
			"/usr/bin/google-chrome-stable",
			"/snap/bin/chromium",
		]
		.into_iter()
		.map(str::to_string)
		.collect()
	}
}

fn windows_candidates() -> Vec<String> {
	let mut roots: Vec<PathBuf> = ["PROGRAMFILES", "PROGRAMFILES(X86)", "LOCALAPPDATA"]
		.into_iter()
		.filter_map(|key| std::env::var(key).ok().map(PathBuf::from))
		.collect();
	if roots.is_empty() {
		roots.push(PathBuf::from(r"C:\Program Files"));
		roots.push(PathBuf::from(r"C:\Program Files (x86)"));
	}

	let suffixes: &[&[&str]] = &[
		&["Chromium", "Application", "chrome.exe"],
		&["Google", "Chrome", "Application", "chrome.exe"],
		&["Microsoft", "Edge", "Application", "msedge.exe"],
	];

	let mut candidates: Vec<String> = roots
		.iter()
		.flat_map(|root| {
			suffixes.iter().map(move |suffix| {
				let mut path = root.clone();
				path.extend(suffix.iter());
				path.to_string_lossy().to_string()
			})
		})
		.collect();
	candidates.extend(["chromium.exe", "chrome.exe", "msedge.exe"].map(str::to_string));
	candidates
}
