//! Chromium runtime for pw-fleet.
//!
//! Implements the engine's driver seams over the Chrome DevTools Protocol:
//! [`ChromiumDriver`] launches one browser per egress identity and hands out
//! isolated browser contexts, and [`ChromiumSurfaceFactory`] opens headful
//! windows for operators to clear challenges.

pub mod browser_finder;
pub mod cdp_probe;
pub mod connection;
pub mod driver;
pub mod error;
pub mod launcher;
pub mod page;
pub mod process;
pub mod surface;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::CdpConnection;
pub use driver::{CdpContext, ChromiumDriver, ChromiumHost};
pub use error::{Result, RuntimeError};
pub use launcher::{BrowserProcess, LaunchOptions, ProfileDir};
pub use page::CdpPage;
pub use surface::{ChromiumSurfaceFactory, SurfaceOptions};
