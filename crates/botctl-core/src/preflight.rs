//! Checks run before anything is launched.

use crate::config::Settings;
use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};

/// The environment file must exist and the application's configuration
/// must load. Nothing is launched if either fails.
pub fn validate(settings: &Settings, diagnostics: &dyn Diagnostics) -> Result<()> {
    if !settings.env_file.is_file() {
        return Err(Error::ValidationFailed(format!(
            "environment file {} not found",
            settings.env_file.display()
        )));
    }
    diagnostics
        .check_config()
        .map_err(|e| Error::ValidationFailed(e.to_string()))?;
    tracing::debug!(env_file = %settings.env_file.display(), "preflight passed");
    Ok(())
}
