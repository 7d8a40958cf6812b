//! Router configuration and hydration input.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BuildError;

use super::state::RouteErrorMap;

/// Behavior toggles for a router instance.
///
/// The serde shape allows embedding in a host's config file; hydration data
/// is runtime-only and always supplied programmatically.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Prefix stripped from every URL before matching and prepended to
    /// every href. Must begin with `/`.
    pub basename: String,
    /// Expose submission methods uppercase (`POST`) instead of the
    /// lowercase historical spelling.
    pub normalize_form_method: bool,
    /// Keep deleted fetchers alive until their in-flight work settles,
    /// publishing the terminal state before removal.
    pub persist_fetchers: bool,
    /// Honor the revalidation response header on redirects by forcing a
    /// full reload at the redirect target.
    pub revalidate_on_redirect_header: bool,
    /// Server-rendered data adopted at construction instead of running an
    /// initial load pass.
    #[serde(skip)]
    pub hydration: Option<HydrationState>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            basename: "/".to_string(),
            normalize_form_method: false,
            persist_fetchers: false,
            revalidate_on_redirect_header: false,
            hydration: None,
        }
    }
}

impl RouterConfig {
    pub(crate) fn validate(&self) -> Result<(), BuildError> {
        if !self.basename.starts_with('/') {
            return Err(BuildError::InvalidBasename(self.basename.clone()));
        }
        Ok(())
    }
}

/// Pre-computed state from a server render.
#[derive(Clone, Debug, Default)]
pub struct HydrationState {
    pub loader_data: HashMap<String, Value>,
    pub action_data: Option<HashMap<String, Value>>,
    pub errors: Option<RouteErrorMap>,
}
