//! Default User-Agent for crawler traffic.
//!
//! The same string is sent on every request and matched against robots.txt
//! `User-agent` groups, so it leads with a short product token.

/// Project URL appended to the User-Agent.
const PROJECT_UA_URL: &str = "https://github.com/crawler-fetch/crawler-fetch";

/// Product token used for robots.txt group matching.
pub const PRODUCT_TOKEN: &str = "crawler-fetch";

/// Default User-Agent for fetch requests (identifies the tool).
#[must_use]
pub fn default_fetch_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("{PRODUCT_TOKEN}/{version} (+{PROJECT_UA_URL})")
}
