//! Package-level constants.

use std::time::Duration;

/// Current version of the relay (sourced from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Package name.
pub const NAME: &str = "botrelay";

/// Header an Adapter may send at connect time to announce its durable identity.
pub const SELF_ID_HEADER: &str = "x-self-id";

/// Header an Adapter may send at connect time to announce its platform tag.
pub const PLATFORM_HEADER: &str = "x-platform";

/// Platform tag used when the Adapter never announces one.
pub const DEFAULT_PLATFORM: &str = "qq";

/// Issuer prefix for tokens minted by the broker itself (identity probes).
pub const BROKER_ISSUER: &str = "broker";

/// Deadline for a Processor → Adapter API call.
pub const API_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for broker-internal probes such as `get_login_info`.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_semver() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert_eq!(parts.len(), 3, "VERSION must be semver (MAJOR.MINOR.PATCH)");
        for part in parts {
            let _: u32 = part.parse().expect("each semver segment must be a number");
        }
    }

    #[test]
    fn headers_are_lowercase() {
        assert_eq!(SELF_ID_HEADER, SELF_ID_HEADER.to_lowercase());
        assert_eq!(PLATFORM_HEADER, PLATFORM_HEADER.to_lowercase());
    }

    #[test]
    fn probe_deadline_shorter_than_api_deadline() {
        assert!(PROBE_TIMEOUT < API_CALL_TIMEOUT);
    }
}
