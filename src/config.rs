//! Configuration for the call core.

use std::time::Duration;

use crate::peer::RtcConfig;

#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Ring window before an unanswered call goes missed (caller side) or is
    /// auto-declined (callee side). Both sides derive their deadline from
    /// this value so they agree.
    pub ring_timeout: Duration,
    /// Maximum concurrent non-terminal calls allowed.
    pub max_concurrent_calls: usize,
    /// ICE configuration handed to every peer connection.
    pub rtc: RtcConfig,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(30),
            max_concurrent_calls: 1,
            rtc: RtcConfig::default(),
        }
    }
}
