use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use super::config::HlsHeadersConfig;

/// Builds the headers for each request as a fresh value.
///
/// The configured sets are never mutated; every call clones the base set and
/// stamps a user agent picked from the rotation list by request index.
#[derive(Debug, Clone)]
pub struct RequestHeaders {
    index: HeaderMap,
    segments: HeaderMap,
    user_agents: Vec<HeaderValue>,
}

impl RequestHeaders {
    pub fn new(config: &HlsHeadersConfig) -> Self {
        let user_agents = config
            .user_agents
            .iter()
            .filter_map(|ua| match HeaderValue::from_str(ua) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(user_agent = %ua, "Ignoring invalid user agent");
                    None
                }
            })
            .collect();
        Self {
            index: config.index.clone(),
            segments: config.segments.clone(),
            user_agents,
        }
    }

    /// Headers for playlist and key requests
    pub fn for_index(&self) -> HeaderMap {
        self.stamp(self.index.clone(), 0)
    }

    /// Headers for the segment at `index`
    pub fn for_segment(&self, index: u64) -> HeaderMap {
        self.stamp(self.segments.clone(), index)
    }

    fn stamp(&self, mut headers: HeaderMap, index: u64) -> HeaderMap {
        if !self.user_agents.is_empty() {
            let pick = (index % self.user_agents.len() as u64) as usize;
            headers.insert(USER_AGENT, self.user_agents[pick].clone());
        }
        headers
    }
}
