//! Scripted announce transport for deterministic tests.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use url::Url;

use super::registry::TrackerRegistry;
use super::session::{AnnounceOutcome, AnnounceTransport, AttemptContext, is_overload_message};
use super::types::{AnnounceEvent, AnnounceRequestParams, AnnounceResponse, PeerRecord};

/// One canned reply for a scripted URL.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    response: AnnounceResponse,
    permanent_url: Option<Url>,
    repeat: bool,
}

impl ScriptedResponse {
    pub fn online(interval_secs: u32, peers: Vec<PeerRecord>) -> Self {
        Self {
            response: AnnounceResponse {
                status: super::types::ResponseStatus::Online,
                interval_secs,
                min_interval_secs: None,
                tracker_id: None,
                peers,
                complete: None,
                incomplete: None,
                downloaded: None,
                message: None,
                udp_probe: false,
            },
            permanent_url: None,
            repeat: false,
        }
    }

    pub fn offline(message: &str) -> Self {
        Self {
            response: AnnounceResponse::offline(60, message),
            permanent_url: None,
            repeat: false,
        }
    }

    pub fn reported_error(reason: &str) -> Self {
        Self {
            response: AnnounceResponse::reported_error(60, reason),
            permanent_url: None,
            repeat: false,
        }
    }

    pub fn with_min_interval(mut self, min_interval_secs: u32) -> Self {
        self.response.min_interval_secs = Some(min_interval_secs);
        self
    }

    pub fn with_tracker_id(mut self, id: &str) -> Self {
        self.response.tracker_id = Some(id.to_string());
        self
    }

    /// Marks the reply as a permanent redirect to the given URL.
    pub fn with_permanent_url(mut self, url: &str) -> Self {
        self.permanent_url = Some(Url::parse(url).expect("valid redirect URL"));
        self
    }
}

/// In-memory transport replaying scripted responses, recording every call.
#[derive(Default)]
pub struct SimulatedTransport {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedResponse>>>,
    calls: Mutex<Vec<(String, AnnounceEvent)>>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one reply for the URL; consumed in order.
    pub fn script(&self, url: &str, response: ScriptedResponse) {
        self.scripts
            .lock()
            .entry(url.to_string())
            .or_default()
            .push_back(response);
    }

    /// Queues a reply replayed for every subsequent call to the URL.
    pub fn script_repeating(&self, url: &str, mut response: ScriptedResponse) {
        response.repeat = true;
        self.script(url, response);
    }

    /// Every `(url, event)` pair announced so far, in order.
    pub fn calls(&self) -> Vec<(String, AnnounceEvent)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl AnnounceTransport for SimulatedTransport {
    async fn announce(
        &self,
        url: &Url,
        params: &AnnounceRequestParams,
        _ctx: &AttemptContext,
    ) -> AnnounceOutcome {
        self.calls
            .lock()
            .push((url.as_str().to_string(), params.event));

        let scripted = {
            let mut scripts = self.scripts.lock();
            match scripts.get_mut(url.as_str()) {
                Some(queue) => match queue.front() {
                    Some(front) if front.repeat => Some(front.clone()),
                    Some(_) => queue.pop_front(),
                    None => None,
                },
                None => None,
            }
        };

        let Some(scripted) = scripted else {
            return AnnounceOutcome {
                response: AnnounceResponse::offline(60, format!("no scripted response for {url}")),
                permanent_url: None,
                overloaded_host: None,
            };
        };

        // Mirror the real transport's overload detection so scripted error
        // messages drive the same-host skip behavior.
        let overloaded_host = scripted
            .response
            .message
            .as_deref()
            .filter(|message| is_overload_message(message))
            .map(|_| TrackerRegistry::host_name(url));

        AnnounceOutcome {
            response: scripted.response,
            permanent_url: scripted.permanent_url,
            overloaded_host,
        }
    }
}
