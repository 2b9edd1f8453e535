//! One announce attempt against one resolved URL.
//!
//! The session owns protocol selection (HTTP vs UDP, including the
//! opportunistic UDP capability probe), the TLS-quirk retry loop, proxy
//! fallback for sandboxed networks, and classification of the outcome.
//! Failures never escape an attempt: every path produces a response object.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONNECTION};
use url::Url;

use super::registry::TrackerRegistry;
use super::types::{
    AnnounceRequestParams, AnnounceResponse, NetworkKind, ResponseStatus,
};
use super::wire::http::{build_announce_url, decode_announce_response};
use super::wire::udp::UdpTrackerClient;
use super::{FailureSeverity, TrackerError};
use crate::config::{NetworkPolicyConfig, UndertowConfig};

/// How a connection attempt ended, consumed by the explicit retry loop at
/// the call site instead of mutating shared flags from inside the transport.
#[derive(Debug)]
pub enum ConnectionOutcome {
    Success(Vec<u8>, Url),
    /// Unrecognized SNI name: retry without hostname verification.
    RetryWithSniHack,
    /// Handshake/internal-error failure: retry with an all-trusting store.
    RetryWithRelaxedTrust,
    /// DH keypair failure: retry with the Diffie-Hellman workaround.
    RetryWithDhWorkaround,
    Fatal(TrackerError),
}

/// UDP strategy for an announce that targets an HTTP(S) URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UdpPlan {
    /// Host already answers UDP: announce over UDP with normal timeouts.
    Confirmed,
    /// Try UDP as a capability probe, falling back to HTTP on failure.
    Probe,
    /// Plain HTTP announce.
    Http,
}

/// Context the state machine supplies for one attempt.
#[derive(Debug, Clone, Default)]
pub struct AttemptContext {
    /// First announce for this torrent; suppresses the UDP probe.
    pub first_announce: bool,
    /// Stopping announce; suppresses the UDP probe.
    pub stopping: bool,
    pub is_private: bool,
    pub permitted_networks: Option<Vec<NetworkKind>>,
}

/// Result of one attempt, with the side-channel signals the state machine
/// consumes.
#[derive(Debug)]
pub struct AnnounceOutcome {
    pub response: AnnounceResponse,
    /// Tracker signalled a permanent redirect: rewrite the announce list.
    pub permanent_url: Option<Url>,
    /// Host reported "too many seeds/peers": skip its other ports for the
    /// remainder of this announce cycle.
    pub overloaded_host: Option<String>,
}

impl AnnounceOutcome {
    fn plain(response: AnnounceResponse) -> Self {
        Self {
            response,
            permanent_url: None,
            overloaded_host: None,
        }
    }
}

/// Transport seam between the state machine and the wire, so tests can
/// substitute a scripted implementation.
#[async_trait]
pub trait AnnounceTransport: Send + Sync {
    async fn announce(
        &self,
        url: &Url,
        params: &AnnounceRequestParams,
        ctx: &AttemptContext,
    ) -> AnnounceOutcome;
}

/// Real transport performing HTTP(S) and UDP announces.
pub struct AnnounceSession {
    config: UndertowConfig,
    registry: Arc<TrackerRegistry>,
    /// Outbound proxy for sandboxed (non-public) targets, tried once after
    /// a failed direct attempt.
    fallback_proxy: Option<reqwest::Proxy>,
}

impl AnnounceSession {
    pub fn new(config: UndertowConfig, registry: Arc<TrackerRegistry>) -> Self {
        Self {
            config,
            registry,
            fallback_proxy: None,
        }
    }

    /// Installs the plugin-supplied proxy used as a fallback for Tor/I2P
    /// style targets.
    pub fn with_fallback_proxy(mut self, proxy: reqwest::Proxy) -> Self {
        self.fallback_proxy = Some(proxy);
        self
    }

    /// Picks the UDP strategy for an HTTP(S) announce URL. A host already
    /// confirmed to answer UDP is announced over UDP outright, with normal
    /// timeouts; unconfirmed hosts probe opportunistically, never on the
    /// first announce or while stopping, to keep startup and shutdown
    /// latency down.
    fn udp_plan(&self, url: &Url, ctx: &AttemptContext) -> UdpPlan {
        let status = self.registry.status_for(url);
        let mut status = status.lock();
        if status.is_udp_confirmed() {
            return UdpPlan::Confirmed;
        }
        if !self.config.udp.probe_enabled
            || ctx.first_announce
            || ctx.stopping
            || ctx.is_private
            || status.is_az_tracker()
        {
            return UdpPlan::Http;
        }
        if status.should_probe_udp() {
            UdpPlan::Probe
        } else {
            UdpPlan::Http
        }
    }

    async fn announce_udp(
        &self,
        url: &Url,
        params: &AnnounceRequestParams,
        probe: bool,
    ) -> Result<AnnounceResponse, TrackerError> {
        let client = UdpTrackerClient::connect(
            url,
            &self.config.udp,
            probe,
            self.config.network.ipv6_enabled,
        )
        .await?;

        let reply = client.announce(params).await?;

        Ok(AnnounceResponse {
            status: ResponseStatus::Online,
            interval_secs: reply.interval_secs,
            min_interval_secs: None,
            tracker_id: None,
            peers: reply.peers,
            complete: reply.seeders,
            incomplete: reply.leechers,
            downloaded: None,
            message: None,
            udp_probe: probe,
        })
    }

    fn http_client(
        &self,
        relaxed_trust: bool,
        proxy: Option<&reqwest::Proxy>,
    ) -> Result<reqwest::Client, TrackerError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("close"));

        let mut builder = reqwest::Client::builder()
            .timeout(self.config.announce.tracker_timeout)
            .user_agent(self.config.announce.user_agent)
            .redirect(reqwest::redirect::Policy::limited(5))
            .default_headers(headers);

        if relaxed_trust {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(proxy) = proxy {
            builder = builder.proxy(proxy.clone());
        }

        Ok(builder.build()?)
    }

    /// One HTTP round-trip, returning the outcome the retry loop consumes.
    async fn http_round_trip(
        &self,
        request_url: &str,
        relaxed_trust: bool,
        proxy: Option<&reqwest::Proxy>,
    ) -> ConnectionOutcome {
        let client = match self.http_client(relaxed_trust, proxy) {
            Ok(client) => client,
            Err(e) => return ConnectionOutcome::Fatal(e),
        };

        let response = match client.get(request_url).send().await {
            Ok(response) => response,
            Err(e) => return classify_send_error(request_url, e),
        };

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return ConnectionOutcome::Fatal(TrackerError::AuthenticationFailure {
                url: request_url.to_string(),
            });
        }
        if !status.is_success() {
            return ConnectionOutcome::Fatal(TrackerError::NetworkUnreachable {
                url: format!("{request_url} (HTTP {status})"),
            });
        }

        let final_url = response.url().clone();

        // Cap the body; exceeding the cap is fatal, not a truncation.
        let limit = self.config.announce.max_response_bytes;
        let mut body = Vec::new();
        let mut response = response;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if body.len() + chunk.len() > limit {
                        return ConnectionOutcome::Fatal(TrackerError::ResponseTooLarge { limit });
                    }
                    body.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(e) => return classify_send_error(request_url, e),
            }
        }

        if body.is_empty() {
            return ConnectionOutcome::Fatal(TrackerError::NetworkUnreachable {
                url: format!("{request_url} (no data)"),
            });
        }

        ConnectionOutcome::Success(body, final_url)
    }

    async fn announce_http(
        &self,
        url: &Url,
        params: &AnnounceRequestParams,
        ctx: &AttemptContext,
    ) -> Result<AnnounceOutcome, TrackerError> {
        let network = NetworkKind::classify(url.host_str().unwrap_or_default());
        let status = self.registry.status_for(url);

        // Per-host request shaping: the AZ extensions once the host is known
        // to run an AZ tracker, and the configured address override.
        let mut params = params.clone();
        params.az_tracker = status.lock().is_az_tracker();
        if params.ip_override.is_none() {
            params.ip_override = resolve_ip_override(&self.config.network, network);
        }

        let request_url = build_announce_url(url, &params, ctx.permitted_networks.as_deref())?;

        let mut relaxed_trust = status.lock().quirks().relaxed_trust;
        let mut proxy: Option<&reqwest::Proxy> = None;

        // At most two inner iterations: the first may discover a TLS quirk,
        // the second runs with it applied.
        let mut last_error: Option<TrackerError> = None;
        for iteration in 0..2 {
            match self
                .http_round_trip(&request_url, relaxed_trust, proxy)
                .await
            {
                ConnectionOutcome::Success(body, final_url) => {
                    return self.decode_http_body(url, &body, final_url, &params, network);
                }
                ConnectionOutcome::RetryWithSniHack => {
                    status.lock().quirks_mut().sni_hack = true;
                    relaxed_trust = true;
                }
                ConnectionOutcome::RetryWithRelaxedTrust => {
                    // Only the second attempt runs with the all-trusting
                    // store; a first-iteration failure sets it up.
                    if iteration == 1 {
                        return Err(TrackerError::NetworkUnreachable {
                            url: request_url.clone(),
                        });
                    }
                    status.lock().quirks_mut().relaxed_trust = true;
                    relaxed_trust = true;
                }
                ConnectionOutcome::RetryWithDhWorkaround => {
                    status.lock().quirks_mut().dh_workaround = true;
                    relaxed_trust = true;
                }
                ConnectionOutcome::Fatal(e) => {
                    // Non-public targets get one retry through the fallback
                    // proxy before the failure stands.
                    if network != NetworkKind::Public
                        && proxy.is_none()
                        && self.fallback_proxy.is_some()
                    {
                        proxy = self.fallback_proxy.as_ref();
                        last_error = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or(TrackerError::NetworkUnreachable { url: request_url }))
    }

    fn decode_http_body(
        &self,
        url: &Url,
        body: &[u8],
        final_url: Url,
        params: &AnnounceRequestParams,
        network: NetworkKind,
    ) -> Result<AnnounceOutcome, TrackerError> {
        let decoded = decode_announce_response(body, params.event, network)?;

        // An AZ-flavoured response marks the host so subsequent announces
        // carry the extended parameters.
        if decoded.az_tracker {
            self.registry.status_for(url).lock().mark_az_tracker();
        }

        // A warning is surfaced once per host+torrent, not every cycle.
        let message = decoded.warning.filter(|warning| {
            self.registry
                .should_surface_warning(url, params.info_hash, warning)
        });

        let response = AnnounceResponse {
            status: ResponseStatus::Online,
            interval_secs: decoded.interval_secs,
            min_interval_secs: decoded.min_interval_secs,
            tracker_id: decoded.tracker_id,
            peers: decoded.peers,
            complete: decoded.complete,
            incomplete: decoded.incomplete,
            downloaded: decoded.downloaded,
            message,
            udp_probe: false,
        };

        Ok(AnnounceOutcome {
            response,
            permanent_url: detect_permanent_redirect(url, &final_url),
            overloaded_host: None,
        })
    }
}

/// Classifies a reqwest failure into the outcome the retry loop acts on.
fn classify_send_error(url: &str, error: reqwest::Error) -> ConnectionOutcome {
    if error.is_timeout() {
        return ConnectionOutcome::Fatal(TrackerError::Timeout {
            url: url.to_string(),
        });
    }

    let description = full_error_chain(&error).to_ascii_lowercase();

    if description.contains("sni") || description.contains("hostname mismatch") {
        return ConnectionOutcome::RetryWithSniHack;
    }
    if description.contains("dh key") || description.contains("diffie") {
        return ConnectionOutcome::RetryWithDhWorkaround;
    }
    if description.contains("handshake")
        || description.contains("internal_error")
        || description.contains("certificate")
    {
        return ConnectionOutcome::RetryWithRelaxedTrust;
    }
    if description.contains("dns") || description.contains("resolve") {
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| url.to_string());
        return ConnectionOutcome::Fatal(TrackerError::UnresolvedHost { host });
    }

    ConnectionOutcome::Fatal(TrackerError::Http(error))
}

fn full_error_chain(error: &reqwest::Error) -> String {
    use std::error::Error as _;
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text
}

/// Recognizes the tracker-specific permanent-redirect marker in the final
/// resolved URL so the caller can rewrite its announce list.
fn detect_permanent_redirect(requested: &Url, final_url: &Url) -> Option<Url> {
    if final_url.host_str() == requested.host_str() && final_url.path() == requested.path() {
        return None;
    }
    let marked = final_url
        .query_pairs()
        .any(|(k, v)| k == "permredirect" && v == "1");
    if !marked {
        return None;
    }
    let mut rewritten = final_url.clone();
    rewritten.set_query(None);
    Some(rewritten)
}

/// Resolves the `ip=` parameter: an explicit configuration override wins,
/// and the public-address override applies to public trackers only.
fn resolve_ip_override(network: &NetworkPolicyConfig, kind: NetworkKind) -> Option<String> {
    if network.ip_override.is_some() {
        return network.ip_override.clone();
    }
    match kind {
        NetworkKind::Public => network.public_ip_override.clone(),
        _ => None,
    }
}

/// Messages that mean the host has already dropped us and other ports on
/// the same host must not be retried this cycle.
pub fn is_overload_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("too many seeds") || message.contains("too many peers")
}

#[async_trait]
impl AnnounceTransport for AnnounceSession {
    async fn announce(
        &self,
        url: &Url,
        params: &AnnounceRequestParams,
        ctx: &AttemptContext,
    ) -> AnnounceOutcome {
        tracing::debug!("Announcing to {url} (event {:?})", params.event);

        let result = match url.scheme() {
            "udp" => self
                .announce_udp(url, params, false)
                .await
                .map(AnnounceOutcome::plain),
            "http" | "https" => match self.udp_plan(url, ctx) {
                UdpPlan::Confirmed => self
                    .announce_udp(url, params, false)
                    .await
                    .map(AnnounceOutcome::plain),
                UdpPlan::Probe => match self.announce_udp(url, params, true).await {
                    Ok(response) => {
                        self.registry.status_for(url).lock().record_probe_success();
                        tracing::info!("UDP probe of {url} succeeded");
                        Ok(AnnounceOutcome::plain(response))
                    }
                    Err(e) => {
                        let status = self.registry.status_for(url);
                        status.lock().record_probe_failure(self.config.udp.probe_cap);
                        tracing::debug!("UDP probe of {url} failed ({e}), using HTTP");
                        self.announce_http(url, params, ctx).await
                    }
                },
                UdpPlan::Http => self.announce_http(url, params, ctx).await,
            },
            other => Err(TrackerError::ConfigurationRejected {
                reason: format!("unsupported tracker scheme '{other}'"),
            }),
        };

        match result {
            Ok(mut outcome) => {
                if let Some(message) = outcome.response.message.as_deref() {
                    if is_overload_message(message) {
                        outcome.overloaded_host = Some(TrackerRegistry::host_name(url));
                    }
                }
                outcome
            }
            Err(e) => {
                let severity = if e.is_soft() {
                    FailureSeverity::Soft
                } else {
                    FailureSeverity::Hard
                };
                match severity {
                    FailureSeverity::Soft => tracing::debug!("Announce to {url} failed ({severity}): {e}"),
                    FailureSeverity::Hard => tracing::warn!("Announce to {url} failed ({severity}): {e}"),
                }

                let mut outcome = match e.response_status() {
                    ResponseStatus::ReportedError => {
                        let reason = match &e {
                            TrackerError::TrackerReported { reason } => reason.clone(),
                            _ => e.to_string(),
                        };
                        AnnounceOutcome::plain(AnnounceResponse::reported_error(60, reason))
                    }
                    _ => AnnounceOutcome::plain(AnnounceResponse::offline(60, e.to_string())),
                };

                if let Some(message) = outcome.response.message.as_deref() {
                    if is_overload_message(message) {
                        outcome.overloaded_host = Some(TrackerRegistry::host_name(url));
                    }
                }
                outcome
            }
        }
    }
}
