//! Upstream MQTT link: connect → subscribe → forward, with unbounded automatic reconnect.
//! `LinkStateMachine` is the pure lifecycle; `BrokerLink::run` drives it against a `BrokerTransport`
//! (rumqttc in production) and forwards messages only once the subscription set is acknowledged.

use crate::constants::{CLIENT_ID_PREFIX, MQTT_DEFAULT_PORT, MQTT_KEEP_ALIVE_SECS, MQTT_REQUEST_CAPACITY};
use crate::envelope::RawMessage;
use crate::utils::OrError;
use crate::{hermes_error, hermes_error_cause};
use percent_encoding::percent_decode_str;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, NetworkOptions, Packet, QoS, SubscribeFilter,
    SubscribeReasonCode,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Subscribing,
    Subscribed,
}

/// What the transport reported, in link terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Start,
    RetryElapsed,
    Connected,
    SubscribeIssued,
    /// Per-pattern outcome, in subscription order
    SubscribeAck(Vec<bool>),
    Message(RawMessage),
    TransportError(String),
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    None,
    Subscribe(Arc<[String]>),
    Forward(RawMessage),
    Reconnect(Duration),
}

/// Delay between reconnect attempts. With `max_interval <= interval` the delay is fixed;
/// otherwise it doubles per consecutive failure up to `max_interval`. Retries never stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub interval: Duration,
    pub max_interval: Duration,
}

impl ReconnectPolicy {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            max_interval: interval,
        }
    }

    pub fn capped(interval: Duration, max_interval: Duration) -> Self {
        Self {
            interval,
            max_interval,
        }
    }

    /// Delay before the retry following `failures` consecutive failed sessions.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if self.max_interval <= self.interval {
            return self.interval;
        }
        let factor = 2u32.saturating_pow(failures.min(31));
        self.interval.saturating_mul(factor).min(self.max_interval)
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SubscribeOutcome<'a> {
    pub accepted: Vec<&'a str>,
    pub rejected: Vec<&'a str>,
}

/// Broker session lifecycle. Any transport error or close returns to `Disconnected` with a reconnect delay;
/// a successful connect always re-subscribes the full set since the broker does not keep it.
pub struct LinkStateMachine {
    state: LinkState,
    subscriptions: Arc<[String]>,
    policy: ReconnectPolicy,
    failures: u32,
}

impl LinkStateMachine {
    pub fn new(subscriptions: Arc<[String]>, policy: ReconnectPolicy) -> Self {
        Self {
            state: LinkState::Disconnected,
            subscriptions,
            policy,
            failures: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    /// Splits a SUBACK into accepted and rejected patterns, in subscription order.
    /// `None` unless the ack completes the pending subscribe; a replayed request after reconnect
    /// can produce a second SUBACK once already `Subscribed`.
    pub fn subscribe_outcome(&self, granted: &[bool]) -> Option<SubscribeOutcome<'_>> {
        if self.state != LinkState::Subscribing {
            return None;
        }
        let mut outcome = SubscribeOutcome::default();
        for (pattern, ok) in self.subscriptions.iter().zip(granted) {
            if *ok {
                outcome.accepted.push(pattern.as_str());
            } else {
                outcome.rejected.push(pattern.as_str());
            }
        }
        Some(outcome)
    }

    pub fn handle(&mut self, event: LinkEvent) -> LinkAction {
        use LinkState::*;
        match (self.state, event) {
            (Disconnected, LinkEvent::Start | LinkEvent::RetryElapsed) => {
                self.state = Connecting;
                LinkAction::None
            }
            (_, LinkEvent::Connected) => {
                self.failures = 0;
                self.state = Connected;
                LinkAction::Subscribe(self.subscriptions.clone())
            }
            (Connected, LinkEvent::SubscribeIssued) => {
                self.state = Subscribing;
                LinkAction::None
            }
            (Subscribing, LinkEvent::SubscribeAck(_)) => {
                self.state = Subscribed;
                LinkAction::None
            }
            (Subscribed, LinkEvent::Message(raw)) => LinkAction::Forward(raw),
            (_, LinkEvent::TransportError(_) | LinkEvent::Closed) => {
                self.state = Disconnected;
                let delay = self.policy.delay_for(self.failures);
                self.failures = self.failures.saturating_add(1);
                LinkAction::Reconnect(delay)
            }
            _ => LinkAction::None,
        }
    }
}

/// Events surfaced by a broker transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    SubscribeAck(Vec<bool>),
    Message(RawMessage),
    Closed,
    /// Protocol traffic the link does not act on (pings, outgoing acks)
    Other,
}

impl TransportEvent {
    fn into_link_event(self) -> Option<LinkEvent> {
        match self {
            TransportEvent::Connected => Some(LinkEvent::Connected),
            TransportEvent::SubscribeAck(granted) => Some(LinkEvent::SubscribeAck(granted)),
            TransportEvent::Message(raw) => Some(LinkEvent::Message(raw)),
            TransportEvent::Closed => Some(LinkEvent::Closed),
            TransportEvent::Other => None,
        }
    }
}

/// Upstream session the link drives. `poll` both (re)connects and yields the next event;
/// after an error the next `poll` starts a fresh connection attempt.
pub trait BrokerTransport: Send {
    fn poll(&mut self) -> impl Future<Output = OrError<TransportEvent>> + Send;

    /// Queues one batched subscribe request for all patterns.
    fn subscribe(&mut self, patterns: &[String]) -> OrError<()>;
}

/// Broker endpoint parsed from an `mqtt://[user[:password]@]host[:port]` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerOptions {
    pub host: String,
    pub port: u16,
    pub credentials: Option<(String, String)>,
    pub client_id: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

impl BrokerOptions {
    /// Error: unparseable URL, unsupported scheme or missing host.
    /// Called by: `BridgeConfig::broker_options`
    pub fn from_url(raw: &str, connect_timeout: Duration) -> OrError<Self> {
        let url = Url::parse(raw).map_err(|e| {
            hermes_error_cause!("broker::BrokerOptions", "from_url", &format!("invalid broker URL '{}'", raw), e)
        })?;
        if !matches!(url.scheme(), "mqtt" | "tcp") {
            return Err(hermes_error!(
                "broker::BrokerOptions",
                "from_url",
                &format!("unsupported scheme '{}', expected mqtt:// or tcp://", url.scheme())
            ));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| hermes_error!("broker::BrokerOptions", "from_url", &format!("no host in '{}'", raw)))?
            .trim_matches(|c: char| c == '[' || c == ']')
            .to_string();
        let credentials = match url.username() {
            "" => None,
            user => Some((decode_userinfo(user), decode_userinfo(url.password().unwrap_or_default()))),
        };
        Ok(Self {
            host,
            port: url.port().unwrap_or(MQTT_DEFAULT_PORT),
            credentials,
            client_id: format!("{}-{:08x}", CLIENT_ID_PREFIX, rand::random::<u32>()),
            keep_alive: Duration::from_secs(MQTT_KEEP_ALIVE_SECS),
            connect_timeout,
        })
    }

    /// `host:port` without credentials, for logs.
    pub fn endpoint(&self) -> String {
        if self.host.contains(':') {
            format!("mqtt://[{}]:{}", self.host, self.port)
        } else {
            format!("mqtt://{}:{}", self.host, self.port)
        }
    }

    fn to_mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        if let Some((user, password)) = &self.credentials {
            options.set_credentials(user.clone(), password.clone());
        }
        options
    }
}

// `Url` keeps userinfo percent-encoded; the broker expects the literal text.
fn decode_userinfo(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

/// rumqttc-backed transport. rumqttc reconnects on the `poll` following an error.
pub struct MqttTransport {
    client: AsyncClient,
    eventloop: EventLoop,
}

impl MqttTransport {
    pub fn new(options: &BrokerOptions) -> Self {
        let (client, mut eventloop) = AsyncClient::new(options.to_mqtt_options(), MQTT_REQUEST_CAPACITY);
        let mut network = NetworkOptions::new();
        network.set_connection_timeout(options.connect_timeout.as_secs().max(1));
        eventloop.set_network_options(network);
        Self { client, eventloop }
    }
}

impl BrokerTransport for MqttTransport {
    async fn poll(&mut self) -> OrError<TransportEvent> {
        let event = self
            .eventloop
            .poll()
            .await
            .map_err(|e| hermes_error_cause!("broker::MqttTransport", "poll", "connection error", e))?;
        Ok(match event {
            Event::Incoming(Packet::ConnAck(_)) => TransportEvent::Connected,
            Event::Incoming(Packet::SubAck(ack)) => TransportEvent::SubscribeAck(
                ack.return_codes
                    .iter()
                    .map(|code| matches!(code, SubscribeReasonCode::Success(_)))
                    .collect(),
            ),
            Event::Incoming(Packet::Publish(publish)) => {
                TransportEvent::Message(RawMessage::new(publish.topic, publish.payload.to_vec()))
            }
            Event::Incoming(Packet::Disconnect) => TransportEvent::Closed,
            _ => TransportEvent::Other,
        })
    }

    fn subscribe(&mut self, patterns: &[String]) -> OrError<()> {
        let filters = patterns
            .iter()
            .map(|pattern| SubscribeFilter::new(pattern.clone(), QoS::AtMostOnce));
        self.client
            .try_subscribe_many(filters)
            .map_err(|e| hermes_error_cause!("broker::MqttTransport", "subscribe", "failed to queue subscribe", e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

/// Owns the upstream session and pushes every message received while subscribed into `outbound`.
pub struct BrokerLink<T: BrokerTransport> {
    transport: T,
    machine: LinkStateMachine,
    settings: LinkSettings,
    endpoint: String,
    outbound: mpsc::UnboundedSender<RawMessage>,
}

impl<T: BrokerTransport> BrokerLink<T> {
    pub fn new(
        transport: T,
        subscriptions: Arc<[String]>,
        settings: LinkSettings,
        endpoint: impl Into<String>,
        outbound: mpsc::UnboundedSender<RawMessage>,
    ) -> Self {
        Self {
            transport,
            machine: LinkStateMachine::new(subscriptions, settings.reconnect),
            settings,
            endpoint: endpoint.into(),
            outbound,
        }
    }

    pub fn state(&self) -> LinkState {
        self.machine.state()
    }

    /// Runs until the receiving end of `outbound` is dropped. Transport failures never end the loop.
    /// Called by: `bridge::Bridge::start` (spawned)
    pub async fn run(mut self) {
        let mut event = LinkEvent::Start;
        loop {
            if !self.dispatch(event).await {
                debug!("message pipeline closed, stopping broker link");
                return;
            }
            event = self.next_event().await;
        }
    }

    async fn next_event(&mut self) -> LinkEvent {
        loop {
            let polled = if self.machine.state() == LinkState::Connecting {
                let timeout = self.settings.connect_timeout;
                match tokio::time::timeout(timeout, self.transport.poll()).await {
                    Ok(result) => result,
                    Err(_) => Err(hermes_error!(
                        "broker::BrokerLink",
                        "next_event",
                        &format!("connect timed out after {}ms", timeout.as_millis())
                    )),
                }
            } else {
                self.transport.poll().await
            };
            match polled {
                Ok(event) => {
                    if let Some(event) = event.into_link_event() {
                        return event;
                    }
                }
                Err(e) => return LinkEvent::TransportError(e),
            }
        }
    }

    // Feeds an event and every follow-up it causes through the state machine.
    // Returns false once the pipeline is gone.
    async fn dispatch(&mut self, event: LinkEvent) -> bool {
        let mut next = Some(event);
        while let Some(event) = next.take() {
            self.log_event(&event);
            match self.machine.handle(event) {
                LinkAction::None => {}
                LinkAction::Subscribe(patterns) => {
                    next = Some(match self.transport.subscribe(&patterns) {
                        Ok(()) => LinkEvent::SubscribeIssued,
                        Err(e) => LinkEvent::TransportError(e),
                    });
                }
                LinkAction::Forward(raw) => {
                    if self.outbound.send(raw).is_err() {
                        return false;
                    }
                }
                LinkAction::Reconnect(delay) => {
                    info!("reconnecting to {} in {}ms...", self.endpoint, delay.as_millis());
                    tokio::time::sleep(delay).await;
                    next = Some(LinkEvent::RetryElapsed);
                }
            }
        }
        true
    }

    fn log_event(&self, event: &LinkEvent) {
        match event {
            LinkEvent::Connected => info!("connected to {}", self.endpoint),
            LinkEvent::SubscribeAck(granted) => match self.machine.subscribe_outcome(granted) {
                Some(outcome) => {
                    for pattern in &outcome.rejected {
                        error!("subscribe error: broker rejected {}", pattern);
                    }
                    info!("subscribed: {}", outcome.accepted.join(", "));
                }
                None => debug!(state = ?self.machine.state(), "ignoring subscribe ack outside of subscribing"),
            },
            LinkEvent::Message(raw) if self.machine.state() != LinkState::Subscribed => {
                debug!(topic = %raw.topic, state = ?self.machine.state(), "dropping message received before subscription");
            }
            LinkEvent::TransportError(e) => warn!("error: {}", e),
            LinkEvent::Closed => info!("connection closed"),
            _ => {}
        }
    }
}
