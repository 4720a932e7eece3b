//! DNS server orchestration.
//!
//! [`QueryRouter`] decides, per datagram, between a synthesized block answer
//! and upstream forwarding. [`start`] binds the UDP socket and runs the
//! receive loop, handing each datagram to its own task so a slow upstream for
//! one query never holds up the next.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::blocklist::SharedIndex;
use crate::dns::blocker::blocked_response;
use crate::dns::forwarder::{DnsForwarder, MAX_UDP_DNS_SIZE};
use crate::error::{Error, Result};
use crate::metrics::{PARSE_ERRORS, QUERIES_BLOCKED, QUERIES_DROPPED, QUERIES_FORWARDED};

/// Classifies queries and produces at most one response per query.
pub struct QueryRouter<F>
where
    F: DnsForwarder,
{
    index: SharedIndex,
    forwarder: F,
}

impl<F> QueryRouter<F>
where
    F: DnsForwarder,
{
    pub fn new(index: SharedIndex, forwarder: F) -> Self {
        Self { index, forwarder }
    }

    /// Handle one raw query from `client`.
    ///
    /// Returns the bytes to send back, or `None` when the query is dropped
    /// (unparsable, or no upstream answered).
    pub async fn route(&self, query: &[u8], client: SocketAddr) -> Option<Vec<u8>> {
        let message = match parse_query(query) {
            Ok(message) => message,
            Err(err) => {
                metrics::counter!(PARSE_ERRORS).increment(1);
                warn!(%client, error = %err, "failed to parse DNS query");
                return None;
            }
        };
        let Some(question) = message.queries().first() else {
            metrics::counter!(PARSE_ERRORS).increment(1);
            warn!(%client, "query has no question");
            return None;
        };

        // match the name as sent, punycode labels stay encoded
        let name = question.name().to_ascii();
        let domain = name.trim_end_matches('.');

        // load once so the whole decision uses one index
        if self.index.load().is_blocked(domain) {
            return match blocked_response(&message).to_bytes() {
                Ok(bytes) => {
                    metrics::counter!(QUERIES_BLOCKED).increment(1);
                    info!(domain = %domain, %client, "BLOCKED {domain} ({client})");
                    Some(bytes)
                }
                Err(err) => {
                    warn!(domain = %domain, %client, error = %err, "failed to encode block response");
                    None
                }
            };
        }

        debug!(domain = %domain, %client, qtype = %question.query_type(), "forwarding query");
        match self.forwarder.forward(query).await {
            Some(response) => {
                metrics::counter!(QUERIES_FORWARDED).increment(1);
                Some(response)
            }
            None => {
                metrics::counter!(QUERIES_DROPPED).increment(1);
                warn!(domain = %domain, %client, "no upstream answered, query dropped");
                None
            }
        }
    }
}

impl<F> Clone for QueryRouter<F>
where
    F: DnsForwarder,
{
    fn clone(&self) -> Self {
        Self {
            index: Arc::clone(&self.index),
            forwarder: self.forwarder.clone(),
        }
    }
}

fn parse_query(bytes: &[u8]) -> Result<Message> {
    Ok(Message::from_bytes(bytes)?)
}

/// Configuration for the DNS listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_addr: SocketAddr,
    /// Upper bound on waiting for in-flight queries at stop.
    pub drain_timeout: Duration,
}

/// Lifecycle of the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Bound,
    Serving,
    Stopping,
    Closed,
}

/// Handle to a running listener.
pub struct ServerHandle {
    local_addr: SocketAddr,
    state: Arc<RwLock<ListenerState>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    listener: JoinHandle<()>,
    drain_timeout: Duration,
}

impl ServerHandle {
    /// Address actually bound, useful when binding port 0.
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ListenerState {
        *self.state.read()
    }

    /// Stop accepting datagrams and wait for in-flight queries.
    ///
    /// In-flight forwards are not cancelled; they finish or hit their own
    /// timeout. Returns `false` if the drain timeout elapsed first, in which
    /// case the state stays [`ListenerState::Stopping`] since the remaining
    /// tasks still hold the socket.
    pub async fn stop(self) -> bool {
        self.cancel.cancel();
        if let Err(err) = self.listener.await {
            warn!(error = %err, "listener task failed");
        }

        self.tracker.close();
        let drained = tokio::time::timeout(self.drain_timeout, self.tracker.wait())
            .await
            .is_ok();
        if !drained {
            warn!(
                pending = self.tracker.len(),
                "drain timeout elapsed with queries still in flight"
            );
            return false;
        }

        *self.state.write() = ListenerState::Closed;
        info!(addr = %self.local_addr, "DNS server stopped");
        true
    }
}

/// Bind the listener and start serving.
///
/// Binding happens before this returns, so a busy port or missing privileges
/// surface here as [`Error::Bind`].
pub async fn start<F>(config: ListenerConfig, router: QueryRouter<F>) -> Result<ServerHandle>
where
    F: DnsForwarder,
{
    let state = Arc::new(RwLock::new(ListenerState::Idle));

    let socket = UdpSocket::bind(config.bind_addr)
        .await
        .map_err(|err| Error::bind(config.bind_addr, err))?;
    let local_addr = socket.local_addr()?;
    *state.write() = ListenerState::Bound;
    info!(addr = %local_addr, "DNS server running");

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();
    let listener = tokio::spawn(serve(
        Arc::new(socket),
        router,
        cancel.clone(),
        tracker.clone(),
        Arc::clone(&state),
    ));

    Ok(ServerHandle {
        local_addr,
        state,
        cancel,
        tracker,
        listener,
        drain_timeout: config.drain_timeout,
    })
}

/// Pause after `failures` consecutive receive errors, doubling up to a cap.
fn recv_backoff(failures: u32) -> Duration {
    const BASE: Duration = Duration::from_millis(10);
    const MAX: Duration = Duration::from_secs(1);

    let exponent = failures.saturating_sub(1).min(16);
    BASE.saturating_mul(1 << exponent).min(MAX)
}

async fn serve<F>(
    socket: Arc<UdpSocket>,
    router: QueryRouter<F>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    state: Arc<RwLock<ListenerState>>,
) where
    F: DnsForwarder,
{
    *state.write() = ListenerState::Serving;
    let mut buf = vec![0u8; MAX_UDP_DNS_SIZE];
    let mut failures = 0u32;

    loop {
        let received = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };

        let (len, client) = match received {
            Ok(received) => {
                failures = 0;
                received
            }
            Err(err) => {
                // ICMP port unreachable from an earlier reply shows up here on Windows
                failures = failures.saturating_add(1);
                let delay = recv_backoff(failures);
                debug!(error = %err, failures, ?delay, "receive error");
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => continue,
                }
            }
        };

        let query = buf[..len].to_vec();
        let socket = Arc::clone(&socket);
        let router = router.clone();
        tracker.spawn(async move {
            if let Some(response) = router.route(&query, client).await {
                if let Err(err) = socket.send_to(&response, client).await {
                    warn!(%client, error = %err, "failed to send response");
                }
            }
        });
    }

    *state.write() = ListenerState::Stopping;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocklist::{BlockGroup, BlocklistManager};
    use crate::dns::BLOCK_ADDRESS;
    use crate::dns::forwarder::tests::MockForwarder;
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::{Name, RData, RecordType};
    use std::str::FromStr;
    use tracing::field::{Field, Visit};
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    /// Layer recording every event with its level and message.
    #[derive(Clone, Default)]
    struct EventRecorder {
        events: Arc<parking_lot::Mutex<Vec<(Level, String)>>>,
    }

    impl EventRecorder {
        /// Messages logged at info or more severe.
        fn visible(&self) -> Vec<String> {
            self.events
                .lock()
                .iter()
                .filter(|(level, _)| *level <= Level::INFO)
                .map(|(_, message)| message.clone())
                .collect()
        }
    }

    #[derive(Default)]
    struct MessageVisitor {
        message: String,
    }

    impl Visit for MessageVisitor {
        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            if field.name() == "message" {
                self.message = format!("{value:?}");
            }
        }
    }

    impl<S: Subscriber> Layer<S> for EventRecorder {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            let mut visitor = MessageVisitor::default();
            event.record(&mut visitor);
            self.events
                .lock()
                .push((*event.metadata().level(), visitor.message));
        }
    }

    /// Forwarder that waits `.0` and then gives up.
    #[derive(Clone)]
    struct StalledForwarder(Duration);

    impl DnsForwarder for StalledForwarder {
        async fn forward(&self, _query: &[u8]) -> Option<Vec<u8>> {
            tokio::time::sleep(self.0).await;
            None
        }
    }

    fn create_query(domain: &str, id: u16) -> Vec<u8> {
        let mut message = Message::new();
        message.set_id(id).set_recursion_desired(true);
        message.add_query(Query::query(Name::from_str(domain).unwrap(), RecordType::A));
        message.to_bytes().unwrap()
    }

    fn manager() -> BlocklistManager {
        BlocklistManager::new([
            BlockGroup::new("ads", ["example.com"]).enabled(true),
            BlockGroup::new("social", ["social.net"]),
        ])
    }

    fn client() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[tokio::test]
    async fn should_answer_blocked_query_locally() {
        let manager = manager();
        let forwarder = MockForwarder::answering(b"upstream".to_vec());
        let router = QueryRouter::new(manager.index(), forwarder.clone());

        let bytes = router
            .route(&create_query("ads.example.com.", 0xBEEF), client())
            .await
            .unwrap();

        let response = Message::from_bytes(&bytes).unwrap();
        assert_eq!(response.id(), 0xBEEF);
        assert_eq!(response.message_type(), MessageType::Response);
        let answer = &response.answers()[0];
        assert_eq!(answer.ttl(), 0);
        match answer.data() {
            Some(RData::A(a)) => assert_eq!(a.0, BLOCK_ADDRESS),
            other => panic!("expected A record, got {other:?}"),
        }
        assert_eq!(forwarder.call_count(), 0);
    }

    #[tokio::test]
    async fn should_block_superstring_without_label_boundary() {
        let manager = manager();
        let forwarder = MockForwarder::answering(b"upstream".to_vec());
        let router = QueryRouter::new(manager.index(), forwarder.clone());

        let bytes = router
            .route(&create_query("notexample.com.", 1), client())
            .await
            .unwrap();

        assert_eq!(Message::from_bytes(&bytes).unwrap().answers().len(), 1);
        assert_eq!(forwarder.call_count(), 0);
    }

    #[tokio::test]
    async fn should_relay_upstream_answer_verbatim() {
        let manager = manager();
        let forwarder = MockForwarder::answering(b"raw upstream bytes".to_vec());
        let router = QueryRouter::new(manager.index(), forwarder.clone());

        let response = router.route(&create_query("openai.com.", 7), client()).await;

        assert_eq!(response.as_deref(), Some(&b"raw upstream bytes"[..]));
        assert_eq!(forwarder.call_count(), 1);
    }

    #[tokio::test]
    async fn should_drop_when_forwarder_silent() {
        let manager = manager();
        let router = QueryRouter::new(manager.index(), MockForwarder::silent());

        assert!(router.route(&create_query("openai.com.", 7), client()).await.is_none());
    }

    #[tokio::test]
    async fn should_drop_unparsable_query() {
        let manager = manager();
        let forwarder = MockForwarder::answering(b"upstream".to_vec());
        let router = QueryRouter::new(manager.index(), forwarder.clone());

        assert!(router.route(&[0x12, 0x34, 0xff], client()).await.is_none());
        assert_eq!(forwarder.call_count(), 0);
    }

    #[tokio::test]
    async fn should_drop_query_without_question() {
        let manager = manager();
        let router = QueryRouter::new(manager.index(), MockForwarder::answering(vec![1]));
        let mut empty = Message::new();
        empty.set_id(3);

        assert!(router.route(&empty.to_bytes().unwrap(), client()).await.is_none());
    }

    #[tokio::test]
    async fn should_follow_group_toggles() {
        let manager = manager();
        let forwarder = MockForwarder::answering(b"upstream".to_vec());
        let router = QueryRouter::new(manager.index(), forwarder.clone());
        let query = create_query("www.social.net.", 11);

        assert_eq!(router.route(&query, client()).await.as_deref(), Some(&b"upstream"[..]));

        manager.set_group_enabled("social", true).unwrap();

        let bytes = router.route(&query, client()).await.unwrap();
        assert_eq!(Message::from_bytes(&bytes).unwrap().id(), 11);
        assert_eq!(forwarder.call_count(), 1);
    }

    #[tokio::test]
    async fn should_report_bind_error_for_busy_port() {
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let config = ListenerConfig {
            bind_addr: taken.local_addr().unwrap(),
            drain_timeout: Duration::from_secs(1),
        };
        let router = QueryRouter::new(manager().index(), MockForwarder::silent());

        let result = start(config, router).await;
        assert!(matches!(result, Err(Error::Bind { .. })));
    }

    #[tokio::test]
    async fn should_walk_through_lifecycle_states() {
        let config = ListenerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            drain_timeout: Duration::from_secs(1),
        };
        let router = QueryRouter::new(manager().index(), MockForwarder::silent());

        let handle = start(config, router).await.unwrap();
        assert_ne!(handle.local_addr().port(), 0);
        assert!(matches!(
            handle.state(),
            ListenerState::Bound | ListenerState::Serving
        ));

        let state = Arc::clone(&handle.state);
        assert!(handle.stop().await);
        assert_eq!(*state.read(), ListenerState::Closed);
    }

    #[tokio::test]
    async fn should_match_punycode_names_as_sent() {
        let manager = BlocklistManager::new([BlockGroup::new("ru", ["xn--p1ai"]).enabled(true)]);
        let forwarder = MockForwarder::answering(b"upstream".to_vec());
        let router = QueryRouter::new(manager.index(), forwarder.clone());

        let bytes = router
            .route(&create_query("xn--80aswg.xn--p1ai.", 21), client())
            .await
            .unwrap();

        assert_eq!(Message::from_bytes(&bytes).unwrap().id(), 21);
        assert_eq!(forwarder.call_count(), 0);
    }

    #[tokio::test]
    async fn should_not_match_unicode_entries_against_encoded_names() {
        let manager = BlocklistManager::new([BlockGroup::new("ru", ["сайт.рф"]).enabled(true)]);
        let forwarder = MockForwarder::answering(b"upstream".to_vec());
        let router = QueryRouter::new(manager.index(), forwarder.clone());

        let response = router
            .route(&create_query("xn--80aswg.xn--p1ai.", 22), client())
            .await;

        assert_eq!(response.as_deref(), Some(&b"upstream"[..]));
        assert_eq!(forwarder.call_count(), 1);
    }

    #[tokio::test]
    async fn should_log_exactly_one_line_per_blocked_query() {
        let manager = manager();
        let router = QueryRouter::new(manager.index(), MockForwarder::answering(vec![1]));
        let recorder = EventRecorder::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(recorder.clone()));

        router
            .route(&create_query("ads.example.com.", 1), client())
            .await
            .unwrap();

        assert_eq!(
            recorder.visible(),
            vec!["BLOCKED ads.example.com (127.0.0.1:50000)".to_string()]
        );
    }

    #[tokio::test]
    async fn should_stay_quiet_for_allowed_queries() {
        let manager = manager();
        let router = QueryRouter::new(manager.index(), MockForwarder::answering(vec![1]));
        let recorder = EventRecorder::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(recorder.clone()));

        router
            .route(&create_query("openai.com.", 2), client())
            .await
            .unwrap();

        assert!(recorder.visible().is_empty());
    }

    #[tokio::test]
    async fn should_remain_stopping_when_drain_times_out() {
        let config = ListenerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            drain_timeout: Duration::from_millis(50),
        };
        let router = QueryRouter::new(
            manager().index(),
            StalledForwarder(Duration::from_secs(2)),
        );
        let handle = start(config, router).await.unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&create_query("openai.com.", 3), handle.local_addr())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let state = Arc::clone(&handle.state);
        assert!(!handle.stop().await);
        assert_eq!(*state.read(), ListenerState::Stopping);
    }

    #[test]
    fn should_back_off_on_repeated_receive_errors() {
        assert_eq!(recv_backoff(1), Duration::from_millis(10));
        assert_eq!(recv_backoff(2), Duration::from_millis(20));
        assert_eq!(recv_backoff(4), Duration::from_millis(80));
        assert_eq!(recv_backoff(8), Duration::from_secs(1));
        assert_eq!(recv_backoff(u32::MAX), Duration::from_secs(1));
    }
}
