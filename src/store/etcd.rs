//! etcd v3 store client
//!
//! Wraps `etcd_client::Client` behind [`StoreConnector`] / [`StoreSession`].
//! Keys are namespaced on the way in and stripped on the way out, so the
//! rest of the crate only sees namespace-relative keys.

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Certificate, Client, ConnectOptions, Error as EtcdError, EventType, Identity, TlsOptions,
    WatchOptions,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{PrevKv, StoreConnector, StoreEndpoint, StoreEvent, StoreEventKind, StoreSession, StoreWatch};
use crate::connection::TlsMaterial;
use crate::error::{Layer, WorkbenchError, WorkbenchResult};

/// Buffered store events per watch before the pump applies backpressure
const WATCH_CHANNEL_CAPACITY: usize = 128;

/// Connector backed by the etcd gRPC client
#[derive(Debug, Default, Clone, Copy)]
pub struct EtcdConnector;

#[async_trait]
impl StoreConnector for EtcdConnector {
    async fn open(&self, endpoint: StoreEndpoint) -> WorkbenchResult<Arc<dyn StoreSession>> {
        let session = EtcdSession::connect(endpoint).await?;
        Ok(Arc::new(session))
    }
}

/// Error context needed to name the failing layer
#[derive(Debug, Clone, Copy)]
struct ErrorContext {
    tls: bool,
    timeout_secs: u64,
}

pub struct EtcdSession {
    client: Client,
    target: String,
    namespace: String,
    request_timeout: Duration,
    context: ErrorContext,
}

impl EtcdSession {
    pub async fn connect(endpoint: StoreEndpoint) -> WorkbenchResult<Self> {
        let scheme = if endpoint.tls.is_some() { "https" } else { "http" };
        let url = format!("{}://{}:{}", scheme, endpoint.host, endpoint.port);
        let target = endpoint.target();

        let mut options = ConnectOptions::new()
            .with_connect_timeout(endpoint.connect_timeout)
            .with_timeout(endpoint.request_timeout);
        if let Some(user) = &endpoint.user {
            options = options.with_user(user.username.clone(), user.password.expose().to_string());
        }
        if let Some(tls) = &endpoint.tls {
            options = options.with_tls(tls_options(tls, &endpoint.host));
        }

        let context = ErrorContext {
            tls: endpoint.tls.is_some(),
            timeout_secs: endpoint.connect_timeout.as_secs(),
        };

        info!("Connecting store client to {}", url);

        let client = tokio::time::timeout(
            endpoint.connect_timeout,
            Client::connect([url.as_str()], Some(options)),
        )
        .await
        .map_err(|_| WorkbenchError::Timeout {
            layer: connect_layer(context.tls),
            seconds: context.timeout_secs,
        })?
        .map_err(|e| map_etcd_error(e, context))?;

        debug!("Store client connected to {}", target);

        Ok(Self {
            client,
            target,
            namespace: endpoint.namespace.unwrap_or_default(),
            request_timeout: endpoint.request_timeout,
            context: ErrorContext {
                tls: context.tls,
                timeout_secs: endpoint.request_timeout.as_secs(),
            },
        })
    }

    fn request_timeout_error(&self) -> WorkbenchError {
        WorkbenchError::Timeout {
            layer: Layer::Store,
            seconds: self.context.timeout_secs,
        }
    }
}

#[async_trait]
impl StoreSession for EtcdSession {
    async fn probe(&self) -> WorkbenchResult<()> {
        let mut client = self.client.clone();
        let status = tokio::time::timeout(self.request_timeout, client.status())
            .await
            .map_err(|_| self.request_timeout_error())?
            .map_err(|e| map_etcd_error(e, self.context))?;
        debug!("Store {} answered status (version {})", self.target, status.version());
        Ok(())
    }

    async fn is_root(&self, user: &str) -> WorkbenchResult<bool> {
        let mut client = self.client.clone();
        let result = tokio::time::timeout(self.request_timeout, client.user_get(user))
            .await
            .map_err(|_| self.request_timeout_error())?;

        match result {
            Ok(response) => Ok(response.roles().iter().any(|r| r == "root")),
            // Reading user records needs the root role itself
            Err(EtcdError::GRpcStatus(status))
                if status.code() == tonic::Code::PermissionDenied =>
            {
                Ok(false)
            }
            Err(e) => Err(map_etcd_error(e, self.context)),
        }
    }

    async fn watch(&self, key: &str, prefix: bool) -> WorkbenchResult<StoreWatch> {
        let mut client = self.client.clone();
        let full_key = namespaced(&self.namespace, key);

        let mut options = WatchOptions::new().with_prev_key();
        if prefix {
            options = options.with_prefix();
        }

        let (watcher, stream) =
            tokio::time::timeout(self.request_timeout, client.watch(full_key.as_str(), Some(options)))
                .await
                .map_err(|_| self.request_timeout_error())?
                .map_err(|e| map_etcd_error(e, self.context))?;

        debug!("Watch started on {} (prefix: {}) at {}", full_key, prefix, self.target);

        let (event_tx, event_rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let (cancel_tx, cancel_rx) = oneshot::channel();

        tokio::spawn(pump_watch(
            watcher,
            stream,
            event_tx,
            cancel_rx,
            self.namespace.clone(),
            self.context,
        ));

        Ok(StoreWatch {
            events: event_rx,
            cancel: cancel_tx,
        })
    }

    /// Only logs; the gRPC channel is released when this session and every
    /// clone of its client are dropped
    async fn close(&self) {
        info!("Store client for {} released", self.target);
    }
}

async fn pump_watch(
    mut watcher: etcd_client::Watcher,
    mut stream: etcd_client::WatchStream,
    event_tx: mpsc::Sender<WorkbenchResult<StoreEvent>>,
    mut cancel_rx: oneshot::Receiver<()>,
    namespace: String,
    context: ErrorContext,
) {
    loop {
        tokio::select! {
            _ = &mut cancel_rx => {
                debug!("Watch {} cancelled", watcher.watch_id());
                if let Err(e) = watcher.cancel().await {
                    debug!("Watch cancel request failed: {}", e);
                }
                return;
            }

            message = stream.message() => match message {
                Ok(Some(response)) => {
                    if response.canceled() {
                        let reason = response.cancel_reason().to_string();
                        warn!("Watch cancelled by store: {}", reason);
                        let _ = event_tx
                            .send(Err(WorkbenchError::ConnectionLost(format!(
                                "watch cancelled by store: {}",
                                reason
                            ))))
                            .await;
                        return;
                    }

                    for event in response.events() {
                        let Some(kv) = event.kv() else { continue };
                        let kind = match event.event_type() {
                            EventType::Put => StoreEventKind::Put,
                            EventType::Delete => StoreEventKind::Delete,
                        };
                        let prev = event.prev_kv().map(|p| PrevKv {
                            value: p.value().to_vec(),
                            lease: p.lease(),
                        });
                        let Some(store_event) = to_store_event(
                            &namespace,
                            kind,
                            kv.key(),
                            kv.value(),
                            kv.lease(),
                            kv.mod_revision(),
                            prev,
                        ) else {
                            continue;
                        };
                        if event_tx.send(Ok(store_event)).await.is_err() {
                            let _ = watcher.cancel().await;
                            return;
                        }
                    }
                }
                Ok(None) => {
                    warn!("Watch stream ended by store");
                    let _ = event_tx
                        .send(Err(WorkbenchError::ConnectionLost(
                            "watch stream closed".to_string(),
                        )))
                        .await;
                    return;
                }
                Err(e) => {
                    warn!("Watch stream failed: {}", e);
                    let _ = event_tx
                        .send(Err(WorkbenchError::ConnectionLost(error_chain(&e))))
                        .await;
                    return;
                }
            }
        }
    }
}

fn tls_options(tls: &TlsMaterial, host: &str) -> TlsOptions {
    let domain = tls.domain.clone().unwrap_or_else(|| host.to_string());
    let mut options = TlsOptions::new().domain_name(domain);

    if !tls.ca_certificates.is_empty() {
        let mut bundle = Vec::new();
        for pem in &tls.ca_certificates {
            bundle.extend_from_slice(pem);
            if !pem.ends_with(b"\n") {
                bundle.push(b'\n');
            }
        }
        options = options.ca_certificate(Certificate::from_pem(bundle));
    }

    if let Some(identity) = &tls.identity {
        options = options.identity(Identity::from_pem(&identity.cert, &identity.key));
    }

    options
}

fn connect_layer(tls: bool) -> Layer {
    if tls {
        Layer::Tls
    } else {
        Layer::Store
    }
}

/// Prefix a namespace-relative key
pub(crate) fn namespaced(namespace: &str, key: &str) -> String {
    format!("{}{}", namespace, key)
}

/// Turn a raw watch event into a namespace-relative [`StoreEvent`]
///
/// Returns `None` for keys that are not UTF-8 or fall outside the
/// namespace; both are logged and skipped.
pub(crate) fn to_store_event(
    namespace: &str,
    kind: StoreEventKind,
    key: &[u8],
    value: &[u8],
    lease: i64,
    revision: i64,
    prev: Option<PrevKv>,
) -> Option<StoreEvent> {
    let full_key = match std::str::from_utf8(key) {
        Ok(full_key) => full_key,
        Err(e) => {
            warn!(
                "Skipping watch event at revision {}: key {:?} is not UTF-8 ({})",
                revision,
                String::from_utf8_lossy(key),
                e
            );
            return None;
        }
    };
    let Some(key) = full_key.strip_prefix(namespace) else {
        debug!(
            "Skipping watch event for {} outside namespace {:?}",
            full_key, namespace
        );
        return None;
    };
    let key = key.to_string();

    Some(StoreEvent {
        kind,
        key,
        value: value.to_vec(),
        lease,
        revision,
        prev,
    })
}

/// Flatten an error and its sources into one line
fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

fn looks_like_tls_failure(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["tls", "certificate", "handshake", "invalid peer", "unknown issuer"]
        .iter()
        .any(|needle| lower.contains(needle))
}

fn map_status(status: &tonic::Status, context: ErrorContext) -> WorkbenchError {
    let message = status.message().to_string();
    match status.code() {
        tonic::Code::Unauthenticated | tonic::Code::PermissionDenied => {
            WorkbenchError::auth_rejected(Layer::Store, message)
        }
        tonic::Code::InvalidArgument if message.contains("authentication failed") => {
            WorkbenchError::auth_rejected(Layer::Store, message)
        }
        tonic::Code::DeadlineExceeded => WorkbenchError::Timeout {
            layer: Layer::Store,
            seconds: context.timeout_secs,
        },
        tonic::Code::Unavailable if context.tls && looks_like_tls_failure(&message) => {
            WorkbenchError::unreachable(Layer::Tls, message)
        }
        _ => WorkbenchError::unreachable(Layer::Store, message),
    }
}

fn map_etcd_error(err: EtcdError, context: ErrorContext) -> WorkbenchError {
    match &err {
        EtcdError::GRpcStatus(status) => map_status(status, context),
        EtcdError::TransportError(_) | EtcdError::IoError(_) => {
            let message = error_chain(&err);
            if context.tls && looks_like_tls_failure(&message) {
                WorkbenchError::unreachable(Layer::Tls, message)
            } else {
                WorkbenchError::unreachable(Layer::Store, message)
            }
        }
        _ => WorkbenchError::unreachable(Layer::Store, error_chain(&err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAIN: ErrorContext = ErrorContext {
        tls: false,
        timeout_secs: 3,
    };
    const TLS: ErrorContext = ErrorContext {
        tls: true,
        timeout_secs: 3,
    };

    #[test]
    fn test_status_mapping() {
        let err = map_status(
            &tonic::Status::invalid_argument(
                "etcdserver: authentication failed, invalid user ID or password",
            ),
            PLAIN,
        );
        assert_eq!(err.kind(), "AuthRejected");
        assert_eq!(err.layer(), Some(Layer::Store));

        let err = map_status(&tonic::Status::deadline_exceeded("slow"), PLAIN);
        assert!(matches!(
            err,
            WorkbenchError::Timeout {
                layer: Layer::Store,
                seconds: 3
            }
        ));

        let err = map_status(&tonic::Status::unavailable("connection refused"), PLAIN);
        assert_eq!(err.kind(), "Unreachable");

        let err = map_status(
            &tonic::Status::unavailable("invalid peer certificate: UnknownIssuer"),
            TLS,
        );
        assert_eq!(err.layer(), Some(Layer::Tls));
    }

    #[test]
    fn test_namespace_is_stripped() {
        let event = to_store_event(
            "/app",
            StoreEventKind::Put,
            b"/app/config",
            b"v",
            0,
            7,
            None,
        )
        .unwrap();
        assert_eq!(event.key, "/config");
        assert_eq!(event.revision, 7);

        assert!(to_store_event("/app", StoreEventKind::Put, b"/other", b"", 0, 1, None).is_none());
        assert!(to_store_event("", StoreEventKind::Put, b"/bad\xff", b"", 0, 1, None).is_none());
        assert_eq!(namespaced("/app", "/config"), "/app/config");
        assert_eq!(namespaced("", "/config"), "/config");
    }

    #[test]
    fn test_tls_failure_detection() {
        assert!(looks_like_tls_failure("received corrupt message of type InvalidContentType (TLS)"));
        assert!(looks_like_tls_failure("invalid peer certificate: UnknownIssuer"));
        assert!(!looks_like_tls_failure("connection refused"));
    }
}
