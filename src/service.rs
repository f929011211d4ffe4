//! Service lifecycle
//!
//! A [`Service`] owns the router, the inbounds and the outbounds built
//! from one configuration document. Construction is fail-fast with
//! `parse <section>[<index>]` error paths; start is ordered (logger,
//! inbounds in declaration order, router); close runs best-effort in
//! reverse dependency order and aggregates errors instead of
//! short-circuiting.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::adapter::{Inbound, Outbound, Router};
use crate::buf::BufferPool;
use crate::config::{LogOptions, Options};
use crate::error::{join_close_errors, Error, Result, ServiceError};
use crate::inbound::{self, InboundAdapter};
use crate::outbound;
use crate::router::RuleRouter;

/// A fully wired proxy instance
pub struct Service {
    log: LogOptions,
    router: Arc<dyn Router>,
    inbounds: Vec<Arc<InboundAdapter>>,
    outbounds: Vec<Arc<dyn Outbound>>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("inbounds", &self.inbounds.len())
            .field("outbounds", &self.outbounds.len())
            .finish()
    }
}

impl Service {
    /// Build the service from a configuration document
    pub fn new(options: Options) -> Result<Self> {
        options.validate()?;

        let log = options.log.clone().unwrap_or_default();
        let router: Arc<dyn Router> =
            Arc::new(RuleRouter::new(options.route.clone().unwrap_or_default()));

        let mut outbounds: Vec<Arc<dyn Outbound>> = Vec::with_capacity(options.outbounds.len());
        for (index, outbound_options) in options.outbounds.iter().enumerate() {
            outbounds.push(outbound::create(index, outbound_options)?);
        }
        if outbounds.is_empty() {
            outbounds.push(Arc::new(crate::outbound::DirectOutbound::new("direct")));
        }

        let pool = Arc::new(BufferPool::with_defaults());
        let mut inbounds = Vec::with_capacity(options.inbounds.len());
        for (index, inbound_options) in options.inbounds.into_iter().enumerate() {
            inbounds.push(Arc::new(inbound::create(
                index,
                inbound_options,
                Arc::clone(&router),
                Arc::clone(&pool),
            )?));
        }

        router.update_outbounds(outbounds.clone());

        Ok(Self {
            log,
            router,
            inbounds,
            outbounds,
        })
    }

    /// Start the logger, every inbound in declaration order, then the
    /// router. The first failure aborts startup.
    pub async fn start(&self) -> Result<()> {
        start_logger(&self.log);

        for inbound in &self.inbounds {
            inbound
                .start()
                .await
                .map_err(|e| ServiceError::start(format!("inbound/{}", inbound.tag()), e))?;
        }

        self.router.start().await?;
        info!("service started");
        Ok(())
    }

    /// Close everything in reverse dependency order, aggregating
    /// errors. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let mut errors = Vec::new();

        for inbound in &self.inbounds {
            if let Err(e) = inbound.close().await {
                errors.push(e);
            }
        }
        for outbound in &self.outbounds {
            if let Err(e) = outbound.close().await {
                errors.push(e);
            }
        }
        if let Err(e) = self.router.close().await {
            errors.push(e);
        }

        info!("service closed");
        match join_close_errors(errors) {
            Some(e) => Err(Error::Service(e)),
            None => Ok(()),
        }
    }

    /// The configured inbounds
    #[must_use]
    pub fn inbounds(&self) -> &[Arc<InboundAdapter>] {
        &self.inbounds
    }
}

/// Install the global tracing subscriber from the `log` section.
///
/// `RUST_LOG` takes precedence over the configured level. Repeated
/// initialization (multiple services in one process) is tolerated.
fn start_logger(options: &LogOptions) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.level.clone()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(options.target);

    // try_init so a second service in the same process is tolerated
    let _ = if options.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_options_str;

    #[tokio::test]
    async fn test_minimal_service_lifecycle() {
        let options = load_options_str(
            r#"{
                "inbounds": [{
                    "type": "mixed", "tag": "in",
                    "listen": "127.0.0.1", "listen_port": 0,
                    "network": "tcp"
                }],
                "outbounds": [{ "type": "direct" }]
            }"#,
        )
        .unwrap();

        let service = Service::new(options).unwrap();
        service.start().await.unwrap();
        assert!(service.inbounds()[0].tcp_local_addr().is_some());

        service.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_twice_is_idempotent() {
        let options = load_options_str(
            r#"{
                "inbounds": [{
                    "type": "mixed", "tag": "in",
                    "listen": "127.0.0.1", "listen_port": 0,
                    "network": "tcp"
                }]
            }"#,
        )
        .unwrap();

        let service = Service::new(options).unwrap();
        service.start().await.unwrap();

        let first = service.close().await;
        let second = service.close().await;
        assert!(first.is_ok());
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_inbound_type_fails_with_path() {
        let options = load_options_str(
            r#"{ "inbounds": [{ "type": "quic", "listen_port": 0 }] }"#,
        )
        .unwrap();

        let err = Service::new(options).unwrap_err();
        assert!(err.to_string().contains("parse inbound[0]"));
        assert!(err.to_string().contains("unknown inbound type"));
    }

    #[tokio::test]
    async fn test_empty_outbounds_get_default_direct() {
        let options = load_options_str(r#"{}"#).unwrap();
        let service = Service::new(options).unwrap();
        assert!(service.inbounds().is_empty());
        service.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_aborts_startup() {
        let holder = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = holder.local_addr().unwrap().port();

        let options = load_options_str(&format!(
            r#"{{
                "inbounds": [{{
                    "type": "mixed", "tag": "in",
                    "listen": "127.0.0.1", "listen_port": {port},
                    "network": "tcp"
                }}]
            }}"#
        ))
        .unwrap();

        let service = Service::new(options).unwrap();
        let err = service.start().await.unwrap_err();
        assert!(err.to_string().contains("start inbound/in"));
    }
}
