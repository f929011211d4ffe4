//! TCP accept loop and per-connection dispatch

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, Instrument};

use super::{proxy_protocol, report_error, Shared};
use crate::adapter::ConnectionHandler;
use crate::common::{Address, FlowContext, Network, ShutdownHandle};

/// Accept until the listener fails or the inbound shuts down. Either
/// exit is silent: accept failure is treated as a shutdown signal.
pub(super) async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    handler: Arc<dyn ConnectionHandler>,
    shutdown: Arc<ShutdownHandle>,
) {
    let mut signal = shutdown.signal();
    loop {
        let (stream, peer) = tokio::select! {
            r = listener.accept() => match r {
                Ok(accepted) => accepted,
                Err(e) => {
                    debug!("accept loop exiting: {e}");
                    break;
                }
            },
            _ = signal.recv() => break,
        };

        shared.stats.record_connection();
        let ctx = FlowContext::new(&shared.tag, shutdown.signal());
        let span = ctx.span.clone();
        let shared = Arc::clone(&shared);
        let handler = Arc::clone(&handler);
        tokio::spawn(
            async move {
                handle_connection(shared, handler, ctx, stream, peer.into()).await;
            }
            .instrument(span),
        );
    }
}

async fn handle_connection(
    shared: Arc<Shared>,
    handler: Arc<dyn ConnectionHandler>,
    ctx: FlowContext,
    mut stream: TcpStream,
    mut source: Address,
) {
    if shared.options.proxy_protocol {
        match proxy_protocol::read_proxy_header(&mut stream).await {
            Ok(Some(declared)) => source = declared,
            Ok(None) => {}
            Err(e) => {
                report_error(&ctx, &e);
                return;
            }
        }
    }

    let local = stream.local_addr().ok();
    let metadata = shared.fill_metadata(Default::default(), Network::Tcp, source, local);
    info!(source = %metadata.source, "inbound connection");

    if let Err(e) = handler.new_connection(ctx.clone(), stream, metadata).await {
        // Dropping the stream closed the connection
        report_error(&ctx, &e);
    }
}
