//! The event-sourced protocol adapter: wires the bidirectional gRPC stream
//! to a per-connection [`Session`].
//!
//! Each accepted stream gets its own blocking task running the session
//! loop; the only shared state is the immutable entity registry. User
//! handlers are synchronous and may block, so the loop must not run on the
//! shared runtime workers: inbound messages are fed through a bounded
//! channel to a `spawn_blocking` task, and replies flow back through a
//! bounded channel, so a slow proxy or a slow handler applies backpressure
//! to its own session only. Closing the stream drops the channels, which
//! is the only cancellation signal.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use crate::proto::cloudstate::eventsourced::event_sourced_server::EventSourced;
use crate::proto::cloudstate::eventsourced::{EventSourcedStreamIn, EventSourcedStreamOut};
use crate::registry::EntityRegistry;
use crate::session::Session;

const CHANNEL_BUFFER: usize = 32;

/// gRPC service driving event-sourced entity sessions.
pub(crate) struct EventSourcedService {
    registry: Arc<EntityRegistry>,
}

impl EventSourcedService {
    pub(crate) fn new(registry: Arc<EntityRegistry>) -> Self {
        Self { registry }
    }
}

#[tonic::async_trait]
impl EventSourced for EventSourcedService {
    type handleStream = ReceiverStream<Result<EventSourcedStreamOut, Status>>;

    async fn handle(
        &self,
        request: Request<Streaming<EventSourcedStreamIn>>,
    ) -> Result<Response<Self::handleStream>, Status> {
        let mut inbound = request.into_inner();
        let (in_tx, mut in_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_BUFFER);
        let registry = Arc::clone(&self.registry);

        // The session loop owns the handlers, which may block; keep it off
        // the shared runtime workers.
        tokio::task::spawn_blocking(move || {
            let mut session = Session::new(registry);
            while let Some(message) = in_rx.blocking_recv() {
                match session.handle(message) {
                    Ok(Some(out)) => {
                        // A send failure means the proxy went away; stop.
                        if out_tx.blocking_send(Ok(out)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::error!(error = %err, "terminating entity stream");
                        let _ = out_tx.blocking_send(Err(err.into_status()));
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            loop {
                let message = match inbound.message().await {
                    Ok(Some(message)) => message,
                    Ok(None) => break,
                    Err(status) => {
                        tracing::debug!(error = %status, "inbound stream failed");
                        break;
                    }
                };
                // A closed channel means the session loop ended first.
                if in_tx.send(message).await.is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(out_rx)))
    }
}
