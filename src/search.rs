//! Search Responder: the ephemeral-port Datagram Server
//! that emits M-SEARCH datagrams and receives unicast responses.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use log::trace;

use crate::datagram_server::{DatagramServer, Receiver};
use crate::error::Result;
use crate::executor::Executors;
use crate::iface::InterfaceBinding;
use crate::message::SsdpMessage;

/// Collaborator notified of each parsed M-SEARCH response.
pub trait ResponseSink: Send + Sync + 'static {
    fn on_response(&self, message: SsdpMessage);
}

struct ParsingReceiver<S: ResponseSink> {
    binding: InterfaceBinding,
    sink: Arc<S>,
    executors: Arc<Executors>,
}

impl<S: ResponseSink> Receiver for ParsingReceiver<S> {
    fn on_receive(&self, source: SocketAddr, data: &[u8]) {
        match SsdpMessage::parse(data, source, &self.binding, SystemTime::now()) {
            Ok(message) => {
                let sink = self.sink.clone();
                if !self.executors.submit_callback(async move {
                    sink.on_response(message);
                }) {
                    trace!(target: "upnp", "Callback pool unavailable, dropping M-SEARCH response.");
                }
            }
            Err(e) => {
                trace!(target: "upnp", "Dropping unparsable M-SEARCH response: {e}");
            }
        }
    }
}

/// A Search Responder: bound to an ephemeral port, never joins the
/// multicast group, sends M-SEARCH requests and receives unicast
/// replies.
pub struct SearchResponder<S: ResponseSink> {
    server: DatagramServer<ParsingReceiver<S>>,
}

impl<S: ResponseSink> SearchResponder<S> {
    pub fn new(binding: InterfaceBinding, sink: Arc<S>, executors: Arc<Executors>) -> Self {
        let receiver = Arc::new(ParsingReceiver {
            binding: binding.clone(),
            sink,
            executors: executors.clone(),
        });
        SearchResponder {
            server: DatagramServer::new(binding, 0, receiver, executors),
        }
    }

    pub async fn open(&mut self) -> Result<()> {
        self.server.open().await
    }

    pub async fn start(&mut self) -> Result<()> {
        self.server.start().await
    }

    pub async fn stop(&mut self) {
        self.server.stop().await
    }

    pub async fn close(&mut self) {
        self.server.close().await
    }

    /// Emits an M-SEARCH datagram for `search_target` with the given
    /// `MX` (max wait, seconds). Dispatched through the I/O pool; dropped
    /// silently if the receive task isn't ready yet.
    pub fn search(&self, search_target: &str, mx: u8) {
        let host = self.server.binding().mode.display_string();
        let payload = SsdpMessage::write_m_search(&host, search_target, mx);
        self.server.send(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::AddressMode;
    use std::sync::Mutex;
    use std::time::Duration;

    fn loopback_binding() -> InterfaceBinding {
        InterfaceBinding {
            interface_name: "lo".into(),
            address: "127.0.0.1".parse().unwrap(),
            mode: AddressMode::Ipv4,
            prefix_len: 8,
        }
    }

    struct RecordingSink {
        responses: Mutex<Vec<SsdpMessage>>,
    }

    impl ResponseSink for RecordingSink {
        fn on_response(&self, message: SsdpMessage) {
            self.responses.lock().unwrap().push(message);
        }
    }

    #[tokio::test]
    async fn search_before_ready_sends_nothing() {
        let sink = Arc::new(RecordingSink {
            responses: Mutex::new(Vec::new()),
        });
        let executors = Arc::new(Executors::new());
        let mut responder = SearchResponder::new(loopback_binding(), sink, executors);

        responder.open().await.unwrap();
        // Not started yet: no running task, no ready latch, send is a no-op.
        responder.search("ssdp:all", 2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        responder.close().await;
    }

    #[tokio::test]
    async fn open_start_stop_close_lifecycle() {
        let sink = Arc::new(RecordingSink {
            responses: Mutex::new(Vec::new()),
        });
        let executors = Arc::new(Executors::new());
        let mut responder = SearchResponder::new(loopback_binding(), sink, executors);

        responder.open().await.unwrap();
        responder.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        responder.stop().await;
        responder.close().await;
    }
}
