//! Notify Receiver.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use log::trace;

use crate::datagram_server::{DatagramServer, Receiver};
use crate::error::Result;
use crate::executor::Executors;
use crate::iface::InterfaceBinding;
use crate::message::SsdpMessage;

/// Collaborator notified of each parsed alive/byebye/update message, in
/// receive order.
pub trait NotificationSink: Send + Sync + 'static {
    fn on_notify(&self, message: SsdpMessage);
}

struct ParsingReceiver<S: NotificationSink> {
    binding: InterfaceBinding,
    sink: Arc<S>,
    executors: Arc<Executors>,
}

impl<S: NotificationSink> Receiver for ParsingReceiver<S> {
    fn on_receive(&self, source: SocketAddr, data: &[u8]) {
        match SsdpMessage::parse(data, source, &self.binding, SystemTime::now()) {
            Ok(message) => {
                let sink = self.sink.clone();
                if !self.executors.submit_callback(async move {
                    sink.on_notify(message);
                }) {
                    trace!(target: "upnp", "Callback pool unavailable, dropping notify message.");
                }
            }
            Err(e) => {
                // Malformed SSDP content is dropped silently:
                // never logged above trace on noisy UPnP networks.
                trace!(target: "upnp", "Dropping unparsable NOTIFY/M-SEARCH datagram: {e}");
            }
        }
    }
}

/// Builds the port-1900 Datagram Server that joins the SSDP multicast
/// group and delivers parsed notifications to `sink`.
pub fn new_notify_receiver<S: NotificationSink>(
    binding: InterfaceBinding,
    sink: Arc<S>,
    executors: Arc<Executors>,
) -> DatagramServer<ParsingReceiver<S>> {
    let receiver = Arc::new(ParsingReceiver {
        binding: binding.clone(),
        sink,
        executors: executors.clone(),
    });
    DatagramServer::new(binding, 1900, receiver, executors)
}

/// Opens and starts a notify receiver in one call, matching the
/// open()+start() sequence spec'd for S1/S2.
pub async fn start_notify_receiver<S: NotificationSink>(
    binding: InterfaceBinding,
    sink: Arc<S>,
    executors: Arc<Executors>,
) -> Result<DatagramServer<ParsingReceiver<S>>> {
    let mut server = new_notify_receiver(binding, sink, executors);
    server.open().await?;
    server.start().await?;
    Ok(server)
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
        messages: Mutex<Vec<SsdpMessage>>,
    }

    impl NotificationSink for RecordingSink {
        fn on_notify(&self, message: SsdpMessage) {
            self.messages.lock().unwrap().push(message);
        }
    }

    #[tokio::test]
    async fn delivers_parsed_notify_from_injected_datagram() {
        let sink = Arc::new(RecordingSink {
            messages: Mutex::new(Vec::new()),
        });
        let executors = Arc::new(Executors::new());
        let binding = loopback_binding();

        let receiver = Arc::new(ParsingReceiver {
            binding: binding.clone(),
            sink: sink.clone(),
            executors: executors.clone(),
        });

        let payload = b"NOTIFY * HTTP/1.1\r\n\
HOST: 239.255.255.250:1900\r\n\
NT: upnp:rootdevice\r\n\
USN: uuid:test-device::upnp:rootdevice\r\n\
NTS: ssdp:alive\r\n\
\r\n";

        receiver.on_receive("127.0.0.1:4000".parse().unwrap(), payload);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let messages = sink.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].uuid, "uuid:test-device");
    }

    #[tokio::test]
    async fn malformed_datagram_is_dropped_not_delivered() {
        let sink = Arc::new(RecordingSink {
            messages: Mutex::new(Vec::new()),
        });
        let executors = Arc::new(Executors::new());
        let receiver = Arc::new(ParsingReceiver {
            binding: loopback_binding(),
            sink: sink.clone(),
            executors,
        });

        receiver.on_receive("127.0.0.1:4000".parse().unwrap(), b"garbage not http");
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(sink.messages.lock().unwrap().is_empty());
    }
}
