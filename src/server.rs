//! Gateway listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::config::{CanChannel, GatewayConfig};
use crate::error::Result;
use crate::session::Session;
use crate::transport::{CanBus, DoipConnection, DoipListener};

/// DoIP gateway: accepts testers and runs a [`Session`] for each.
///
/// `open_bus` is called once per accepted connection, so every session owns
/// its own bus handle. Sessions run one at a time unless
/// `concurrent_sessions` is set; then each session leases its own CAN
/// identifier pair and testers beyond the available pairs are turned away.
pub struct Gateway<F> {
    listener: DoipListener,
    config: GatewayConfig,
    open_bus: Arc<F>,
    channels: Arc<ChannelPool>,
}

/// Identifier pairs not used by a running session.
#[derive(Debug)]
struct ChannelPool {
    free: Mutex<Vec<CanChannel>>,
}

impl ChannelPool {
    fn new(channels: Vec<CanChannel>) -> Self {
        Self {
            free: Mutex::new(channels),
        }
    }

    fn lease(pool: &Arc<Self>) -> Option<ChannelLease> {
        let mut free = pool.free.lock();
        if free.is_empty() {
            return None;
        }
        let channel = free.remove(0);
        Some(ChannelLease {
            pool: pool.clone(),
            channel,
        })
    }
}

/// A leased pair, returned to the pool on drop.
#[derive(Debug)]
struct ChannelLease {
    pool: Arc<ChannelPool>,
    channel: CanChannel,
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        self.pool.free.lock().push(self.channel);
    }
}

impl<B, F> Gateway<F>
where
    B: CanBus + ?Sized + 'static,
    F: Fn(&GatewayConfig) -> Result<Arc<B>> + Send + Sync + 'static,
{
    /// Validate `config` and bind its listen address.
    pub fn bind(config: GatewayConfig, open_bus: F) -> Result<Self> {
        config.validate()?;
        let listener = DoipListener::bind(config.listen_addr)?;
        tracing::info!(
            addr = %listener.local_addr(),
            interface = %config.can.interface,
            request_id = format!("0x{:03X}", config.can.request_id),
            response_id = format!("0x{:03X}", config.can.response_id),
            "gateway listening"
        );
        let channels = Arc::new(ChannelPool::new(config.can.channels()));
        Ok(Self {
            listener,
            config,
            open_bus: Arc::new(open_bus),
            channels,
        })
    }

    /// Get the local address the gateway is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Get the configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Accept one tester and serve it to completion.
    pub fn accept_one(&self) -> Result<()> {
        let connection = self.listener.accept()?;
        serve(connection, self.config.clone(), self.open_bus.as_ref())
    }

    /// Accept testers forever.
    ///
    /// Accept failures and session errors are logged; they do not stop the
    /// gateway.
    pub fn run(&self) -> Result<()> {
        loop {
            let connection = match self.listener.accept() {
                Ok(connection) => connection,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };

            if self.config.concurrent_sessions {
                self.spawn_session(connection);
            } else if let Err(e) = serve(connection, self.config.clone(), self.open_bus.as_ref()) {
                tracing::debug!(error = %e, "session finished with error");
            }
        }
    }

    fn spawn_session(&self, connection: DoipConnection) {
        let peer = connection.peer_addr();
        let Some(lease) = ChannelPool::lease(&self.channels) else {
            tracing::warn!(%peer, "no free CAN identifier pair, refusing tester");
            if let Err(e) = connection.shutdown() {
                tracing::debug!(%peer, error = %e, "shutdown");
            }
            return;
        };

        let channel = lease.channel;
        let config = self
            .config
            .clone()
            .with_can_ids(channel.request_id, channel.response_id);
        let open_bus = self.open_bus.clone();
        let spawned = thread::Builder::new()
            .name(format!("doip-session-{peer}"))
            .spawn(move || {
                let _lease = lease;
                serve(connection, config, open_bus.as_ref())
            });
        if let Err(e) = spawned {
            tracing::error!(%peer, error = %e, "cannot spawn session thread");
        }
    }
}

fn serve<B, F>(connection: DoipConnection, config: GatewayConfig, open_bus: &F) -> Result<()>
where
    B: CanBus + ?Sized + 'static,
    F: Fn(&GatewayConfig) -> Result<Arc<B>>,
{
    let peer = connection.peer_addr();
    tracing::info!(%peer, "tester connected");

    let bus = match open_bus(&config) {
        Ok(bus) => bus,
        Err(e) => {
            tracing::error!(%peer, interface = %config.can.interface, error = %e, "cannot open CAN bus");
            if let Err(e) = connection.shutdown() {
                tracing::debug!(%peer, error = %e, "shutdown");
            }
            return Err(e);
        }
    };

    Session::new(connection, bus, config).run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::header::LogicalAddress;
    use crate::isotp::single_frame;
    use crate::transport::{BusFrame, DoipClient, MockBus};
    use crate::types::ActivationCode;
    use std::time::Duration;

    const TESTER: LogicalAddress = LogicalAddress(0x0E00);
    const ECU: LogicalAddress = LogicalAddress(0x1000);

    fn local_config() -> GatewayConfig {
        GatewayConfig::default()
            .with_listen_addr("127.0.0.1:0".parse().unwrap())
            .with_read_timeout(Duration::from_millis(50))
    }

    fn echo_bus(_: &GatewayConfig) -> Result<Arc<MockBus>> {
        let bus = MockBus::new();
        bus.set_responder(|frame: &BusFrame| {
            let mut reply = frame.data()[1..=(frame.data()[0] as usize)].to_vec();
            reply[0] += 0x40;
            vec![single_frame(0x7E8, &reply, 0).unwrap()]
        });
        Ok(Arc::new(bus))
    }

    fn connect(addr: SocketAddr) -> DoipClient {
        let client = DoipClient::connect(addr, TESTER).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client
    }

    #[test]
    fn test_bind_rejects_invalid_config() {
        let config = local_config().with_can_ids(0x7E0, 0x7E0);
        assert!(matches!(
            Gateway::bind(config, echo_bus),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn test_accept_one() {
        let gateway = Gateway::bind(local_config(), echo_bus).unwrap();
        let addr = gateway.local_addr();
        let server = thread::spawn(move || gateway.accept_one());

        let mut client = connect(addr);
        assert_eq!(client.activate_routing(0).unwrap(), ActivationCode::Success);
        client.send_diagnostic(ECU, &[0x10, 0x03]).unwrap();
        let response = client.receive_diagnostic().unwrap();
        assert_eq!(response.user_data.as_ref(), &[0x50, 0x03]);

        client.close().unwrap();
        server.join().unwrap().unwrap();
    }

    #[test]
    fn test_sequential_sessions() {
        let gateway = Gateway::bind(local_config(), echo_bus).unwrap();
        let addr = gateway.local_addr();
        thread::spawn(move || gateway.run());

        for _ in 0..2 {
            let mut client = connect(addr);
            client.activate_routing(0).unwrap();
            client.send_diagnostic(ECU, &[0x3E, 0x00]).unwrap();
            assert_eq!(
                client.receive_diagnostic().unwrap().user_data.as_ref(),
                &[0x7E, 0x00]
            );
            client.close().unwrap();
        }
    }

    #[test]
    fn test_concurrent_sessions_use_distinct_channels() {
        let config = local_config()
            .with_concurrent_sessions(true)
            .with_session_channels(vec![CanChannel {
                request_id: 0x7E1,
                response_id: 0x7E9,
            }]);
        let opened = Arc::new(Mutex::new(Vec::new()));
        let gateway = {
            let opened = opened.clone();
            Gateway::bind(config, move |config: &GatewayConfig| {
                opened.lock().push(config.can.primary_channel());
                echo_bus(config)
            })
            .unwrap()
        };
        let addr = gateway.local_addr();
        thread::spawn(move || gateway.run());

        let mut first = connect(addr);
        let mut second = connect(addr);
        assert!(first.activate_routing(0).unwrap().is_success());
        assert!(second.activate_routing(0).unwrap().is_success());

        // Both pairs are taken.
        let mut third = connect(addr);
        assert!(third.receive().unwrap_err().is_disconnect());

        let mut opened_channels = opened.lock().clone();
        opened_channels.sort_by_key(|channel| channel.request_id);
        assert_eq!(
            opened_channels,
            vec![
                CanChannel { request_id: 0x7E0, response_id: 0x7E8 },
                CanChannel { request_id: 0x7E1, response_id: 0x7E9 },
            ]
        );

        // A closed session hands its pair back.
        first.close().unwrap();
        let mut served = false;
        for _ in 0..20 {
            thread::sleep(Duration::from_millis(50));
            let mut next = connect(addr);
            if next.activate_routing(0).is_ok() {
                served = true;
                break;
            }
        }
        assert!(served);
        drop(second);
    }

    #[test]
    fn test_bus_open_failure_drops_connection() {
        let gateway = Gateway::bind(local_config(), |config: &GatewayConfig| -> Result<Arc<MockBus>> {
            Err(GatewayError::config(format!("no such interface {}", config.can.interface)))
        })
        .unwrap();
        let addr = gateway.local_addr();
        let server = thread::spawn(move || gateway.accept_one());

        let mut client = connect(addr);
        assert!(client.receive().unwrap_err().is_disconnect());
        assert!(server.join().unwrap().is_err());
    }
}
