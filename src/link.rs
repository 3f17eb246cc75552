//! TCP link to the property server.
//!
//! Messages are newline-delimited JSON [`BusMessage`]s. The link reconnects in
//! the background, re-sends every snoop on each new connection, caches the
//! last park state reported for each peer, and forwards decoded
//! [`PeerEvent`]s to the daemon.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::bus::{
    ParkState, ParkTarget, PeerEvent, PropertyBus, PropertyUpdate, DOME_PARK, PARK_ELEMENT,
    TELESCOPE_PARK,
};
use crate::config::ServerSettings;
use crate::error::BusError;

pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BusMessage {
    Snoop {
        device: String,
        property: String,
    },
    SetSwitch {
        device: String,
        property: String,
        element: String,
    },
    Update(PropertyUpdate),
}

#[derive(Debug, Default)]
struct Shared {
    connected: AtomicBool,
    parks: Mutex<HashMap<(String, ParkTarget), ParkState>>,
    subscriptions: Mutex<Vec<(String, String)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn record(&self, event: &PeerEvent) {
        if let PeerEvent::Park { target, report } = event {
            lock(&self.parks).insert((report.device.clone(), *target), report.park_state());
        }
    }

    /// A park write makes any earlier report stale until the peer answers.
    fn forget_park(&self, device: &str, target: ParkTarget) {
        lock(&self.parks).insert((device.to_string(), target), ParkState::Unknown);
    }

    fn subscriptions(&self) -> Vec<(String, String)> {
        lock(&self.subscriptions).clone()
    }
}

pub struct PeerLink {
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<PeerEvent>,
    outbound: Option<mpsc::UnboundedSender<BusMessage>>,
    runtime: Option<Handle>,
    task: Option<JoinHandle<()>>,
    address: Option<String>,
}

impl PeerLink {
    /// Create a link bound to the current tokio runtime, if any, along with
    /// the receiver for decoded peer events.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn new(events: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            events,
            outbound: None,
            runtime: Handle::try_current().ok(),
            task: None,
            address: None,
        }
    }

    /// Stop the background task. The cached park states are kept.
    pub fn shutdown(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.outbound = None;
        self.shared.connected.store(false, Ordering::SeqCst);
    }

    fn running_for(&self, address: &str) -> bool {
        self.address.as_deref() == Some(address)
            && self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    fn send(&self, message: BusMessage) -> Result<(), BusError> {
        let outbound = self.outbound.as_ref().ok_or(BusError::NotConnected)?;
        outbound.send(message).map_err(|_| BusError::LinkClosed)
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PropertyBus for PeerLink {
    fn connect(&mut self, server: &ServerSettings) -> Result<(), BusError> {
        let address = server.address();
        if self.running_for(&address) {
            return Ok(());
        }

        let runtime = self.runtime.clone().ok_or(BusError::NoRuntime)?;
        self.shutdown();

        let (tx, rx) = mpsc::unbounded_channel();
        self.outbound = Some(tx);
        self.address = Some(address.clone());
        self.task = Some(runtime.spawn(run_link(
            address,
            Arc::clone(&self.shared),
            rx,
            self.events.clone(),
        )));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn snoop(&mut self, device: &str, property: &str) -> Result<(), BusError> {
        {
            let mut subscriptions = lock(&self.shared.subscriptions);
            let key = (device.to_string(), property.to_string());
            if subscriptions.contains(&key) {
                return Ok(());
            }
            subscriptions.push(key);
        }

        // Sent again on every (re)connection, so a closed link is not an error here.
        if self.is_connected() {
            let _ = self.send(BusMessage::Snoop {
                device: device.to_string(),
                property: property.to_string(),
            });
        }
        Ok(())
    }

    fn set_switch(&mut self, device: &str, property: &str, element: &str) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        self.send(BusMessage::SetSwitch {
            device: device.to_string(),
            property: property.to_string(),
            element: element.to_string(),
        })?;

        if element == PARK_ELEMENT {
            let target = match property {
                TELESCOPE_PARK => Some(ParkTarget::Mount),
                DOME_PARK => Some(ParkTarget::Dome),
                _ => None,
            };
            if let Some(target) = target {
                self.shared.forget_park(device, target);
            }
        }
        Ok(())
    }

    fn park_state(&self, device: &str, target: ParkTarget) -> ParkState {
        lock(&self.shared.parks)
            .get(&(device.to_string(), target))
            .copied()
            .unwrap_or_default()
    }
}

async fn run_link(
    address: String,
    shared: Arc<Shared>,
    mut outbound: mpsc::UnboundedReceiver<BusMessage>,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    loop {
        match TcpStream::connect(&address).await {
            Ok(stream) => {
                info!("Connected to property server {}", address);
                shared.connected.store(true, Ordering::SeqCst);
                if let Err(e) = serve(stream, &shared, &mut outbound, &events).await {
                    warn!("Property server {} link error: {}", address, e);
                }
                shared.connected.store(false, Ordering::SeqCst);
                warn!("Disconnected from property server {}", address);
            }
            Err(e) => debug!("Unable to reach property server {}: {}", address, e),
        }

        if events.is_closed() {
            debug!("Peer event receiver dropped, stopping link");
            return;
        }
        time::sleep(RECONNECT_DELAY).await;
    }
}

async fn serve(
    stream: TcpStream,
    shared: &Shared,
    outbound: &mut mpsc::UnboundedReceiver<BusMessage>,
    events: &mpsc::UnboundedSender<PeerEvent>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    for (device, property) in shared.subscriptions() {
        write_message(&mut writer, &BusMessage::Snoop { device, property }).await?;
    }

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => handle_line(&line, shared, events),
                None => return Ok(()),
            },
            message = outbound.recv() => match message {
                Some(message) => write_message(&mut writer, &message).await?,
                None => return Ok(()),
            },
        }
    }
}

fn handle_line(line: &str, shared: &Shared, events: &mpsc::UnboundedSender<PeerEvent>) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }

    match serde_json::from_str::<BusMessage>(trimmed) {
        Ok(BusMessage::Update(update)) => {
            if let Some(event) = PeerEvent::decode(&update) {
                shared.record(&event);
                let _ = events.send(event);
            }
        }
        Ok(other) => debug!("Ignoring unexpected bus message {:?}", other),
        Err(e) => warn!("Malformed bus message: {}", e),
    }
}

async fn write_message(writer: &mut OwnedWriteHalf, message: &BusMessage) -> std::io::Result<()> {
    let json = serde_json::to_string(message).map_err(std::io::Error::other)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{PropertyState, SwitchElement, UNPARK_ELEMENT};
    use tokio::net::TcpListener;

    #[test]
    fn test_bus_message_wire_format() {
        let json = serde_json::to_string(&BusMessage::Snoop {
            device: "Dome Simulator".to_string(),
            property: "DOME_PARK".to_string(),
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"type":"Snoop","device":"Dome Simulator","property":"DOME_PARK"}"#
        );
    }

    fn mount_update(state: PropertyState, parked: bool) -> String {
        serde_json::to_string(&BusMessage::Update(PropertyUpdate {
            device: "Telescope Simulator".to_string(),
            property: TELESCOPE_PARK.to_string(),
            state,
            elements: vec![
                SwitchElement {
                    name: PARK_ELEMENT.to_string(),
                    on: parked,
                },
                SwitchElement {
                    name: UNPARK_ELEMENT.to_string(),
                    on: !parked,
                },
            ],
        }))
        .unwrap()
    }

    #[test]
    fn test_unparked_mount_is_not_cached_as_parked() {
        let shared = Shared::default();
        let (tx, _rx) = mpsc::unbounded_channel();

        handle_line(&mount_update(PropertyState::Ok, false), &shared, &tx);
        assert_eq!(
            lock(&shared.parks).get(&("Telescope Simulator".to_string(), ParkTarget::Mount)),
            Some(&ParkState::Unknown)
        );

        handle_line(&mount_update(PropertyState::Ok, true), &shared, &tx);
        assert_eq!(
            lock(&shared.parks).get(&("Telescope Simulator".to_string(), ParkTarget::Mount)),
            Some(&ParkState::Parked)
        );
    }

    #[test]
    fn test_park_write_clears_cached_state() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (outbound, mut sent) = mpsc::unbounded_channel();
        let mut link = PeerLink::new(tx);
        link.outbound = Some(outbound);
        link.shared.connected.store(true, Ordering::SeqCst);

        handle_line(&mount_update(PropertyState::Ok, true), &link.shared, &link.events);
        assert_eq!(
            link.park_state("Telescope Simulator", ParkTarget::Mount),
            ParkState::Parked
        );

        link.park("Telescope Simulator", ParkTarget::Mount).unwrap();
        assert_eq!(
            link.park_state("Telescope Simulator", ParkTarget::Mount),
            ParkState::Unknown
        );
        assert_eq!(
            sent.try_recv().unwrap(),
            BusMessage::SetSwitch {
                device: "Telescope Simulator".to_string(),
                property: TELESCOPE_PARK.to_string(),
                element: PARK_ELEMENT.to_string(),
            }
        );

        // Other switch writes leave the cache alone.
        handle_line(&mount_update(PropertyState::Ok, true), &link.shared, &link.events);
        link.set_switch("Telescope Simulator", TELESCOPE_PARK, UNPARK_ELEMENT)
            .unwrap();
        assert_eq!(
            link.park_state("Telescope Simulator", ParkTarget::Mount),
            ParkState::Parked
        );
    }

    #[test]
    fn test_connect_without_runtime_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut link = PeerLink::new(tx);
        assert!(matches!(
            link.connect(&ServerSettings::default()),
            Err(BusError::NoRuntime)
        ));
        assert!(matches!(
            link.set_switch("Dome Simulator", "DOME_PARK", "PARK"),
            Err(BusError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_link_snoops_and_caches_park_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (mut link, mut events) = PeerLink::channel();
        link.snoop("Telescope Simulator", TELESCOPE_PARK).unwrap();
        link.connect(&ServerSettings {
            host: "127.0.0.1".to_string(),
            port,
        })
        .unwrap();

        let (stream, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let snoop: BusMessage =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(
            snoop,
            BusMessage::Snoop {
                device: "Telescope Simulator".to_string(),
                property: TELESCOPE_PARK.to_string(),
            }
        );

        let update = BusMessage::Update(PropertyUpdate {
            device: "Telescope Simulator".to_string(),
            property: TELESCOPE_PARK.to_string(),
            state: PropertyState::Ok,
            elements: vec![SwitchElement {
                name: "PARK".to_string(),
                on: true,
            }],
        });
        let mut line = serde_json::to_string(&update).unwrap();
        line.push('\n');
        writer.write_all(line.as_bytes()).await.unwrap();

        let event = time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, PeerEvent::Park { target: ParkTarget::Mount, .. }));
        assert!(link.is_connected());
        assert_eq!(
            link.park_state("Telescope Simulator", ParkTarget::Mount),
            ParkState::Parked
        );
        assert_eq!(
            link.park_state("Dome Simulator", ParkTarget::Dome),
            ParkState::Unknown
        );
    }
}
