//! Field PLC collaborator.
//!
//! The PLC streams sensor frames over TCP; the poll loop keeps the latest
//! frame in a snapshot the arena reads every tick. Health means a frame
//! arrived recently, so a wire fault shows up at the start gate within half
//! a second.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

/// Sensor readings older than this mark the PLC unhealthy.
const STALENESS_LIMIT: Duration = Duration::from_millis(500);
/// Delay between reconnection attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// One sensor frame as encoded by the PLC, length-prefixed postcard on the
/// wire.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct PlcInputs {
    pub field_estop: bool,
    pub red_estops: [bool; 3],
    pub blue_estops: [bool; 3],
    pub scale: [bool; 2],
    pub red_switch: [bool; 2],
    pub blue_switch: [bool; 2],
    pub red_vault_distances: [u16; 3],
    pub blue_vault_distances: [u16; 3],
    pub power_up_buttons: [bool; 6],
}

#[derive(Default)]
struct PlcShared {
    address: String,
    inputs: PlcInputs,
    last_frame_time: Option<Instant>,
}

/// Handle to the PLC state. Clones share one snapshot; the poll loop runs on
/// one clone while the arena reads another.
#[derive(Clone, Default)]
pub struct Plc {
    shared: Arc<Mutex<PlcShared>>,
}

impl Plc {
    pub fn new() -> Plc {
        Plc::default()
    }

    /// Points the poll loop at the PLC. An empty address disables polling
    /// and the start-gate health check.
    pub fn set_address(&self, address: &str) {
        let mut shared = self.shared.lock().unwrap();
        if shared.address != address {
            shared.address = address.to_string();
            shared.last_frame_time = None;
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.shared.lock().unwrap().address.is_empty()
    }

    /// Whether a sensor frame arrived recently enough to trust.
    pub fn is_healthy(&self) -> bool {
        self.shared
            .lock()
            .unwrap()
            .last_frame_time
            .is_some_and(|t| t.elapsed() < STALENESS_LIMIT)
    }

    pub fn get_field_estop(&self) -> bool {
        self.shared.lock().unwrap().inputs.field_estop
    }

    pub fn get_team_estops(&self) -> ([bool; 3], [bool; 3]) {
        let inputs = self.shared.lock().unwrap().inputs;
        (inputs.red_estops, inputs.blue_estops)
    }

    /// Plate sensor pairs for the scale, red switch and blue switch.
    pub fn get_scale_and_switches(&self) -> ([bool; 2], [bool; 2], [bool; 2]) {
        let inputs = self.shared.lock().unwrap().inputs;
        (inputs.scale, inputs.red_switch, inputs.blue_switch)
    }

    /// Ultrasonic distances for the red and blue vault columns.
    pub fn get_vaults(&self) -> ([u16; 3], [u16; 3]) {
        let inputs = self.shared.lock().unwrap().inputs;
        (inputs.red_vault_distances, inputs.blue_vault_distances)
    }

    /// Vault buttons in R-force, R-levitate, R-boost, B-force, B-levitate,
    /// B-boost order.
    pub fn get_power_up_buttons(&self) -> [bool; 6] {
        self.shared.lock().unwrap().inputs.power_up_buttons
    }

    /// Poll loop. Reconnects with a fixed delay forever; the arena keeps
    /// running on stale (and soon unhealthy) data in the meantime.
    pub async fn run(self) {
        loop {
            let address = self.shared.lock().unwrap().address.clone();
            if address.is_empty() {
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
            match TcpStream::connect(&address).await {
                Ok(stream) => {
                    tracing::info!(address, "Connected to the PLC.");
                    if let Err(err) = self.read_frames(stream).await {
                        tracing::warn!(?err, "PLC connection lost.");
                    }
                }
                Err(err) => {
                    tracing::warn!(?err, address, "Unable to reach the PLC.");
                }
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn read_frames(&self, mut stream: TcpStream) -> std::io::Result<()> {
        loop {
            let mut length = [0u8; 2];
            stream.read_exact(&mut length).await?;
            let mut frame = vec![0u8; u16::from_be_bytes(length) as usize];
            stream.read_exact(&mut frame).await?;
            match postcard::from_bytes::<PlcInputs>(&frame) {
                Ok(inputs) => {
                    let mut shared = self.shared.lock().unwrap();
                    shared.inputs = inputs;
                    shared.last_frame_time = Some(Instant::now());
                }
                Err(err) => {
                    tracing::error!(?err, "Discarding a malformed PLC frame.");
                }
            }
        }
    }

    /// Test hook: installs a snapshot as if it had just arrived on the wire.
    #[cfg(test)]
    pub fn inject_inputs(&self, inputs: PlcInputs) {
        let mut shared = self.shared.lock().unwrap();
        shared.inputs = inputs;
        shared.last_frame_time = Some(Instant::now());
    }
}
