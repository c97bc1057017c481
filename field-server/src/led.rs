//! UDP controllers for the LED strings on the scale and switches.
//!
//! Each controller pushes a tiny mode datagram whenever its state changes
//! and repeats it as a keepalive, so a power-cycled strip recovers on its
//! own. Sends are fire-and-forget; the strips are cosmetic.

use std::io;
use std::net::UdpSocket;
use std::time::{Duration, Instant};

/// How often an unchanged state is re-sent.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(1);

/// Display programs the LED strings can run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LedMode {
    Off,
    Warmup,
    Red,
    Blue,
}

impl LedMode {
    fn wire_byte(self) -> u8 {
        match self {
            LedMode::Off => 0,
            LedMode::Warmup => 1,
            LedMode::Red => 2,
            LedMode::Blue => 3,
        }
    }
}

/// One LED string endpoint.
pub struct LedController {
    socket: Option<UdpSocket>,
    near_is_red: bool,
    modes: (LedMode, LedMode),
    dirty: bool,
    last_packet_time: Instant,
}

impl LedController {
    pub fn new() -> LedController {
        LedController {
            socket: None,
            near_is_red: true,
            modes: (LedMode::Off, LedMode::Off),
            dirty: true,
            last_packet_time: Instant::now(),
        }
    }

    /// Points the controller at its strip. An empty address disables it; a
    /// malformed one is a configuration error that fails startup.
    pub fn set_address(&mut self, address: &str) -> io::Result<()> {
        if address.is_empty() {
            self.socket = None;
            return Ok(());
        }
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(address)?;
        self.socket = Some(socket);
        self.dirty = true;
        Ok(())
    }

    /// True puts the red pixels on the scoring-table end.
    pub fn set_sidedness(&mut self, near_is_red: bool) {
        if self.near_is_red != near_is_red {
            self.near_is_red = near_is_red;
            self.dirty = true;
        }
    }

    /// Sets the program for the near and far halves of the string.
    pub fn set_mode(&mut self, near: LedMode, far: LedMode) {
        if self.modes != (near, far) {
            self.modes = (near, far);
            self.dirty = true;
        }
    }

    /// Pushes the current state out when it changed or the keepalive lapsed.
    pub fn update(&mut self) {
        let Some(socket) = &self.socket else {
            return;
        };
        if !self.dirty && self.last_packet_time.elapsed() < KEEPALIVE_PERIOD {
            return;
        }
        let packet = [
            self.modes.0.wire_byte(),
            self.modes.1.wire_byte(),
            self.near_is_red as u8,
        ];
        if let Err(err) = socket.send(&packet) {
            tracing::warn!(?err, "Failed to send an LED packet.");
        }
        self.dirty = false;
        self.last_packet_time = Instant::now();
    }
}
