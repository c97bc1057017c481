//! Driver station transport.
//!
//! Each team's driver station dials the field over TCP (:1750) to identify
//! itself and keep a channel for game data, and reports robot status over
//! UDP (:1160). The field pushes control packets (mode, enable, estop) to
//! the station's UDP port inline from the arena tick; TCP writes go through
//! a per-connection queue drained by a writer task so a wedged station can
//! never stall the loop.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, UdpSocket};
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::arena::{SharedArena, StationId};
use crate::store::Match;

/// TCP port driver stations dial for the control channel.
const DS_TCP_LISTEN_PORT: u16 = 1750;
/// UDP port the field listens on for station status datagrams.
const DS_UDP_LISTEN_PORT: u16 = 1160;
/// UDP port on the driver station that control packets are pushed to.
const DS_UDP_SEND_PORT: u16 = 1121;
/// Queued TCP notices per connection before sends start failing.
const TCP_QUEUE_SIZE: usize = 16;
/// A station that stays silent this long is considered unlinked.
const STATUS_STALENESS_LIMIT: Duration = Duration::from_secs(2);

/// First frame a station sends after connecting.
#[derive(Debug, Serialize, Deserialize)]
struct HandshakePacket {
    team_id: u32,
}

/// Status datagram sent periodically by every driver station.
#[derive(Debug, Serialize, Deserialize)]
struct StatusPacket {
    team_id: u32,
    robot_linked: bool,
    battery_voltage: f32,
}

/// Control datagram pushed to a station every packet period.
#[derive(Debug, Serialize, Deserialize)]
struct ControlPacket {
    auto: bool,
    enabled: bool,
    estop: bool,
    match_time_sec: f32,
}

/// Notices delivered over the TCP channel.
#[derive(Debug, Serialize, Deserialize)]
enum TcpNotice {
    GameData(String),
    MatchStart { match_id: i64 },
}

/// The field's handle to one connected driver station.
pub struct DriverStationConnection {
    pub team_id: u32,
    pub robot_linked: bool,
    pub auto: bool,
    pub enabled: bool,
    pub estop: bool,
    pub battery_voltage: f32,
    pub last_status_time: Option<Instant>,
    pub packets_sent: u64,
    pub packets_received: u64,
    control_socket: Option<UdpSocket>,
    tcp_queue: Option<mpsc::Sender<TcpNotice>>,
}

impl DriverStationConnection {
    /// A connection handle with no transport attached yet. The listeners
    /// attach sockets once the station actually dials in.
    pub fn new(team_id: u32) -> DriverStationConnection {
        DriverStationConnection {
            team_id,
            robot_linked: false,
            auto: false,
            enabled: false,
            estop: false,
            battery_voltage: 0.0,
            last_status_time: None,
            packets_sent: 0,
            packets_received: 0,
            control_socket: None,
            tcp_queue: None,
        }
    }

    fn attach_transport(
        &mut self,
        station_ip: IpAddr,
        tcp_queue: mpsc::Sender<TcpNotice>,
    ) -> io::Result<()> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect((station_ip, DS_UDP_SEND_PORT))?;
        self.control_socket = Some(socket);
        self.tcp_queue = Some(tcp_queue);
        Ok(())
    }

    /// Sends one control packet reflecting the current phase. Inline from
    /// the tick; UDP never blocks and errors are reported for per-station
    /// logging.
    pub fn update(&mut self, match_time_sec: f64) -> io::Result<()> {
        let Some(socket) = &self.control_socket else {
            return Ok(());
        };
        let packet = ControlPacket {
            auto: self.auto,
            enabled: self.enabled,
            estop: self.estop,
            match_time_sec: match_time_sec as f32,
        };
        let payload = postcard::to_stdvec(&packet)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        socket.send(&payload)?;
        self.packets_sent += 1;
        Ok(())
    }

    /// Reveals the plate assignment over the TCP channel.
    pub fn send_game_specific_data_packet(&self, data: &str) -> io::Result<()> {
        self.queue_tcp(TcpNotice::GameData(data.to_string()))
    }

    /// Tells the station a match is starting so it can reset its telemetry.
    pub fn signal_match_start(&self, match_record: &Match) -> io::Result<()> {
        self.queue_tcp(TcpNotice::MatchStart {
            match_id: match_record.id,
        })
    }

    /// Drops the transport; the writer task exits when its queue closes.
    pub fn close(&mut self) {
        self.control_socket = None;
        self.tcp_queue = None;
        self.robot_linked = false;
    }

    fn queue_tcp(&self, notice: TcpNotice) -> io::Result<()> {
        let Some(queue) = &self.tcp_queue else {
            return Ok(());
        };
        queue
            .try_send(notice)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "station TCP queue full or closed"))
    }
}

/// Accepts driver station control connections and binds each to the station
/// its team is assigned to.
pub async fn listen_for_driver_stations(arena: SharedArena) {
    let listener = match TcpListener::bind(("0.0.0.0", DS_TCP_LISTEN_PORT)).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(?err, "Unable to listen for driver stations.");
            return;
        }
    };
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(handle_station_connection(arena.clone(), stream, peer.ip()));
            }
            Err(err) => {
                tracing::warn!(?err, "Failed to accept a driver station connection.");
            }
        }
    }
}

/// Handshakes one station, attaches its transport and drains its TCP queue
/// until the connection dies or the station is reassigned.
async fn handle_station_connection(arena: SharedArena, mut stream: TcpStream, peer_ip: IpAddr) {
    let handshake = match read_frame::<HandshakePacket>(&mut stream).await {
        Ok(handshake) => handshake,
        Err(err) => {
            tracing::warn!(?err, %peer_ip, "Driver station handshake failed.");
            return;
        }
    };

    let (tcp_queue, mut notices) = mpsc::channel(TCP_QUEUE_SIZE);
    let station = {
        let mut arena = arena.lock().await;
        let Some(station) = arena.get_assigned_station(handshake.team_id) else {
            tracing::warn!(
                team = handshake.team_id,
                "Rejecting a driver station for a team not in the current match."
            );
            return;
        };
        let mut connection = DriverStationConnection::new(handshake.team_id);
        if let Err(err) = connection.attach_transport(peer_ip, tcp_queue) {
            tracing::error!(?err, team = handshake.team_id, "Unable to open the control socket.");
            return;
        }
        arena.station_mut(station).ds_conn = Some(connection);
        station
    };
    tracing::info!(team = handshake.team_id, %station, "Driver station connected.");

    while let Some(notice) = notices.recv().await {
        if let Err(err) = write_frame(&mut stream, &notice).await {
            tracing::error!(?err, team = handshake.team_id, "Driver station TCP write failed.");
            break;
        }
    }

    // Clear the arena's handle unless the station was already reassigned.
    let mut arena = arena.lock().await;
    let alliance_station = arena.station_mut(station);
    if alliance_station
        .ds_conn
        .as_ref()
        .is_some_and(|c| c.team_id == handshake.team_id)
    {
        alliance_station.ds_conn = None;
    }
    tracing::info!(team = handshake.team_id, %station, "Driver station disconnected.");
}

/// Ingests robot status datagrams and keeps the per-station link state
/// fresh.
pub async fn listen_for_ds_udp_packets(arena: SharedArena) {
    let socket = match tokio::net::UdpSocket::bind(("0.0.0.0", DS_UDP_LISTEN_PORT)).await {
        Ok(socket) => socket,
        Err(err) => {
            tracing::error!(?err, "Unable to listen for driver station status.");
            return;
        }
    };
    let mut buf = [0u8; 128];
    loop {
        let Ok((n, _)) = socket.recv_from(&mut buf).await else {
            continue;
        };
        let status: StatusPacket = match postcard::from_bytes(&buf[..n]) {
            Ok(status) => status,
            Err(err) => {
                tracing::debug!(?err, "Discarding a malformed status datagram.");
                continue;
            }
        };
        let mut arena = arena.lock().await;
        let Some(station) = arena.get_assigned_station(status.team_id) else {
            continue;
        };
        if let Some(connection) = &mut arena.station_mut(station).ds_conn {
            connection.robot_linked = status.robot_linked;
            connection.battery_voltage = status.battery_voltage;
            connection.last_status_time = Some(Instant::now());
            connection.packets_received += 1;
        }
    }
}

/// Watches per-station packet rates and link staleness. A saturated or dead
/// link shows up in the event log and at the start gate.
pub async fn monitor_bandwidth(arena: SharedArena) {
    const MONITOR_PERIOD: Duration = Duration::from_secs(5);
    let mut interval = tokio::time::interval(MONITOR_PERIOD);
    let mut last_counts: HashMap<StationId, u64> = HashMap::new();
    loop {
        interval.tick().await;
        let mut arena = arena.lock().await;
        for station in StationId::ALL {
            let Some(connection) = &mut arena.station_mut(station).ds_conn else {
                last_counts.remove(&station);
                continue;
            };
            let received = connection.packets_received;
            let previous = last_counts.insert(station, received).unwrap_or(received);
            let rate = (received - previous) as f64 / MONITOR_PERIOD.as_secs_f64();
            tracing::debug!(
                %station,
                team = connection.team_id,
                rate,
                sent = connection.packets_sent,
                battery = connection.battery_voltage,
                "Driver station link statistics."
            );

            let stale = connection
                .last_status_time
                .is_none_or(|t| t.elapsed() > STATUS_STALENESS_LIMIT);
            if stale && connection.robot_linked {
                connection.robot_linked = false;
                tracing::warn!(%station, team = connection.team_id, "Robot link went stale.");
            }
        }
    }
}

async fn read_frame<T: serde::de::DeserializeOwned>(stream: &mut TcpStream) -> io::Result<T> {
    let mut length = [0u8; 2];
    stream.read_exact(&mut length).await?;
    let mut frame = vec![0u8; u16::from_be_bytes(length) as usize];
    stream.read_exact(&mut frame).await?;
    postcard::from_bytes(&frame).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

async fn write_frame<T: Serialize>(stream: &mut TcpStream, value: &T) -> io::Result<()> {
    let payload = postcard::to_stdvec(value)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let mut frame = BytesMut::with_capacity(2 + payload.len());
    frame.put_u16(payload.len() as u16);
    frame.put_slice(&payload);
    stream.write_all(&frame).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unattached_connection_swallows_sends() {
        let mut connection = DriverStationConnection::new(254);
        assert!(connection.update(0.0).is_ok());
        assert_eq!(connection.packets_sent, 0);
        assert!(connection.send_game_specific_data_packet("LL").is_ok());
        assert!(connection.signal_match_start(&Match::test()).is_ok());
    }

    #[test]
    fn control_packets_reach_the_station_port() {
        // Stand a fake station socket up on localhost and aim at it directly.
        let station = UdpSocket::bind("127.0.0.1:0").unwrap();
        station
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();

        let mut connection = DriverStationConnection::new(254);
        let socket = UdpSocket::bind("0.0.0.0:0").unwrap();
        socket.connect(station.local_addr().unwrap()).unwrap();
        connection.control_socket = Some(socket);

        connection.auto = true;
        connection.enabled = true;
        connection.update(7.5).unwrap();
        assert_eq!(connection.packets_sent, 1);

        let mut buf = [0u8; 64];
        let n = station.recv(&mut buf).unwrap();
        let packet: ControlPacket = postcard::from_bytes(&buf[..n]).unwrap();
        assert!(packet.auto);
        assert!(packet.enabled);
        assert!(!packet.estop);
        assert_eq!(packet.match_time_sec, 7.5);
    }

    #[test]
    fn close_drops_the_link() {
        let mut connection = DriverStationConnection::new(254);
        connection.robot_linked = true;
        connection.close();
        assert!(!connection.robot_linked);
        assert!(connection.control_socket.is_none());
    }
}
