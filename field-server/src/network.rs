//! Per-match reconfiguration of the field WiFi access point and the managed
//! switch.
//!
//! Both devices speak a line-oriented TCP console: authenticate, issue one
//! command per station, commit. Configuration runs in fire-and-forget tasks
//! spawned by the arena; a failure is logged and shows up operationally as
//! an unlinked robot at the start gate.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::store::{EventSettings, Team};

/// The event WiFi access point.
#[derive(Clone)]
pub struct AccessPoint {
    address: String,
    username: String,
    password: String,
    team_channel: u16,
    admin_channel: u16,
    admin_wpa_key: String,
}

impl AccessPoint {
    pub fn from_settings(settings: &EventSettings) -> AccessPoint {
        AccessPoint {
            address: settings.ap_address.clone(),
            username: settings.ap_username.clone(),
            password: settings.ap_password.clone(),
            team_channel: settings.ap_team_channel,
            admin_channel: settings.ap_admin_channel,
            admin_wpa_key: settings.ap_admin_wpa_key.clone(),
        }
    }

    /// Brings up the administrative network. Run once when settings load.
    pub async fn configure_admin_wifi(&self) -> io::Result<()> {
        let commands = vec![
            format!("set admin-channel {}", self.admin_channel),
            format!("set admin-wpa-key {}", self.admin_wpa_key),
            "commit".to_string(),
        ];
        self.send_config(&commands).await
    }

    /// Reprograms the six team SSIDs for the stations R1..R3, B1..B3.
    pub async fn configure_team_wifi(&self, teams: &[Option<Team>; 6]) -> io::Result<()> {
        let mut commands = vec![format!("set team-channel {}", self.team_channel)];
        for (position, team) in teams.iter().enumerate() {
            let team_id = team.as_ref().map_or(0, |t| t.id);
            commands.push(format!("set team-ssid {} {}", position + 1, team_id));
        }
        commands.push("commit".to_string());
        self.send_config(&commands).await
    }

    async fn send_config(&self, commands: &[String]) -> io::Result<()> {
        if self.address.is_empty() {
            return Ok(());
        }
        send_console_commands(&self.address, &self.username, &self.password, commands).await
    }
}

/// The managed switch feeding the station Ethernet drops.
#[derive(Clone)]
pub struct NetworkSwitch {
    address: String,
    password: String,
}

impl NetworkSwitch {
    pub fn from_settings(settings: &EventSettings) -> NetworkSwitch {
        NetworkSwitch {
            address: settings.switch_address.clone(),
            password: settings.switch_password.clone(),
        }
    }

    /// Moves each station port onto its team's VLAN.
    pub async fn configure_team_ethernet(&self, teams: &[Option<Team>; 6]) -> io::Result<()> {
        if self.address.is_empty() {
            return Ok(());
        }
        let mut commands = Vec::with_capacity(7);
        for (position, team) in teams.iter().enumerate() {
            let team_id = team.as_ref().map_or(0, |t| t.id);
            commands.push(format!("set port-vlan {} {}", position + 1, team_id));
        }
        commands.push("commit".to_string());
        send_console_commands(&self.address, "admin", &self.password, &commands).await
    }
}

/// Authenticates against a device console and plays the command list, then
/// waits for the device to acknowledge with a line starting with "ok".
async fn send_console_commands(
    address: &str,
    username: &str,
    password: &str,
    commands: &[String],
) -> io::Result<()> {
    let stream = TcpStream::connect(address).await?;
    let (reader, mut writer) = stream.into_split();

    writer
        .write_all(format!("login {} {}\n", username, password).as_bytes())
        .await?;
    for command in commands {
        writer.write_all(format!("{}\n", command).as_bytes()).await?;
    }
    writer.flush().await?;

    let mut response = String::new();
    BufReader::new(reader)
        .take(256)
        .read_to_string(&mut response)
        .await?;
    if response.lines().last().is_some_and(|l| l.starts_with("ok")) {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("device rejected configuration: {response:?}"),
        ))
    }
}
