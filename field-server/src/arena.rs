//! The arena orchestrator: match state machine, the 10 ms control loop and
//! the operator command entry points.
//!
//! The arena lives behind one coarse [`tokio::sync::Mutex`]; the tick task
//! and every command handler lock it for the duration of their work, and
//! notifier delivery rides on broadcast channels so subscribers never hold
//! the lock.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;

use game::{Alliance, MatchTiming, PowerUpRegistry, Score, ScoreSummary, Seesaw, Vault};

use crate::driver_station::{self, DriverStationConnection};
use crate::led::{LedController, LedMode};
use crate::network::{AccessPoint, NetworkSwitch};
use crate::notifier::Notifier;
use crate::plc::Plc;
use crate::store::{Database, EventSettings, Match, MatchStatus, MatchType, StoreError, Team};

/// Control loop cadence.
const ARENA_LOOP_PERIOD: Duration = Duration::from_millis(10);
/// Minimum interval between periodic driver station control packets.
const DS_PACKET_PERIOD: Duration = Duration::from_millis(250);
/// How long scores stay on the audience screen after the match ends.
const MATCH_END_SCORE_DWELL: Duration = Duration::from_secs(3);

/// Progression of match states. Transitions only move forward; only an
/// explicit reset returns a finished match to `PreMatch`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchState {
    PreMatch,
    StartMatch,
    WarmupPeriod,
    AutoPeriod,
    PausePeriod,
    TeleopPeriod,
    EndgamePeriod,
    PostMatch,
}

/// One of the six driver station positions around the field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, serde::Deserialize)]
pub enum StationId {
    R1,
    R2,
    R3,
    B1,
    B2,
    B3,
}

impl StationId {
    pub const ALL: [StationId; 6] = [
        StationId::R1,
        StationId::R2,
        StationId::R3,
        StationId::B1,
        StationId::B2,
        StationId::B3,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-station flags and the driver station bound to it.
#[derive(Default)]
pub struct AllianceStation {
    pub ds_conn: Option<DriverStationConnection>,
    pub astop: bool,
    pub estop: bool,
    pub bypass: bool,
    pub team: Option<Team>,
}

/// Operator-facing failures from arena commands. The messages double as the
/// text surfaced in the operator console.
#[derive(Debug, thiserror::Error)]
pub enum ArenaError {
    #[error("Cannot load a match while there is a match still in progress or with results pending.")]
    MatchInProgress,
    #[error("Cannot start match while an emergency stop is active.")]
    EstopActive,
    #[error("Cannot start match until all robots are connected or bypassed.")]
    RobotsNotReady,
    #[error("Cannot start match while PLC is not healthy.")]
    PlcUnhealthy,
    #[error("Cannot start match while field emergency stop is active.")]
    FieldEstopActive,
    #[error("Cannot abort match when it is not in progress.")]
    MatchNotInProgress,
    #[error("Cannot reset match while it is in progress.")]
    ResetDuringMatch,
    #[error("Can't substitute teams for qualification matches.")]
    QualificationSubstitution,
    #[error("Invalid LED controller address: {0}")]
    LedConfig(std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The live status document served to operator consoles.
#[derive(Clone, Serialize)]
pub struct ArenaStatus {
    pub stations: Vec<StationStatus>,
    pub match_state: MatchState,
    pub can_start_match: bool,
    pub plc_is_healthy: bool,
    pub field_estop: bool,
    pub field_reset: bool,
    pub game_specific_data: String,
}

#[derive(Clone, Serialize)]
pub struct StationStatus {
    pub station: StationId,
    pub team_id: Option<u32>,
    pub robot_linked: bool,
    pub astop: bool,
    pub estop: bool,
    pub bypass: bool,
}

/// Realtime score payload published whenever either alliance's score moves.
#[derive(Clone, Debug, Serialize)]
pub struct ScoreUpdate {
    pub red: ScoreSummary,
    pub blue: ScoreSummary,
}

pub type SharedArena = Arc<Mutex<Arena>>;

pub struct Arena {
    pub settings: EventSettings,
    pub store: Database,
    access_point: AccessPoint,
    network_switch: NetworkSwitch,
    pub plc: Plc,
    pub stations: [AllianceStation; 6],
    pub current_match: Match,
    pub match_state: MatchState,
    last_match_state: Option<MatchState>,
    pub match_start_time: Instant,
    pub last_match_time_sec: f64,
    pub timing: MatchTiming,
    pub red_score: Score,
    pub blue_score: Score,
    last_ds_packet_time: Instant,
    pub field_reset: bool,
    pub audience_display_screen: String,
    pub alliance_station_display_screen: String,
    pub mute_match_sounds: bool,
    match_aborted: bool,
    post_match_blank_time: Option<Instant>,
    pub scale: Seesaw,
    pub red_switch: Seesaw,
    pub blue_switch: Seesaw,
    pub red_vault: Vault,
    pub blue_vault: Vault,
    pub power_ups: PowerUpRegistry,
    pub scale_leds: LedController,
    pub red_switch_leds: LedController,
    pub blue_switch_leds: LedController,
    pub match_state_notifier: Notifier<MatchState>,
    pub match_time_notifier: Notifier<i64>,
    pub robot_status_notifier: Notifier<()>,
    pub match_load_teams_notifier: Notifier<()>,
    pub realtime_score_notifier: Notifier<ScoreUpdate>,
    pub audience_display_notifier: Notifier<String>,
    pub alliance_station_display_notifier: Notifier<String>,
    pub play_sound_notifier: Notifier<String>,
}

impl Arena {
    /// Creates the arena in its pre-match idle state. Configuration problems
    /// surface here and abort startup.
    pub async fn new(data_dir: impl Into<PathBuf>) -> Result<Arena, ArenaError> {
        let store = Database::open(data_dir).await?;
        let settings = EventSettings::default();
        let mut arena = Arena {
            access_point: AccessPoint::from_settings(&settings),
            network_switch: NetworkSwitch::from_settings(&settings),
            settings,
            store,
            plc: Plc::new(),
            stations: Default::default(),
            current_match: Match::test(),
            match_state: MatchState::PreMatch,
            last_match_state: None,
            match_start_time: Instant::now(),
            last_match_time_sec: 0.0,
            timing: MatchTiming::default(),
            red_score: Score::default(),
            blue_score: Score::default(),
            last_ds_packet_time: Instant::now(),
            field_reset: false,
            audience_display_screen: "blank".to_string(),
            alliance_station_display_screen: "match".to_string(),
            mute_match_sounds: false,
            match_aborted: false,
            post_match_blank_time: None,
            scale: Seesaw::new(Alliance::Neither),
            red_switch: Seesaw::new(Alliance::Red),
            blue_switch: Seesaw::new(Alliance::Blue),
            red_vault: Vault::new(Alliance::Red),
            blue_vault: Vault::new(Alliance::Blue),
            power_ups: PowerUpRegistry::new(),
            scale_leds: LedController::new(),
            red_switch_leds: LedController::new(),
            blue_switch_leds: LedController::new(),
            match_state_notifier: Notifier::new(),
            match_time_notifier: Notifier::new(),
            robot_status_notifier: Notifier::new(),
            match_load_teams_notifier: Notifier::new(),
            realtime_score_notifier: Notifier::new(),
            audience_display_notifier: Notifier::new(),
            alliance_station_display_notifier: Notifier::new(),
            play_sound_notifier: Notifier::new(),
        };
        arena.load_settings().await?;
        arena.load_test_match()?;
        Ok(arena)
    }

    /// Loads or reloads event settings and the components derived from them.
    pub async fn load_settings(&mut self) -> Result<(), ArenaError> {
        let settings = self.store.get_event_settings().clone();

        self.access_point = AccessPoint::from_settings(&settings);
        self.network_switch = NetworkSwitch::from_settings(&settings);
        self.plc.set_address(&settings.plc_address);
        self.scale_leds
            .set_address(&settings.scale_led_address)
            .map_err(ArenaError::LedConfig)?;
        self.red_switch_leds
            .set_address(&settings.red_switch_led_address)
            .map_err(ArenaError::LedConfig)?;
        self.blue_switch_leds
            .set_address(&settings.blue_switch_led_address)
            .map_err(ArenaError::LedConfig)?;

        if settings.network_security_enabled {
            if let Err(err) = self.access_point.configure_admin_wifi().await {
                tracing::error!(?err, "Failed to configure the admin WiFi.");
            }
        }

        self.settings = settings;
        Ok(())
    }

    pub fn station(&self, id: StationId) -> &AllianceStation {
        &self.stations[id.index()]
    }

    pub fn station_mut(&mut self, id: StationId) -> &mut AllianceStation {
        &mut self.stations[id.index()]
    }

    /// Sets up the arena for the given match.
    pub fn load_match(&mut self, match_record: Match) -> Result<(), ArenaError> {
        if self.match_state != MatchState::PreMatch {
            return Err(ArenaError::MatchInProgress);
        }

        self.assign_team(match_record.red1, StationId::R1);
        self.assign_team(match_record.red2, StationId::R2);
        self.assign_team(match_record.red3, StationId::R3);
        self.assign_team(match_record.blue1, StationId::B1);
        self.assign_team(match_record.blue2, StationId::B2);
        self.assign_team(match_record.blue3, StationId::B3);
        self.current_match = match_record;

        self.setup_network();

        // Rebuild the realtime scoring state.
        self.red_score = Score::default();
        self.blue_score = Score::default();
        self.field_reset = false;
        self.scale = Seesaw::new(Alliance::Neither);
        self.red_switch = Seesaw::new(Alliance::Red);
        self.blue_switch = Seesaw::new(Alliance::Blue);
        self.red_vault = Vault::new(Alliance::Red);
        self.blue_vault = Vault::new(Alliance::Blue);
        self.power_ups.reset();

        // Field elements hold a consistent sidedness until the real
        // assignment is revealed at match start.
        self.scale.set_sidedness(true);
        self.red_switch.set_sidedness(true);
        self.blue_switch.set_sidedness(true);
        self.scale_leds.set_sidedness(true);
        self.red_switch_leds.set_sidedness(true);
        self.blue_switch_leds.set_sidedness(true);

        self.match_load_teams_notifier.notify(());
        self.notify_score();
        self.alliance_station_display_screen = "match".to_string();
        self.alliance_station_display_notifier
            .notify(self.alliance_station_display_screen.clone());
        Ok(())
    }

    /// Loads an empty test match.
    pub fn load_test_match(&mut self) -> Result<(), ArenaError> {
        self.load_match(Match::test())
    }

    /// Loads the first match of the current type that has not been played.
    pub fn load_next_match(&mut self) -> Result<(), ArenaError> {
        if self.current_match.match_type == MatchType::Test {
            return self.load_test_match();
        }
        let next = self
            .store
            .get_matches_by_type(self.current_match.match_type)
            .into_iter()
            .find(|m| m.status != MatchStatus::Complete);
        if let Some(match_record) = next {
            self.load_match(match_record)?;
        }
        Ok(())
    }

    /// Swaps a team into a station, updating the match record to follow.
    pub async fn substitute_team(
        &mut self,
        team_id: u32,
        station: StationId,
    ) -> Result<(), ArenaError> {
        if self.current_match.match_type == MatchType::Qualification {
            return Err(ArenaError::QualificationSubstitution);
        }
        self.assign_team(team_id, station);
        match station {
            StationId::R1 => self.current_match.red1 = team_id,
            StationId::R2 => self.current_match.red2 = team_id,
            StationId::R3 => self.current_match.red3 = team_id,
            StationId::B1 => self.current_match.blue1 = team_id,
            StationId::B2 => self.current_match.blue2 = team_id,
            StationId::B3 => self.current_match.blue3 = team_id,
        }
        self.setup_network();
        self.match_load_teams_notifier.notify(());

        if self.current_match.match_type != MatchType::Test {
            let match_record = self.current_match.clone();
            if let Err(err) = self.store.save_match(&match_record).await {
                tracing::error!(?err, "Failed to save the substituted match.");
            }
        }
        Ok(())
    }

    /// Starts the match if every readiness gate passes.
    pub async fn start_match(&mut self) -> Result<(), ArenaError> {
        self.check_can_start_match()?;

        // Test matches may carry an operator-supplied plate assignment;
        // everything else draws a fresh one.
        if self.current_match.match_type != MatchType::Test
            || !game::is_valid_game_specific_data(&self.current_match.game_specific_data)
        {
            self.current_match.game_specific_data = game::generate_game_specific_data();
        }

        let mut plates = self.current_match.game_specific_data.chars();
        let switch_near_is_red = plates.next() == Some('L');
        let scale_near_is_red = plates.next() == Some('L');
        self.scale.set_sidedness(scale_near_is_red);
        self.red_switch.set_sidedness(switch_near_is_red);
        self.blue_switch.set_sidedness(switch_near_is_red);
        self.scale_leds.set_sidedness(scale_near_is_red);
        self.red_switch_leds.set_sidedness(switch_near_is_red);
        self.blue_switch_leds.set_sidedness(switch_near_is_red);

        self.current_match.started_at = Some(chrono::Utc::now());
        if self.current_match.match_type != MatchType::Test {
            let match_record = self.current_match.clone();
            if let Err(err) = self.store.save_match(&match_record).await {
                tracing::error!(?err, "Failed to save the started match.");
            }
        }

        for alliance_station in &self.stations {
            if let Some(connection) = &alliance_station.ds_conn {
                if let Err(err) = connection.signal_match_start(&self.current_match) {
                    tracing::error!(?err, team = connection.team_id, "Failed to signal match start.");
                }
            }
        }

        self.match_state = MatchState::StartMatch;
        Ok(())
    }

    /// Kills the current match if it is underway.
    pub fn abort_match(&mut self) -> Result<(), ArenaError> {
        if self.match_state == MatchState::PreMatch || self.match_state == MatchState::PostMatch {
            return Err(ArenaError::MatchNotInProgress);
        }
        if !self.mute_match_sounds && self.match_state != MatchState::WarmupPeriod {
            self.play_sound_notifier.notify("match-abort".to_string());
        }
        self.match_state = MatchState::PostMatch;
        self.match_aborted = true;
        self.post_match_blank_time = None;
        self.set_audience_display("blank");
        Ok(())
    }

    /// Returns the arena to pre-match once results are in.
    pub fn reset_match(&mut self) -> Result<(), ArenaError> {
        if self.match_state != MatchState::PostMatch && self.match_state != MatchState::PreMatch {
            return Err(ArenaError::ResetDuringMatch);
        }
        self.match_state = MatchState::PreMatch;
        self.match_aborted = false;
        self.post_match_blank_time = None;
        for alliance_station in &mut self.stations {
            alliance_station.bypass = false;
        }
        self.mute_match_sounds = false;
        Ok(())
    }

    /// Fractional seconds since the start of the match, zero outside of one.
    pub fn match_time_sec(&self) -> f64 {
        match self.match_state {
            MatchState::PreMatch | MatchState::StartMatch | MatchState::PostMatch => 0.0,
            _ => self.match_start_time.elapsed().as_secs_f64(),
        }
    }

    /// One iteration of the control loop: advance the state machine, publish
    /// notifications, feed the driver stations and ingest field sensors.
    pub fn update(&mut self) {
        let mut auto = false;
        let mut enabled = false;
        let mut send_ds_packet = false;
        let match_time_sec = self.match_time_sec();

        match self.match_state {
            MatchState::PreMatch => {
                auto = true;
                enabled = false;
            }
            MatchState::StartMatch => {
                self.match_state = MatchState::WarmupPeriod;
                self.match_start_time = Instant::now();
                self.last_match_time_sec = -1.0;
                auto = true;
                enabled = false;
                self.set_audience_display("match");
                self.send_game_specific_data_packet();
                self.set_field_leds(LedMode::Warmup);
                self.play_sound("match-warmup");
            }
            MatchState::WarmupPeriod => {
                auto = true;
                enabled = false;
                if match_time_sec >= self.timing.warmup_end_sec() {
                    self.match_state = MatchState::AutoPeriod;
                    auto = true;
                    enabled = true;
                    send_ds_packet = true;
                    self.play_sound("match-start");
                }
            }
            MatchState::AutoPeriod => {
                auto = true;
                enabled = true;
                if match_time_sec >= self.timing.auto_end_sec() {
                    self.match_state = MatchState::PausePeriod;
                    auto = false;
                    enabled = false;
                    send_ds_packet = true;
                    self.play_sound("match-end");
                }
            }
            MatchState::PausePeriod => {
                auto = false;
                enabled = false;
                if match_time_sec >= self.timing.pause_end_sec() {
                    self.match_state = MatchState::TeleopPeriod;
                    auto = false;
                    enabled = true;
                    send_ds_packet = true;
                    self.play_sound("match-resume");
                }
            }
            MatchState::TeleopPeriod => {
                auto = false;
                enabled = true;
                if match_time_sec >= self.timing.endgame_start_sec() {
                    self.match_state = MatchState::EndgamePeriod;
                    send_ds_packet = false;
                    self.play_sound("match-endgame");
                }
            }
            MatchState::EndgamePeriod => {
                auto = false;
                enabled = true;
                if match_time_sec >= self.timing.match_end_sec() {
                    self.match_state = MatchState::PostMatch;
                    auto = false;
                    enabled = false;
                    send_ds_packet = true;
                    // Leave the scores up briefly before blanking.
                    self.post_match_blank_time = Some(Instant::now() + MATCH_END_SCORE_DWELL);
                    self.play_sound("match-end");
                }
            }
            MatchState::PostMatch => {}
        }

        if Some(self.match_state) != self.last_match_state {
            self.match_state_notifier.notify(self.match_state);
        }
        self.last_match_state = Some(self.match_state);

        // Tick the match clock on every whole-second crossing.
        if match_time_sec as i64 != self.last_match_time_sec as i64 {
            self.match_time_notifier.notify(match_time_sec as i64);
        }
        self.last_match_time_sec = match_time_sec;

        if send_ds_packet || self.last_ds_packet_time.elapsed() >= DS_PACKET_PERIOD {
            self.send_ds_packet(auto, enabled);
            self.robot_status_notifier.notify(());
        }

        if let Some(deadline) = self.post_match_blank_time {
            if Instant::now() >= deadline {
                self.post_match_blank_time = None;
                self.set_audience_display("blank");
                self.alliance_station_display_screen = "logo".to_string();
                self.alliance_station_display_notifier
                    .notify(self.alliance_station_display_screen.clone());
            }
        }

        self.handle_plc_input();
        self.handle_plc_output();

        self.sync_field_leds();
        self.scale_leds.update();
        self.red_switch_leds.update();
        self.blue_switch_leds.update();
    }

    /// Keeps the LED strings in step with the match: warmup pattern until
    /// play begins, live ownership colors during it, dark afterwards.
    fn sync_field_leds(&mut self) {
        match self.match_state {
            MatchState::AutoPeriod
            | MatchState::PausePeriod
            | MatchState::TeleopPeriod
            | MatchState::EndgamePeriod => {
                let scale_mode = led_mode_for(self.scale.owned_by());
                let red_switch_mode = led_mode_for(self.red_switch.owned_by());
                let blue_switch_mode = led_mode_for(self.blue_switch.owned_by());
                self.scale_leds.set_mode(scale_mode, scale_mode);
                self.red_switch_leds.set_mode(red_switch_mode, red_switch_mode);
                self.blue_switch_leds.set_mode(blue_switch_mode, blue_switch_mode);
            }
            MatchState::PreMatch | MatchState::PostMatch => {
                self.set_field_leds(LedMode::Off);
            }
            MatchState::StartMatch | MatchState::WarmupPeriod => {}
        }
    }

    /// Audience-facing totals for the red alliance.
    pub fn red_score_summary(&self) -> ScoreSummary {
        self.red_score.summarize(self.blue_score.fouls)
    }

    /// Audience-facing totals for the blue alliance.
    pub fn blue_score_summary(&self) -> ScoreSummary {
        self.blue_score.summarize(self.red_score.fouls)
    }

    /// The live status document served to operator consoles.
    pub fn status(&self) -> ArenaStatus {
        let stations = StationId::ALL
            .iter()
            .map(|&id| {
                let alliance_station = self.station(id);
                StationStatus {
                    station: id,
                    team_id: alliance_station.team.as_ref().map(|t| t.id),
                    robot_linked: alliance_station
                        .ds_conn
                        .as_ref()
                        .is_some_and(|c| c.robot_linked),
                    astop: alliance_station.astop,
                    estop: alliance_station.estop,
                    bypass: alliance_station.bypass,
                }
            })
            .collect();
        ArenaStatus {
            stations,
            match_state: self.match_state,
            can_start_match: self.check_can_start_match().is_ok(),
            plc_is_healthy: self.plc.is_healthy(),
            field_estop: self.plc.get_field_estop(),
            field_reset: self.field_reset,
            game_specific_data: self.current_match.game_specific_data.clone(),
        }
    }

    /// The station a team occupies in the current match, if any.
    pub fn get_assigned_station(&self, team_id: u32) -> Option<StationId> {
        StationId::ALL
            .into_iter()
            .find(|&id| self.station(id).team.as_ref().is_some_and(|t| t.id == team_id))
    }

    /// The start gate: pre-match, no stops, every robot linked or bypassed,
    /// and a healthy PLC when one is configured.
    pub fn check_can_start_match(&self) -> Result<(), ArenaError> {
        if self.match_state != MatchState::PreMatch {
            return Err(ArenaError::MatchInProgress);
        }
        for alliance_station in &self.stations {
            if alliance_station.estop {
                return Err(ArenaError::EstopActive);
            }
            if !alliance_station.bypass {
                let linked = alliance_station
                    .ds_conn
                    .as_ref()
                    .is_some_and(|c| c.robot_linked);
                if !linked {
                    return Err(ArenaError::RobotsNotReady);
                }
            }
        }
        if self.plc.is_enabled() {
            if !self.plc.is_healthy() {
                return Err(ArenaError::PlcUnhealthy);
            }
            if self.plc.get_field_estop() {
                return Err(ArenaError::FieldEstopActive);
            }
        }
        Ok(())
    }

    /// Loads a team into a station, cleaning up any previous occupant.
    fn assign_team(&mut self, team_id: u32, station: StationId) {
        // Nothing to do if the requested team is already connected there.
        if let Some(connection) = &self.station(station).ds_conn {
            if connection.team_id == team_id {
                return;
            }
        }
        let alliance_station = self.station_mut(station);
        if let Some(mut connection) = alliance_station.ds_conn.take() {
            connection.close();
            alliance_station.team = None;
        }

        if team_id == 0 {
            alliance_station.team = None;
            return;
        }
        // Teams missing from the roster run anonymously.
        let team = self
            .store
            .get_team_by_id(team_id)
            .unwrap_or(Team {
                id: team_id,
                name: String::new(),
            });
        self.station_mut(station).team = Some(team);
    }

    /// Asynchronously reprograms the field network for the new team set.
    fn setup_network(&self) {
        if !self.settings.network_security_enabled {
            return;
        }
        let teams = StationId::ALL.map(|id| self.station(id).team.clone());

        let access_point = self.access_point.clone();
        let wifi_teams = teams.clone();
        tokio::spawn(async move {
            if let Err(err) = access_point.configure_team_wifi(&wifi_teams).await {
                tracing::error!(?err, "Failed to configure team WiFi.");
            }
        });
        let network_switch = self.network_switch.clone();
        tokio::spawn(async move {
            if let Err(err) = network_switch.configure_team_ethernet(&teams).await {
                tracing::error!(?err, "Failed to configure team Ethernet.");
            }
        });
    }

    /// Pushes one control packet to every connected station.
    fn send_ds_packet(&mut self, auto: bool, enabled: bool) {
        let match_time_sec = self.match_time_sec();
        for alliance_station in &mut self.stations {
            let blocked =
                alliance_station.estop || alliance_station.astop || alliance_station.bypass;
            let estop = alliance_station.estop;
            if let Some(connection) = &mut alliance_station.ds_conn {
                connection.auto = auto;
                connection.enabled = enabled && !blocked;
                connection.estop = estop;
                if let Err(err) = connection.update(match_time_sec) {
                    tracing::error!(
                        ?err,
                        team = connection.team_id,
                        "Unable to send a driver station packet."
                    );
                }
            }
        }
        self.last_ds_packet_time = Instant::now();
    }

    /// Reveals the plate assignment to every connected station.
    fn send_game_specific_data_packet(&mut self) {
        for alliance_station in &self.stations {
            if let Some(connection) = &alliance_station.ds_conn {
                if let Err(err) =
                    connection.send_game_specific_data_packet(&self.current_match.game_specific_data)
                {
                    tracing::error!(
                        ?err,
                        team = connection.team_id,
                        "Unable to send the game data packet."
                    );
                }
            }
        }
        self.last_ds_packet_time = Instant::now();
    }

    /// Folds the latest PLC sensor snapshot into estops, seesaws, vaults and
    /// the realtime scores.
    fn handle_plc_input(&mut self) {
        // Field estop is an input, not an error.
        if self.plc.get_field_estop() && self.match_time_sec() > 0.0 && !self.match_aborted {
            let _ = self.abort_match();
        }
        let (red_estops, blue_estops) = self.plc.get_team_estops();
        self.handle_estop(StationId::R1, red_estops[0]);
        self.handle_estop(StationId::R2, red_estops[1]);
        self.handle_estop(StationId::R3, red_estops[2]);
        self.handle_estop(StationId::B1, blue_estops[0]);
        self.handle_estop(StationId::B2, blue_estops[1]);
        self.handle_estop(StationId::B3, blue_estops[2]);

        if self.match_state == MatchState::PreMatch || self.match_state == MatchState::PostMatch {
            // Outside a match the scoring state is hand-editable; leave it be.
            return;
        }
        let match_start_time = self.match_start_time;
        let now = Instant::now();
        let teleop_start_time = self.timing.teleop_start_time(match_start_time);

        let old_red_score = self.red_score.clone();
        let old_blue_score = self.blue_score.clone();

        let (scale, red_switch, blue_switch) = self.plc.get_scale_and_switches();
        self.scale.update_state(scale, &self.power_ups, now);
        self.red_switch.update_state(red_switch, &self.power_ups, now);
        self.blue_switch
            .update_state(blue_switch, &self.power_ups, now);
        if self.match_state == MatchState::AutoPeriod {
            self.red_score.auto_ownership_points = 2
                * ((self.red_switch.red_seconds(&self.power_ups, match_start_time, now)
                    + self.scale.red_seconds(&self.power_ups, match_start_time, now))
                    as i64);
            self.blue_score.auto_ownership_points = 2
                * ((self.blue_switch.blue_seconds(&self.power_ups, match_start_time, now)
                    + self.scale.blue_seconds(&self.power_ups, match_start_time, now))
                    as i64);
        } else {
            self.red_score.teleop_ownership_points =
                (self.red_switch.red_seconds(&self.power_ups, teleop_start_time, now)
                    + self.scale.red_seconds(&self.power_ups, teleop_start_time, now))
                    as i64;
            self.blue_score.teleop_ownership_points =
                (self.blue_switch.blue_seconds(&self.power_ups, teleop_start_time, now)
                    + self.scale.blue_seconds(&self.power_ups, teleop_start_time, now))
                    as i64;
        }

        let (red_vault_distances, blue_vault_distances) = self.plc.get_vaults();
        self.red_vault.update_cubes(
            Vault::cube_count_from_distance(red_vault_distances[0]),
            Vault::cube_count_from_distance(red_vault_distances[1]),
            Vault::cube_count_from_distance(red_vault_distances[2]),
        );
        self.blue_vault.update_cubes(
            Vault::cube_count_from_distance(blue_vault_distances[0]),
            Vault::cube_count_from_distance(blue_vault_distances[1]),
            Vault::cube_count_from_distance(blue_vault_distances[2]),
        );
        let buttons = self.plc.get_power_up_buttons();
        self.red_vault
            .update_buttons(&mut self.power_ups, buttons[0], buttons[1], buttons[2], now);
        self.blue_vault
            .update_buttons(&mut self.power_ups, buttons[3], buttons[4], buttons[5], now);

        self.red_score.force_cubes = self.red_vault.force_cubes;
        self.red_score.force_played = self.red_vault.force_power_up.is_some();
        self.red_score.levitate_cubes = self.red_vault.levitate_cubes;
        self.red_score.levitate_played = self.red_vault.levitate_played;
        self.red_score.boost_cubes = self.red_vault.boost_cubes;
        self.red_score.boost_played = self.red_vault.boost_power_up.is_some();
        self.blue_score.force_cubes = self.blue_vault.force_cubes;
        self.blue_score.force_played = self.blue_vault.force_power_up.is_some();
        self.blue_score.levitate_cubes = self.blue_vault.levitate_cubes;
        self.blue_score.levitate_played = self.blue_vault.levitate_played;
        self.blue_score.boost_cubes = self.blue_vault.boost_cubes;
        self.blue_score.boost_played = self.blue_vault.boost_power_up.is_some();

        if let Some(effect) = self.red_vault.check_for_newly_played_power_up() {
            self.play_sound(&format!("match-{}", effect.name()));
        }
        if let Some(effect) = self.blue_vault.check_for_newly_played_power_up() {
            self.play_sound(&format!("match-{}", effect.name()));
        }

        if old_red_score != self.red_score || old_blue_score != self.blue_score {
            self.notify_score();
        }
    }

    /// Light and motor commands back to the PLC.
    fn handle_plc_output(&mut self) {
        // TODO: drive the stack lights once the output register map is fixed.
    }

    /// Applies one station's estop button state, honoring the rule that a
    /// stop can never clear while the match runs.
    fn handle_estop(&mut self, station: StationId, pressed: bool) {
        let in_auto = self.match_state == MatchState::AutoPeriod;
        let match_time_sec = self.match_time_sec();
        let alliance_station = self.station_mut(station);
        if pressed {
            if in_auto {
                alliance_station.astop = true;
            } else {
                alliance_station.estop = true;
            }
        } else {
            if !in_auto {
                alliance_station.astop = false;
            }
            if match_time_sec == 0.0 {
                alliance_station.estop = false;
            }
        }
    }

    fn set_audience_display(&mut self, screen: &str) {
        self.audience_display_screen = screen.to_string();
        self.audience_display_notifier
            .notify(self.audience_display_screen.clone());
    }

    fn set_field_leds(&mut self, mode: LedMode) {
        self.scale_leds.set_mode(mode, mode);
        self.red_switch_leds.set_mode(mode, mode);
        self.blue_switch_leds.set_mode(mode, mode);
    }

    fn play_sound(&self, sound: &str) {
        if !self.mute_match_sounds {
            self.play_sound_notifier.notify(sound.to_string());
        }
    }

    fn notify_score(&self) {
        self.realtime_score_notifier.notify(ScoreUpdate {
            red: self.red_score_summary(),
            blue: self.blue_score_summary(),
        });
    }
}

fn led_mode_for(alliance: Alliance) -> LedMode {
    match alliance {
        Alliance::Neither => LedMode::Off,
        Alliance::Red => LedMode::Red,
        Alliance::Blue => LedMode::Blue,
    }
}

/// Spawns the background I/O tasks and drives the control loop forever.
pub async fn run(arena: SharedArena) {
    {
        let arena_guard = arena.lock().await;
        tokio::spawn(arena_guard.plc.clone().run());
    }
    tokio::spawn(driver_station::listen_for_driver_stations(arena.clone()));
    tokio::spawn(driver_station::listen_for_ds_udp_packets(arena.clone()));
    tokio::spawn(driver_station::monitor_bandwidth(arena.clone()));

    let mut ticker = tokio::time::interval(ARENA_LOOP_PERIOD);
    loop {
        ticker.tick().await;
        arena.lock().await.update();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plc::PlcInputs;
    use tokio::sync::broadcast::Receiver;

    async fn test_arena() -> (Arena, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let arena = Arena::new(dir.path()).await.unwrap();
        (arena, dir)
    }

    fn bypass_all(arena: &mut Arena) {
        for alliance_station in &mut arena.stations {
            alliance_station.bypass = true;
        }
    }

    fn link_all(arena: &mut Arena) {
        for (i, alliance_station) in arena.stations.iter_mut().enumerate() {
            let mut connection = DriverStationConnection::new(100 + i as u32);
            connection.robot_linked = true;
            alliance_station.ds_conn = Some(connection);
        }
    }

    fn rewind_match_clock(arena: &mut Arena, seconds: f64) {
        arena.match_start_time = Instant::now() - Duration::from_secs_f64(seconds);
    }

    fn drain(rx: &mut Receiver<String>) -> Vec<String> {
        let mut sounds = Vec::new();
        while let Ok(sound) = rx.try_recv() {
            sounds.push(sound);
        }
        sounds
    }

    #[tokio::test]
    async fn happy_path_runs_every_phase() {
        let (mut arena, _dir) = test_arena().await;
        let mut sounds = arena.play_sound_notifier.subscribe();
        let mut states = arena.match_state_notifier.subscribe();
        bypass_all(&mut arena);
        arena.current_match.game_specific_data = "LL".to_string();

        arena.start_match().await.unwrap();
        assert_eq!(arena.match_state, MatchState::StartMatch);
        // The operator-supplied test assignment survives the gate.
        assert_eq!(arena.current_match.game_specific_data, "LL");
        assert!(arena.current_match.started_at.is_some());

        arena.update();
        assert_eq!(arena.match_state, MatchState::WarmupPeriod);
        assert_eq!(arena.audience_display_screen, "match");

        // The zero-length warmup advances on the very next tick.
        arena.update();
        assert_eq!(arena.match_state, MatchState::AutoPeriod);

        rewind_match_clock(&mut arena, 15.01);
        arena.update();
        assert_eq!(arena.match_state, MatchState::PausePeriod);

        rewind_match_clock(&mut arena, 18.01);
        arena.update();
        assert_eq!(arena.match_state, MatchState::TeleopPeriod);

        rewind_match_clock(&mut arena, 123.01);
        arena.update();
        assert_eq!(arena.match_state, MatchState::EndgamePeriod);

        rewind_match_clock(&mut arena, 153.01);
        arena.update();
        assert_eq!(arena.match_state, MatchState::PostMatch);
        assert_eq!(arena.match_time_sec(), 0.0);

        // Scores dwell for three seconds, then the displays blank.
        assert_eq!(arena.audience_display_screen, "match");
        arena.post_match_blank_time = Some(Instant::now());
        arena.update();
        assert_eq!(arena.audience_display_screen, "blank");
        assert_eq!(arena.alliance_station_display_screen, "logo");

        assert_eq!(
            drain(&mut sounds),
            vec![
                "match-warmup",
                "match-start",
                "match-end",
                "match-resume",
                "match-endgame",
                "match-end"
            ]
        );

        let mut seen = Vec::new();
        while let Ok(state) = states.try_recv() {
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                MatchState::WarmupPeriod,
                MatchState::AutoPeriod,
                MatchState::PausePeriod,
                MatchState::TeleopPeriod,
                MatchState::EndgamePeriod,
                MatchState::PostMatch
            ]
        );
    }

    #[tokio::test]
    async fn match_time_is_zero_outside_a_match() {
        let (mut arena, _dir) = test_arena().await;
        assert_eq!(arena.match_time_sec(), 0.0);
        arena.match_state = MatchState::StartMatch;
        assert_eq!(arena.match_time_sec(), 0.0);
        arena.match_state = MatchState::AutoPeriod;
        rewind_match_clock(&mut arena, 5.0);
        assert!(arena.match_time_sec() >= 5.0);
        arena.match_state = MatchState::PostMatch;
        assert_eq!(arena.match_time_sec(), 0.0);
    }

    #[tokio::test]
    async fn start_gate_needs_every_station_linked_or_bypassed() {
        let (mut arena, _dir) = test_arena().await;
        assert!(matches!(
            arena.check_can_start_match(),
            Err(ArenaError::RobotsNotReady)
        ));
        assert!(!arena.status().can_start_match);

        link_all(&mut arena);
        assert!(arena.check_can_start_match().is_ok());

        // One unlinked robot closes the gate; bypassing it reopens it.
        arena.stations[2].ds_conn.as_mut().unwrap().robot_linked = false;
        assert!(matches!(
            arena.check_can_start_match(),
            Err(ArenaError::RobotsNotReady)
        ));
        arena.stations[2].bypass = true;
        assert!(arena.check_can_start_match().is_ok());
        assert!(arena.status().can_start_match);
    }

    #[tokio::test]
    async fn start_gate_rejects_an_active_estop() {
        let (mut arena, _dir) = test_arena().await;
        bypass_all(&mut arena);
        arena.station_mut(StationId::R1).estop = true;

        let err = arena.start_match().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot start match while an emergency stop is active."
        );
        assert_eq!(arena.match_state, MatchState::PreMatch);
    }

    #[tokio::test]
    async fn start_gate_honors_plc_health_when_configured() {
        let (mut arena, _dir) = test_arena().await;
        bypass_all(&mut arena);
        assert!(arena.check_can_start_match().is_ok());

        arena.settings.plc_address = "10.0.100.10:502".to_string();
        arena.plc.set_address(&arena.settings.plc_address);
        assert!(matches!(
            arena.check_can_start_match(),
            Err(ArenaError::PlcUnhealthy)
        ));

        let mut inputs = PlcInputs::default();
        inputs.field_estop = true;
        arena.plc.inject_inputs(inputs);
        assert!(matches!(
            arena.check_can_start_match(),
            Err(ArenaError::FieldEstopActive)
        ));

        arena.plc.inject_inputs(PlcInputs::default());
        assert!(arena.check_can_start_match().is_ok());
    }

    #[tokio::test]
    async fn abort_is_rejected_outside_a_match_and_after_the_first_call() {
        let (mut arena, _dir) = test_arena().await;
        assert!(matches!(
            arena.abort_match(),
            Err(ArenaError::MatchNotInProgress)
        ));

        let mut sounds = arena.play_sound_notifier.subscribe();
        bypass_all(&mut arena);
        arena.start_match().await.unwrap();
        arena.update();
        arena.update();
        assert_eq!(arena.match_state, MatchState::AutoPeriod);
        drain(&mut sounds);

        arena.abort_match().unwrap();
        assert_eq!(arena.match_state, MatchState::PostMatch);
        assert_eq!(arena.audience_display_screen, "blank");
        assert_eq!(drain(&mut sounds), vec!["match-abort"]);

        assert!(matches!(
            arena.abort_match(),
            Err(ArenaError::MatchNotInProgress)
        ));
    }

    #[tokio::test]
    async fn abort_during_warmup_stays_silent() {
        let (mut arena, _dir) = test_arena().await;
        arena.timing.warmup_duration_sec = 30;
        bypass_all(&mut arena);
        arena.start_match().await.unwrap();
        arena.update();
        assert_eq!(arena.match_state, MatchState::WarmupPeriod);

        let mut sounds = arena.play_sound_notifier.subscribe();
        arena.abort_match().unwrap();
        assert!(drain(&mut sounds).is_empty());
    }

    #[tokio::test]
    async fn load_match_is_rejected_while_one_is_underway() {
        let (mut arena, _dir) = test_arena().await;
        bypass_all(&mut arena);
        arena.start_match().await.unwrap();
        assert!(matches!(
            arena.load_test_match(),
            Err(ArenaError::MatchInProgress)
        ));
    }

    #[tokio::test]
    async fn load_match_assigns_teams_and_resets_scoring() {
        let (mut arena, _dir) = test_arena().await;
        arena.red_score.fouls = 3;

        let mut match_record = Match::test();
        match_record.red1 = 254;
        match_record.blue3 = 1678;
        let mut load_notifications = arena.match_load_teams_notifier.subscribe();
        arena.load_match(match_record).unwrap();

        assert_eq!(
            arena.station(StationId::R1).team.as_ref().map(|t| t.id),
            Some(254)
        );
        assert!(arena.station(StationId::R2).team.is_none());
        assert_eq!(arena.get_assigned_station(1678), Some(StationId::B3));
        assert_eq!(arena.red_score, Score::default());
        assert!(load_notifications.try_recv().is_ok());
        assert_eq!(arena.alliance_station_display_screen, "match");
    }

    #[tokio::test]
    async fn reset_clears_bypasses_and_returns_to_prematch() {
        let (mut arena, _dir) = test_arena().await;
        bypass_all(&mut arena);
        arena.mute_match_sounds = true;
        arena.start_match().await.unwrap();
        arena.update();
        arena.update();
        assert!(matches!(
            arena.reset_match(),
            Err(ArenaError::ResetDuringMatch)
        ));

        arena.abort_match().unwrap();
        arena.reset_match().unwrap();
        assert_eq!(arena.match_state, MatchState::PreMatch);
        assert!(arena.stations.iter().all(|s| !s.bypass));
        assert!(!arena.mute_match_sounds);

        // Loading again leaves the arena equivalent to pre-load.
        arena.load_test_match().unwrap();
        assert_eq!(arena.red_score, Score::default());
        assert_eq!(arena.blue_score, Score::default());
    }

    #[tokio::test]
    async fn load_next_match_skips_completed_matches() {
        let (mut arena, _dir) = test_arena().await;
        let mut played = Match {
            match_type: MatchType::Practice,
            status: MatchStatus::Complete,
            ..Match::test()
        };
        arena.store.create_match(&mut played).await.unwrap();
        let mut upcoming = Match {
            match_type: MatchType::Practice,
            red1: 254,
            ..Match::test()
        };
        arena.store.create_match(&mut upcoming).await.unwrap();

        // Pivot off a practice match so the loader follows that schedule.
        arena.current_match.match_type = MatchType::Practice;
        arena.load_next_match().unwrap();
        assert_eq!(arena.current_match.id, upcoming.id);
        assert_eq!(arena.get_assigned_station(254), Some(StationId::R1));

        // A test match reloads as a fresh test match instead.
        arena.load_test_match().unwrap();
        arena.load_next_match().unwrap();
        assert_eq!(arena.current_match.match_type, MatchType::Test);
    }

    #[tokio::test]
    async fn substitution_is_rejected_for_qualification_matches() {
        let (mut arena, _dir) = test_arena().await;
        arena.substitute_team(971, StationId::B1).await.unwrap();
        assert_eq!(arena.current_match.blue1, 971);
        assert_eq!(arena.get_assigned_station(971), Some(StationId::B1));

        arena.current_match.match_type = MatchType::Qualification;
        assert!(matches!(
            arena.substitute_team(973, StationId::B2).await,
            Err(ArenaError::QualificationSubstitution)
        ));
    }

    #[tokio::test]
    async fn estop_rules_by_phase() {
        let (mut arena, _dir) = test_arena().await;

        // During auto the button arms the autonomous stop.
        arena.match_state = MatchState::AutoPeriod;
        rewind_match_clock(&mut arena, 5.0);
        arena.handle_estop(StationId::R1, true);
        assert!(arena.station(StationId::R1).astop);
        assert!(!arena.station(StationId::R1).estop);

        // Releasing during auto does not clear the astop.
        arena.handle_estop(StationId::R1, false);
        assert!(arena.station(StationId::R1).astop);

        // In teleop the release clears the astop, a press becomes an estop.
        arena.match_state = MatchState::TeleopPeriod;
        arena.handle_estop(StationId::R1, false);
        assert!(!arena.station(StationId::R1).astop);
        arena.handle_estop(StationId::R1, true);
        assert!(arena.station(StationId::R1).estop);

        // The estop stays latched while the match runs.
        arena.handle_estop(StationId::R1, false);
        assert!(arena.station(StationId::R1).estop);

        // Once the match is over it releases.
        arena.match_state = MatchState::PostMatch;
        arena.handle_estop(StationId::R1, false);
        assert!(!arena.station(StationId::R1).estop);
    }

    #[tokio::test]
    async fn ds_packets_follow_the_cadence() {
        let (mut arena, _dir) = test_arena().await;
        let mut robot_status = arena.robot_status_notifier.subscribe();

        // Not yet due: construction just refreshed the packet clock.
        arena.update();
        assert!(robot_status.try_recv().is_err());

        arena.last_ds_packet_time = Instant::now() - Duration::from_millis(300);
        arena.update();
        assert!(robot_status.try_recv().is_ok());

        // The send refreshed the clock, so the next tick is quiet again.
        arena.update();
        assert!(robot_status.try_recv().is_err());
    }

    #[tokio::test]
    async fn field_estop_aborts_a_running_match() {
        let (mut arena, _dir) = test_arena().await;
        arena.match_state = MatchState::AutoPeriod;
        arena.last_match_state = Some(MatchState::AutoPeriod);
        rewind_match_clock(&mut arena, 5.0);

        let mut inputs = PlcInputs::default();
        inputs.field_estop = true;
        arena.plc.inject_inputs(inputs);

        arena.update();
        assert_eq!(arena.match_state, MatchState::PostMatch);

        // Another tick with the estop still held must not error or re-abort.
        arena.update();
        assert_eq!(arena.match_state, MatchState::PostMatch);
    }

    #[tokio::test]
    async fn auto_ownership_points_double_the_floored_seconds() {
        let (mut arena, _dir) = test_arena().await;
        arena.match_state = MatchState::AutoPeriod;
        arena.last_match_state = Some(MatchState::AutoPeriod);
        rewind_match_clock(&mut arena, 12.0);

        // Red has held its switch for the last ten seconds.
        let held_since = Instant::now() - Duration::from_secs(10);
        arena
            .red_switch
            .update_state([true, false], &arena.power_ups, held_since);

        arena.update();
        assert_eq!(arena.red_score.auto_ownership_points, 20);
        assert_eq!(arena.blue_score.auto_ownership_points, 0);
    }

    #[tokio::test]
    async fn teleop_ownership_accrues_from_the_teleop_start() {
        let (mut arena, _dir) = test_arena().await;
        let mut scores = arena.realtime_score_notifier.subscribe();
        arena.match_state = MatchState::TeleopPeriod;
        arena.last_match_state = Some(MatchState::TeleopPeriod);
        // 18 s of auto and pause plus 7 s of teleop.
        rewind_match_clock(&mut arena, 25.0);

        // Blue has owned the scale since before teleop began; only the
        // teleop half counts here.
        let held_since = Instant::now() - Duration::from_secs(20);
        arena
            .scale
            .update_state([false, true], &arena.power_ups, held_since);

        arena.update();
        assert_eq!(arena.blue_score.teleop_ownership_points, 7);
        assert_eq!(arena.red_score.teleop_ownership_points, 0);
        assert!(scores.try_recv().is_ok());
    }

    #[tokio::test]
    async fn vault_state_mirrors_into_the_score() {
        let (mut arena, _dir) = test_arena().await;
        let mut sounds = arena.play_sound_notifier.subscribe();
        arena.match_state = MatchState::TeleopPeriod;
        arena.last_match_state = Some(MatchState::TeleopPeriod);
        rewind_match_clock(&mut arena, 25.0);

        let mut inputs = PlcInputs::default();
        // Two force cubes and one levitate cube in the red vault.
        inputs.red_vault_distances = [340, 620, 900];
        inputs.blue_vault_distances = [900, 900, 900];
        inputs.power_up_buttons = [true, false, false, false, false, false];
        arena.plc.inject_inputs(inputs);

        arena.update();
        assert_eq!(arena.red_score.force_cubes, 2);
        assert_eq!(arena.red_score.levitate_cubes, 1);
        assert!(arena.red_score.force_played);
        assert!(!arena.red_score.boost_played);
        assert_eq!(drain(&mut sounds), vec!["match-force"]);

        // Holding the button adds nothing on later ticks.
        arena.update();
        assert!(drain(&mut sounds).is_empty());
    }
}
