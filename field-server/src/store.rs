//! JSON-file event store: settings, the team roster and the match schedule.
//!
//! Collections live as plain files under the data directory and are held in
//! memory behind the arena lock; every mutation rewrites its file so the
//! event survives a server restart.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs;

/// Failures opening or writing the backing files.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("store contains malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// The kind of match being run; test matches never persist.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Test,
    Practice,
    Qualification,
    Elimination,
}

/// Lifecycle of a scheduled match.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchStatus {
    #[default]
    #[serde(rename = "")]
    Scheduled,
    #[serde(rename = "started")]
    Started,
    #[serde(rename = "complete")]
    Complete,
}

/// One scheduled (or ad hoc test) match.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Match {
    pub id: i64,
    #[serde(rename = "type")]
    pub match_type: MatchType,
    pub display_name: String,
    pub status: MatchStatus,
    pub red1: u32,
    pub red2: u32,
    pub red3: u32,
    pub blue1: u32,
    pub blue2: u32,
    pub blue3: u32,
    pub game_specific_data: String,
    pub started_at: Option<DateTime<Utc>>,
}

impl Match {
    /// An empty test match with no teams assigned.
    pub fn test() -> Match {
        Match {
            id: 0,
            match_type: MatchType::Test,
            display_name: "Test Match".to_string(),
            status: MatchStatus::Scheduled,
            red1: 0,
            red2: 0,
            red3: 0,
            blue1: 0,
            blue2: 0,
            blue3: 0,
            game_specific_data: String::new(),
            started_at: None,
        }
    }
}

/// A registered team.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Team {
    pub id: u32,
    pub name: String,
}

/// Everything the operator configures for an event.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    pub ap_address: String,
    pub ap_username: String,
    pub ap_password: String,
    pub ap_team_channel: u16,
    pub ap_admin_channel: u16,
    pub ap_admin_wpa_key: String,
    pub switch_address: String,
    pub switch_password: String,
    pub plc_address: String,
    pub network_security_enabled: bool,
    pub tba_event_code: String,
    pub tba_secret_id: String,
    pub tba_secret: String,
    pub stem_tv_event_code: String,
    pub scale_led_address: String,
    pub red_switch_led_address: String,
    pub blue_switch_led_address: String,
}

/// The open event store.
pub struct Database {
    dir: PathBuf,
    settings: EventSettings,
    teams: Vec<Team>,
    matches: Vec<Match>,
    next_match_id: i64,
}

impl Database {
    /// Opens the store, creating the data directory and empty collections on
    /// first use. Failure here is fatal to startup.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Database, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        let settings = read_collection(&dir.join("settings.json")).await?;
        let teams = read_collection(&dir.join("teams.json")).await?;
        let matches: Vec<Match> = read_collection(&dir.join("matches.json")).await?;
        let next_match_id = matches.iter().map(|m| m.id).max().unwrap_or(0) + 1;
        Ok(Database {
            dir,
            settings,
            teams,
            matches,
            next_match_id,
        })
    }

    pub fn get_event_settings(&self) -> &EventSettings {
        &self.settings
    }

    pub async fn save_event_settings(&mut self, settings: EventSettings) -> Result<(), StoreError> {
        self.settings = settings;
        write_collection(&self.dir.join("settings.json"), &self.settings).await
    }

    pub fn get_team_by_id(&self, team_id: u32) -> Option<Team> {
        self.teams.iter().find(|t| t.id == team_id).cloned()
    }

    pub async fn create_team(&mut self, team: Team) -> Result<(), StoreError> {
        self.teams.retain(|t| t.id != team.id);
        self.teams.push(team);
        write_collection(&self.dir.join("teams.json"), &self.teams).await
    }

    /// Absent matches are not an error.
    pub fn get_match_by_id(&self, match_id: i64) -> Option<Match> {
        self.matches.iter().find(|m| m.id == match_id).cloned()
    }

    /// All scheduled matches of the given type, in schedule order.
    pub fn get_matches_by_type(&self, match_type: MatchType) -> Vec<Match> {
        self.matches
            .iter()
            .filter(|m| m.match_type == match_type)
            .cloned()
            .collect()
    }

    /// Inserts a new match, assigning its id.
    pub async fn create_match(&mut self, match_record: &mut Match) -> Result<(), StoreError> {
        match_record.id = self.next_match_id;
        self.next_match_id += 1;
        self.matches.push(match_record.clone());
        self.write_matches().await
    }

    /// Replaces the stored match with the same id.
    pub async fn save_match(&mut self, match_record: &Match) -> Result<(), StoreError> {
        if let Some(stored) = self.matches.iter_mut().find(|m| m.id == match_record.id) {
            *stored = match_record.clone();
        }
        self.write_matches().await
    }

    pub async fn delete_match(&mut self, match_id: i64) -> Result<(), StoreError> {
        self.matches.retain(|m| m.id != match_id);
        self.write_matches().await
    }

    pub async fn truncate_matches(&mut self) -> Result<(), StoreError> {
        self.matches.clear();
        self.write_matches().await
    }

    async fn write_matches(&self) -> Result<(), StoreError> {
        write_collection(&self.dir.join("matches.json"), &self.matches).await
    }
}

/// Reads a collection file, treating a missing file as the empty default.
async fn read_collection<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StoreError> {
    match fs::read_to_string(path).await {
        Ok(text) => Ok(serde_json::from_str(&text)?),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(err.into()),
    }
}

async fn write_collection<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp() -> (Database, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).await.unwrap();
        (db, dir)
    }

    fn qualification_match() -> Match {
        Match {
            match_type: MatchType::Qualification,
            display_name: "Qualification 1".to_string(),
            red1: 254,
            red2: 1114,
            red3: 148,
            blue1: 971,
            blue2: 973,
            blue3: 1678,
            ..Match::test()
        }
    }

    #[tokio::test]
    async fn nonexistent_match_is_none() {
        let (db, _dir) = open_temp().await;
        assert!(db.get_match_by_id(1114).is_none());
    }

    #[tokio::test]
    async fn match_crud_round_trip() {
        let (mut db, _dir) = open_temp().await;

        let mut match_record = qualification_match();
        db.create_match(&mut match_record).await.unwrap();
        assert!(match_record.id > 0);
        let stored = db.get_match_by_id(match_record.id).unwrap();
        assert_eq!(stored.red1, 254);
        assert_eq!(stored.status, MatchStatus::Scheduled);

        match_record.status = MatchStatus::Started;
        db.save_match(&match_record).await.unwrap();
        assert_eq!(
            db.get_match_by_id(match_record.id).unwrap().status,
            MatchStatus::Started
        );

        db.delete_match(match_record.id).await.unwrap();
        assert!(db.get_match_by_id(match_record.id).is_none());
    }

    #[tokio::test]
    async fn truncate_empties_the_schedule() {
        let (mut db, _dir) = open_temp().await;
        let mut match_record = qualification_match();
        db.create_match(&mut match_record).await.unwrap();
        db.truncate_matches().await.unwrap();
        assert!(db.get_match_by_id(match_record.id).is_none());
    }

    #[tokio::test]
    async fn collections_survive_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut db = Database::open(dir.path()).await.unwrap();
            let mut settings = EventSettings::default();
            settings.plc_address = "10.0.100.10:502".to_string();
            db.save_event_settings(settings).await.unwrap();
            db.create_team(Team {
                id: 254,
                name: "The Cheesy Poofs".to_string(),
            })
            .await
            .unwrap();
            let mut match_record = qualification_match();
            db.create_match(&mut match_record).await.unwrap();
        }

        let db = Database::open(dir.path()).await.unwrap();
        assert_eq!(db.get_event_settings().plc_address, "10.0.100.10:502");
        assert_eq!(db.get_team_by_id(254).unwrap().name, "The Cheesy Poofs");
        assert_eq!(db.get_matches_by_type(MatchType::Qualification).len(), 1);
        assert!(db.get_matches_by_type(MatchType::Practice).is_empty());
    }
}
