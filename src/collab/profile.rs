//! Player profile persistence. Best effort: a broken or missing file yields
//! the default explorer, a failed save is only logged.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const MAX_LEVEL: u32 = 50;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppTheme {
    Sky,
    Mint,
    Purple,
    Rainbow,
    Galaxy,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct Streak {
    pub current: u32,
    pub last_login_date: String,
    pub frozen: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Inventory {
    pub themes: Vec<AppTheme>,
    pub avatars: Vec<String>,
    pub stickers: Vec<String>,
}

impl Default for Inventory {
    fn default() -> Self {
        Self {
            themes: vec![AppTheme::Sky, AppTheme::Mint, AppTheme::Purple],
            avatars: vec!["avataaars".into()],
            stickers: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct UserProfile {
    pub name: String,
    pub avatar_style: String,
    pub total_score: u64,
    pub xp: u64,
    pub level: u32,
    pub streak: Streak,
    pub inventory: Inventory,
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            name: "Explorer".into(),
            avatar_style: "avataaars".into(),
            total_score: 0,
            xp: 0,
            level: 1,
            streak: Streak::default(),
            inventory: Inventory::default(),
        }
    }
}

/// Mystery-box prize. XP goes through [`UserProfile::add_xp`]; the rest land
/// in the inventory.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reward {
    Xp(u64),
    Theme(AppTheme),
    Avatar(String),
    Sticker(String),
}

const DATE_FORMAT: &str = "%Y-%m-%d";

/// XP needed to go from `level` to the next one.
pub fn xp_for_level(level: u32) -> u64 {
    let level = u64::from(level);
    level * 100 + level * level * 10
}

impl UserProfile {
    /// Adds XP and score, levelling up as far as the XP allows. Returns
    /// whether at least one level was gained.
    pub fn add_xp(&mut self, amount: u64) -> bool {
        let start = self.level;
        self.xp = self.xp.saturating_add(amount);
        self.total_score = self.total_score.saturating_add(amount);
        while self.level < MAX_LEVEL && self.xp >= xp_for_level(self.level) {
            self.xp -= xp_for_level(self.level);
            self.level += 1;
        }
        self.level > start
    }

    /// Records a login on `today`. Returns `true` when this is the first login
    /// of the day, i.e. when a streak bonus is due.
    ///
    /// A login the day after the last one extends the streak. After a longer
    /// gap the streak restarts at 1, unless a freeze is held: the freeze is
    /// spent and the streak is kept as is.
    pub fn check_daily_streak(&mut self, today: NaiveDate) -> bool {
        let last = NaiveDate::parse_from_str(&self.streak.last_login_date, DATE_FORMAT).ok();
        if last == Some(today) {
            return false;
        }

        match last {
            Some(last) if today.pred_opt() == Some(last) => {
                self.streak.current = self.streak.current.saturating_add(1);
            }
            Some(_) if self.streak.frozen => {
                debug!(streak = self.streak.current, "streak freeze used");
                self.streak.frozen = false;
            }
            _ => self.streak.current = 1,
        }
        self.streak.last_login_date = today.format(DATE_FORMAT).to_string();
        true
    }

    /// Adds an item reward to the inventory. Returns `false` when it was
    /// already owned or is not an item.
    pub fn unlock_reward(&mut self, reward: &Reward) -> bool {
        fn add<T: PartialEq + Clone>(owned: &mut Vec<T>, item: &T) -> bool {
            if owned.contains(item) {
                return false;
            }
            owned.push(item.clone());
            true
        }

        let inventory = &mut self.inventory;
        match reward {
            Reward::Xp(_) => false,
            Reward::Theme(theme) => add(&mut inventory.themes, theme),
            Reward::Avatar(style) => add(&mut inventory.avatars, style),
            Reward::Sticker(sticker) => add(&mut inventory.stickers, sticker),
        }
    }
}

pub trait ProfileStore: Send + Sync {
    fn load_or_default(&self) -> UserProfile;
    fn save(&self, profile: &UserProfile);
}

/// Keeps the profile as a JSON document in one file.
#[derive(Debug, Clone)]
pub struct JsonProfileStore {
    path: PathBuf,
}

impl JsonProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProfileStore for JsonProfileStore {
    fn load_or_default(&self) -> UserProfile {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) => {
                debug!(path = %self.path.display(), error = %err, "no stored profile");
                return UserProfile::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(profile) => profile,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to load profile");
                UserProfile::default()
            }
        }
    }

    fn save(&self, profile: &UserProfile) {
        let json = match serde_json::to_string_pretty(profile) {
            Ok(json) => json,
            Err(err) => {
                warn!(error = %err, "failed to encode profile");
                return;
            }
        };
        if let Some(parent) = self.path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %err, "failed to create profile dir");
                return;
            }
        }
        if let Err(err) = fs::write(&self.path, json) {
            warn!(path = %self.path.display(), error = %err, "failed to save profile");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DATE_FORMAT).unwrap()
    }

    fn streak(current: u32, last: &str, frozen: bool) -> UserProfile {
        UserProfile {
            streak: Streak {
                current,
                last_login_date: last.into(),
                frozen,
            },
            ..UserProfile::default()
        }
    }

    #[test]
    fn first_login_starts_the_streak() {
        let mut profile = UserProfile::default();
        assert!(profile.check_daily_streak(day("2025-03-10")));
        assert_eq!(profile.streak.current, 1);
        assert_eq!(profile.streak.last_login_date, "2025-03-10");
    }

    #[test]
    fn consecutive_days_extend_the_streak() {
        let mut profile = streak(4, "2025-02-28", false);
        assert!(profile.check_daily_streak(day("2025-03-01")));
        assert_eq!(profile.streak.current, 5);
        assert_eq!(profile.streak.last_login_date, "2025-03-01");
    }

    #[test]
    fn a_missed_day_restarts_the_streak() {
        let mut profile = streak(7, "2025-03-07", false);
        assert!(profile.check_daily_streak(day("2025-03-10")));
        assert_eq!(profile.streak.current, 1);
    }

    #[test]
    fn a_freeze_bridges_one_gap() {
        let mut profile = streak(7, "2025-03-07", true);
        assert!(profile.check_daily_streak(day("2025-03-10")));
        assert_eq!(profile.streak.current, 7);
        assert!(!profile.streak.frozen);
        assert_eq!(profile.streak.last_login_date, "2025-03-10");

        assert!(profile.check_daily_streak(day("2025-03-13")));
        assert_eq!(profile.streak.current, 1);
    }

    #[test]
    fn second_login_on_the_same_day_changes_nothing() {
        let mut profile = streak(3, "2025-03-10", true);
        let before = profile.clone();
        assert!(!profile.check_daily_streak(day("2025-03-10")));
        assert_eq!(profile, before);
    }

    #[test]
    fn unlocking_an_owned_item_is_a_no_op() {
        let mut profile = UserProfile::default();
        assert!(profile.unlock_reward(&Reward::Theme(AppTheme::Galaxy)));
        assert!(!profile.unlock_reward(&Reward::Theme(AppTheme::Galaxy)));
        assert!(!profile.unlock_reward(&Reward::Theme(AppTheme::Sky)));
        assert!(profile.unlock_reward(&Reward::Sticker("🚀".into())));
        assert!(!profile.unlock_reward(&Reward::Sticker("🚀".into())));
        assert!(!profile.unlock_reward(&Reward::Avatar("avataaars".into())));
        assert!(profile.unlock_reward(&Reward::Avatar("bottts".into())));
        assert!(!profile.unlock_reward(&Reward::Xp(50)));

        assert_eq!(
            profile.inventory.themes,
            vec![AppTheme::Sky, AppTheme::Mint, AppTheme::Purple, AppTheme::Galaxy]
        );
        assert_eq!(profile.inventory.stickers, vec!["🚀"]);
        assert_eq!(profile.inventory.avatars, vec!["avataaars", "bottts"]);
        assert_eq!(profile.xp, 0);
    }

    #[test]
    fn rewards_use_the_tagged_wire_shape() {
        let reward: Reward = serde_json::from_str(r#"{"type":"THEME","value":"RAINBOW"}"#).unwrap();
        assert_eq!(reward, Reward::Theme(AppTheme::Rainbow));
    }

    #[test]
    fn huge_xp_grants_saturate() {
        let mut profile = UserProfile::default();
        assert!(profile.add_xp(u64::MAX));
        assert!(!profile.add_xp(u64::MAX));
        assert_eq!(profile.total_score, u64::MAX);
        assert_eq!(profile.level, MAX_LEVEL);
    }

    #[test]
    fn missing_file_gives_the_default_explorer() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonProfileStore::new(dir.path().join("profile.json"));
        let profile = store.load_or_default();
        assert_eq!(profile.name, "Explorer");
        assert_eq!(profile.level, 1);
        assert_eq!(
            profile.inventory.themes,
            vec![AppTheme::Sky, AppTheme::Mint, AppTheme::Purple]
        );
    }

    #[test]
    fn partial_records_merge_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");
        fs::write(&path, r#"{"name":"Nova","xp":40,"inventory":{"stickers":["🦄"]}}"#).unwrap();

        let profile = JsonProfileStore::new(&path).load_or_default();
        assert_eq!(profile.name, "Nova");
        assert_eq!(profile.xp, 40);
        assert_eq!(profile.avatar_style, "avataaars");
        assert_eq!(profile.inventory.stickers, vec!["🦄"]);
        assert_eq!(profile.inventory.avatars, vec!["avataaars"]);
    }

    #[test]
    fn corrupt_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");
        fs::write(&path, "{not json").unwrap();
        assert_eq!(
            JsonProfileStore::new(&path).load_or_default(),
            UserProfile::default()
        );
    }

    #[test]
    fn saved_profile_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonProfileStore::new(dir.path().join("nested").join("profile.json"));
        let mut profile = UserProfile::default();
        profile.name = "Pixel".into();
        profile.add_xp(150);
        store.save(&profile);
        assert_eq!(store.load_or_default(), profile);
    }

    #[test]
    fn xp_carries_over_levels() {
        let mut profile = UserProfile::default();
        // level 1 needs 110, level 2 needs 240
        assert!(profile.add_xp(400));
        assert_eq!(profile.level, 3);
        assert_eq!(profile.xp, 50);
        assert_eq!(profile.total_score, 400);
        assert!(!profile.add_xp(10));
    }
}
