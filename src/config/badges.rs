//! Skill-level badge table
//!
//! The table is assembled once at startup from three layers: an explicit
//! override string, emoji discovered in the guild catalog by name, and the
//! built-in keycap defaults. Earlier layers win per level.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::{debug, warn};

pub const MIN_LEVEL: u8 = 1;
pub const MAX_LEVEL: u8 = 10;

/// Custom emoji known to the guild
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmojiRef {
    pub name: String,
    pub id: String,
}

impl EmojiRef {
    pub fn markup(&self) -> String {
        format!("<:{}:{}>", self.name, self.id)
    }
}

/// Badge sources as configured
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BadgeSettings {
    /// `"1:<:lvl1:123>,2:<:lvl2:456>"`
    pub override_spec: Option<String>,
    pub catalog: Vec<EmojiRef>,
}

/// Immutable level → badge lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelBadges {
    table: BTreeMap<u8, String>,
}

fn level_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"^(?:faceit|faceitlvl|lvl|level|lv|l)?_?0*([1-9]|10)$",
            r"^(?:faceit_)?level_?0*([1-9]|10)$",
            r"^(?:faceit)?0*([1-9]|10)$",
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

fn markup_pattern() -> Option<&'static Regex> {
    static MARKUP: OnceLock<Option<Regex>> = OnceLock::new();
    MARKUP
        .get_or_init(|| Regex::new(r"^<:[a-zA-Z0-9_~]+:\d+>$").ok())
        .as_ref()
}

fn valid_level(level: u8) -> bool {
    (MIN_LEVEL..=MAX_LEVEL).contains(&level)
}

impl LevelBadges {
    /// Keycap emoji for every level
    pub fn builtin() -> Self {
        let keycaps = [
            "1️⃣", "2️⃣", "3️⃣", "4️⃣", "5️⃣", "6️⃣", "7️⃣", "8️⃣", "9️⃣", "🔟",
        ];
        let table = (MIN_LEVEL..=MAX_LEVEL)
            .zip(keycaps)
            .map(|(level, badge)| (level, badge.to_string()))
            .collect();
        Self { table }
    }

    /// Assemble the table from configured layers
    pub fn assemble(settings: &BadgeSettings) -> Self {
        let mut badges = Self::builtin();

        let discovered = Self::discover(&settings.catalog);
        debug!("Discovered {} level badges in emoji catalog", discovered.len());
        badges.table.extend(discovered);

        if let Some(spec) = settings.override_spec.as_deref() {
            let overrides = Self::parse_override(spec);
            debug!("Applying {} level badge overrides", overrides.len());
            badges.table.extend(overrides);
        }

        badges
    }

    /// Parse `level:badge` pairs, ignoring malformed ones and levels outside 1..=10
    pub fn parse_override(spec: &str) -> BTreeMap<u8, String> {
        let mut out = BTreeMap::new();
        for pair in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((key, value)) = pair.split_once(':') else {
                continue;
            };
            let Ok(level) = key.trim().parse::<u8>() else {
                continue;
            };
            if !valid_level(level) {
                continue;
            }
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            if markup_pattern().is_some_and(|re| !re.is_match(value)) {
                warn!("Level badge override for {} is not emoji markup: {}", level, value);
            }
            out.insert(level, value.to_string());
        }
        out
    }

    /// Map catalog emoji whose names encode a level
    pub fn discover(catalog: &[EmojiRef]) -> BTreeMap<u8, String> {
        catalog
            .iter()
            .filter_map(|emoji| {
                Self::level_from_emoji_name(&emoji.name).map(|level| (level, emoji.markup()))
            })
            .collect()
    }

    /// Extract a level from names like `faceitlvl7`, `level_03` or `10`
    pub fn level_from_emoji_name(name: &str) -> Option<u8> {
        let normalized = name.to_lowercase().replace('-', "_");
        level_patterns().iter().find_map(|re| {
            re.captures(&normalized)
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse::<u8>().ok())
                .filter(|level| valid_level(*level))
        })
    }

    pub fn badge(&self, level: u8) -> Option<&str> {
        if !valid_level(level) {
            return None;
        }
        self.table.get(&level).map(String::as_str)
    }
}

impl Default for LevelBadges {
    fn default() -> Self {
        Self::builtin()
    }
}
