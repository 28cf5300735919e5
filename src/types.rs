use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Event / Period
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_id: i64,
    pub sport_id: i64,
    pub league_id: Option<i64>,
    pub league_name: String,
    pub starts: DateTime<Utc>,
    pub home: String,
    pub away: String,
    pub event_type: EventType,
    /// Links an in-play event to its prematch parent.
    pub parent_id: Option<i64>,
    pub resulting_unit: Option<String>,
    pub is_have_odds: bool,
    pub periods: Vec<Period>,
}

impl Event {
    pub fn category(&self) -> EventCategory {
        EventCategory::from_resulting_unit(self.resulting_unit.as_deref())
    }

    /// "home vs away", used in change summaries.
    pub fn fixture(&self) -> String {
        format!("{} vs {}", self.home, self.away)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventType {
    Prematch,
    Live,
    Other(String),
}

impl EventType {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "prematch" => EventType::Prematch,
            "live" => EventType::Live,
            _ => EventType::Other(s.to_string()),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Prematch => write!(f, "prematch"),
            EventType::Live => write!(f, "live"),
            EventType::Other(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Standard,
    Corners,
    Bookings,
}

impl EventCategory {
    pub fn from_resulting_unit(unit: Option<&str>) -> Self {
        match unit {
            Some(u) if u.eq_ignore_ascii_case("corners") => EventCategory::Corners,
            Some(u) if u.eq_ignore_ascii_case("bookings") => EventCategory::Bookings,
            _ => EventCategory::Standard,
        }
    }
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventCategory::Standard => "standard",
            EventCategory::Corners => "corners",
            EventCategory::Bookings => "bookings",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Period {
    /// From the `num_<n>` key.
    pub number: i32,
    pub status: Option<i64>,
    /// Quotes for this period are settled after this instant.
    pub cutoff: Option<DateTime<Utc>>,
    pub limits: PeriodLimits,
    pub line_id: Option<i64>,
    /// Upstream `number` field, carried as-is.
    pub line_number: Option<i64>,
    pub money_line: Option<MoneyLine>,
    pub spreads: Vec<SpreadLine>,
    pub totals: Vec<TotalLine>,
    pub team_totals: Vec<TeamTotalLine>,
}

/// Per-market maximum bet ceilings from the period `meta` block.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PeriodLimits {
    pub max_spread: Option<f64>,
    pub max_money_line: Option<f64>,
    pub max_total: Option<f64>,
    pub max_team_total: Option<f64>,
}

// ---------------------------------------------------------------------------
// Market lines
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MarketKind {
    MoneyLine,
    Spread,
    Total,
    TeamTotal,
}

impl MarketKind {
    pub const ALL: [MarketKind; 4] = [
        MarketKind::MoneyLine,
        MarketKind::Spread,
        MarketKind::Total,
        MarketKind::TeamTotal,
    ];

    /// Snapshot table the kind is written to.
    pub fn table(self) -> &'static str {
        match self {
            MarketKind::MoneyLine => "money_lines",
            MarketKind::Spread => "spreads",
            MarketKind::Total => "totals",
            MarketKind::TeamTotal => "team_totals",
        }
    }
}

impl std::fmt::Display for MarketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MarketKind::MoneyLine => "Moneyline",
            MarketKind::Spread => "Spreads",
            MarketKind::Total => "Totals",
            MarketKind::TeamTotal => "Team Totals",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MoneyLine {
    pub home: Option<f64>,
    pub draw: Option<f64>,
    pub away: Option<f64>,
    /// True when the payload carried a `draw` key at all, i.e. a 3-way market.
    pub three_way: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpreadLine {
    pub handicap: f64,
    pub alt_line_id: Option<i64>,
    pub home: Option<f64>,
    pub away: Option<f64>,
    pub max_bet: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TotalLine {
    pub points: f64,
    pub alt_line_id: Option<i64>,
    pub over: Option<f64>,
    pub under: Option<f64>,
    pub max_bet: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TeamTotalLine {
    pub team: TeamSide,
    pub points: Option<f64>,
    pub over: Option<f64>,
    pub under: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TeamSide {
    Home,
    Away,
}

impl TeamSide {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "home" => Some(TeamSide::Home),
            "away" => Some(TeamSide::Away),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TeamSide::Home => "home",
            TeamSide::Away => "away",
        }
    }
}

// ---------------------------------------------------------------------------
// Change detection keys / values
// ---------------------------------------------------------------------------

/// Numeric line value (handicap or points) usable as a hash key.
/// `-0.0` is folded into `0.0` so "0" and "-0" spreads are the same line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinePoint(u64);

impl LinePoint {
    pub fn new(v: f64) -> Self {
        let v = if v == 0.0 { 0.0 } else { v };
        LinePoint(v.to_bits())
    }

    pub fn value(self) -> f64 {
        f64::from_bits(self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Discriminator {
    /// Money lines have one line per period.
    Whole,
    Line(LinePoint),
    Team(TeamSide),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LineKey {
    pub kind: MarketKind,
    pub event_id: i64,
    pub period: i32,
    pub discriminator: Discriminator,
}

impl LineKey {
    pub fn money_line(event_id: i64, period: i32) -> Self {
        Self { kind: MarketKind::MoneyLine, event_id, period, discriminator: Discriminator::Whole }
    }

    pub fn spread(event_id: i64, period: i32, handicap: f64) -> Self {
        Self {
            kind: MarketKind::Spread,
            event_id,
            period,
            discriminator: Discriminator::Line(LinePoint::new(handicap)),
        }
    }

    pub fn total(event_id: i64, period: i32, points: f64) -> Self {
        Self {
            kind: MarketKind::Total,
            event_id,
            period,
            discriminator: Discriminator::Line(LinePoint::new(points)),
        }
    }

    pub fn team_total(event_id: i64, period: i32, team: TeamSide) -> Self {
        Self {
            kind: MarketKind::TeamTotal,
            event_id,
            period,
            discriminator: Discriminator::Team(team),
        }
    }
}

/// The change-relevant fields of one market line. Equality is over every field.
#[derive(Debug, Clone, PartialEq)]
pub enum LineValue {
    MoneyLine { home: Option<f64>, draw: Option<f64>, away: Option<f64> },
    Spread { home: Option<f64>, away: Option<f64>, max_bet: Option<f64> },
    Total { over: Option<f64>, under: Option<f64>, max_bet: Option<f64> },
    TeamTotal { points: Option<f64>, over: Option<f64>, under: Option<f64> },
}

impl From<&MoneyLine> for LineValue {
    fn from(m: &MoneyLine) -> Self {
        LineValue::MoneyLine { home: m.home, draw: m.draw, away: m.away }
    }
}

impl From<&SpreadLine> for LineValue {
    fn from(s: &SpreadLine) -> Self {
        LineValue::Spread { home: s.home, away: s.away, max_bet: s.max_bet }
    }
}

impl From<&TotalLine> for LineValue {
    fn from(t: &TotalLine) -> Self {
        LineValue::Total { over: t.over, under: t.under, max_bet: t.max_bet }
    }
}

impl From<&TeamTotalLine> for LineValue {
    fn from(t: &TeamTotalLine) -> Self {
        LineValue::TeamTotal { points: t.points, over: t.over, under: t.under }
    }
}

/// Keys of the lines that changed for one event in one pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    keys: HashSet<LineKey>,
}

impl ChangeSet {
    pub fn insert(&mut self, key: LineKey) {
        self.keys.insert(key);
    }

    pub fn contains(&self, key: &LineKey) -> bool {
        self.keys.contains(key)
    }

    /// Human-readable summary: "Moneyline, Spreads (handicaps: [-1.5, 0.5]), Team Totals (home)".
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        for kind in MarketKind::ALL {
            let mut discriminators: Vec<Discriminator> = self
                .keys
                .iter()
                .filter(|k| k.kind == kind)
                .map(|k| k.discriminator)
                .collect();
            if discriminators.is_empty() {
                continue;
            }
            discriminators.sort();
            discriminators.dedup();
            match kind {
                MarketKind::MoneyLine => parts.push(kind.to_string()),
                MarketKind::Spread | MarketKind::Total => {
                    let mut lines: Vec<f64> = discriminators
                        .iter()
                        .filter_map(|d| match d {
                            Discriminator::Line(p) => Some(p.value()),
                            _ => None,
                        })
                        .collect();
                    lines.sort_by(f64::total_cmp);
                    let label = if kind == MarketKind::Spread { "handicaps" } else { "points" };
                    parts.push(format!("{kind} ({label}: {lines:?})"));
                }
                MarketKind::TeamTotal => {
                    let teams: Vec<&str> = discriminators
                        .iter()
                        .filter_map(|d| match d {
                            Discriminator::Team(t) => Some(t.as_str()),
                            _ => None,
                        })
                        .collect();
                    parts.push(format!("{kind} ({})", teams.join(", ")));
                }
            }
        }
        parts.join(", ")
    }
}

// ---------------------------------------------------------------------------
// Cursor / notifications
// ---------------------------------------------------------------------------

/// Opaque upstream `since` token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub String);

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Published once per snapshot table written, after the event's transaction commits.
#[derive(Debug, Clone, Serialize)]
pub struct OddsUpdate {
    pub sport_id: i64,
    pub event_id: i64,
    pub home_team: String,
    pub away_team: String,
    pub table_updated: &'static str,
    pub update_time: DateTime<Utc>,
}

/// Lowercased slug: parentheses dropped, spaces to dashes.
pub fn uname(text: &str) -> String {
    text.to_lowercase()
        .replace(['(', ')'], "")
        .replace(' ', "-")
        .replace("---", "-")
}

#[cfg(test)]
impl ChangeSet {
    pub(crate) fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }
}

/// A fully priced Premier League fixture with one full-time period.
#[cfg(test)]
pub(crate) fn sample_event(event_id: i64, starts: DateTime<Utc>) -> Event {
    Event {
        event_id,
        sport_id: 1,
        league_id: Some(1980),
        league_name: "England - Premier League".into(),
        starts,
        home: "Arsenal".into(),
        away: "Chelsea".into(),
        event_type: EventType::Prematch,
        parent_id: None,
        resulting_unit: Some("Regular".into()),
        is_have_odds: true,
        periods: vec![Period {
            number: 0,
            status: Some(1),
            cutoff: Some(starts),
            limits: PeriodLimits {
                max_spread: Some(5000.0),
                max_money_line: Some(3000.0),
                max_total: Some(4000.0),
                max_team_total: Some(1000.0),
            },
            line_id: Some(2_750_000_001),
            line_number: Some(0),
            money_line: Some(MoneyLine {
                home: Some(1.91),
                draw: Some(3.40),
                away: Some(4.20),
                three_way: true,
            }),
            spreads: vec![SpreadLine {
                handicap: -0.5,
                alt_line_id: None,
                home: Some(1.95),
                away: Some(1.95),
                max_bet: Some(5000.0),
            }],
            totals: vec![TotalLine {
                points: 2.5,
                alt_line_id: None,
                over: Some(1.90),
                under: Some(1.98),
                max_bet: Some(4000.0),
            }],
            team_totals: vec![TeamTotalLine {
                team: TeamSide::Home,
                points: Some(1.5),
                over: Some(1.87),
                under: Some(1.99),
            }],
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_follows_resulting_unit() {
        assert_eq!(EventCategory::from_resulting_unit(Some("Corners")), EventCategory::Corners);
        assert_eq!(EventCategory::from_resulting_unit(Some("Bookings")), EventCategory::Bookings);
        assert_eq!(EventCategory::from_resulting_unit(Some("Regular")), EventCategory::Standard);
        assert_eq!(EventCategory::from_resulting_unit(None), EventCategory::Standard);
    }

    #[test]
    fn negative_zero_line_is_the_same_key() {
        assert_eq!(LineKey::spread(1, 0, -0.0), LineKey::spread(1, 0, 0.0));
        assert_ne!(LineKey::spread(1, 0, -0.5), LineKey::spread(1, 0, 0.5));
    }

    #[test]
    fn describe_lists_kinds_in_order() {
        let mut changes = ChangeSet::default();
        changes.insert(LineKey::total(7, 0, 2.5));
        changes.insert(LineKey::spread(7, 0, 0.5));
        changes.insert(LineKey::spread(7, 1, -1.5));
        changes.insert(LineKey::money_line(7, 0));
        changes.insert(LineKey::team_total(7, 0, TeamSide::Away));
        assert_eq!(
            changes.describe(),
            "Moneyline, Spreads (handicaps: [-1.5, 0.5]), Totals (points: [2.5]), Team Totals (away)"
        );
    }

    #[test]
    fn uname_slugifies_names() {
        assert_eq!(uname("Manchester United (Corners)"), "manchester-united-corners");
        assert_eq!(uname("A - B"), "a-b");
    }
}
