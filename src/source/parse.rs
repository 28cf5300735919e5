use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::error::{FetchError, MalformedEvent};
use crate::types::{
    Cursor, Event, EventType, MoneyLine, Period, PeriodLimits, SpreadLine, TeamSide,
    TeamTotalLine, TotalLine,
};

/// One decoded poll: the events that parsed, the ones that did not, and the
/// cursor to use for the next poll.
#[derive(Debug, Default)]
pub struct FeedBatch {
    pub events: Vec<Event>,
    pub malformed: Vec<MalformedEvent>,
    pub cursor: Option<Cursor>,
}

/// Decode a markets response. Only a body that is not an object, or an
/// `events` field that is not an array, fails the whole batch.
pub fn parse_feed(v: &Value) -> Result<FeedBatch, FetchError> {
    let obj = v
        .as_object()
        .ok_or_else(|| FetchError::Malformed("response is not a JSON object".to_string()))?;

    let cursor = obj.get("last").and_then(cursor_from);

    let items = match obj.get("events") {
        None | Some(Value::Null) => return Ok(FeedBatch { cursor, ..Default::default() }),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(FetchError::Malformed("`events` is not an array".to_string())),
    };

    let mut batch = FeedBatch { cursor, ..Default::default() };
    for item in items {
        match parse_event(item) {
            Ok(event) => batch.events.push(event),
            Err(bad) => batch.malformed.push(bad),
        }
    }
    Ok(batch)
}

/// Decode the sports listing: `[{"id": 1, ...}, ...]`.
pub fn parse_sport_ids(v: &Value) -> Result<Vec<i64>, FetchError> {
    let items = v
        .as_array()
        .ok_or_else(|| FetchError::Malformed("sports response is not an array".to_string()))?;
    Ok(items.iter().filter_map(|s| s.get("id").and_then(int)).collect())
}

fn cursor_from(v: &Value) -> Option<Cursor> {
    match v {
        Value::Number(n) => Some(Cursor(n.to_string())),
        Value::String(s) if !s.is_empty() => Some(Cursor(s.clone())),
        _ => None,
    }
}

pub fn parse_event(v: &Value) -> Result<Event, MalformedEvent> {
    let event_id = v.get("event_id").and_then(int);
    let bad = |reason: &str| MalformedEvent { event_id, reason: reason.to_string() };

    let event_id = event_id.ok_or_else(|| bad("missing event_id"))?;
    let sport_id = v.get("sport_id").and_then(int).ok_or_else(|| bad("missing sport_id"))?;
    let starts = v
        .get("starts")
        .and_then(|s| s.as_str())
        .and_then(parse_instant)
        .ok_or_else(|| bad("missing or unparseable starts"))?;
    let home = text(v, "home").ok_or_else(|| bad("missing home"))?;
    let away = text(v, "away").ok_or_else(|| bad("missing away"))?;

    let periods = match v.get("periods") {
        Some(Value::Object(map)) => map
            .iter()
            .filter_map(|(key, pv)| {
                let period = period_number(key).and_then(|n| parse_period(n, pv));
                if period.is_none() {
                    debug!(event_id, period_key = %key, "skipping unparseable period");
                }
                period
            })
            .collect(),
        _ => Vec::new(),
    };

    Ok(Event {
        event_id,
        sport_id,
        league_id: v.get("league_id").and_then(int),
        league_name: text(v, "league_name").unwrap_or_default(),
        starts,
        home,
        away,
        event_type: text(v, "event_type")
            .map(|s| EventType::parse(&s))
            .unwrap_or(EventType::Prematch),
        parent_id: v.get("parent_id").and_then(int),
        resulting_unit: text(v, "resulting_unit"),
        is_have_odds: v.get("is_have_odds").and_then(|b| b.as_bool()).unwrap_or(true),
        periods,
    })
}

/// `num_3` → 3
fn period_number(key: &str) -> Option<i32> {
    key.strip_prefix("num_")?.parse().ok()
}

fn parse_period(number: i32, v: &Value) -> Option<Period> {
    v.as_object()?;
    let meta = v.get("meta");
    let meta_num = |field: &str| meta.and_then(|m| m.get(field)).and_then(num);

    let money_line = v.get("money_line").filter(|m| m.is_object()).map(|m| MoneyLine {
        home: m.get("home").and_then(num),
        draw: m.get("draw").and_then(num),
        away: m.get("away").and_then(num),
        three_way: m.get("draw").is_some(),
    });

    let spreads = entries(v.get("spreads"))
        .filter_map(|(key, s)| {
            let handicap = s.get("hdp").and_then(num).or_else(|| key.parse().ok())?;
            Some(SpreadLine {
                handicap,
                alt_line_id: s.get("alt_line_id").and_then(int),
                home: s.get("home").and_then(num),
                away: s.get("away").and_then(num),
                max_bet: s.get("max").and_then(num),
            })
        })
        .collect();

    let totals = entries(v.get("totals"))
        .filter_map(|(key, t)| {
            let points = t.get("points").and_then(num).or_else(|| key.parse().ok())?;
            Some(TotalLine {
                points,
                alt_line_id: t.get("alt_line_id").and_then(int),
                over: t.get("over").and_then(num),
                under: t.get("under").and_then(num),
                max_bet: t.get("max").and_then(num),
            })
        })
        .collect();

    let team_totals = entries(v.get("team_total"))
        .filter_map(|(key, t)| {
            let team = TeamSide::parse(key)?;
            Some(TeamTotalLine {
                team,
                points: t.get("points").and_then(num),
                over: t.get("over").and_then(num),
                under: t.get("under").and_then(num),
            })
        })
        .collect();

    Some(Period {
        number,
        status: v.get("period_status").and_then(int),
        cutoff: v.get("cutoff").and_then(|c| c.as_str()).and_then(parse_instant),
        limits: PeriodLimits {
            max_spread: meta_num("max_spread"),
            max_money_line: meta_num("max_money_line"),
            max_total: meta_num("max_total"),
            max_team_total: meta_num("max_team_total"),
        },
        line_id: v.get("line_id").and_then(int),
        line_number: v.get("number").and_then(int),
        money_line,
        spreads,
        totals,
        team_totals,
    })
}

/// Object members whose value is itself an object. Absent or null → empty.
fn entries<'a>(v: Option<&'a Value>) -> impl Iterator<Item = (&'a String, &'a Value)> + 'a {
    v.and_then(|m| m.as_object())
        .into_iter()
        .flat_map(|m| m.iter())
        .filter(|(_, item)| item.is_object())
}

fn num(v: &Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

fn int(v: &Value) -> Option<i64> {
    v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

fn text(v: &Value, field: &str) -> Option<String> {
    v.get(field).and_then(|s| s.as_str()).map(|s| s.to_string())
}

/// RFC 3339, or a naive `YYYY-MM-DDTHH:MM:SS[.f]` taken as UTC.
pub fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn soccer_event() -> Value {
        json!({
            "event_id": 1_590_000_001i64,
            "sport_id": 1,
            "league_id": 1980,
            "league_name": "England - Premier League",
            "starts": "2024-08-17T14:00:00",
            "home": "Arsenal",
            "away": "Wolverhampton",
            "event_type": "prematch",
            "parent_id": null,
            "resulting_unit": "Regular",
            "is_have_odds": true,
            "periods": {
                "num_0": {
                    "line_id": 2_600_000_000i64,
                    "number": 0,
                    "cutoff": "2024-08-17T14:00:00Z",
                    "period_status": 1,
                    "money_line": { "home": 1.29, "draw": 6.1, "away": 10.5 },
                    "spreads": {
                        "-1.75": { "hdp": -1.75, "alt_line_id": null, "home": 1.97, "away": 1.93, "max": 5000.0 },
                        "-1.5": { "hdp": -1.5, "alt_line_id": 91, "home": 1.8, "away": 2.11, "max": 2500.0 }
                    },
                    "totals": {
                        "3.0": { "points": 3.0, "over": 1.85, "under": 2.05, "max": 3000.0 }
                    },
                    "team_total": {
                        "home": { "points": 2.0, "over": 1.7, "under": 2.15 },
                        "away": null
                    },
                    "meta": { "number": 0, "max_spread": 5000.0, "max_money_line": 3000.0, "max_total": 3000.0, "max_team_total": 1000.0 }
                },
                "num_1": {
                    "line_id": 2_600_000_001i64,
                    "number": 1,
                    "cutoff": "2024-08-17T14:00:00Z",
                    "period_status": 1,
                    "money_line": { "home": 1.8, "draw": 2.6, "away": 6.5 },
                    "spreads": null,
                    "meta": {}
                }
            }
        })
    }

    #[test]
    fn parses_full_event() {
        let event = parse_event(&soccer_event()).unwrap();
        assert_eq!(event.event_id, 1_590_000_001);
        assert_eq!(event.starts, Utc.with_ymd_and_hms(2024, 8, 17, 14, 0, 0).unwrap());
        assert_eq!(event.event_type, EventType::Prematch);
        assert_eq!(event.periods.len(), 2);

        let full = event.periods.iter().find(|p| p.number == 0).unwrap();
        let ml = full.money_line.as_ref().unwrap();
        assert_eq!((ml.home, ml.draw, ml.away), (Some(1.29), Some(6.1), Some(10.5)));
        assert!(ml.three_way);
        assert_eq!(full.spreads.len(), 2);
        assert_eq!(full.totals[0].points, 3.0);
        assert_eq!(full.team_totals.len(), 1);
        assert_eq!(full.team_totals[0].team, TeamSide::Home);
        assert_eq!(full.limits.max_team_total, Some(1000.0));

        let half = event.periods.iter().find(|p| p.number == 1).unwrap();
        assert!(half.spreads.is_empty());
        assert!(half.totals.is_empty());
        assert_eq!(half.limits, PeriodLimits::default());
    }

    #[test]
    fn spread_handicap_falls_back_to_key() {
        let v = json!({ "spreads": { "+0.5": { "home": 1.9, "away": 1.9 } } });
        let period = parse_period(0, &v).unwrap();
        assert_eq!(period.spreads[0].handicap, 0.5);
    }

    #[test]
    fn two_way_money_line_has_no_draw_slot() {
        let v = json!({ "money_line": { "home": 1.5, "away": 2.6 } });
        let ml = parse_period(0, &v).unwrap().money_line.unwrap();
        assert!(!ml.three_way);
        assert_eq!(ml.draw, None);
    }

    #[test]
    fn feed_keeps_good_events_and_reports_bad_ones() {
        let body = json!({
            "sport_id": 1,
            "last": 1_723_900_000_123i64,
            "events": [
                soccer_event(),
                { "event_id": 42, "sport_id": 1, "home": "A" },
                { "home": "no id" }
            ]
        });
        let batch = parse_feed(&body).unwrap();
        assert_eq!(batch.cursor, Some(Cursor("1723900000123".to_string())));
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.malformed.len(), 2);
        assert_eq!(batch.malformed[0].event_id, Some(42));
        assert_eq!(batch.malformed[1].event_id, None);
    }

    #[test]
    fn feed_without_events_is_empty_not_an_error() {
        let batch = parse_feed(&json!({ "last": "abc" })).unwrap();
        assert!(batch.events.is_empty());
        assert_eq!(batch.cursor, Some(Cursor("abc".to_string())));
    }

    #[test]
    fn feed_with_wrong_shape_is_malformed() {
        assert!(matches!(parse_feed(&json!([1, 2])), Err(FetchError::Malformed(_))));
        assert!(matches!(parse_feed(&json!({ "events": {} })), Err(FetchError::Malformed(_))));
    }

    #[test]
    fn sport_ids_from_listing() {
        let v = json!([{ "id": 1, "name": "Soccer" }, { "id": "3" }, { "name": "?" }]);
        assert_eq!(parse_sport_ids(&v).unwrap(), vec![1, 3]);
    }

    #[test]
    fn instants_accept_naive_and_offset_forms() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(parse_instant("2024-01-02T03:04:05"), Some(expected));
        assert_eq!(parse_instant("2024-01-02T05:04:05+02:00"), Some(expected));
        assert_eq!(parse_instant("2024-01-02 03:04:05"), Some(expected));
        assert_eq!(parse_instant("yesterday"), None);
    }
}
