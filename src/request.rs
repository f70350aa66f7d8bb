use std::fmt;

use chrono::{NaiveDate, NaiveTime};
use serde::Deserialize;
use serde_json::{Value, json};
use ulid::Ulid;

use crate::engine::{BookingRecord, Engine, EngineError, HoldRequest};
use crate::model::{Day, HoldTicket, Requester};
use crate::observability;
use crate::slots::display_time;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// Not a JSON object with a known `op`.
    Malformed(String),
    Invalid { field: &'static str, reason: String },
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Malformed(e) => write!(f, "malformed request: {e}"),
            RequestError::Invalid { field, reason } => write!(f, "invalid {field}: {reason}"),
        }
    }
}

impl std::error::Error for RequestError {}

fn invalid(field: &'static str, reason: impl Into<String>) -> RequestError {
    RequestError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Party size from an int, an integral float or a string of digits.
pub fn party_size(value: &Value) -> Result<u32, RequestError> {
    let n = match value {
        Value::Number(n) => match n.as_u64() {
            Some(n) => Some(n),
            None => n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64),
        },
        Value::String(s) => {
            let s = s.trim();
            if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) {
                s.parse().ok()
            } else {
                None
            }
        }
        _ => None,
    };
    n.and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| invalid("party_size", format!("expected a whole number, got {value}")))
}

/// Requester id from a string or a number. Missing means a placeholder.
pub fn requester(value: &Value) -> Result<Requester, RequestError> {
    match value {
        Value::Null => Ok(Requester::parse("")),
        Value::String(s) => Ok(Requester::parse(s)),
        Value::Number(n) => match n.as_u64() {
            Some(n) => Ok(Requester::parse(&n.to_string())),
            None => n
                .as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= 0.0)
                .map(|f| Requester::parse(&format!("{f:.0}")))
                .ok_or_else(|| invalid("requester", format!("not an identifier: {n}"))),
        },
        other => Err(invalid("requester", format!("not an identifier: {other}"))),
    }
}

/// `dd/mm/yyyy` or ISO `yyyy-mm-dd`.
pub fn day(value: &Value) -> Result<Day, RequestError> {
    let s = value
        .as_str()
        .ok_or_else(|| invalid("date", format!("expected a string, got {value}")))?
        .trim();
    Day::parse(s)
        .or_else(|| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok().map(Day::new))
        .ok_or_else(|| invalid("date", format!("unrecognized date {s:?}")))
}

/// `HH:MM`, `HH:MM:SS` or `hh:mm AM/PM`.
pub fn time(field: &'static str, value: &Value) -> Result<NaiveTime, RequestError> {
    let s = value
        .as_str()
        .ok_or_else(|| invalid(field, format!("expected a string, got {value}")))?
        .trim();
    ["%H:%M", "%H:%M:%S", "%I:%M %p"]
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(s, fmt).ok())
        .ok_or_else(|| invalid(field, format!("unrecognized time {s:?}")))
}

fn hold_id(value: &str) -> Result<Ulid, RequestError> {
    Ulid::from_string(value.trim()).map_err(|e| invalid("hold_id", e.to_string()))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum RawCommand {
    Hold {
        date: Value,
        start: Value,
        end: Value,
        party_size: Value,
        #[serde(default)]
        requester: Value,
    },
    Finalize {
        hold_id: String,
        requester: Value,
    },
    Release {
        hold_id: String,
    },
    Cancel {
        requester: Value,
        date: Value,
    },
    Exists {
        requester: Value,
        date: Value,
    },
    Availability {
        date: Value,
        start: Value,
        end: Value,
        party_size: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Hold(HoldRequest),
    Finalize { hold_id: Ulid, requester: Requester },
    Release { hold_id: Ulid },
    Cancel { requester: Requester, day: Day },
    Exists { requester: Requester, day: Day },
    Availability {
        day: Day,
        start: NaiveTime,
        end: NaiveTime,
        party_size: u32,
    },
}

impl Command {
    pub fn label(&self) -> &'static str {
        match self {
            Command::Hold(_) => "hold",
            Command::Finalize { .. } => "finalize",
            Command::Release { .. } => "release",
            Command::Cancel { .. } => "cancel",
            Command::Exists { .. } => "exists",
            Command::Availability { .. } => "availability",
        }
    }
}

impl TryFrom<RawCommand> for Command {
    type Error = RequestError;

    fn try_from(raw: RawCommand) -> Result<Self, Self::Error> {
        Ok(match raw {
            RawCommand::Hold {
                date,
                start,
                end,
                party_size: size,
                requester: who,
            } => Command::Hold(HoldRequest {
                day: day(&date)?,
                start: time("start", &start)?,
                end: time("end", &end)?,
                party_size: party_size(&size)?,
                requester: requester(&who)?,
            }),
            RawCommand::Finalize { hold_id: id, requester: who } => Command::Finalize {
                hold_id: hold_id(&id)?,
                requester: requester(&who)?,
            },
            RawCommand::Release { hold_id: id } => Command::Release { hold_id: hold_id(&id)? },
            RawCommand::Cancel { requester: who, date } => Command::Cancel {
                requester: requester(&who)?,
                day: day(&date)?,
            },
            RawCommand::Exists { requester: who, date } => Command::Exists {
                requester: requester(&who)?,
                day: day(&date)?,
            },
            RawCommand::Availability {
                date,
                start,
                end,
                party_size: size,
            } => Command::Availability {
                day: day(&date)?,
                start: time("start", &start)?,
                end: time("end", &end)?,
                party_size: party_size(&size)?,
            },
        })
    }
}

pub fn parse_command(line: &str) -> Result<Command, RequestError> {
    let raw: RawCommand =
        serde_json::from_str(line).map_err(|e| RequestError::Malformed(e.to_string()))?;
    Command::try_from(raw)
}

fn ticket_json(ticket: &HoldTicket) -> Value {
    json!({
        "id": ticket.id.to_string(),
        "date": ticket.day.to_string(),
        "room_id": ticket.room_id,
        "room_type": ticket.bucket.display_name(),
        "start": display_time(ticket.start),
        "end": display_time(ticket.end),
        "slots": ticket.slots,
        "owner": ticket.owner.id(),
        "expires_at": ticket.expires_at,
    })
}

fn booking_json(record: &BookingRecord) -> Value {
    json!({
        "booking_id": record.booking_id,
        "requester_id": record.requester_id,
        "date": record.day.to_string(),
        "start": display_time(record.start),
        "end": display_time(record.end),
        "room_type": record.bucket.code(),
        "room_id": record.room_id,
        "slots": record.slots,
        "created_at": record.created_at,
        "status": record.status.as_str(),
    })
}

fn error_json(kind: &str, message: &str) -> Value {
    json!({ "ok": false, "error": kind, "message": message })
}

/// Run a parsed command and render the response object.
pub async fn execute(engine: &Engine, command: Command) -> Value {
    let result: Result<Value, EngineError> = match command {
        Command::Hold(req) => engine
            .hold_room(req)
            .await
            .map(|ticket| json!({ "ok": true, "hold": ticket_json(&ticket) })),
        Command::Finalize { hold_id, requester } => engine
            .finalize_by_id(hold_id, &requester)
            .await
            .map(|record| json!({ "ok": true, "booking": booking_json(&record) })),
        Command::Release { hold_id } => engine
            .release_hold(hold_id)
            .await
            .map(|cells| json!({ "ok": true, "released": cells })),
        Command::Cancel { requester, day } => engine
            .cancel(&requester, day)
            .await
            .map(|n| json!({ "ok": true, "cancelled": n })),
        Command::Exists { requester, day } => engine
            .active_booking_exists(&requester, day)
            .await
            .map(|exists| json!({ "ok": true, "exists": exists })),
        Command::Availability {
            day,
            start,
            end,
            party_size,
        } => engine
            .available_rooms(day, start, end, party_size)
            .await
            .map(|rooms| {
                let ids: Vec<&str> = rooms.iter().map(|r| r.id.as_str()).collect();
                json!({ "ok": true, "rooms": ids })
            }),
    };
    result.unwrap_or_else(|e| error_json(e.kind(), &e.to_string()))
}

/// Parse and run one JSON line.
pub async fn handle_line(engine: &Engine, line: &str) -> Value {
    let command = match parse_command(line) {
        Ok(command) => command,
        Err(e) => {
            metrics::counter!(observability::COMMANDS_TOTAL, "op" => "unknown", "status" => "bad_request")
                .increment(1);
            return error_json("bad_request", &e.to_string());
        }
    };
    let op = command.label();
    let response = execute(engine, command).await;
    let status = if response["ok"] == Value::Bool(true) { "ok" } else { "error" };
    metrics::counter!(observability::COMMANDS_TOTAL, "op" => op, "status" => status).increment(1);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Bucket, Catalog};
    use crate::engine::EngineConfig;
    use crate::store::LocalStore;
    use std::sync::Arc;

    #[test]
    fn party_size_forms() {
        assert_eq!(party_size(&json!(5)), Ok(5));
        assert_eq!(party_size(&json!(5.0)), Ok(5));
        assert_eq!(party_size(&json!(" 7 ")), Ok(7));
        assert!(party_size(&json!(5.5)).is_err());
        assert!(party_size(&json!("five")).is_err());
        assert!(party_size(&json!("-3")).is_err());
        assert!(party_size(&json!(null)).is_err());
    }

    #[test]
    fn requester_forms() {
        assert_eq!(requester(&json!(1234567)), Ok(Requester::Verified("1234567".into())));
        assert_eq!(requester(&json!(1234567.0)), Ok(Requester::Verified("1234567".into())));
        assert_eq!(requester(&json!("1234567")), Ok(Requester::Verified("1234567".into())));
        assert_eq!(requester(&json!(null)), Ok(Requester::Placeholder("PENDING".into())));
        assert!(requester(&json!([1])).is_err());
    }

    #[test]
    fn day_and_time_forms() {
        let expected = Day::from_ymd(2025, 6, 2).unwrap();
        assert_eq!(day(&json!("02/06/2025")), Ok(expected));
        assert_eq!(day(&json!("2025-06-02")), Ok(expected));
        assert!(day(&json!("tomorrow")).is_err());

        let two_pm = NaiveTime::from_hms_opt(14, 0, 0).unwrap();
        assert_eq!(time("start", &json!("14:00")), Ok(two_pm));
        assert_eq!(time("start", &json!("14:00:00")), Ok(two_pm));
        assert_eq!(time("start", &json!("02:00 PM")), Ok(two_pm));
        assert!(matches!(
            time("end", &json!(14)),
            Err(RequestError::Invalid { field: "end", .. })
        ));
    }

    #[test]
    fn parse_hold_command() {
        let cmd = parse_command(
            r#"{"op":"hold","date":"02/06/2025","start":"14:00","end":"16:00","party_size":"5","requester":1234567}"#,
        )
        .unwrap();
        let Command::Hold(req) = cmd else {
            panic!("expected hold, got {cmd:?}");
        };
        assert_eq!(req.party_size, 5);
        assert_eq!(req.requester, Requester::Verified("1234567".into()));

        assert!(matches!(parse_command(r#"{"op":"teleport"}"#), Err(RequestError::Malformed(_))));
        assert!(matches!(
            parse_command(r#"{"op":"release","hold_id":"nope"}"#),
            Err(RequestError::Invalid { field: "hold_id", .. })
        ));
    }

    #[tokio::test]
    async fn command_lines_end_to_end() {
        let store = Arc::new(LocalStore::ephemeral());
        let engine = Engine::open(
            store,
            Catalog::with_counts(&[(Bucket::Medium, 2)]),
            EngineConfig::default(),
        )
        .await
        .unwrap();

        let held = handle_line(
            &engine,
            r#"{"op":"hold","date":"2030-06-02","start":"14:00","end":"16:00","party_size":5,"requester":"1234567"}"#,
        )
        .await;
        assert_eq!(held["ok"], json!(true));
        assert_eq!(held["hold"]["room_id"], json!("M-01"));
        assert_eq!(held["hold"]["slots"], json!([13, 14, 15, 16]));

        let id = held["hold"]["id"].as_str().unwrap().to_string();
        let booked = handle_line(
            &engine,
            &format!(r#"{{"op":"finalize","hold_id":"{id}","requester":"1234567"}}"#),
        )
        .await;
        assert_eq!(booked["ok"], json!(true));
        assert_eq!(booked["booking"]["room_type"], json!("DISCUSSION-M"));
        assert_eq!(booked["booking"]["start"], json!("02:00 PM"));

        let exists = handle_line(&engine, r#"{"op":"exists","requester":1234567,"date":"02/06/2030"}"#).await;
        assert_eq!(exists["exists"], json!(true));

        let rooms = handle_line(
            &engine,
            r#"{"op":"availability","date":"02/06/2030","start":"15:00","end":"15:30","party_size":4}"#,
        )
        .await;
        assert_eq!(rooms["rooms"], json!(["M-02"]));

        let again = handle_line(
            &engine,
            r#"{"op":"hold","date":"02/06/2030","start":"09:00","end":"10:00","party_size":5,"requester":"1234567"}"#,
        )
        .await;
        assert_eq!(again["error"], json!("already_booked"));

        let cancelled = handle_line(&engine, r#"{"op":"cancel","requester":"1234567","date":"02/06/2030"}"#).await;
        assert_eq!(cancelled["cancelled"], json!(1));

        let bad = handle_line(&engine, "not json").await;
        assert_eq!(bad["error"], json!("bad_request"));
    }
}
