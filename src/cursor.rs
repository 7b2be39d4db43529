//! Ordering keys and the combined resume cursor.
//!
//! Progress is always measured by timestamp. Identity fields only break
//! ties between records that share a timestamp, so an unordered random id
//! can never stall forward progress.
//!
//! The cursor handed to clients is opaque: base64 (URL-safe) over a compact
//! JSON document with microsecond timestamps, the resolution of the store.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::ExecutionId;

/// Token format version. Bump when the encoded layout changes.
const TOKEN_VERSION: u8 = 2;

/// Position in the coarse (status transition) subsequence.
///
/// Same shape as [`LineKey`]: transitions of one execution are numbered, so
/// two changes recorded at the same instant still have distinct keys and a
/// terminal change always sorts after the one before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatusKey {
    pub at: DateTime<Utc>,
    pub seq: i64,
    pub execution_id: ExecutionId,
}

/// Position in the fine (line) subsequence.
///
/// Field order matters: the derived `Ord` compares timestamp, then sequence
/// number, then execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LineKey {
    pub at: DateTime<Utc>,
    pub seq: i64,
    pub execution_id: ExecutionId,
}

impl std::fmt::Display for StatusKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}#{}/{}",
            self.at.to_rfc3339(),
            self.seq,
            self.execution_id
        )
    }
}

impl std::fmt::Display for LineKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}#{}/{}",
            self.at.to_rfc3339(),
            self.seq,
            self.execution_id
        )
    }
}

/// Everything already delivered to one consumer, per subsequence.
///
/// `None` in a field means nothing from that subsequence has been consumed.
/// An empty cursor therefore resumes from the start of the log, which is
/// different from having no cursor at all (a fresh subscription).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    pub status: Option<StatusKey>,
    pub line: Option<LineKey>,
}

impl Cursor {
    /// Resume from the beginning of the log.
    pub fn start() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.line.is_none()
    }

    /// Move the status position forward. Never moves backwards.
    pub fn advance_status(&mut self, key: StatusKey) {
        if self.status.is_none_or(|cur| key > cur) {
            self.status = Some(key);
        }
    }

    /// Move the line position forward. Never moves backwards.
    pub fn advance_line(&mut self, key: LineKey) {
        if self.line.is_none_or(|cur| key > cur) {
            self.line = Some(key);
        }
    }

    pub fn encode(&self) -> String {
        let wire = WireCursor {
            v: TOKEN_VERSION,
            s: self
                .status
                .map(|k| (k.at.timestamp_micros(), k.seq, k.execution_id.0)),
            l: self
                .line
                .map(|k| (k.at.timestamp_micros(), k.seq, k.execution_id.0)),
        };
        // Serializing plain integers and UUIDs cannot fail.
        let json = serde_json::to_vec(&wire).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(token: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|e| Error::InvalidCursor(format!("not base64: {e}")))?;
        let wire: WireCursor = serde_json::from_slice(&bytes)
            .map_err(|e| Error::InvalidCursor(format!("malformed: {e}")))?;
        if wire.v != TOKEN_VERSION {
            return Err(Error::InvalidCursor(format!(
                "unsupported version {}",
                wire.v
            )));
        }

        let status = match wire.s {
            Some((micros, seq, id)) => Some(StatusKey {
                at: from_micros(micros)?,
                seq,
                execution_id: ExecutionId(id),
            }),
            None => None,
        };
        let line = match wire.l {
            Some((micros, seq, id)) => Some(LineKey {
                at: from_micros(micros)?,
                seq,
                execution_id: ExecutionId(id),
            }),
            None => None,
        };
        Ok(Self { status, line })
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl std::str::FromStr for Cursor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Cursor::decode(s)
    }
}

#[derive(Serialize, Deserialize)]
struct WireCursor {
    v: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    s: Option<(i64, i64, Uuid)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    l: Option<(i64, i64, Uuid)>,
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| Error::InvalidCursor(format!("timestamp out of range: {micros}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{SubsecRound, TimeZone};

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    #[test]
    fn token_preserves_both_positions() {
        let mut cursor = Cursor::start();
        cursor.advance_status(StatusKey {
            at: Utc::now().trunc_subsecs(6),
            seq: 1,
            execution_id: ExecutionId::new(),
        });
        cursor.advance_line(LineKey {
            at: at(1),
            seq: 7,
            execution_id: ExecutionId::new(),
        });

        let decoded = Cursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn empty_cursor_is_distinct_token() {
        let token = Cursor::start().encode();
        let decoded: Cursor = token.parse().unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn garbage_tokens_are_rejected() {
        assert!(matches!(
            Cursor::decode("%%%"),
            Err(Error::InvalidCursor(_))
        ));
        let not_json = URL_SAFE_NO_PAD.encode(b"hello");
        assert!(matches!(
            Cursor::decode(&not_json),
            Err(Error::InvalidCursor(_))
        ));
        let future = URL_SAFE_NO_PAD.encode(br#"{"v":9}"#);
        assert!(matches!(
            Cursor::decode(&future),
            Err(Error::InvalidCursor(_))
        ));
    }

    #[test]
    fn tokens_from_the_previous_layout_are_rejected() {
        let old = URL_SAFE_NO_PAD.encode(
            br#"{"v":1,"s":[1700000000000000,"00000000-0000-0000-0000-000000000001"]}"#,
        );
        assert!(matches!(Cursor::decode(&old), Err(Error::InvalidCursor(_))));
    }

    #[test]
    fn later_transition_at_the_same_instant_sorts_after() {
        let id = ExecutionId(Uuid::from_u128(1));
        let running = StatusKey { at: at(0), seq: 0, execution_id: id };
        let completed = StatusKey { at: at(0), seq: 1, execution_id: id };
        assert!(running < completed);

        let mut cursor = Cursor::start();
        cursor.advance_status(running);
        cursor.advance_status(completed);
        assert_eq!(cursor.status, Some(completed));
    }

    #[test]
    fn line_keys_order_by_time_then_seq() {
        let a = ExecutionId(Uuid::from_u128(2));
        let b = ExecutionId(Uuid::from_u128(1));
        let first = LineKey { at: at(1), seq: 0, execution_id: a };
        let second = LineKey { at: at(1), seq: 1, execution_id: b };
        let third = LineKey { at: at(2), seq: 0, execution_id: b };
        assert!(first < second && second < third);
    }

    #[test]
    fn advance_never_moves_backwards() {
        let id = ExecutionId::new();
        let mut cursor = Cursor::start();
        cursor.advance_status(StatusKey { at: at(5), seq: 1, execution_id: id });
        cursor.advance_status(StatusKey { at: at(3), seq: 0, execution_id: id });
        assert_eq!(cursor.status.unwrap().at, at(5));
    }
}
