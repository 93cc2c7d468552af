//! Cursores opacos para paginación keyset.
//!
//! El cursor codifica `(timestamp, id)` de la última fila servida en base64
//! URL-safe; el cliente lo devuelve intacto. Un cursor ilegible se trata
//! como 400.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub const DEFAULT_LIMIT: i64 = 50;
pub const MAX_LIMIT: i64 = 500;

pub fn encode_cursor(ts: DateTime<Utc>, id: Uuid) -> String {
    URL_SAFE_NO_PAD.encode(format!("{}|{id}", ts.to_rfc3339()))
}

pub fn decode_cursor(raw: &str) -> Option<(DateTime<Utc>, Uuid)> {
    let bytes = URL_SAFE_NO_PAD.decode(raw).ok()?;
    let s = String::from_utf8(bytes).ok()?;
    let (ts_raw, id_raw) = s.split_once('|')?;
    let ts = DateTime::parse_from_rfc3339(ts_raw).ok()?.with_timezone(&Utc);
    let id = Uuid::parse_str(id_raw).ok()?;
    Some((ts, id))
}

pub fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trips() {
        let ts = Utc::now();
        let id = Uuid::new_v4();
        let cursor = encode_cursor(ts, id);
        let (ts2, id2) = decode_cursor(&cursor).unwrap();
        assert_eq!(id2, id);
        assert!((ts2 - ts).num_milliseconds().abs() < 1);
    }

    #[test]
    fn garbage_cursors_decode_to_none() {
        assert!(decode_cursor("no-es-base64!").is_none());
        assert!(decode_cursor("").is_none());
        let sin_pipe = URL_SAFE_NO_PAD.encode("abc");
        assert!(decode_cursor(&sin_pipe).is_none());
    }

    #[test]
    fn limits_are_clamped() {
        assert_eq!(clamp_limit(None), DEFAULT_LIMIT);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(10_000)), MAX_LIMIT);
        assert_eq!(clamp_limit(Some(25)), 25);
    }
}
