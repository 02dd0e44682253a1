//! Redo meta encoding and file-name conventions.
//!
//! Every object the redo subsystem writes carries the changefeed in its
//! name, so sweeps work by substring match without reading contents:
//!
//! - meta: `<capture>_<namespace>_<feed>_meta_<uuid>.meta`
//! - log:  `<capture>_<namespace>_<feed>_<uuid>_<type>_<max_commit_ts>.log`
//! - deletion marker: `delete_<feed>` (default namespace) or
//!   `delete_<namespace>_<feed>`

use crate::core::error::{SluiceError, SluiceResult};
use crate::model::{CaptureId, ChangefeedId, Ts};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Extension of meta files.
pub const META_EXT: &str = ".meta";

/// Extension of redo log files.
pub const LOG_EXT: &str = ".log";

/// Content of the deletion marker object.
pub const DELETION_MARKER_CONTENT: &[u8] = b"D";

/// The durable recovery barrier of a changefeed.
///
/// Once initialized both fields are nonzero, both are monotonically
/// non-decreasing across flushes, and `checkpoint_ts ≤ resolved_ts`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMeta {
    /// Highest timestamp whose transactions are durably in the sink.
    pub checkpoint_ts: Ts,
    /// Highest timestamp below which no new upstream events can arrive.
    pub resolved_ts: Ts,
}

impl LogMeta {
    /// Encode as MessagePack.
    pub fn encode(&self) -> SluiceResult<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(SluiceError::marshal)
    }

    /// Decode from MessagePack.
    pub fn decode(data: &[u8]) -> SluiceResult<Self> {
        rmp_serde::from_slice(data).map_err(SluiceError::marshal)
    }
}

/// Reduce recovered metas into the resume point.
///
/// `checkpoint` is the maximum checkpoint seen; `resolved` is the maximum
/// resolved, raised to `checkpoint` if it lags (a crash window can leave a
/// newer checkpoint next to an older resolved).
pub fn reduce_metas(metas: &[LogMeta]) -> LogMeta {
    let checkpoint_ts = metas.iter().map(|m| m.checkpoint_ts).max().unwrap_or(0);
    let resolved_ts = metas
        .iter()
        .map(|m| m.resolved_ts)
        .max()
        .unwrap_or(0)
        .max(checkpoint_ts);
    LogMeta {
        checkpoint_ts,
        resolved_ts,
    }
}

/// Kind of a redo log file, encoded in its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFileType {
    /// Row change events.
    Row,
    /// DDL events.
    Ddl,
}

impl LogFileType {
    /// Parse the name component; `None` for unknown kinds.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "row" => Some(Self::Row),
            "ddl" => Some(Self::Ddl),
            _ => None,
        }
    }

    /// The name component for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Row => "row",
            Self::Ddl => "ddl",
        }
    }
}

/// A fresh uuid-suffixed meta file name for one flush generation.
pub fn meta_file_name(capture_id: &CaptureId, changefeed: &ChangefeedId) -> String {
    format!(
        "{}_{}_{}_meta_{}{}",
        capture_id,
        changefeed.namespace,
        changefeed.id,
        Uuid::new_v4(),
        META_EXT
    )
}

/// A redo log file name encoding its kind and highest commit timestamp.
pub fn log_file_name(
    capture_id: &CaptureId,
    changefeed: &ChangefeedId,
    file_type: LogFileType,
    max_commit_ts: Ts,
) -> String {
    format!(
        "{}_{}_{}_{}_{}_{}{}",
        capture_id,
        changefeed.namespace,
        changefeed.id,
        Uuid::new_v4(),
        file_type.as_str(),
        max_commit_ts,
        LOG_EXT
    )
}

/// Extract `(max_commit_ts, file-type component)` from a log file path.
///
/// Components are parsed from the end of the name, so changefeed ids that
/// contain underscores stay unambiguous.
pub fn parse_log_file_name(path: &str) -> SluiceResult<(Ts, String)> {
    let name = path.rsplit('/').next().unwrap_or(path);
    let stem = name.strip_suffix(LOG_EXT).ok_or_else(|| {
        SluiceError::invalid_config(format!("{path:?} is not a redo log file name"))
    })?;

    let mut parts = stem.rsplit('_');
    let commit_ts = parts
        .next()
        .and_then(|ts| ts.parse::<Ts>().ok())
        .ok_or_else(|| {
            SluiceError::invalid_config(format!("{path:?} has no commit timestamp component"))
        })?;
    let file_type = parts.next().ok_or_else(|| {
        SluiceError::invalid_config(format!("{path:?} has no file type component"))
    })?;

    Ok((commit_ts, file_type.to_string()))
}

/// Substring every object of a changefeed carries in its name.
pub fn changefeed_matcher(changefeed: &ChangefeedId) -> String {
    if changefeed.is_default_namespace() {
        format!("_{}_", changefeed.id)
    } else {
        format!("_{}_{}_", changefeed.namespace, changefeed.id)
    }
}

/// Name of the marker object left by an interrupted cleanup.
pub fn deletion_marker(changefeed: &ChangefeedId) -> String {
    if changefeed.is_default_namespace() {
        format!("delete_{}", changefeed.id)
    } else {
        format!("delete_{}_{}", changefeed.namespace, changefeed.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed() -> ChangefeedId {
        ChangefeedId::in_default_namespace("orders")
    }

    #[test]
    fn log_meta_round_trips_through_msgpack() {
        let meta = LogMeta {
            checkpoint_ts: 42,
            resolved_ts: 99,
        };
        let decoded = LogMeta::decode(&meta.encode().unwrap()).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn reduce_takes_maxima_and_lifts_resolved() {
        let merged = reduce_metas(&[
            LogMeta {
                checkpoint_ts: 10,
                resolved_ts: 20,
            },
            LogMeta {
                checkpoint_ts: 30,
                resolved_ts: 25,
            },
        ]);
        assert_eq!(merged.checkpoint_ts, 30);
        assert_eq!(merged.resolved_ts, 30);
    }

    #[test]
    fn meta_file_names_match_the_feed_and_are_unique() {
        let a = meta_file_name(&"cap-1".to_string(), &feed());
        let b = meta_file_name(&"cap-1".to_string(), &feed());
        assert_ne!(a, b);
        assert!(a.starts_with("cap-1_default_orders_meta_"));
        assert!(a.ends_with(META_EXT));
        assert!(a.contains(&changefeed_matcher(&feed())));
    }

    #[test]
    fn log_file_names_parse_back() {
        let name = log_file_name(&"cap-1".to_string(), &feed(), LogFileType::Ddl, 12345);
        let (commit_ts, file_type) = parse_log_file_name(&name).unwrap();
        assert_eq!(commit_ts, 12345);
        assert_eq!(LogFileType::parse(&file_type), Some(LogFileType::Ddl));
    }

    #[test]
    fn log_file_parse_survives_underscored_feed_ids() {
        let feed = ChangefeedId::new("team_a", "order_events");
        let name = log_file_name(&"cap_1".to_string(), &feed, LogFileType::Row, 7);
        let (commit_ts, file_type) = parse_log_file_name(&name).unwrap();
        assert_eq!(commit_ts, 7);
        assert_eq!(file_type, "row");
    }

    #[test]
    fn parse_rejects_foreign_names() {
        assert!(parse_log_file_name("delete_orders").is_err());
        assert!(parse_log_file_name("cap_default_orders_row_abc_u.log").is_err());
    }

    #[test]
    fn matcher_and_marker_elide_the_default_namespace() {
        assert_eq!(changefeed_matcher(&feed()), "_orders_");
        assert_eq!(deletion_marker(&feed()), "delete_orders");

        let named = ChangefeedId::new("team-a", "orders");
        assert_eq!(changefeed_matcher(&named), "_team-a_orders_");
        assert_eq!(deletion_marker(&named), "delete_team-a_orders");
    }

    #[test]
    fn marker_does_not_match_its_own_feed_matcher() {
        // Sweeps filter by matcher; the marker must survive them so an
        // interrupted cleanup can be detected at the next startup.
        let marker = deletion_marker(&feed());
        assert!(!marker.contains(&changefeed_matcher(&feed())));
    }
}
