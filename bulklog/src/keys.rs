//! Store key layout.
//!
//! For collection `C` and pipe `P`:
//!
//! - `bulklog.C.buffer` - list of not-yet-flushed documents
//! - `bulklog.C.flushedAt` - RFC 3339 nanosecond timestamp of the last
//!   flush decision
//! - `bulklog.C.pipes` - namespace prefix for the collection's pipes
//! - `bulklog.C.pipes.P` - pipe metadata hash (`iteration`, `startedAt`,
//!   `flushPeriod`, `retentionPeriod`)
//! - `bulklog.C.pipes.P.buffer` - the pipe's sealed document list
//! - `bulklog.C.pipes.P.consumers` - hash of per-consumer delivery state

use uuid::Uuid;

pub(crate) fn buffer_key(collection: &str) -> String {
    format!("bulklog.{collection}.buffer")
}

pub(crate) fn flushed_at_key(collection: &str) -> String {
    format!("bulklog.{collection}.flushedAt")
}

pub(crate) fn pipe_prefix(collection: &str) -> String {
    format!("bulklog.{collection}.pipes")
}

pub(crate) fn pipe_key(prefix: &str, id: Uuid) -> String {
    format!("{prefix}.{id}")
}

pub(crate) fn pipe_buffer_key(pipe_key: &str) -> String {
    format!("{pipe_key}.buffer")
}

pub(crate) fn pipe_consumers_key(pipe_key: &str) -> String {
    format!("{pipe_key}.consumers")
}

/// Extracts the pipe id from a metadata key under `prefix`.
///
/// Returns `None` for the `.buffer` and `.consumers` companion keys (and
/// anything else that is not exactly `prefix.<uuid>`), which makes this
/// the filter for store enumeration results.
pub(crate) fn parse_pipe_id(prefix: &str, key: &str) -> Option<Uuid> {
    let rest = key.strip_prefix(prefix)?.strip_prefix('.')?;
    if rest.contains('.') {
        return None;
    }
    Uuid::parse_str(rest).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_build_collection_keys() {
        assert_eq!(buffer_key("audit"), "bulklog.audit.buffer");
        assert_eq!(flushed_at_key("audit"), "bulklog.audit.flushedAt");
        assert_eq!(pipe_prefix("audit"), "bulklog.audit.pipes");
    }

    #[test]
    fn should_build_pipe_keys() {
        // given
        let id = Uuid::new_v4();
        let prefix = pipe_prefix("audit");

        // when
        let key = pipe_key(&prefix, id);

        // then
        assert_eq!(key, format!("bulklog.audit.pipes.{id}"));
        assert_eq!(pipe_buffer_key(&key), format!("{key}.buffer"));
        assert_eq!(pipe_consumers_key(&key), format!("{key}.consumers"));
    }

    #[test]
    fn should_parse_pipe_id_from_metadata_key_only() {
        // given
        let id = Uuid::new_v4();
        let prefix = pipe_prefix("audit");
        let key = pipe_key(&prefix, id);

        // then
        assert_eq!(parse_pipe_id(&prefix, &key), Some(id));
        assert_eq!(parse_pipe_id(&prefix, &pipe_buffer_key(&key)), None);
        assert_eq!(parse_pipe_id(&prefix, &pipe_consumers_key(&key)), None);
        assert_eq!(parse_pipe_id(&prefix, "bulklog.other.pipes.xyz"), None);
        assert_eq!(parse_pipe_id(&prefix, &format!("{prefix}.not-a-uuid")), None);
    }
}
