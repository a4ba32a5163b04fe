use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::app::AppKind;
use crate::argval::ArgValue;
use crate::state::TaskState;

/// Captured standard streams are truncated at this many bytes.
pub const STREAM_CAP: usize = 64 * 1024;

/// Pointer into the result cache, set iff the record is `Succeeded`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRef {
    pub path: PathBuf,
    pub fingerprint: String,
}

/// One enqueued unit of work, as read back from the queue store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Queue-unique, monotonic.
    pub id: i64,
    pub app_name: String,
    pub kind: AppKind,
    pub code_blob: String,
    /// Positional arguments, with future placeholders unresolved.
    pub args: Vec<ArgValue>,
    /// Named arguments, same template form.
    pub kwargs: BTreeMap<String, ArgValue>,
    /// Ids this record awaits, in order of appearance in the arguments.
    pub dep_ids: Vec<i64>,
    pub fingerprint: String,
    pub state: TaskState,
    /// Zero on success.
    pub errno: i32,
    pub out: String,
    pub err: String,
    pub result_ref: Option<ResultRef>,
    /// Provider-issued worker identifier.
    pub jobid: Option<String>,
    pub created_at: NaiveDateTime,
    pub started_at: Option<NaiveDateTime>,
    pub finished_at: Option<NaiveDateTime>,
}

/// Insert form of a record; the store assigns the id and timestamps.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub app_name: String,
    pub kind: AppKind,
    pub code_blob: String,
    pub args: Vec<ArgValue>,
    pub kwargs: BTreeMap<String, ArgValue>,
    pub dep_ids: Vec<i64>,
    pub fingerprint: String,
    /// Cache hits insert directly `Succeeded` with the cached payload's
    /// streams; everything else starts `Waiting`/`Pending` per deps.
    pub cached: Option<CachedInsert>,
}

/// What a cache-hit insert carries along.
#[derive(Debug, Clone)]
pub struct CachedInsert {
    pub result_ref: ResultRef,
    pub out: String,
    pub err: String,
}

/// Truncate a captured stream at `STREAM_CAP`, on a char boundary.
pub fn truncate_stream(s: &str) -> String {
    if s.len() <= STREAM_CAP {
        return s.to_string();
    }
    let mut end = STREAM_CAP;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_cap_and_boundaries() {
        let short = "hello";
        assert_eq!(truncate_stream(short), "hello");

        let long = "é".repeat(STREAM_CAP); // 2 bytes each
        let cut = truncate_stream(&long);
        assert!(cut.len() <= STREAM_CAP);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
