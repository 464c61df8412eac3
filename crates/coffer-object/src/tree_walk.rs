//! Lazy, sorted, depth-first namespace traversal.
//!
//! A walk descends from the directory implied by the listing prefix and
//! produces entries in strict lexicographic order over a bounded channel.
//! The producer selects on its cancel channel at every send, so closing the
//! cancel side (directly or through the pool timer) terminates it promptly.

use async_trait::async_trait;
use coffer_common::{StorageError, StorageResult, MAX_OBJECT_LIST, SLASH_SEPARATOR};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// One traversal result; `end` marks the last value of the walk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeWalkResult {
    pub entry: String,
    pub end: bool,
}

/// Items flowing through the walk channel: entries, or the error that
/// terminated the walk.
pub type TreeWalkItem = Result<TreeWalkResult, StorageError>;

/// Directory listing and leaf detection for the walker.
///
/// `list_dir` returns raw, unsorted children with directories suffixed by
/// `/`. `is_leaf` decides whether a directory-shaped path is really an
/// object (and should lose its trailing slash in listings).
#[async_trait]
pub trait TreeWalkSource: Send + Sync + 'static {
    async fn list_dir(&self, volume: &str, dir_path: &str) -> StorageResult<Vec<String>>;
    async fn is_leaf(&self, volume: &str, path: &str) -> bool;
}

/// Keep only entries sharing `prefix_entry`. Entries must be sorted, so the
/// matching run is contiguous and can be narrowed from both ends.
#[must_use]
pub fn filter_matching_prefix(entries: Vec<String>, prefix_entry: &str) -> Vec<String> {
    let mut start = 0;
    let mut end = entries.len();
    while start < end && !entries[start].starts_with(prefix_entry) {
        start += 1;
    }
    while start < end && !entries[end - 1].starts_with(prefix_entry) {
        end -= 1;
    }
    entries[start..end].to_vec()
}

/// Whether leaf checks can be deferred to emit time for this (sorted)
/// listing. They cannot when an entry extends its successor's slash-trimmed
/// name, because trimming the trailing slash would then reorder the run.
#[must_use]
pub fn delay_is_leaf_check(entries: &[String]) -> bool {
    for pair in entries.windows(2) {
        let entry = &pair[0];
        let next_trimmed = pair[1].trim_end_matches(SLASH_SEPARATOR);
        if entry.starts_with(next_trimmed) {
            return false;
        }
    }
    true
}

/// List, sort and prefix-filter a directory, resolving leaf-ness eagerly
/// unless the listing allows delaying it.
async fn filtered_list_dir(
    source: &dyn TreeWalkSource,
    volume: &str,
    dir_path: &str,
    prefix_entry: &str,
) -> StorageResult<(Vec<String>, bool)> {
    let mut entries = source.list_dir(volume, dir_path).await?;
    entries.sort();
    let mut entries = filter_matching_prefix(entries, prefix_entry);
    if delay_is_leaf_check(&entries) {
        return Ok((entries, true));
    }
    for entry in &mut entries {
        if entry.ends_with(SLASH_SEPARATOR) {
            let full = format!("{dir_path}{entry}");
            if source.is_leaf(volume, &full).await {
                entry.pop();
            }
        }
    }
    // Trimming slashes can reorder the run.
    entries.sort();
    Ok((entries, false))
}

async fn send_item(
    tx: &mpsc::Sender<TreeWalkItem>,
    cancel: &mut watch::Receiver<bool>,
    item: TreeWalkItem,
) -> Result<(), ()> {
    tokio::select! {
        // Any activity on the cancel channel (a cancel value or the sender
        // going away) aborts the walk.
        _ = cancel.changed() => Err(()),
        sent = tx.send(item) => sent.map_err(|_| ()),
    }
}

/// Recursive walk of one directory level. `prefix_dir` is empty or ends
/// with a slash; `entry_prefix_match` filters the first level only.
#[allow(clippy::too_many_arguments)]
fn do_tree_walk<'a>(
    source: Arc<dyn TreeWalkSource>,
    volume: &'a str,
    prefix_dir: String,
    entry_prefix_match: String,
    marker: String,
    recursive: bool,
    tx: &'a mpsc::Sender<TreeWalkItem>,
    cancel: &'a mut watch::Receiver<bool>,
    is_end: bool,
) -> Pin<Box<dyn Future<Output = Result<(), ()>> + Send + 'a>> {
    Box::pin(async move {
        // marker "four/five.txt" splits into the component to seek to at
        // this level ("four/") and the remainder for the next level.
        let (marker_dir, marker_base) = match marker.split_once(SLASH_SEPARATOR) {
            Some((dir, base)) => (format!("{dir}/"), base.to_string()),
            None => (marker.clone(), String::new()),
        };

        let (entries, delayed_leaf) =
            match filtered_list_dir(source.as_ref(), volume, &prefix_dir, &entry_prefix_match)
                .await
            {
                Ok(listed) => listed,
                Err(err) => {
                    let _ = send_item(tx, cancel, Err(err)).await;
                    return Err(());
                }
            };
        if entries.is_empty() {
            return Ok(());
        }

        // Seek to the marker position within the sorted entries.
        let start = entries.partition_point(|e| e.as_str() < marker_dir.as_str());
        let entries = &entries[start..];

        for (i, raw_entry) in entries.iter().enumerate() {
            let mut entry = raw_entry.clone();
            if delayed_leaf && entry.ends_with(SLASH_SEPARATOR) {
                let full = format!("{prefix_dir}{entry}");
                if source.is_leaf(volume, &full).await {
                    entry.pop();
                }
            }

            // The marker itself was listed by the previous page.
            if i == 0 && entry == marker_dir && !entry.ends_with(SLASH_SEPARATOR) {
                continue;
            }

            if entry.ends_with(SLASH_SEPARATOR) && (recursive || entry == marker_dir) {
                let marker_arg = if entry == marker_dir {
                    marker_base.clone()
                } else {
                    String::new()
                };
                let mark_is_end = is_end && i == entries.len() - 1;
                do_tree_walk(
                    source.clone(),
                    volume,
                    format!("{prefix_dir}{entry}"),
                    String::new(),
                    marker_arg,
                    recursive,
                    tx,
                    cancel,
                    mark_is_end,
                )
                .await?;
                continue;
            }

            let is_eof = is_end && i == entries.len() - 1;
            send_item(
                tx,
                cancel,
                Ok(TreeWalkResult {
                    entry: format!("{prefix_dir}{entry}"),
                    end: is_eof,
                }),
            )
            .await?;
        }
        Ok(())
    })
}

/// Start a walk; entries arrive on the returned channel, which closes when
/// the walk completes or is cancelled.
pub fn start_tree_walk(
    source: Arc<dyn TreeWalkSource>,
    volume: &str,
    prefix: &str,
    marker: &str,
    recursive: bool,
    mut cancel: watch::Receiver<bool>,
) -> mpsc::Receiver<TreeWalkItem> {
    let (tx, rx) = mpsc::channel(MAX_OBJECT_LIST);

    // prefix "one/two/th" walks "one/two/" matching entries against "th";
    // the marker is made relative to that directory.
    let (prefix_dir, entry_prefix_match) = match prefix.rfind(SLASH_SEPARATOR) {
        Some(idx) => (prefix[..=idx].to_string(), prefix[idx + 1..].to_string()),
        None => (String::new(), prefix.to_string()),
    };
    let marker = marker
        .strip_prefix(&prefix_dir)
        .unwrap_or(marker)
        .to_string();

    let volume = volume.to_string();
    tokio::spawn(async move {
        let ended = do_tree_walk(
            source,
            &volume,
            prefix_dir,
            entry_prefix_match,
            marker,
            recursive,
            &tx,
            &mut cancel,
            true,
        )
        .await;
        if ended.is_err() {
            debug!(volume = %volume, "tree walk aborted");
        }
        // Dropping the sender closes the result channel.
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use coffer_storage::{PosixDisk, StorageAPI};
    use std::time::Duration;
    use tempfile::tempdir;

    const VOLUME: &str = "testvolume";

    struct FsSource {
        disk: PosixDisk,
    }

    #[async_trait]
    impl TreeWalkSource for FsSource {
        async fn list_dir(&self, volume: &str, dir_path: &str) -> StorageResult<Vec<String>> {
            self.disk.list_dir(volume, dir_path).await
        }

        async fn is_leaf(&self, _volume: &str, path: &str) -> bool {
            !path.ends_with(SLASH_SEPARATOR)
        }
    }

    async fn create_namespace(files: &[&str]) -> (tempfile::TempDir, Arc<dyn TreeWalkSource>) {
        let dir = tempdir().unwrap();
        let disk = PosixDisk::new(dir.path().join("disk")).unwrap();
        disk.make_vol(VOLUME).await.unwrap();
        for file in files {
            disk.append_file(VOLUME, file, b"").await.unwrap();
        }
        (dir, Arc::new(FsSource { disk }))
    }

    fn standard_files() -> Vec<&'static str> {
        vec!["d/e", "d/f", "d/g/h", "i/j/k", "lmn"]
    }

    async fn collect(
        source: Arc<dyn TreeWalkSource>,
        prefix: &str,
        marker: &str,
        recursive: bool,
    ) -> Vec<TreeWalkResult> {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let mut rx = start_tree_walk(source, VOLUME, prefix, marker, recursive, cancel_rx);
        let mut results = Vec::new();
        while let Some(item) = rx.recv().await {
            results.push(item.unwrap());
        }
        results
    }

    #[test]
    fn delay_is_leaf_check_cases() {
        let cases: Vec<(Vec<&str>, bool)> = vec![
            // Cannot be delayed: trimming would reorder.
            (vec!["a-b/", "a/"], false),
            (vec!["a%b/", "a/"], false),
            (vec!["a-b-c", "a-b/"], false),
            // Can be delayed.
            (vec!["a-b/", "aa/"], true),
            (vec!["a", "a-b"], true),
            (vec!["aaa", "bbb"], true),
        ];
        for (i, (entries, expected)) in cases.into_iter().enumerate() {
            let entries: Vec<String> = entries.into_iter().map(String::from).collect();
            assert_eq!(
                delay_is_leaf_check(&entries),
                expected,
                "case {} failed",
                i + 1
            );
        }
    }

    #[test]
    fn filter_matching_prefix_cases() {
        let entries: Vec<String> = ["a", "aab", "ab", "abbbb", "zzz"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let cases: Vec<(&str, Vec<&str>)> = vec![
            ("", vec!["a", "aab", "ab", "abbbb", "zzz"]),
            ("a", vec!["a", "aab", "ab", "abbbb"]),
            ("aa", vec!["aab"]),
            ("c", vec![]),
        ];
        for (prefix, expected) in cases {
            let got = filter_matching_prefix(entries.clone(), prefix);
            let expected: Vec<String> = expected.into_iter().map(String::from).collect();
            assert_eq!(got, expected, "prefix {prefix:?}");
        }
    }

    #[tokio::test]
    async fn walk_honors_prefix() {
        let (_dir, source) = create_namespace(&standard_files()).await;
        let results = collect(source, "d/", "", true).await;
        assert!(!results.is_empty());
        for res in &results {
            assert!(res.entry.starts_with("d/"), "entry {}", res.entry);
        }
    }

    #[tokio::test]
    async fn walk_honors_marker() {
        let (_dir, source) = create_namespace(&standard_files()).await;
        let results = collect(source, "", "d/g", true).await;
        let entries: Vec<&str> = results.iter().map(|r| r.entry.as_str()).collect();
        assert_eq!(entries, vec!["d/g/h", "i/j/k", "lmn"]);
    }

    #[tokio::test]
    async fn recursive_and_non_recursive_traversal() {
        let (_dir, source) = create_namespace(&standard_files()).await;
        let cases: Vec<(&str, &str, bool, Vec<&str>)> = vec![
            ("", "", false, vec!["d/", "i/", "lmn"]),
            ("", "", true, vec!["d/e", "d/f", "d/g/h", "i/j/k", "lmn"]),
            ("", "d/e", false, vec!["d/f", "d/g/", "i/", "lmn"]),
            ("", "d/e", true, vec!["d/f", "d/g/h", "i/j/k", "lmn"]),
            ("d/", "", false, vec!["d/e", "d/f", "d/g/"]),
            ("d/", "", true, vec!["d/e", "d/f", "d/g/h"]),
            ("d/", "d/e", false, vec!["d/f", "d/g/"]),
            ("d/", "d/e", true, vec!["d/f", "d/g/h"]),
        ];
        for (prefix, marker, recursive, expected) in cases {
            let results = collect(source.clone(), prefix, marker, recursive).await;
            let entries: Vec<&str> = results.iter().map(|r| r.entry.as_str()).collect();
            assert_eq!(
                entries, expected,
                "prefix={prefix:?} marker={marker:?} recursive={recursive}"
            );
        }
    }

    #[tokio::test]
    async fn walk_output_is_sorted() {
        let (_dir, source) = create_namespace(&standard_files()).await;
        for (prefix, marker, recursive) in [
            ("", "", false),
            ("", "", true),
            ("", "d/e", false),
            ("", "d/e", true),
            ("d/", "", false),
            ("d/", "", true),
            ("d/", "d/e", false),
            ("d/", "d/e", true),
        ] {
            let results = collect(source.clone(), prefix, marker, recursive).await;
            let entries: Vec<&str> = results.iter().map(|r| r.entry.as_str()).collect();
            let mut sorted = entries.clone();
            sorted.sort_unstable();
            assert_eq!(entries, sorted, "unsorted for {prefix:?}/{marker:?}");
        }
    }

    #[tokio::test]
    async fn last_entry_carries_end_marker() {
        let (_dir, source) = create_namespace(&standard_files()).await;
        let cases: Vec<(&str, &str, bool, &str)> = vec![
            ("", "", false, "lmn"),
            ("", "", true, "lmn"),
            ("", "d/e", false, "lmn"),
            ("", "d/e", true, "lmn"),
            ("d/", "", false, "d/g/"),
            ("d/", "", true, "d/g/h"),
            ("d/", "d/e", false, "d/g/"),
            ("d/", "d/e", true, "d/g/h"),
        ];
        for (prefix, marker, recursive, expected_last) in cases {
            let results = collect(source.clone(), prefix, marker, recursive).await;
            let last = results.last().unwrap();
            assert_eq!(last.entry, expected_last);
            assert!(last.end, "missing end marker for {prefix:?}/{marker:?}");
            for res in &results[..results.len() - 1] {
                assert!(!res.end);
            }
        }
    }

    #[tokio::test]
    async fn cancellation_closes_output() {
        // More files than the channel buffers, so the producer is blocked
        // mid-walk when the cancel arrives.
        let files: Vec<String> = (0..MAX_OBJECT_LIST + 100)
            .map(|i| format!("file.{i:05}"))
            .collect();
        let refs: Vec<&str> = files.iter().map(String::as_str).collect();
        let (_dir, source) = create_namespace(&refs).await;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut rx = start_tree_walk(source, VOLUME, "", "", true, cancel_rx);

        // Read a couple of entries, then cancel.
        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.entry, "file.00000");
        cancel_tx.send(true).unwrap();

        // The channel drains whatever was buffered and then closes; no new
        // sends occur after the cancel is observed.
        tokio::time::timeout(Duration::from_secs(5), async {
            while rx.recv().await.is_some() {}
        })
        .await
        .expect("output channel did not close after cancellation");
    }
}
