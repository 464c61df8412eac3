//! Per-disk error collection and quorum reduction.
//!
//! Fan-out operations collect one error slot per disk and never surface an
//! individual disk failure directly; the reducer decides the outcome.

use coffer_common::StorageError;

/// Errors a bucket metadata read may skip while trying the next disk.
pub const BUCKET_METADATA_IGNORED_ERRS: &[StorageError] = &[
    StorageError::DiskNotFound,
    StorageError::DiskAccessDenied,
    StorageError::FaultyDisk,
    StorageError::VolumeNotFound,
];

/// Errors a bucket write operation treats as an absent disk.
pub const BUCKET_OP_IGNORED_ERRS: &[StorageError] = &[
    StorageError::DiskNotFound,
    StorageError::FaultyDisk,
    StorageError::DiskAccessDenied,
];

/// Outcome of reducing per-disk errors against a quorum.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reduced {
    /// Successes (or ignored errors) reached the quorum.
    Ok,
    /// One dominant error reached the quorum.
    Err(StorageError),
    /// No single outcome reached the quorum.
    NoQuorum,
}

/// Whether `err` appears in `ignored`.
#[must_use]
pub fn is_err_ignored(err: &StorageError, ignored: &[StorageError]) -> bool {
    ignored.contains(err)
}

/// Count plain successes.
#[must_use]
pub fn count_success(errs: &[Option<StorageError>]) -> usize {
    errs.iter().filter(|e| e.is_none()).count()
}

/// The modal outcome across the disk set and its multiplicity. Ignored
/// errors count as success.
#[must_use]
pub fn reduce_errs(
    errs: &[Option<StorageError>],
    ignored: &[StorageError],
) -> (Option<StorageError>, usize) {
    let mut outcomes: Vec<(Option<StorageError>, usize)> = Vec::new();
    for err in errs {
        let outcome = match err {
            Some(e) if !is_err_ignored(e, ignored) => Some(e.clone()),
            _ => None,
        };
        match outcomes.iter_mut().find(|(o, _)| *o == outcome) {
            Some((_, count)) => *count += 1,
            None => outcomes.push((outcome, 1)),
        }
    }
    outcomes
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .unwrap_or((None, 0))
}

/// Reduce per-disk errors against a quorum: success when the modal outcome
/// is success and reaches the quorum, the dominant error when that error
/// reaches the quorum, `NoQuorum` otherwise.
#[must_use]
pub fn reduce_quorum_errs(
    errs: &[Option<StorageError>],
    ignored: &[StorageError],
    quorum: usize,
) -> Reduced {
    let (modal, count) = reduce_errs(errs, ignored);
    if count < quorum {
        return Reduced::NoQuorum;
    }
    match modal {
        None => Reduced::Ok,
        Some(err) => Reduced::Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modal_error_wins() {
        let errs = vec![
            None,
            Some(StorageError::VolumeNotFound),
            Some(StorageError::VolumeNotFound),
            Some(StorageError::VolumeNotFound),
            Some(StorageError::DiskNotFound),
            None,
        ];
        let (modal, count) = reduce_errs(&errs, &[StorageError::DiskNotFound]);
        assert_eq!(modal, Some(StorageError::VolumeNotFound));
        assert_eq!(count, 3);
    }

    #[test]
    fn ignored_errors_count_as_success() {
        let errs = vec![
            None,
            Some(StorageError::DiskNotFound),
            Some(StorageError::FaultyDisk),
            None,
        ];
        assert_eq!(
            reduce_quorum_errs(&errs, BUCKET_OP_IGNORED_ERRS, 3),
            Reduced::Ok
        );
    }

    #[test]
    fn quorum_not_reached() {
        let errs = vec![
            None,
            None,
            Some(StorageError::VolumeNotFound),
            Some(StorageError::DiskFull),
        ];
        assert_eq!(reduce_quorum_errs(&errs, &[], 3), Reduced::NoQuorum);
    }

    #[test]
    fn dominant_error_surfaces() {
        let errs = vec![
            Some(StorageError::VolumeExists),
            Some(StorageError::VolumeExists),
            Some(StorageError::VolumeExists),
            None,
        ];
        assert_eq!(
            reduce_quorum_errs(&errs, &[], 3),
            Reduced::Err(StorageError::VolumeExists)
        );
    }
}
