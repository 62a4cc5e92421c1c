// Ordered revision lists and the bisection primitives shared by regression
// and progression (`spec.md` §4.13). Grounded on the teacher's
// `tasks/regression/generic.rs`, generalized away from a single Azure-queue
// driven task into a revision-agnostic binary search the two task handlers
// both call.

use serde::{Deserialize, Serialize};

/// The project's ordered list of buildable revisions (release build type),
/// oldest first (`spec.md` §4.6/§4.13 step 1).
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RevisionList(Vec<u64>);

impl RevisionList {
    pub fn new(mut revisions: Vec<u64>) -> Self {
        revisions.sort_unstable();
        revisions.dedup();
        Self(revisions)
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.0
    }

    pub fn index_of(&self, revision: u64) -> Option<usize> {
        self.0.iter().position(|&r| r == revision)
    }

    pub fn get(&self, index: usize) -> Option<u64> {
        self.0.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Drops the revision at `index` (`spec.md` §4.13 step 5: "on bad-build,
    /// drop that revision from the list and continue"). Returns the index
    /// the former `index + 1` now occupies, or `None` if nothing remains.
    pub fn remove(&mut self, index: usize) {
        if index < self.0.len() {
            self.0.remove(index);
        }
    }

    /// The up-to-`count` revisions nearest (but not equal) to `index`, used
    /// by the extreme-revisions pass (`spec.md` §4.13 step 4).
    pub fn nearest(&self, index: usize, count: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.0.len()).filter(|&i| i != index).collect();
        indices.sort_by_key(|&i| (i as i64 - index as i64).abs());
        indices.truncate(count);
        indices
    }
}

/// Checkpoint metadata persisted on the testcase so a bisection task can
/// resume after a requeue (`spec.md` §4.13 step 2: `last_regression_{min,max}`
/// / `last_progression_{min,max}`).
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct BisectionCheckpoint {
    pub min_index: usize,
    pub max_index: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BisectionOutcome {
    /// `max - min == 1`: the range is as narrow as it will get.
    Converged { min_index: usize, max_index: usize },
    /// Bounds assumption failed even after a retry; mark `NA` per step 3.
    Invalid,
    /// Wall-clock deadline hit mid-search; requeue with this checkpoint.
    Requeued(BisectionCheckpoint),
}

/// Runs the shared binary search (`spec.md` §4.13 step 5). `probe(index)`
/// must return `Ok(true)` if revision `index` reproduces the crash,
/// `Ok(false)` if it does not, and `Err(BotError::BadBuild { .. })` if the
/// revision is unusable — in which case the caller drops it and retries the
/// same step against the shifted list.
pub async fn bisect<F, Fut>(
    revisions: &mut RevisionList,
    mut min_index: usize,
    mut max_index: usize,
    deadline: impl Fn() -> bool,
    mut probe: F,
) -> anyhow::Result<BisectionOutcome>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<bool>>,
{
    loop {
        if max_index <= min_index + 1 {
            return Ok(BisectionOutcome::Converged {
                min_index,
                max_index,
            });
        }
        if deadline() {
            return Ok(BisectionOutcome::Requeued(BisectionCheckpoint {
                min_index,
                max_index,
            }));
        }

        let mid = (min_index + max_index) / 2;
        match probe(mid).await {
            Ok(true) => max_index = mid,
            Ok(false) => min_index = mid,
            Err(err) => {
                if let Some(crate::error::BotError::BadBuild { .. }) =
                    err.downcast_ref::<crate::error::BotError>()
                {
                    revisions.remove(mid);
                    if mid <= min_index {
                        min_index = min_index.saturating_sub(1);
                    }
                    if mid <= max_index {
                        max_index = max_index.saturating_sub(1);
                    }
                    if revisions.is_empty() || max_index <= min_index {
                        return Ok(BisectionOutcome::Invalid);
                    }
                    continue;
                }
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_list_dedups_and_sorts() {
        let revisions = RevisionList::new(vec![9, 1, 5, 1, 22]);
        assert_eq!(revisions.as_slice(), &[1, 5, 9, 22]);
    }

    #[test]
    fn test_nearest_excludes_self() {
        let revisions = RevisionList::new(vec![1, 2, 5, 8, 9, 12, 15, 19, 21, 22]);
        let nearest = revisions.nearest(9, 3);
        assert!(!nearest.contains(&9));
        assert_eq!(nearest.len(), 3);
    }

    #[tokio::test]
    async fn test_bisect_converges() {
        // revision_list [1,2,5,8,9,12,15,19,21,22], crash first appears at
        // index 8 (revision 21) per the spec's scenario 3.
        let mut revisions = RevisionList::new(vec![1, 2, 5, 8, 9, 12, 15, 19, 21, 22]);
        let len = revisions.len();
        let outcome = bisect(&mut revisions, 0, len - 1, || false, |idx| async move {
            Ok(idx >= 8)
        })
        .await
        .unwrap();

        assert_eq!(
            outcome,
            BisectionOutcome::Converged {
                min_index: 8,
                max_index: 9
            }
        );
    }

    #[tokio::test]
    async fn test_bisect_requeues_on_deadline() {
        let mut revisions = RevisionList::new(vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let outcome = bisect(&mut revisions, 0, 7, || true, |idx| async move { Ok(idx >= 4) })
            .await
            .unwrap();
        assert!(matches!(outcome, BisectionOutcome::Requeued(_)));
    }
}
