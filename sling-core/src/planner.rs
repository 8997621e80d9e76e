//! Expands a [`SendPlan`] into [`RequestDescriptor`]s
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use glob::Pattern;
use tracing::{debug, warn};

use crate::{
    context::RunContext,
    plan::{PlanError, SendPlan, Source},
};

/// One unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    /// run the request belongs to
    pub session_id: Arc<str>,
    /// 1-based, unique within the run
    pub request_id: u64,
    /// payload file
    pub path: PathBuf,
}

/// Lazy, finite sequence of descriptors for one run.
///
/// Multi sends match the wildcard once at construction. Each match is
/// stat'ed again when its turn comes; files that vanished in between are
/// skipped with a warning and do not consume a request id.
#[derive(Debug)]
pub struct RequestPlanner {
    session_id: Arc<str>,
    files: Vec<PathBuf>,
    // cycle over `files` until `planned` are emitted
    cycle: bool,
    // stat each file again before emitting it
    restat: bool,
    planned: u64,
    emitted: u64,
    cursor: usize,
    // consecutive skipped files, a full pass of misses ends the sequence
    misses: usize,
}

impl RequestPlanner {
    /// Build the planner, matching files for multi sends.
    pub fn new(plan: &SendPlan, ctx: &RunContext) -> Result<Self, PlanError> {
        let session_id = ctx.session_id().clone();
        let planner = match &plan.source {
            Source::File(path) => Self {
                session_id,
                files: vec![path.clone()],
                cycle: true,
                restat: false,
                planned: plan.repeat.max(1),
                emitted: 0,
                cursor: 0,
                misses: 0,
            },
            Source::Glob { dir, wildcard } => {
                let files = match_files(dir, wildcard)?;
                let planned = match (plan.repeat, files.len()) {
                    (_, 0) => 0,
                    (0, n) => n as u64,
                    (repeat, _) => repeat,
                };
                if files.is_empty() {
                    debug!(?dir, %wildcard, "no matching files, nothing to send");
                }
                Self {
                    session_id,
                    files,
                    cycle: plan.repeat > 0,
                    restat: true,
                    planned,
                    emitted: 0,
                    cursor: 0,
                    misses: 0,
                }
            }
        };
        debug!(planned = planner.planned, files = planner.files.len(), "request planner ready");
        Ok(planner)
    }

    /// number of descriptors the planner intends to emit. The actual count
    /// is lower only when matched files disappear during the run.
    pub fn planned(&self) -> u64 {
        self.planned
    }

    /// matched source files, in emission order
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    fn next_file(&mut self) -> Option<PathBuf> {
        while self.misses < self.files.len() {
            if self.cursor == self.files.len() {
                if !self.cycle {
                    return None;
                }
                self.cursor = 0;
            }
            let path = &self.files[self.cursor];
            self.cursor += 1;
            if !self.restat {
                return Some(path.clone());
            }
            match fs::metadata(path) {
                Ok(meta) if !meta.is_dir() => {
                    self.misses = 0;
                    return Some(path.clone());
                }
                Ok(_) => debug!(?path, "skipping directory"),
                Err(err) => warn!(?path, %err, "cannot stat file, skipping"),
            }
            self.misses += 1;
        }
        None
    }
}

impl Iterator for RequestPlanner {
    type Item = RequestDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        if self.emitted >= self.planned {
            return None;
        }
        let Some(path) = self.next_file() else {
            // everything left vanished
            self.planned = self.emitted;
            return None;
        };
        self.emitted += 1;
        Some(RequestDescriptor {
            session_id: self.session_id.clone(),
            request_id: self.emitted,
            path,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.planned - self.emitted) as usize;
        (0, Some(left))
    }
}

// `dir/wildcard`, with `dir` escaped so only the wildcard is a pattern.
// Directories are dropped here, stat failures are warned about and dropped.
fn match_files(dir: &Path, wildcard: &str) -> Result<Vec<PathBuf>, PlanError> {
    fs::read_dir(dir).map_err(|err| PlanError::SourceUnavailable {
        path: dir.to_path_buf(),
        reason: err.to_string(),
    })?;
    let pattern = format!("{}/{}", Pattern::escape(&dir.to_string_lossy()), wildcard);
    let paths = glob::glob(&pattern).map_err(|source| PlanError::InvalidPattern {
        pattern: pattern.clone(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in paths {
        match entry {
            Ok(path) => match fs::metadata(&path) {
                Ok(meta) if meta.is_dir() => debug!(?path, "skipping directory"),
                Ok(_) => files.push(path),
                Err(err) => warn!(?path, %err, "cannot stat file, skipping"),
            },
            Err(err) => warn!(path = ?err.path(), err = %err.error(), "cannot read match, skipping"),
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, time::Duration};

    use config::{Endpoint, TransportKind};
    use tracing_test::traced_test;
    use transport::Timeouts;

    use super::*;
    use crate::plan::{Persistence, RateLimits, SendType};

    fn plan(source: Source, repeat: u64) -> SendPlan {
        SendPlan {
            send_type: match source {
                Source::File(_) if repeat > 1 => SendType::Repeat,
                Source::File(_) => SendType::Single,
                Source::Glob { .. } => SendType::Multi,
            },
            source,
            repeat,
            concurrency: 1,
            cxn_lim: false,
            delay: Duration::ZERO,
            rate: RateLimits::default(),
            endpoint: Endpoint {
                address: "127.0.0.1".to_owned(),
                port: 9,
                kind: TransportKind::Tcp,
            },
            timeouts: Timeouts::default(),
            persistence: Persistence::default(),
        }
    }

    fn glob(dir: &Path, wildcard: &str, repeat: u64) -> SendPlan {
        plan(
            Source::Glob {
                dir: dir.to_path_buf(),
                wildcard: wildcard.to_owned(),
            },
            repeat,
        )
    }

    fn abc() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a", "b", "c"] {
            fs::write(dir.path().join(name), name).unwrap();
        }
        dir
    }

    fn names(descs: &[RequestDescriptor]) -> Vec<String> {
        descs
            .iter()
            .map(|d| d.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    fn ctx() -> RunContext {
        RunContext::with_session("s")
    }

    #[test]
    fn test_repeat_same_file() {
        let plan = plan(Source::File(PathBuf::from("f")), 5);
        let descs = RequestPlanner::new(&plan, &ctx()).unwrap().collect::<Vec<_>>();
        assert_eq!(descs.len(), 5);
        assert!(descs.iter().all(|d| d.path == Path::new("f")));
        assert_eq!(
            descs.iter().map(|d| d.request_id).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
        assert!(descs.iter().all(|d| &*d.session_id == "s"));
    }

    #[test]
    fn test_multi_cycles() {
        let dir = abc();
        let planner = RequestPlanner::new(&glob(dir.path(), "*", 7), &ctx()).unwrap();
        assert_eq!(planner.planned(), 7);
        let descs = planner.collect::<Vec<_>>();
        assert_eq!(names(&descs), ["a", "b", "c", "a", "b", "c", "a"]);
        assert_eq!(
            descs.iter().map(|d| d.request_id).collect::<Vec<_>>(),
            (1..=7).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_multi_unbounded_sends_each_once() {
        let dir = abc();
        let descs = RequestPlanner::new(&glob(dir.path(), "*", 0), &ctx())
            .unwrap()
            .collect::<Vec<_>>();
        assert_eq!(names(&descs), ["a", "b", "c"]);
    }

    #[test]
    fn test_wildcard_filters() {
        let dir = abc();
        fs::write(dir.path().join("d.xml"), b"<d/>").unwrap();
        let descs = RequestPlanner::new(&glob(dir.path(), "*.xml", 0), &ctx())
            .unwrap()
            .collect::<Vec<_>>();
        assert_eq!(names(&descs), ["d.xml"]);
    }

    #[test]
    fn test_empty_dir_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut planner = RequestPlanner::new(&glob(dir.path(), "*", 0), &ctx()).unwrap();
        assert_eq!(planner.planned(), 0);
        assert!(planner.next().is_none());
    }

    #[test]
    fn test_only_subdirectories_with_repeat() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub1")).unwrap();
        fs::create_dir(dir.path().join("sub2")).unwrap();
        let planner = RequestPlanner::new(&glob(dir.path(), "*", 5), &ctx()).unwrap();
        assert_eq!(planner.planned(), 0);
        assert_eq!(planner.count(), 0);
    }

    #[test]
    fn test_directories_skipped() {
        let dir = abc();
        fs::create_dir(dir.path().join("b-dir")).unwrap();
        let descs = RequestPlanner::new(&glob(dir.path(), "*", 4), &ctx())
            .unwrap()
            .collect::<Vec<_>>();
        assert_eq!(names(&descs), ["a", "b", "c", "a"]);
    }

    #[test]
    #[traced_test]
    fn test_vanished_file_skipped() {
        let dir = abc();
        let mut planner = RequestPlanner::new(&glob(dir.path(), "*", 5), &ctx()).unwrap();
        fs::remove_file(dir.path().join("b")).unwrap();
        let first = planner.next().unwrap();
        let descs = std::iter::once(first).chain(planner).collect::<Vec<_>>();
        assert_eq!(names(&descs), ["a", "c", "a", "c", "a"]);
        let ids = descs.iter().map(|d| d.request_id).collect::<HashSet<_>>();
        assert_eq!(ids, (1..=5).collect::<HashSet<_>>());
        assert!(logs_contain("cannot stat file"));
    }

    #[test]
    fn test_all_vanished_terminates() {
        let dir = abc();
        let mut planner = RequestPlanner::new(&glob(dir.path(), "*", 10), &ctx()).unwrap();
        for name in ["a", "b", "c"] {
            fs::remove_file(dir.path().join(name)).unwrap();
        }
        assert!(planner.next().is_none());
        assert_eq!(planner.planned(), 0);
    }

    #[test]
    fn test_invalid_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let err = RequestPlanner::new(&glob(dir.path(), "[", 0), &ctx()).unwrap_err();
        assert!(matches!(err, PlanError::InvalidPattern { .. }), "{err}");
    }

    #[test]
    fn test_unreadable_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = RequestPlanner::new(&glob(&dir.path().join("gone"), "*", 0), &ctx())
            .unwrap_err();
        assert!(matches!(err, PlanError::SourceUnavailable { .. }));
    }
}
