//! Bounded log walker
//!
//! Iterates the log files of one device in (session, split) order while
//! charging each file's size against a data-volume budget. A budget is shared
//! by every device of a request: hand it from one walker to the next with
//! [`LogWalker::into_budget`].

use crate::config::BudgetPolicy;
use crate::store::LogStore;
use crate::types::{LogFileRef, Result, Timestamp};

const BYTES_PER_MB: u64 = 1 << 20;

/// Cumulative byte budget of one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBudget {
    limit_mb: u64,
    limit_bytes: u64,
    used_bytes: u64,
    policy: BudgetPolicy,
    exhausted: bool,
}

impl VolumeBudget {
    pub fn new(limit_mb: u64, policy: BudgetPolicy) -> Self {
        Self {
            limit_mb,
            limit_bytes: limit_mb.saturating_mul(BYTES_PER_MB),
            used_bytes: 0,
            policy,
            exhausted: false,
        }
    }

    /// Charge `size` bytes; returns false (and charges nothing) if the file does not fit
    pub fn try_consume(&mut self, size: u64) -> bool {
        if self.exhausted && self.policy == BudgetPolicy::StopAtFirstOverflow {
            return false;
        }
        let total = self.used_bytes.saturating_add(size);
        if total > self.limit_bytes {
            self.exhausted = true;
            return false;
        }
        self.used_bytes = total;
        true
    }

    pub fn limit_mb(&self) -> u64 {
        self.limit_mb
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    /// True once a file has been refused
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

/// One file to load, in walk order
#[derive(Debug, Clone, PartialEq)]
pub struct WalkStep {
    pub file: LogFileRef,
    /// The previous loaded file of this walk belongs to another session
    pub session_changed: bool,
}

/// Iterator over the files of one device that fit the budget
pub struct LogWalker<'a> {
    store: &'a dyn LogStore,
    files: std::vec::IntoIter<LogFileRef>,
    budget: VolumeBudget,
    previous_session: Option<u32>,
    skipped: Vec<LogFileRef>,
}

impl<'a> LogWalker<'a> {
    /// List the candidate files of `device` within `[start, stop]`
    ///
    /// Fails only if the store cannot list the device's files.
    pub fn new(
        store: &'a dyn LogStore,
        device: &str,
        start: &Timestamp,
        stop: &Timestamp,
        budget: VolumeBudget,
    ) -> Result<Self> {
        let mut files = store.list_log_files(device, start, stop)?;
        files.sort_by_key(|f| (f.session, f.split));
        log::debug!("{} candidate log files for {}", files.len(), device);

        Ok(Self {
            store,
            files: files.into_iter(),
            budget,
            previous_session: None,
            skipped: Vec::new(),
        })
    }

    /// Files refused by the budget so far
    pub fn skipped(&self) -> &[LogFileRef] {
        &self.skipped
    }

    pub fn budget(&self) -> &VolumeBudget {
        &self.budget
    }

    /// Give the budget back, with this walk's usage charged
    pub fn into_budget(self) -> VolumeBudget {
        self.budget
    }

    fn file_size(&self, file: &LogFileRef) -> u64 {
        match self.store.size(file) {
            Ok(size) => size,
            Err(e) => {
                log::warn!("File: {} - size unavailable ({}), using listed size", file.path, e);
                file.size
            }
        }
    }
}

impl Iterator for LogWalker<'_> {
    type Item = WalkStep;

    fn next(&mut self) -> Option<WalkStep> {
        while let Some(file) = self.files.next() {
            let size = self.file_size(&file);
            if !self.budget.try_consume(size) {
                log::info!("File: {} - Skipping (limit {} MB)", file.path, self.budget.limit_mb());
                self.skipped.push(file);
                continue;
            }

            log::info!("File: {}", file.path);
            let session_changed = self
                .previous_session
                .map_or(false, |previous| previous != file.session);
            self.previous_session = Some(file.session);
            return Some(WalkStep { file, session_changed });
        }
        None
    }
}
