//! Offline/online reconciliation.
//!
//! Whole-document last-writer-wins:
//!
//! | server text vs. baseline | meaning                         | outcome            |
//! |--------------------------|---------------------------------|--------------------|
//! | equal                    | nobody else wrote while offline | flush local edits  |
//! | different                | a peer persisted changes        | adopt server copy  |
//!
//! Remote wins on divergence: local offline work is discarded rather than
//! merged. Either way the baseline is consumed.

use crate::store::{OfflineBaseline, ServerDocument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
    /// Online, waiting for the authoritative copy to compare against.
    Reconciling,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Server changed while we were offline; take it wholesale.
    RemoteWins(ServerDocument),
    /// Server still matches the baseline; our edits can be flushed.
    LocalWins,
}

/// Compare the authoritative copy against the baseline.
pub fn resolve(baseline: &OfflineBaseline, server: &ServerDocument) -> Resolution {
    if server.text == baseline.text {
        Resolution::LocalWins
    } else {
        Resolution::RemoteWins(server.clone())
    }
}

/// Baseline bookkeeping after the editor moved to another document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rebase {
    /// Document whose pending baseline was abandoned.
    pub dropped: Option<String>,
    /// Fresh baseline for the new document, captured while offline.
    pub captured: Option<OfflineBaseline>,
}

pub struct ConflictResolver {
    state: Connectivity,
    baseline: Option<OfflineBaseline>,
    divergences: u64,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self {
            state: Connectivity::Online,
            baseline: None,
            divergences: 0,
        }
    }

    /// Online → Offline. Returns the baseline to persist, if one was captured.
    ///
    /// A baseline that is still pending from an earlier disconnection is kept:
    /// it is the last text known to match the server.
    pub fn go_offline(&mut self, document_id: &str, text: &str, now_ms: u64) -> Option<OfflineBaseline> {
        self.state = Connectivity::Offline;
        if self.baseline.is_some() || document_id.is_empty() {
            return None;
        }
        let baseline = OfflineBaseline {
            document_id: document_id.to_owned(),
            text: text.to_owned(),
            captured_at: now_ms,
        };
        self.baseline = Some(baseline.clone());
        Some(baseline)
    }

    /// Offline → Online. Returns the document to fetch when a baseline exists.
    pub fn go_online(&mut self) -> Option<String> {
        match &self.baseline {
            Some(b) => {
                self.state = Connectivity::Reconciling;
                Some(b.document_id.clone())
            }
            None => {
                self.state = Connectivity::Online;
                None
            }
        }
    }

    /// Reinstate a baseline persisted before a restart. Returns the document
    /// to fetch if we are already online.
    pub fn restore(&mut self, baseline: OfflineBaseline) -> Option<String> {
        if self.baseline.is_some() {
            return None;
        }
        let document_id = baseline.document_id.clone();
        self.baseline = Some(baseline);
        match self.state {
            Connectivity::Offline => None,
            _ => {
                self.state = Connectivity::Reconciling;
                Some(document_id)
            }
        }
    }

    /// The editor switched to `document_id`. A baseline held for another
    /// document is dropped. While offline a new one is captured from `text`;
    /// a reconciliation in progress is abandoned.
    pub fn switch_document(&mut self, document_id: &str, text: &str, now_ms: u64) -> Rebase {
        let stale = self.baseline.as_ref().is_some_and(|b| b.document_id != document_id);
        if !stale {
            return Rebase::default();
        }
        let dropped = self.baseline.take().map(|b| b.document_id);
        if let Some(old) = &dropped {
            log::info!("abandoning offline baseline for {old} on switch to {document_id}");
        }
        let captured = match self.state {
            Connectivity::Offline => self.go_offline(document_id, text, now_ms),
            Connectivity::Reconciling | Connectivity::Online => {
                self.state = Connectivity::Online;
                None
            }
        };
        Rebase { dropped, captured }
    }

    /// The authoritative copy of `document_id` arrived. Consumes the baseline
    /// when it belongs to that document.
    pub fn on_fetched(&mut self, document_id: &str, server: &ServerDocument) -> Option<Resolution> {
        if self.state != Connectivity::Reconciling {
            return None;
        }
        if self.baseline.as_ref().map(|b| b.document_id.as_str()) != Some(document_id) {
            log::debug!("ignoring fetched copy of {document_id}: no baseline for it");
            return None;
        }
        let baseline = self.baseline.take()?;
        self.state = Connectivity::Online;

        let resolution = resolve(&baseline, server);
        if let Resolution::RemoteWins(_) = resolution {
            self.divergences += 1;
            log::warn!(
                "document {} diverged while offline; discarding local edits in favour of server copy",
                baseline.document_id
            );
        } else {
            log::info!("document {} unchanged while offline; flushing local edits", baseline.document_id);
        }
        Some(resolution)
    }

    pub fn state(&self) -> Connectivity {
        self.state
    }

    pub fn baseline(&self) -> Option<&OfflineBaseline> {
        self.baseline.as_ref()
    }

    pub fn is_reconciling(&self) -> bool {
        self.state == Connectivity::Reconciling
    }

    /// Number of divergences resolved in favour of the server.
    pub fn divergences(&self) -> u64 {
        self.divergences
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}
