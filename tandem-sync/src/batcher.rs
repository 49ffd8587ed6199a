//! Change batching: decides when local edits are transmitted.
//!
//! ```text
//!   edit ──► offline? ──yes──► Disarm, stay dirty            (Offline)
//!              │no
//!              ▼
//!   |Δchars| ≥ threshold or "…word␠" ──yes──► Disarm + Flush (Flushing)
//!              │no
//!              ▼
//!   Arm(now + debounce)                                       (Batching)
//!   timer fires ──► Flush                                     (Flushing)
//! ```
//!
//! Every flush carries its own [`FlushId`]. Only the acknowledgment of the
//! most recent flush can settle state; anything older is stale and ignored.

use std::fmt;
use tokio::time::{Duration, Instant};

use crate::config::{SyncConfig, WordBoundaryPolicy};
use crate::protocol::{now_millis, Ack, ClientId, TitleUpdatePayload};

/// Monotonic identity of one flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlushId(u64);

impl FlushId {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FlushId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Named batcher states, highest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    Offline,
    Batching,
    Flushing,
    Idle,
}

/// Side effects requested by the batcher.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchAction {
    /// (Re)arm the debounce timer for `Instant`.
    Arm(Instant),
    /// Cancel the debounce timer.
    Disarm,
    /// Transmit the full current text.
    Flush(FlushTicket),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlushTicket {
    pub id: FlushId,
    pub text: String,
}

/// How a flush ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Positive ack, or no ack object at all.
    Accepted,
    /// `ack.ok == false`
    Rejected,
    /// Transport error or ack deadline elapsed.
    Failed,
}

impl AckOutcome {
    pub fn from_ack(ack: Option<Ack>) -> Self {
        match ack {
            None | Some(Ack { ok: true }) => Self::Accepted,
            Some(Ack { ok: false }) => Self::Rejected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDisposition {
    Applied(AckOutcome),
    /// Ack for a superseded flush.
    Stale,
    /// Batcher already closed.
    Ignored,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    id: FlushId,
    chars: i64,
}

/// True when `text` ends with letters followed by one whitespace character.
pub fn ends_with_completed_word(text: &str, policy: WordBoundaryPolicy) -> bool {
    let mut rev = text.chars().rev();
    match (rev.next(), rev.next()) {
        (Some(last), Some(prev)) => last.is_whitespace() && policy.is_letter(prev),
        _ => false,
    }
}

/// Buffers local text edits and decides transmission cadence.
pub struct ChangeBatcher {
    debounce: Duration,
    threshold: i64,
    policy: WordBoundaryPolicy,
    text: String,
    text_chars: i64,
    /// Net characters added since the last accepted flush.
    pending_chars: i64,
    deadline: Option<Instant>,
    in_flight: Option<InFlight>,
    next_id: u64,
    online: bool,
    held: bool,
    dirty: bool,
    failed: bool,
    closed: bool,
}

impl ChangeBatcher {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            debounce: config.debounce(),
            threshold: config.flush_char_threshold as i64,
            policy: config.word_boundary,
            text: String::new(),
            text_chars: 0,
            pending_chars: 0,
            deadline: None,
            in_flight: None,
            next_id: 1,
            online: true,
            held: false,
            dirty: false,
            failed: false,
            closed: false,
        }
    }

    /// Record a local edit. `text` is the full document text after the edit.
    pub fn on_edit(&mut self, text: &str, now: Instant) -> Vec<BatchAction> {
        if self.closed || text == self.text {
            return Vec::new();
        }

        let chars = text.chars().count() as i64;
        self.pending_chars += chars - self.text_chars;
        self.text_chars = chars;
        self.text = text.to_owned();
        self.dirty = true;

        if !self.online || self.held {
            return self.disarm();
        }

        if self.pending_chars.abs() >= self.threshold
            || ends_with_completed_word(&self.text, self.policy)
        {
            let mut actions = self.disarm();
            actions.push(BatchAction::Flush(self.begin_flush()));
            return actions;
        }

        let at = now + self.debounce;
        self.deadline = Some(at);
        vec![BatchAction::Arm(at)]
    }

    /// Debounce timer expiry.
    pub fn on_timer(&mut self, now: Instant) -> Vec<BatchAction> {
        match self.deadline {
            Some(at) if now >= at => {
                self.deadline = None;
                if self.dirty && self.can_transmit() {
                    vec![BatchAction::Flush(self.begin_flush())]
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    /// Flush outstanding edits right away (reconnection path).
    pub fn flush_now(&mut self) -> Vec<BatchAction> {
        if !self.dirty || !self.can_transmit() {
            return Vec::new();
        }
        let mut actions = self.disarm();
        actions.push(BatchAction::Flush(self.begin_flush()));
        actions
    }

    /// Settle the flush identified by `id`.
    pub fn on_ack(&mut self, id: FlushId, outcome: AckOutcome) -> AckDisposition {
        if self.closed {
            return AckDisposition::Ignored;
        }
        let flight = match self.in_flight {
            Some(f) if f.id == id => f,
            _ => {
                log::debug!("ignoring stale ack for flush {id}");
                return AckDisposition::Stale;
            }
        };
        self.in_flight = None;

        match outcome {
            AckOutcome::Accepted => {
                self.pending_chars -= flight.chars;
            }
            AckOutcome::Rejected | AckOutcome::Failed => {
                log::warn!("flush {id} not acknowledged ({outcome:?}); keeping local buffer");
                self.failed = true;
                self.dirty = true;
            }
        }
        AckDisposition::Applied(outcome)
    }

    /// Connectivity change. Going offline cancels the pending timer.
    pub fn set_online(&mut self, online: bool) -> Vec<BatchAction> {
        self.online = online;
        if online {
            Vec::new()
        } else {
            self.disarm()
        }
    }

    /// Hold transmission while reconnection is being reconciled.
    pub fn set_held(&mut self, held: bool) -> Vec<BatchAction> {
        self.held = held;
        if held {
            self.disarm()
        } else {
            Vec::new()
        }
    }

    /// Replace local text with remote content, discarding unsent edits.
    /// An outstanding flush is forgotten and its ack becomes stale.
    pub fn adopt(&mut self, text: &str) -> Vec<BatchAction> {
        self.text = text.to_owned();
        self.text_chars = text.chars().count() as i64;
        self.pending_chars = 0;
        self.in_flight = None;
        self.dirty = false;
        self.failed = false;
        self.disarm()
    }

    /// Mark the document as changed without a text edit (e.g. offline title).
    pub fn mark_dirty(&mut self) {
        if !self.closed {
            self.dirty = true;
        }
    }

    /// Stop batching. Pending timers are cancelled and late acks ignored.
    pub fn close(&mut self) -> Vec<BatchAction> {
        self.closed = true;
        self.disarm()
    }

    fn can_transmit(&self) -> bool {
        self.online && !self.held && !self.closed
    }

    fn begin_flush(&mut self) -> FlushTicket {
        let id = FlushId(self.next_id);
        self.next_id += 1;
        self.in_flight = Some(InFlight {
            id,
            chars: self.pending_chars,
        });
        self.dirty = false;
        self.failed = false;
        FlushTicket {
            id,
            text: self.text.clone(),
        }
    }

    fn disarm(&mut self) -> Vec<BatchAction> {
        if self.deadline.take().is_some() {
            vec![BatchAction::Disarm]
        } else {
            Vec::new()
        }
    }

    pub fn phase(&self) -> BatchPhase {
        if !self.online {
            BatchPhase::Offline
        } else if self.deadline.is_some() {
            BatchPhase::Batching
        } else if self.in_flight.is_some() {
            BatchPhase::Flushing
        } else {
            BatchPhase::Idle
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn pending_chars(&self) -> i64 {
        self.pending_chars
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    pub fn in_flight(&self) -> Option<FlushId> {
        self.in_flight.map(|f| f.id)
    }
}

/// Unbatched title channel: every change is sent at once.
pub struct TitleChannel {
    client_id: ClientId,
    title: String,
}

impl TitleChannel {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            title: String::new(),
        }
    }

    /// Record a local title change; returns the payload to send when online.
    pub fn on_title(&mut self, title: &str, online: bool) -> Option<TitleUpdatePayload> {
        if title == self.title {
            return None;
        }
        self.title = title.to_owned();
        online.then(|| TitleUpdatePayload {
            title: self.title.clone(),
            client_id: self.client_id,
            timestamp: now_millis(),
        })
    }

    /// Apply a title that arrived from a peer or from the server.
    pub fn adopt(&mut self, title: &str) {
        self.title = title.to_owned();
    }

    pub fn title(&self) -> &str {
        &self.title
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batcher() -> ChangeBatcher {
        ChangeBatcher::new(&SyncConfig::default())
    }

    fn flushes(actions: &[BatchAction]) -> Vec<FlushTicket> {
        actions
            .iter()
            .filter_map(|a| match a {
                BatchAction::Flush(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    /// Type `s` one character at a time, all at `now`.
    fn type_str(b: &mut ChangeBatcher, s: &str, now: Instant) -> Vec<BatchAction> {
        let mut text = b.text().to_owned();
        let mut all = Vec::new();
        for c in s.chars() {
            text.push(c);
            all.extend(b.on_edit(&text, now));
        }
        all
    }

    #[test]
    fn test_completed_word_detection() {
        let p = WordBoundaryPolicy::AnyScript;
        assert!(ends_with_completed_word("hello ", p));
        assert!(ends_with_completed_word("one two\n", p));
        assert!(!ends_with_completed_word("hello", p));
        assert!(!ends_with_completed_word("42 ", p));
        assert!(!ends_with_completed_word(" ", p));
        assert!(!ends_with_completed_word("", p));
        assert!(ends_with_completed_word("привет ", p));
        assert!(!ends_with_completed_word("привет ", WordBoundaryPolicy::LatinOnly));
        assert!(ends_with_completed_word("café ", WordBoundaryPolicy::LatinOnly));
    }

    #[test]
    fn test_word_boundary_flushes_immediately() {
        let mut b = batcher();
        let now = Instant::now();
        let actions = type_str(&mut b, "hello", now);
        assert!(flushes(&actions).is_empty());
        assert_eq!(b.phase(), BatchPhase::Batching);

        let actions = b.on_edit("hello ", now);
        assert_eq!(actions[0], BatchAction::Disarm);
        let sent = flushes(&actions);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].text, "hello ");
        assert_eq!(b.phase(), BatchPhase::Flushing);
    }

    #[test]
    fn test_char_threshold_flushes_immediately() {
        let mut b = batcher();
        let now = Instant::now();
        let actions = type_str(&mut b, "abcdefghi", now);
        assert!(flushes(&actions).is_empty());

        let actions = b.on_edit("abcdefghij", now);
        assert_eq!(flushes(&actions).len(), 1);
    }

    #[test]
    fn test_large_deletion_counts_toward_threshold() {
        let mut b = batcher();
        let now = Instant::now();
        let mut sent = flushes(&b.on_edit("0123456789abcdef", now));
        assert_eq!(sent.len(), 1);
        b.on_ack(sent.remove(0).id, AckOutcome::Accepted);
        assert_eq!(b.pending_chars(), 0);

        let sent = flushes(&b.on_edit("012345", now));
        assert_eq!(sent.len(), 1);
    }

    #[test]
    fn test_debounce_rearms_on_each_edit() {
        let mut b = batcher();
        let t0 = Instant::now();
        assert_eq!(b.on_edit("a", t0), vec![BatchAction::Arm(t0 + Duration::from_millis(500))]);

        let t1 = t0 + Duration::from_millis(100);
        assert_eq!(b.on_edit("ab", t1), vec![BatchAction::Arm(t1 + Duration::from_millis(500))]);

        // Old deadline passing does nothing.
        assert!(b.on_timer(t0 + Duration::from_millis(500)).is_empty());
        let sent = flushes(&b.on_timer(t1 + Duration::from_millis(500)));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].text, "ab");
        assert!(b.on_timer(t1 + Duration::from_millis(900)).is_empty());
    }

    #[test]
    fn test_offline_edit_does_not_transmit() {
        let mut b = batcher();
        let now = Instant::now();
        b.on_edit("a", now);
        assert_eq!(b.set_online(false), vec![BatchAction::Disarm]);

        let actions = b.on_edit("a word ", now);
        assert!(actions.is_empty());
        assert!(b.is_dirty());
        assert_eq!(b.phase(), BatchPhase::Offline);
        assert!(b.on_timer(now + Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn test_rejected_ack_keeps_counter_for_retry() {
        let mut b = batcher();
        let now = Instant::now();
        let sent = flushes(&type_str(&mut b, "hi ", now));
        assert_eq!(sent.len(), 1);
        let before = b.pending_chars();

        assert_eq!(
            b.on_ack(sent[0].id, AckOutcome::Rejected),
            AckDisposition::Applied(AckOutcome::Rejected)
        );
        assert_eq!(b.pending_chars(), before);
        assert!(b.has_failed());
        assert!(b.is_dirty());
    }

    #[test]
    fn test_stale_ack_is_ignored() {
        let mut b = batcher();
        let now = Instant::now();
        let first = flushes(&b.on_edit("first ", now)).remove(0);
        let second = flushes(&b.on_edit("first second ", now)).remove(0);
        assert!(second.id > first.id);

        assert_eq!(b.on_ack(first.id, AckOutcome::Accepted), AckDisposition::Stale);
        assert_eq!(b.in_flight(), Some(second.id));

        b.on_ack(second.id, AckOutcome::Accepted);
        assert_eq!(b.in_flight(), None);
        assert_eq!(b.pending_chars(), 0);
    }

    #[test]
    fn test_accept_only_subtracts_flushed_chars() {
        let mut b = batcher();
        let now = Instant::now();
        let ticket = flushes(&b.on_edit("abc ", now)).remove(0);
        b.on_edit("abc de", now);
        b.on_ack(ticket.id, AckOutcome::Accepted);
        assert_eq!(b.pending_chars(), 2);
        assert!(b.is_dirty());
    }

    #[test]
    fn test_closed_ignores_late_ack() {
        let mut b = batcher();
        let now = Instant::now();
        let ticket = flushes(&b.on_edit("late ", now)).remove(0);
        b.close();
        assert_eq!(b.on_ack(ticket.id, AckOutcome::Accepted), AckDisposition::Ignored);
        assert!(b.on_edit("more", now).is_empty());
    }

    #[test]
    fn test_adopt_discards_local_edits() {
        let mut b = batcher();
        let now = Instant::now();
        b.on_edit("local", now);
        assert_eq!(b.adopt("remote"), vec![BatchAction::Disarm]);
        assert_eq!(b.text(), "remote");
        assert!(!b.is_dirty());
        assert_eq!(b.pending_chars(), 0);
    }

    #[test]
    fn test_adopt_while_flushing_keeps_threshold_accurate() {
        let mut b = batcher();
        let now = Instant::now();
        let ticket = flushes(&b.on_edit("hello ", now)).remove(0);
        b.adopt("theirs");
        assert_eq!(b.in_flight(), None);
        assert_eq!(b.phase(), BatchPhase::Idle);
        assert_eq!(b.on_ack(ticket.id, AckOutcome::Accepted), AckDisposition::Stale);
        assert_eq!(b.pending_chars(), 0);

        assert!(flushes(&type_str(&mut b, "xxxxxxxxx", now)).is_empty());
        let sent = flushes(&type_str(&mut b, "x", now));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].text, "theirsxxxxxxxxxx");
    }

    #[test]
    fn test_flush_now_requires_dirty_and_online() {
        let mut b = batcher();
        assert!(b.flush_now().is_empty());
        b.set_online(false);
        b.on_edit("x", Instant::now());
        assert!(b.flush_now().is_empty());
        b.set_online(true);
        assert_eq!(flushes(&b.flush_now()).len(), 1);
    }

    #[test]
    fn test_ack_outcome_from_ack() {
        assert_eq!(AckOutcome::from_ack(None), AckOutcome::Accepted);
        assert_eq!(AckOutcome::from_ack(Some(Ack { ok: true })), AckOutcome::Accepted);
        assert_eq!(AckOutcome::from_ack(Some(Ack { ok: false })), AckOutcome::Rejected);
    }

    #[test]
    fn test_title_channel_sends_every_change() {
        let id = ClientId::generate();
        let mut t = TitleChannel::new(id);
        let a = t.on_title("N", true).unwrap();
        let b = t.on_title("No", true).unwrap();
        assert_eq!(a.title, "N");
        assert_eq!(b.title, "No");
        assert_eq!(b.client_id, id);
        assert!(t.on_title("No", true).is_none());
        assert!(t.on_title("Not", false).is_none());
        assert_eq!(t.title(), "Not");
    }
}
