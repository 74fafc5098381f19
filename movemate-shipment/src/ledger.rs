use chrono::{DateTime, Utc};
use movemate_core::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::PaymentMethod;
use crate::step::{Step, StepKind, StepStatus, StepTemplate};

// ============================================================================
// Step Ledger
// ============================================================================
//
// Steps live in an arena keyed by id; `order` holds the ids in execution
// order. Renumbering rewrites `order` and each step's `seq`, never an id.
// `current_seq` moves together with every insert/remove so both are always
// committed as one document.
//
// ============================================================================

/// Attributes of a shipment that decide its step template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateShape {
    pub payment_method: PaymentMethod,
    pub destination_count: usize,
    pub is_round_trip: bool,
    pub has_pod: bool,
}

/// Result of cutting the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Truncated {
    pub appended: Vec<Uuid>,
    pub current_seq: u32,
}

/// What a truncation changed, so it can be undone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct TruncationRecord {
    cut_step: Uuid,
    cut_kind: StepKind,
    relabeled: bool,
    prior_statuses: Vec<(Uuid, StepStatus)>,
    prior_current: Uuid,
    appended: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StepLedger {
    arena: HashMap<Uuid, Step>,
    order: Vec<Uuid>,
    current_seq: u32,
    #[serde(default)]
    truncation: Option<TruncationRecord>,
}

impl StepLedger {
    /// Build the ordered template for a shipment.
    pub fn initialize(shape: &TemplateShape, is_rematching: bool, now: DateTime<Utc>) -> Self {
        let (templates, current_seq) = build_template(shape, is_rematching);
        let mut ledger = Self::default();
        for (seq, template) in templates.iter().enumerate() {
            let step = Step::from_template(template, seq as u32, now);
            ledger.order.push(step.id);
            ledger.arena.insert(step.id, step);
        }
        ledger.current_seq = current_seq;
        ledger
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn current_seq(&self) -> u32 {
        self.current_seq
    }

    pub fn current_step(&self) -> Option<&Step> {
        self.step_at(self.current_seq)
    }

    pub fn step_at(&self, seq: u32) -> Option<&Step> {
        self.order.get(seq as usize).and_then(|id| self.arena.get(id))
    }

    pub fn get(&self, id: &Uuid) -> Option<&Step> {
        self.arena.get(id)
    }

    /// Steps in execution order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Step> + '_ {
        self.order.iter().filter_map(move |id| self.arena.get(id))
    }

    /// First step of the given kind.
    pub fn find_kind(&self, kind: StepKind) -> Option<&Step> {
        self.iter().find(|s| s.kind == kind)
    }

    pub fn is_truncated(&self) -> bool {
        self.truncation.is_some()
    }

    /// Close the current step and open the next one.
    ///
    /// Returns `false` and changes nothing when the current step is the last.
    pub fn advance(&mut self, now: DateTime<Utc>) -> bool {
        let current = self.current_seq as usize;
        if current + 1 >= self.order.len() {
            return false;
        }

        let (done_id, next_id) = (self.order[current], self.order[current + 1]);
        if let Some(step) = self.arena.get_mut(&done_id) {
            step.set_status(StepStatus::Done, now);
        }
        if let Some(step) = self.arena.get_mut(&next_id) {
            step.set_status(StepStatus::Progressing, now);
        }
        self.current_seq += 1;
        true
    }

    /// Mark the current step with `status` without moving the pointer.
    pub fn settle_current(&mut self, status: StepStatus, now: DateTime<Utc>) -> Result<&Step, LedgerError> {
        let id = *self
            .order
            .get(self.current_seq as usize)
            .ok_or(LedgerError::StepNotFound(self.current_seq))?;
        let step = self.arena.get_mut(&id).ok_or(LedgerError::StepNotFound(self.current_seq))?;
        step.set_status(status, now);
        Ok(&*step)
    }

    /// Insert a step at `seq`, shifting every later step by one.
    pub fn insert_at(&mut self, seq: u32, template: StepTemplate, now: DateTime<Utc>) -> Result<Uuid, LedgerError> {
        if seq as usize > self.order.len() {
            return Err(LedgerError::StepNotFound(seq));
        }
        if template.status == StepStatus::Progressing {
            return Err(LedgerError::InvalidTemplate(
                "inserted steps cannot start progressing".to_string(),
            ));
        }

        let step = Step::from_template(&template, seq, now);
        let id = step.id;
        self.arena.insert(id, step);
        self.order.insert(seq as usize, id);
        if seq <= self.current_seq && self.order.len() > 1 {
            self.current_seq += 1;
        }
        self.renumber(now);
        Ok(id)
    }

    /// Delete the step at `seq`, shifting every later step back by one.
    pub fn remove_at(&mut self, seq: u32, now: DateTime<Utc>) -> Result<Step, LedgerError> {
        if seq as usize >= self.order.len() {
            return Err(LedgerError::StepNotFound(seq));
        }
        if seq == self.current_seq {
            return Err(LedgerError::CannotRemoveCurrent(seq));
        }

        let id = self.order.remove(seq as usize);
        let removed = self.arena.remove(&id).ok_or(LedgerError::StepNotFound(seq))?;
        if seq < self.current_seq {
            self.current_seq -= 1;
        }
        if let Some(record) = self.truncation.as_mut() {
            record.prior_statuses.retain(|(step_id, _)| *step_id != id);
            record.appended.retain(|step_id| *step_id != id);
        }
        self.renumber(now);
        Ok(removed)
    }

    /// Cancel every step from `from_seq` on and append `terminals`.
    ///
    /// With `relabel_cut` the step at `from_seq` is renamed (e.g. CASH_VERIFY
    /// to REJECTED_PAYMENT) and closed as DONE instead of being cancelled.
    /// The new current step is the last appended PROGRESSING step, or the
    /// last appended step when none progresses.
    pub fn truncate_from(
        &mut self,
        from_seq: u32,
        relabel_cut: Option<StepKind>,
        terminals: Vec<StepTemplate>,
        now: DateTime<Utc>,
    ) -> Result<Truncated, LedgerError> {
        if self.truncation.is_some() {
            return Err(LedgerError::AlreadyTruncated);
        }
        if terminals.is_empty() {
            return Err(LedgerError::InvalidTemplate("truncation needs a terminal step".to_string()));
        }
        let cut_step = *self
            .order
            .get(from_seq as usize)
            .ok_or(LedgerError::StepNotFound(from_seq))?;
        let prior_current = *self
            .order
            .get(self.current_seq as usize)
            .ok_or(LedgerError::StepNotFound(self.current_seq))?;

        let mut prior_statuses = Vec::new();
        let mut cut_kind = StepKind::Created;
        for id in self.order[from_seq as usize..].iter() {
            let Some(step) = self.arena.get_mut(id) else { continue };
            prior_statuses.push((*id, step.status));
            if *id == cut_step {
                cut_kind = step.kind;
                if let Some(kind) = relabel_cut {
                    step.relabel(kind, now);
                    step.set_status(StepStatus::Done, now);
                    continue;
                }
            }
            step.set_status(StepStatus::Cancelled, now);
        }

        let mut appended = Vec::with_capacity(terminals.len());
        let mut current_seq = None;
        for template in &terminals {
            let seq = self.order.len() as u32;
            let step = Step::from_template(template, seq, now);
            if step.status == StepStatus::Progressing {
                current_seq = Some(seq);
            }
            appended.push(step.id);
            self.order.push(step.id);
            self.arena.insert(step.id, step);
        }
        self.current_seq = current_seq.unwrap_or(self.order.len() as u32 - 1);

        self.truncation = Some(TruncationRecord {
            cut_step,
            cut_kind,
            relabeled: relabel_cut.is_some(),
            prior_statuses,
            prior_current,
            appended: appended.clone(),
        });

        Ok(Truncated {
            appended,
            current_seq: self.current_seq,
        })
    }

    /// Undo the last `truncate_from`: delete the appended steps, restore the
    /// cut step's kind and every affected status, and reopen the step that
    /// was current before the cut.
    pub fn revert_truncation(&mut self, now: DateTime<Utc>) -> Result<(), LedgerError> {
        let record = self.truncation.as_ref().ok_or(LedgerError::NothingToRevert)?;
        if record.relabeled
            && self.arena.get(&record.cut_step).map(|s| s.kind) != Some(StepKind::RejectedPayment)
        {
            return Err(LedgerError::NoRejectedPayment);
        }
        let record = self.truncation.take().ok_or(LedgerError::NothingToRevert)?;

        for id in &record.appended {
            self.arena.remove(id);
        }
        self.order.retain(|id| !record.appended.contains(id));

        if let Some(step) = self.arena.get_mut(&record.cut_step) {
            if record.relabeled {
                step.relabel(record.cut_kind, now);
            }
        }
        for (id, status) in &record.prior_statuses {
            if let Some(step) = self.arena.get_mut(id) {
                step.set_status(*status, now);
            }
        }

        let current = self
            .order
            .iter()
            .position(|id| *id == record.prior_current)
            .ok_or(LedgerError::InvariantViolated("current step lost during revert".to_string()))?;
        self.current_seq = current as u32;
        self.renumber(now);
        Ok(())
    }

    /// Check ordering and the single-active-step rule.
    ///
    /// `terminal` shipments must have no progressing step at all.
    pub fn check_invariants(&self, terminal: bool) -> Result<(), LedgerError> {
        if self.arena.len() != self.order.len() {
            return Err(LedgerError::InvariantViolated("arena and order disagree".to_string()));
        }
        for (index, id) in self.order.iter().enumerate() {
            let step = self
                .arena
                .get(id)
                .ok_or_else(|| LedgerError::InvariantViolated(format!("missing step {}", id)))?;
            if step.seq as usize != index {
                return Err(LedgerError::InvariantViolated(format!(
                    "step {} has seq {} at position {}",
                    id, step.seq, index
                )));
            }
        }
        if self.current_seq as usize >= self.order.len() {
            return Err(LedgerError::InvariantViolated(format!(
                "current seq {} out of range",
                self.current_seq
            )));
        }

        let progressing: Vec<u32> = self
            .iter()
            .filter(|s| s.status == StepStatus::Progressing)
            .map(|s| s.seq)
            .collect();
        match (terminal, progressing.as_slice()) {
            (true, []) => Ok(()),
            (false, [seq]) if *seq == self.current_seq => Ok(()),
            _ => Err(LedgerError::InvariantViolated(format!(
                "progressing steps {:?} with current seq {}",
                progressing, self.current_seq
            ))),
        }
    }

    fn renumber(&mut self, now: DateTime<Utc>) {
        for (index, id) in self.order.iter().enumerate() {
            if let Some(step) = self.arena.get_mut(id) {
                if step.seq != index as u32 {
                    step.seq = index as u32;
                    step.updated_at = now;
                }
            }
        }
    }
}

/// The ordered template and its starting `current_seq`.
pub fn build_template(shape: &TemplateShape, is_rematching: bool) -> (Vec<StepTemplate>, u32) {
    let cash = shape.payment_method == PaymentMethod::Cash;
    let mut steps = vec![StepTemplate::new(StepKind::Created).with_status(StepStatus::Done)];

    if cash {
        let status = if is_rematching { StepStatus::Done } else { StepStatus::Progressing };
        steps.push(StepTemplate::new(StepKind::CashVerify).with_status(status));
    }

    let driver_status = if !cash || is_rematching { StepStatus::Progressing } else { StepStatus::Idle };
    steps.push(StepTemplate::new(StepKind::DriverAccepted).with_status(driver_status));
    steps.push(StepTemplate::new(StepKind::ConfirmDatetime));
    steps.push(StepTemplate::new(StepKind::ArrivalPickup));
    steps.push(StepTemplate::new(StepKind::Pickup));

    for index in 0..shape.destination_count.max(1) {
        let meta = serde_json::json!({ "dropoff_index": index });
        steps.push(StepTemplate::new(StepKind::ArrivalDropoff).with_meta(meta.clone()));
        steps.push(StepTemplate::new(StepKind::Dropoff).with_meta(meta));
    }

    if shape.is_round_trip {
        let meta = serde_json::json!({ "return_trip": true });
        steps.push(StepTemplate::new(StepKind::ArrivalDropoff).with_meta(meta.clone()));
        steps.push(StepTemplate::new(StepKind::Dropoff).with_meta(meta));
    }

    if shape.has_pod {
        steps.push(StepTemplate::new(StepKind::Pod).with_meta(serde_json::json!({ "phase": "SHIPPING" })));
        steps.push(StepTemplate::new(StepKind::Pod).with_meta(serde_json::json!({ "phase": "RECEIVED" })));
    }

    steps.push(StepTemplate::new(StepKind::Finish));

    let current_seq = if cash && is_rematching { 2 } else { 1 };
    (steps, current_seq)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Step not found at seq {0}")]
    StepNotFound(u32),

    #[error("Cannot remove the current step at seq {0}")]
    CannotRemoveCurrent(u32),

    #[error("Step ledger is already truncated")]
    AlreadyTruncated,

    #[error("Step ledger has no truncation to revert")]
    NothingToRevert,

    #[error("No rejected payment step to revert")]
    NoRejectedPayment,

    #[error("Invalid step template: {0}")]
    InvalidTemplate(String),

    #[error("Step ledger invariant violated: {0}")]
    InvariantViolated(String),
}

impl From<LedgerError> for CoreError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::StepNotFound(seq) => CoreError::not_found("step", seq.to_string()),
            LedgerError::CannotRemoveCurrent(_) => CoreError::invalid_state("STEP_IS_CURRENT", err.to_string()),
            LedgerError::AlreadyTruncated => CoreError::invalid_state("STEPS_ALREADY_TRUNCATED", err.to_string()),
            LedgerError::NothingToRevert => CoreError::invalid_state("NOTHING_TO_REVERT", err.to_string()),
            LedgerError::NoRejectedPayment => CoreError::invalid_state("NO_REJECTED_PAYMENT", err.to_string()),
            LedgerError::InvalidTemplate(_) => CoreError::invalid_state("INVALID_STEP_TEMPLATE", err.to_string()),
            LedgerError::InvariantViolated(_) => CoreError::invalid_state("STEP_INVARIANT_VIOLATED", err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(method: PaymentMethod) -> TemplateShape {
        TemplateShape {
            payment_method: method,
            destination_count: 1,
            is_round_trip: false,
            has_pod: false,
        }
    }

    fn kinds(ledger: &StepLedger) -> Vec<StepKind> {
        ledger.iter().map(|s| s.kind).collect()
    }

    fn statuses(ledger: &StepLedger) -> Vec<StepStatus> {
        ledger.iter().map(|s| s.status).collect()
    }

    #[test]
    fn test_credit_template() {
        let ledger = StepLedger::initialize(&shape(PaymentMethod::Credit), false, Utc::now());
        assert_eq!(
            kinds(&ledger),
            vec![
                StepKind::Created,
                StepKind::DriverAccepted,
                StepKind::ConfirmDatetime,
                StepKind::ArrivalPickup,
                StepKind::Pickup,
                StepKind::ArrivalDropoff,
                StepKind::Dropoff,
                StepKind::Finish,
            ]
        );
        assert_eq!(ledger.current_seq(), 1);
        assert_eq!(ledger.current_step().map(|s| s.status), Some(StepStatus::Progressing));
        ledger.check_invariants(false).unwrap();
    }

    #[test]
    fn test_cash_template_waits_for_verification() {
        let ledger = StepLedger::initialize(&shape(PaymentMethod::Cash), false, Utc::now());
        assert_eq!(ledger.step_at(1).map(|s| s.kind), Some(StepKind::CashVerify));
        assert_eq!(ledger.step_at(2).map(|s| s.status), Some(StepStatus::Idle));
        assert_eq!(ledger.current_seq(), 1);
        ledger.check_invariants(false).unwrap();
    }

    #[test]
    fn test_cash_rematch_starts_at_driver_step() {
        let ledger = StepLedger::initialize(&shape(PaymentMethod::Cash), true, Utc::now());
        assert_eq!(ledger.current_seq(), 2);
        assert_eq!(ledger.step_at(1).map(|s| s.status), Some(StepStatus::Done));
        assert_eq!(ledger.current_step().map(|s| s.kind), Some(StepKind::DriverAccepted));
        ledger.check_invariants(false).unwrap();
    }

    #[test]
    fn test_multi_drop_round_trip_pod_template() {
        let shape = TemplateShape {
            payment_method: PaymentMethod::Credit,
            destination_count: 3,
            is_round_trip: true,
            has_pod: true,
        };
        let ledger = StepLedger::initialize(&shape, false, Utc::now());
        let dropoffs = ledger.iter().filter(|s| s.kind == StepKind::Dropoff).count();
        let pods = ledger.iter().filter(|s| s.kind == StepKind::Pod).count();
        assert_eq!(dropoffs, 4);
        assert_eq!(pods, 2);
        assert_eq!(ledger.iter().last().map(|s| s.kind), Some(StepKind::Finish));
        assert_eq!(ledger.len(), 8 + 3 * 2 + 2);
    }

    #[test]
    fn test_advance_until_terminal() {
        let mut ledger = StepLedger::initialize(&shape(PaymentMethod::Credit), false, Utc::now());
        let mut moves = 0;
        while ledger.advance(Utc::now()) {
            moves += 1;
            ledger.check_invariants(false).unwrap();
        }
        assert_eq!(moves, ledger.len() - 2);
        assert_eq!(ledger.current_step().map(|s| s.kind), Some(StepKind::Finish));

        ledger.settle_current(StepStatus::Done, Utc::now()).unwrap();
        ledger.check_invariants(true).unwrap();
    }

    #[test]
    fn test_insert_before_current_shifts_pointer() {
        let mut ledger = StepLedger::initialize(&shape(PaymentMethod::Credit), false, Utc::now());
        let current_id = ledger.current_step().unwrap().id;

        ledger
            .insert_at(1, StepTemplate::new(StepKind::UninterestedDriver).with_status(StepStatus::Done), Utc::now())
            .unwrap();

        assert_eq!(ledger.current_seq(), 2);
        assert_eq!(ledger.current_step().unwrap().id, current_id);
        ledger.check_invariants(false).unwrap();
    }

    #[test]
    fn test_insert_progressing_template_rejected() {
        let mut ledger = StepLedger::initialize(&shape(PaymentMethod::Credit), false, Utc::now());
        let result = ledger.insert_at(3, StepTemplate::new(StepKind::Pod).with_status(StepStatus::Progressing), Utc::now());
        assert!(matches!(result, Err(LedgerError::InvalidTemplate(_))));
    }

    #[test]
    fn test_remove_renumbers_and_deletes() {
        let mut ledger = StepLedger::initialize(&shape(PaymentMethod::Credit), false, Utc::now());
        let before = ledger.len();
        let removed = ledger.remove_at(3, Utc::now()).unwrap();

        assert_eq!(removed.kind, StepKind::ArrivalPickup);
        assert_eq!(ledger.len(), before - 1);
        assert!(ledger.get(&removed.id).is_none());
        ledger.check_invariants(false).unwrap();
    }

    #[test]
    fn test_remove_current_or_missing_fails() {
        let mut ledger = StepLedger::initialize(&shape(PaymentMethod::Credit), false, Utc::now());
        assert_eq!(ledger.remove_at(1, Utc::now()), Err(LedgerError::CannotRemoveCurrent(1)));
        assert_eq!(ledger.remove_at(99, Utc::now()), Err(LedgerError::StepNotFound(99)));
    }

    #[test]
    fn test_truncate_appends_after_max_seq() {
        let mut ledger = StepLedger::initialize(&shape(PaymentMethod::Credit), false, Utc::now());
        let len = ledger.len() as u32;
        let truncated = ledger
            .truncate_from(
                1,
                None,
                vec![
                    StepTemplate::new(StepKind::CustomerCancelled).with_status(StepStatus::Done),
                    StepTemplate::new(StepKind::Refund).with_status(StepStatus::Progressing),
                ],
                Utc::now(),
            )
            .unwrap();

        assert_eq!(truncated.appended.len(), 2);
        assert_eq!(truncated.current_seq, len + 1);
        assert_eq!(ledger.step_at(len).map(|s| s.kind), Some(StepKind::CustomerCancelled));
        assert!(ledger
            .iter()
            .filter(|s| s.seq >= 1 && s.seq < len)
            .all(|s| s.status == StepStatus::Cancelled));
        ledger.check_invariants(false).unwrap();
    }

    #[test]
    fn test_truncate_then_revert_restores_everything() {
        for cut in 1..6u32 {
            let mut ledger = StepLedger::initialize(&shape(PaymentMethod::Cash), false, Utc::now());
            let original_kinds = kinds(&ledger);
            let original_statuses = statuses(&ledger);
            let original_current = ledger.current_seq();

            ledger
                .truncate_from(
                    cut,
                    None,
                    vec![StepTemplate::new(StepKind::Refund).with_status(StepStatus::Progressing)],
                    Utc::now(),
                )
                .unwrap();
            ledger.revert_truncation(Utc::now()).unwrap();

            assert_eq!(kinds(&ledger), original_kinds, "cut at {}", cut);
            assert_eq!(statuses(&ledger), original_statuses, "cut at {}", cut);
            assert_eq!(ledger.current_seq(), original_current);
            ledger.check_invariants(false).unwrap();
        }
    }

    #[test]
    fn test_rejected_payment_cut_and_revert() {
        let mut ledger = StepLedger::initialize(&shape(PaymentMethod::Cash), false, Utc::now());
        ledger
            .truncate_from(
                1,
                Some(StepKind::RejectedPayment),
                vec![StepTemplate::new(StepKind::Refund).with_status(StepStatus::Progressing)],
                Utc::now(),
            )
            .unwrap();
        assert_eq!(ledger.step_at(1).map(|s| (s.kind, s.status)), Some((StepKind::RejectedPayment, StepStatus::Done)));
        assert_eq!(ledger.current_step().map(|s| s.kind), Some(StepKind::Refund));

        ledger.revert_truncation(Utc::now()).unwrap();
        assert_eq!(ledger.step_at(1).map(|s| (s.kind, s.status)), Some((StepKind::CashVerify, StepStatus::Progressing)));
        assert!(ledger.find_kind(StepKind::Refund).is_none());
        assert_eq!(ledger.step_at(2).map(|s| s.status), Some(StepStatus::Idle));
    }

    #[test]
    fn test_revert_without_truncation_fails() {
        let mut ledger = StepLedger::initialize(&shape(PaymentMethod::Cash), false, Utc::now());
        assert_eq!(ledger.revert_truncation(Utc::now()), Err(LedgerError::NothingToRevert));
    }

    #[test]
    fn test_double_truncation_rejected() {
        let mut ledger = StepLedger::initialize(&shape(PaymentMethod::Credit), false, Utc::now());
        let terminal = || vec![StepTemplate::new(StepKind::SystemCancelled).with_status(StepStatus::Done)];
        ledger.truncate_from(1, None, terminal(), Utc::now()).unwrap();
        assert_eq!(
            ledger.truncate_from(1, None, terminal(), Utc::now()),
            Err(LedgerError::AlreadyTruncated)
        );
    }

    #[test]
    fn test_ledger_error_maps_to_core_codes() {
        let err: CoreError = LedgerError::StepNotFound(4).into();
        assert_eq!(err.code(), "STEP_NOT_FOUND");
        let err: CoreError = LedgerError::NoRejectedPayment.into();
        assert_eq!(err.code(), "NO_REJECTED_PAYMENT");
    }
}
