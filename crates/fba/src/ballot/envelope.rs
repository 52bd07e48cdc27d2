//! Building, recording, and broadcasting the local ballot statement.
//!
//! Emitting is a two-step dance: the freshly built self-envelope is
//! first fed back through `advance_slot` so cascading transitions
//! (accept-prepared, confirm-prepared, accept-commit...) complete
//! within one delivery, and only the final envelope reaches the
//! network. The depth guard in `send_latest_envelope` and the
//! last-emitted dedup keep the cascade from double-broadcasting.

use super::*;

impl BallotProtocol {
    /// Broadcast the latest envelope, once, from the top level only.
    pub(super) fn send_latest_envelope<D: Driver>(&mut self, driver: &Arc<D>) {
        if self.advance_depth != 0 {
            return;
        }
        if !self.fully_validated {
            return;
        }
        let Some(envelope) = self.last_envelope.clone() else {
            return;
        };
        if self.last_emitted.as_ref() == Some(&envelope) {
            return;
        }
        self.last_emitted = Some(envelope.clone());
        driver.emit_envelope(&envelope);
    }

    /// Emit the statement matching the current phase and self-process
    /// it.
    pub(super) fn emit_current_state<D: Driver>(&mut self, ctx: &SlotContext<'_, D>) {
        let statement = match self.phase {
            BallotPhase::Prepare => self.build_prepare(ctx),
            BallotPhase::Confirm => self.build_confirm(ctx),
            BallotPhase::Externalize => self.build_externalize(ctx),
        };

        if let Some(statement) = statement {
            self.advance_slot(&statement, ctx);
        }
        self.send_latest_envelope(ctx.driver);
    }

    /// PREPARE reflecting the full local state.
    ///
    /// Before the first bump there is no working ballot; the statement
    /// is still recorded (so the local node counts toward its own
    /// federated predicates) but never broadcast.
    fn build_prepare<D: Driver>(&mut self, ctx: &SlotContext<'_, D>) -> Option<Statement> {
        let can_broadcast = self.current_ballot.is_some();
        let ballot = self.current_ballot.clone().unwrap_or_else(Ballot::null);

        let prepare = Prepare {
            quorum_set_hash: ctx.driver.hash_quorum_set(ctx.local_quorum_set),
            ballot,
            prepared: self.prepared.clone(),
            prepared_prime: self.prepared_prime.clone(),
            n_c: self.commit.as_ref().map(|b| b.counter).unwrap_or(0),
            n_h: self.high_ballot.as_ref().map(|b| b.counter).unwrap_or(0),
        };
        self.record_statement(Pledges::Prepare(prepare), can_broadcast, ctx)
    }

    fn build_confirm<D: Driver>(&mut self, ctx: &SlotContext<'_, D>) -> Option<Statement> {
        let ballot = self.current_ballot.clone()?;
        let confirm = Confirm {
            ballot,
            n_prepared: self.prepared.as_ref().map(|b| b.counter).unwrap_or(0),
            n_commit: self.commit.as_ref().map(|b| b.counter).unwrap_or(0),
            n_h: self.high_ballot.as_ref().map(|b| b.counter).unwrap_or(0),
            quorum_set_hash: ctx.driver.hash_quorum_set(ctx.local_quorum_set),
        };
        self.record_statement(Pledges::Confirm(confirm), true, ctx)
    }

    fn build_externalize<D: Driver>(&mut self, ctx: &SlotContext<'_, D>) -> Option<Statement> {
        let commit = self.commit.clone()?;
        let externalize = Externalize {
            commit,
            n_h: self.high_ballot.as_ref().map(|b| b.counter).unwrap_or(0),
            commit_quorum_set_hash: ctx.driver.hash_quorum_set(ctx.local_quorum_set),
        };
        self.record_statement(Pledges::Externalize(externalize), true, ctx)
    }

    /// Sign and record a self-statement; mark it for broadcast when
    /// `set_last` and it dominates the previous one.
    fn record_statement<D: Driver>(
        &mut self,
        pledges: Pledges,
        set_last: bool,
        ctx: &SlotContext<'_, D>,
    ) -> Option<Statement> {
        let statement = Statement {
            node_id: *ctx.local_node_id,
            slot_index: ctx.slot_index,
            pledges,
        };
        let mut envelope = Envelope::unsigned(statement.clone());
        ctx.driver.sign_envelope(&mut envelope);

        if !self.is_newer_statement(ctx.local_node_id, &envelope.statement) {
            return None;
        }
        self.latest_envelopes.insert(*ctx.local_node_id, envelope.clone());
        if set_last {
            self.last_envelope = Some(envelope);
        }
        Some(statement)
    }
}
