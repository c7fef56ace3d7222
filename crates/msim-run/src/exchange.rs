//! Accumulators the root expects from its children.
//!
//! ```text
//!   assign run ──► append_receive_list     one receipt per (sub-value, accumulator)
//!                        │                 computed by another rank
//!   poll ─────────► receive                try_receive(sender, tag) → write_accumulator
//!                        │
//!                  update_receive_list     every accumulator of a sub-value in?
//!                                          → completion.set_at + restart checkpoint
//! ```
//!
//! Receiving never blocks and never un-receives: calling it again only
//! moves more receipts forward. An accumulator that never arrives keeps
//! its sub-value incomplete; there is no timeout here.

use std::collections::BTreeMap;

use tracing::{debug, info};

use msim_msg::{accumulator_tag, MsgError, Tag, Transport, TransportExt};
use msim_store::RunStore;
use msim_types::{MetadataCatalog, Rank, RunId, ROOT_RANK};

use crate::error::{Result, RunError};
use crate::run_group::RunGroup;

/// One accumulator of one sub-value to be received from a child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccumulatorReceipt {
    pub run_id: RunId,
    pub sub_value_id: usize,
    pub table_id: u32,
    pub acc_id: u32,
    /// Global accumulator index across all tables.
    pub acc_index: usize,
    pub value_count: usize,
    pub sender_rank: Rank,
    pub tag: Tag,
    pub is_received: bool,
}

#[derive(Debug, Default)]
pub struct AccumulatorExchange {
    receipts: Vec<AccumulatorReceipt>,
}

impl AccumulatorExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receipts still waiting for their sub-value to complete.
    pub fn receipts(&self) -> &[AccumulatorReceipt] {
        &self.receipts
    }

    pub fn pending(&self, run_id: RunId) -> usize {
        self.receipts.iter().filter(|r| r.run_id == run_id && !r.is_received).count()
    }

    /// Expect every accumulator of every sub-value the root does not compute
    /// itself for the run just assigned to `group`.
    pub fn append_receive_list(
        &mut self,
        group: &RunGroup,
        catalog: &MetadataCatalog,
        sub_value_count: usize,
    ) -> Result<()> {
        let before = self.receipts.len();

        for (acc_index, acc) in catalog.accumulators().iter().enumerate() {
            let value_count = catalog
                .table_by_id(acc.table_id)
                .ok_or_else(|| {
                    RunError::Validation(format!(
                        "accumulator {} refers to unknown output table {}",
                        acc.name, acc.table_id
                    ))
                })?
                .cell_count;

            for sub_value_id in 0..sub_value_count {
                let sender_rank = group.rank_by_sub_value_id(sub_value_id);
                if sender_rank == ROOT_RANK {
                    continue;
                }
                self.receipts.push(AccumulatorReceipt {
                    run_id: group.run_id,
                    sub_value_id,
                    table_id: acc.table_id,
                    acc_id: acc.acc_id,
                    acc_index,
                    value_count,
                    sender_rank,
                    tag: accumulator_tag(sub_value_id, sub_value_count, acc_index),
                    is_received: false,
                });
            }
        }
        debug!(
            run_id = group.run_id,
            group = group.group_number,
            receipts = self.receipts.len() - before,
            "accumulator receive list"
        );
        Ok(())
    }

    /// Try to receive every pending accumulator once and write what arrived.
    /// Returns the number of accumulators received.
    pub fn receive(&mut self, transport: &dyn Transport, store: &dyn RunStore) -> Result<usize> {
        let mut received = 0;

        for r in self.receipts.iter_mut().filter(|r| !r.is_received) {
            let values = match transport.try_receive_values(r.sender_rank, r.tag, r.value_count) {
                Ok(Some(values)) => values,
                Ok(None) => continue,
                Err(MsgError::SizeMismatch { expected, actual }) => {
                    return Err(RunError::Protocol(format!(
                        "run {} sub-value {} accumulator {} of table {} from rank {}: \
                         expected {expected} values, received {actual}",
                        r.run_id, r.sub_value_id, r.acc_id, r.table_id, r.sender_rank
                    )));
                }
                Err(e) => return Err(e.into()),
            };

            store.write_accumulator(r.run_id, r.sub_value_id, r.table_id, r.acc_id, &values)?;
            r.is_received = true;
            received += 1;
        }
        Ok(received)
    }

    /// Mark sub-values whose accumulators are all in, persist the new
    /// restart checkpoint of their runs and drop their receipts.
    ///
    /// Returns the runs whose checkpoint was updated.
    pub fn update_receive_list(&mut self, groups: &[RunGroup], store: &dyn RunStore) -> Result<Vec<RunId>> {
        let mut all_in: BTreeMap<(RunId, usize), bool> = BTreeMap::new();
        for r in &self.receipts {
            *all_in.entry((r.run_id, r.sub_value_id)).or_insert(true) &= r.is_received;
        }

        let mut updated: Vec<RunId> = Vec::new();
        for (&(run_id, sub_value_id), _) in all_in.iter().filter(|(_, done)| **done) {
            if let Some(group) = groups.iter().find(|g| g.run_id == run_id) {
                group.completion.set_at(sub_value_id);
            }
            if !updated.contains(&run_id) {
                updated.push(run_id);
            }
            debug!(run_id, sub_value_id, "sub-value received");
        }

        for &run_id in &updated {
            if let Some(group) = groups.iter().find(|g| g.run_id == run_id) {
                let sub_restart = group.completion.count_first();
                store.update_restart_sub_value(run_id, sub_restart)?;
                if group.completion.is_all() {
                    info!(run_id, group = group.group_number, "all sub-values received");
                }
            }
        }

        self.receipts
            .retain(|r| !all_in.get(&(r.run_id, r.sub_value_id)).copied().unwrap_or(false));
        Ok(updated)
    }

    /// Forget every receipt of a run, received or not.
    pub fn remove_run(&mut self, run_id: RunId) {
        self.receipts.retain(|r| r.run_id != run_id);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use msim_store::demo;
    use crate::topology::ProcessTopology;
    use msim_msg::LocalWorld;
    use msim_store::NewRunRequest;
    use msim_types::ModelStatus;

    fn new_run(store: &dyn RunStore, subs: usize) -> RunId {
        let req = NewRunRequest {
            current_status: ModelStatus::Init,
            sub_count: subs,
            run_stamp: "test".into(),
            ..NewRunRequest::default()
        };
        store.create_new_run(&req).unwrap().run_id
    }

    #[test]
    fn receive_list_skips_root_sub_values() {
        // 4 sub-values, groups of 2, root computes sub-values 0..2 of group 2
        let root = ProcessTopology::compute(4, 2, 4, 0, true);
        let mut groups = RunGroup::all(&root);
        groups[1].next_run(101, 1, ModelStatus::Progress);

        let catalog = demo::catalog().unwrap();
        let mut ex = AccumulatorExchange::new();
        ex.append_receive_list(&groups[1], &catalog, 4).unwrap();

        assert_eq!(ex.receipts().len(), 2 * catalog.accumulator_count());
        assert!(ex.receipts().iter().all(|r| r.sub_value_id >= 2 && r.sender_rank == 3));
        assert_eq!(ex.pending(101), ex.receipts().len());
    }

    #[test]
    fn receive_write_and_checkpoint() {
        let world = LocalWorld::new(3);
        let store = demo::store().unwrap();
        let catalog = store.load_catalog().unwrap();
        let run_id = new_run(&store, 2);

        // 2 children, root idle
        let root = ProcessTopology::compute(2, 1, 3, 0, false);
        let mut groups = RunGroup::all(&root);
        groups[0].next_run(run_id, 1, ModelStatus::Progress);

        let mut ex = AccumulatorExchange::new();
        ex.append_receive_list(&groups[0], &catalog, 2).unwrap();
        let total = ex.receipts().len();

        // rank 2 sends everything for sub-value 1 first
        for r in ex.receipts().iter().filter(|r| r.sub_value_id == 1) {
            world[2].send_values(0, r.tag, &vec![1.0; r.value_count]).unwrap();
        }
        assert_eq!(ex.receive(&world[0], &store).unwrap(), total / 2);
        assert_eq!(ex.update_receive_list(&groups, &store).unwrap(), vec![run_id]);
        assert!(groups[0].completion.is_set(1));
        // a gap at sub-value 0: checkpoint stays at 0
        assert_eq!(store.run_record(run_id).unwrap().unwrap().sub_restart, 0);
        assert_eq!(ex.receipts().len(), total / 2);

        for r in ex.receipts().to_vec() {
            world[1].send_values(0, r.tag, &vec![2.0; r.value_count]).unwrap();
        }
        ex.receive(&world[0], &store).unwrap();
        ex.update_receive_list(&groups, &store).unwrap();
        assert!(groups[0].completion.is_all());
        assert_eq!(store.run_record(run_id).unwrap().unwrap().sub_restart, 2);
        assert!(ex.receipts().is_empty());

        // nothing more to do
        assert_eq!(ex.receive(&world[0], &store).unwrap(), 0);
    }

    #[test]
    fn undersized_payload_is_a_protocol_error() {
        let world = LocalWorld::new(2);
        let store = demo::store().unwrap();
        let catalog = store.load_catalog().unwrap();
        let run_id = new_run(&store, 1);

        let root = ProcessTopology::compute(1, 1, 2, 0, true);
        let mut groups = RunGroup::all(&root);
        groups[0].next_run(run_id, 1, ModelStatus::Progress);

        let mut ex = AccumulatorExchange::new();
        ex.append_receive_list(&groups[0], &catalog, 1).unwrap();
        let first = ex.receipts()[0].clone();
        world[1].send_values(0, first.tag, &[1.0]).unwrap();

        assert!(matches!(ex.receive(&world[0], &store), Err(RunError::Protocol(_))));
    }
}
