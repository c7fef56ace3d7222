//! Small demo model: two output tables, three parameters, two working
//! sets and one task running both of them.
//!
//! Used by `msim-node init-demo` and by scenario tests.

use std::collections::BTreeMap;

use msim_types::catalog::{Aggregation, EntityDic, ModelDic, ParamDic, TableAcc, TableDic, TableExpr};
use msim_types::{MetadataCatalog, ParamValues, SetId, TaskId, ValueKind};

use crate::error::Result;
use crate::memory::MemoryStore;
use crate::records::WorksetValue;

pub const MODEL_NAME: &str = "lifeCycle";
pub const TASK_NAME: &str = "scenarios";
pub const BASE_SET: &str = "Default";
pub const SCENARIO_SET: &str = "HighMortality";

/// Ids of the seeded input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemoIds {
    pub base_set_id: SetId,
    pub scenario_set_id: SetId,
    pub task_id: TaskId,
}

pub fn catalog() -> Result<MetadataCatalog> {
    let acc = |table_id: u32, acc_id: u32, name: &str| TableAcc { table_id, acc_id, name: name.into() };
    let expr = |table_id: u32, expr_id: u32, name: &str, acc_id: u32, aggregation: Aggregation| TableExpr {
        table_id,
        expr_id,
        name: name.into(),
        acc_id,
        aggregation,
    };
    let param = |param_id: u32, name: &str, kind: ValueKind, size: usize| ParamDic {
        param_id,
        name: name.into(),
        kind,
        size,
    };

    let catalog = MetadataCatalog::new(
        ModelDic { model_id: 1, name: MODEL_NAME.into(), digest: "a9f3c1d0".into() },
        vec![
            TableDic { table_id: 1, name: "incomeByAge".into(), cell_count: 4 },
            TableDic { table_id: 2, name: "deaths".into(), cell_count: 2 },
        ],
        vec![
            acc(1, 0, "income"),
            acc(1, 1, "persons"),
            acc(2, 0, "deaths"),
        ],
        vec![
            expr(1, 0, "avgIncome", 0, Aggregation::Mean),
            expr(1, 1, "totalPersons", 1, Aggregation::Sum),
            expr(2, 0, "avgDeaths", 0, Aggregation::Mean),
            expr(2, 1, "maxDeaths", 0, Aggregation::Max),
        ],
        vec![
            param(0, "StartAge", ValueKind::Int, 1),
            param(1, "MortalityRate", ValueKind::Float, 2),
            param(2, "UseTax", ValueKind::Bool, 1),
        ],
        vec![EntityDic {
            entity_id: 0,
            name: "Person".into(),
            attributes: vec!["age".into(), "income".into(), "alive".into()],
        }],
    )?;
    Ok(catalog)
}

/// Seed the demo working sets and task into `store`.
pub fn seed(store: &MemoryStore) -> Result<DemoIds> {
    let values = |start_age: i64, mortality: [f64; 2], tax: bool| {
        BTreeMap::from([
            ("StartAge".to_string(), WorksetValue::Values(vec![ParamValues::Int(vec![start_age])])),
            ("MortalityRate".to_string(), WorksetValue::Values(vec![ParamValues::Float(mortality.to_vec())])),
            ("UseTax".to_string(), WorksetValue::Values(vec![ParamValues::Bool(vec![tax])])),
        ])
    };

    let base_set_id = store.add_workset(BASE_SET, None, values(20, [0.01, 0.02], true))?;
    let scenario_set_id = store.add_workset(SCENARIO_SET, None, values(20, [0.03, 0.05], false))?;
    let task_id = store.add_task(TASK_NAME, vec![base_set_id, scenario_set_id])?;
    Ok(DemoIds { base_set_id, scenario_set_id, task_id })
}

/// In-memory demo database, seeded.
pub fn store() -> Result<MemoryStore> {
    let store = MemoryStore::new(catalog()?);
    seed(&store)?;
    Ok(store)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{NewRunRequest, ParameterReader, RunStore};
    use msim_types::ModelStatus;

    #[test]
    fn demo_model_shape() {
        let c = catalog().unwrap();
        assert_eq!(c.tables().len(), 2);
        assert_eq!(c.accumulator_count(), 3);
        assert_eq!(c.parameters().len(), 3);
    }

    #[test]
    fn default_set_runs() {
        let store = store().unwrap();
        let req = NewRunRequest {
            current_status: ModelStatus::Init,
            sub_count: 3,
            run_stamp: "demo".into(),
            ..NewRunRequest::default()
        };
        let run = store.create_new_run(&req).unwrap();
        assert!(run.run_id > 0);
        assert_eq!(
            store.read_parameter(run.run_id, "MortalityRate", 2).unwrap(),
            ParamValues::Float(vec![0.01, 0.02])
        );
    }
}
