//! Input parameter lineage of a new run.
//!
//! Every model parameter is taken from the first source that has it:
//!
//! ```text
//!   Parameter.<name> run option  →  working set value  →  working set import
//!                                →  working set base run  →  validation error
//! ```

use std::collections::BTreeMap;

use msim_types::catalog::ParamDic;
use msim_types::{MetadataCatalog, ParamValues, ParameterSource, RunId};

use crate::error::{Result, StoreError};
use crate::records::{RunOutput, RunParameter, Workset, WorksetValue};

/// Resolve every catalog parameter for a run of `sub_count` sub-values.
pub fn resolve_parameters(
    catalog: &MetadataCatalog,
    workset: &Workset,
    sub_count: usize,
    overrides: &BTreeMap<String, String>,
    outputs: &BTreeMap<RunId, RunOutput>,
) -> Result<BTreeMap<String, RunParameter>> {
    if let Some(unknown) = overrides.keys().find(|n| catalog.parameter_by_name(n).is_none()) {
        return Err(StoreError::Validation(format!("run option for unknown parameter {unknown}")));
    }

    let mut resolved = BTreeMap::new();
    for param in catalog.parameters() {
        let run_param = resolve_one(param, workset, overrides, outputs)?;
        check_values(param, &run_param.values, sub_count)?;
        resolved.insert(param.name.clone(), run_param);
    }
    Ok(resolved)
}

fn resolve_one(
    param: &ParamDic,
    workset: &Workset,
    overrides: &BTreeMap<String, String>,
    outputs: &BTreeMap<RunId, RunOutput>,
) -> Result<RunParameter> {
    if let Some(text) = overrides.get(&param.name) {
        if param.size != 1 {
            return Err(StoreError::Validation(format!(
                "run option can only set a scalar parameter, {} has {} values",
                param.name, param.size
            )));
        }
        return Ok(RunParameter {
            source: ParameterSource::RunOption { value: text.clone() },
            values: vec![ParamValues::parse_scalar(param.kind, text)?],
        });
    }

    match workset.parameters.get(&param.name) {
        Some(WorksetValue::Values(values)) => {
            return Ok(RunParameter {
                source: ParameterSource::Workset { set_id: workset.set_id },
                values: values.clone(),
            });
        }
        Some(WorksetValue::Import { model_name, run_id }) => {
            let values = run_parameter(outputs, *run_id, &param.name).ok_or_else(|| {
                StoreError::Validation(format!(
                    "parameter {} not found in run {run_id} of model {model_name}",
                    param.name
                ))
            })?;
            return Ok(RunParameter {
                source: ParameterSource::ImportRun { model_name: model_name.clone(), run_id: *run_id },
                values,
            });
        }
        None => {}
    }

    if let Some(base_run_id) = workset.base_run_id {
        if let Some(values) = run_parameter(outputs, base_run_id, &param.name) {
            return Ok(RunParameter { source: ParameterSource::BaseRun { run_id: base_run_id }, values });
        }
    }

    Err(StoreError::Validation(format!(
        "parameter {} not found in working set {} or its base run",
        param.name, workset.name
    )))
}

fn run_parameter(outputs: &BTreeMap<RunId, RunOutput>, run_id: RunId, name: &str) -> Option<Vec<ParamValues>> {
    outputs.get(&run_id)?.parameters.get(name).map(|p| p.values.clone())
}

/// One entry or one per sub-value, each of the declared kind and size.
fn check_values(param: &ParamDic, values: &[ParamValues], sub_count: usize) -> Result<()> {
    if values.len() != 1 && values.len() != sub_count {
        return Err(StoreError::Validation(format!(
            "parameter {} has {} sub-values, expected 1 or {sub_count}",
            param.name,
            values.len()
        )));
    }
    for v in values {
        v.expect_shape(param.kind, param.size)
            .map_err(|e| StoreError::Validation(format!("parameter {}: {e}", param.name)))?;
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use msim_types::catalog::{ModelDic, TableAcc, TableDic};
    use msim_types::ValueKind;

    fn catalog() -> MetadataCatalog {
        MetadataCatalog::new(
            ModelDic { model_id: 1, name: "m".into(), digest: String::new() },
            vec![TableDic { table_id: 0, name: "t".into(), cell_count: 1 }],
            vec![TableAcc { table_id: 0, acc_id: 0, name: "acc0".into() }],
            vec![],
            vec![
                ParamDic { param_id: 0, name: "Seed".into(), kind: ValueKind::Int, size: 1 },
                ParamDic { param_id: 1, name: "Rates".into(), kind: ValueKind::Float, size: 2 },
            ],
            vec![],
        )
        .unwrap()
    }

    fn base_output(run_id: RunId) -> BTreeMap<RunId, RunOutput> {
        let mut out = RunOutput::default();
        out.parameters.insert(
            "Rates".into(),
            RunParameter {
                source: ParameterSource::Workset { set_id: 1 },
                values: vec![ParamValues::Float(vec![0.5, 0.25])],
            },
        );
        out.parameters.insert(
            "Seed".into(),
            RunParameter {
                source: ParameterSource::Workset { set_id: 1 },
                values: vec![ParamValues::Int(vec![7])],
            },
        );
        BTreeMap::from([(run_id, out)])
    }

    fn workset(base_run_id: Option<RunId>) -> Workset {
        Workset {
            set_id: 2,
            name: "Default".into(),
            model_id: 1,
            base_run_id,
            parameters: BTreeMap::from([(
                "Seed".to_string(),
                WorksetValue::Values(vec![ParamValues::Int(vec![1])]),
            )]),
        }
    }

    #[test]
    fn search_order() {
        let outputs = base_output(10);
        let overrides = BTreeMap::from([("Seed".to_string(), "42".to_string())]);

        let params = resolve_parameters(&catalog(), &workset(Some(10)), 4, &overrides, &outputs).unwrap();
        assert_eq!(params["Seed"].source, ParameterSource::RunOption { value: "42".into() });
        assert_eq!(params["Seed"].values, vec![ParamValues::Int(vec![42])]);
        assert_eq!(params["Rates"].source, ParameterSource::BaseRun { run_id: 10 });

        let params =
            resolve_parameters(&catalog(), &workset(Some(10)), 4, &BTreeMap::new(), &outputs).unwrap();
        assert_eq!(params["Seed"].source, ParameterSource::Workset { set_id: 2 });
    }

    #[test]
    fn import_from_other_run() {
        let outputs = base_output(10);
        let mut ws = workset(None);
        ws.parameters.insert(
            "Rates".into(),
            WorksetValue::Import { model_name: "other".into(), run_id: 10 },
        );
        let params = resolve_parameters(&catalog(), &ws, 1, &BTreeMap::new(), &outputs).unwrap();
        assert_eq!(
            params["Rates"].source,
            ParameterSource::ImportRun { model_name: "other".into(), run_id: 10 }
        );
    }

    #[test]
    fn missing_everywhere_is_an_error() {
        let err = resolve_parameters(&catalog(), &workset(None), 1, &BTreeMap::new(), &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[test]
    fn rejects_wrong_sub_value_count_and_unknown_override() {
        let mut ws = workset(Some(10));
        ws.parameters.insert(
            "Seed".into(),
            WorksetValue::Values(vec![ParamValues::Int(vec![1]), ParamValues::Int(vec![2])]),
        );
        assert!(resolve_parameters(&catalog(), &ws, 3, &BTreeMap::new(), &base_output(10)).is_err());

        let overrides = BTreeMap::from([("Nope".to_string(), "1".to_string())]);
        assert!(resolve_parameters(&catalog(), &workset(Some(10)), 1, &overrides, &base_output(10)).is_err());
    }
}
